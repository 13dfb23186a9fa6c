use crate::config::ServerConfig;
use crate::device::DeviceState;
use crate::frame::{encode_placeholder, CodecError};
use crate::ingest::{IngestError, Ingestor};
use anyhow::{Context, Result};
use axum::{
    body::{Body, Bytes},
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument, warn};

const PLACEHOLDER_WIDTH: u32 = 640;
const PLACEHOLDER_HEIGHT: u32 = 480;
const LIVE_BOUNDARY: &str = "frame";
const MIN_LIVE_VIEW_INTERVAL: Duration = Duration::from_millis(1);

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub ingestor: Arc<Ingestor>,
    pub live_view_interval: Duration,
    /// Served when a device has no frame yet
    pub placeholder: Bytes,
}

impl AppState {
    pub fn new(ingestor: Arc<Ingestor>, config: &ServerConfig) -> Result<Self, CodecError> {
        Ok(Self {
            ingestor,
            live_view_interval: config.live_view_interval(),
            placeholder: encode_placeholder(PLACEHOLDER_WIDTH, PLACEHOLDER_HEIGHT)?,
        })
    }
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, error: impl Into<String>, code: &str) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
            code: code.to_string(),
        }),
    )
}

fn device_not_found() -> ApiError {
    api_error(StatusCode::NOT_FOUND, "Device not found", "NOT_FOUND")
}

/// Upload response
#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub device_id: String,
    pub accepted: u64,
    pub rejected: u64,
}

/// Device list response
#[derive(Debug, Serialize)]
pub struct DeviceListResponse {
    pub devices: Vec<DeviceState>,
}

/// Device registration request
#[derive(Debug, Deserialize)]
pub struct RegisterDeviceRequest {
    pub device_id: Option<String>,
    #[serde(rename = "type")]
    pub device_type: Option<String>,
    pub alias: Option<String>,
}

/// Alias update request
#[derive(Debug, Deserialize)]
pub struct AliasRequest {
    pub alias: String,
}

/// Motion toggle request
///
/// Detector thresholds and timing are service-wide settings; extra fields
/// sent by older clients are ignored.
#[derive(Debug, Deserialize)]
pub struct MotionToggleRequest {
    pub enabled: bool,
}

/// Create the API router
pub fn create_router(state: AppState, config: &ServerConfig) -> Router {
    let cors = if config.cors_enabled {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        CorsLayer::new()
    };

    Router::new()
        .route("/", get(root))
        .route("/health", get(health_check))
        .route("/upload/:device_id", post(upload))
        .route("/stream/:device_id", get(live_stream))
        .route("/snapshot/:device_id", get(snapshot))
        .route("/devices", get(list_devices))
        .route("/register_device", post(register_device))
        .route("/device/:device_id/alias", post(set_alias))
        .route("/device/:device_id/motion", post(set_motion))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn root() -> impl IntoResponse {
    Json(serde_json::json!({ "detail": "Hello and Welcome" }))
}

/// Health check endpoint
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "camvault-ingest",
        "devices": state.ingestor.registry().len(),
        "shutting_down": state.ingestor.is_shutting_down(),
    }))
}

/// Accept a raw JPEG or a multipart stream of JPEGs from one device
#[instrument(skip(state, headers, body))]
async fn upload(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    headers: HeaderMap,
    body: Body,
) -> Result<Json<UploadResponse>, ApiError> {
    if state.ingestor.is_shutting_down() {
        return Err(shutting_down());
    }

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok());

    let summary = state
        .ingestor
        .ingest_stream(&device_id, content_type, body.into_data_stream())
        .await
        .map_err(|e| match e {
            IngestError::ShuttingDown => shutting_down(),
            IngestError::Task(e) => {
                error!(device_id = %device_id, error = %e, "Ingest task failed");
                api_error(StatusCode::INTERNAL_SERVER_ERROR, "Failed to ingest frame", "INTERNAL_ERROR")
            }
            other => api_error(StatusCode::BAD_REQUEST, other.to_string(), "INVALID_FRAME"),
        })?;

    if summary.accepted == 0 {
        warn!(device_id = %device_id, rejected = summary.rejected, "Upload contained no usable frame");
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "No valid JPEG frame in request body",
            "INVALID_FRAME",
        ));
    }

    Ok(Json(UploadResponse {
        device_id,
        accepted: summary.accepted,
        rejected: summary.rejected,
    }))
}

fn shutting_down() -> ApiError {
    api_error(
        StatusCode::SERVICE_UNAVAILABLE,
        "Service is shutting down",
        "SHUTTING_DOWN",
    )
}

/// Live view as multipart/x-mixed-replace
async fn live_stream(State(state): State<AppState>, Path(device_id): Path<String>) -> Response {
    let mut ticker = tokio::time::interval(state.live_view_interval.max(MIN_LIVE_VIEW_INTERVAL));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let parts = futures::stream::unfold(
        (state, device_id, ticker),
        |(state, device_id, mut ticker)| async move {
            ticker.tick().await;
            if state.ingestor.is_shutting_down() {
                return None;
            }
            let jpeg = state
                .ingestor
                .registry()
                .live_frame(&device_id)
                .unwrap_or_else(|| state.placeholder.clone());
            Some((Ok::<_, Infallible>(live_part(&jpeg)), (state, device_id, ticker)))
        },
    );

    (
        [(
            header::CONTENT_TYPE,
            format!("multipart/x-mixed-replace; boundary={LIVE_BOUNDARY}"),
        )],
        Body::from_stream(parts),
    )
        .into_response()
}

/// One live-view part: `--frame\r\nContent-Type: image/jpeg\r\n\r\n<jpeg>\r\n`
fn live_part(jpeg: &[u8]) -> Bytes {
    let head = format!("--{LIVE_BOUNDARY}\r\nContent-Type: image/jpeg\r\n\r\n");
    let mut part = Vec::with_capacity(head.len() + jpeg.len() + 2);
    part.extend_from_slice(head.as_bytes());
    part.extend_from_slice(jpeg);
    part.extend_from_slice(b"\r\n");
    Bytes::from(part)
}

/// Latest frame of a device, or the placeholder
async fn snapshot(State(state): State<AppState>, Path(device_id): Path<String>) -> impl IntoResponse {
    let jpeg = state
        .ingestor
        .registry()
        .latest_frame(&device_id)
        .unwrap_or_else(|| state.placeholder.clone());
    ([(header::CONTENT_TYPE, "image/jpeg")], jpeg)
}

async fn list_devices(State(state): State<AppState>) -> Json<DeviceListResponse> {
    Json(DeviceListResponse {
        devices: state.ingestor.registry().list(),
    })
}

#[instrument(skip(state))]
async fn register_device(
    State(state): State<AppState>,
    Json(request): Json<RegisterDeviceRequest>,
) -> impl IntoResponse {
    let device_id = match request.device_id.filter(|id| !id.trim().is_empty()) {
        Some(id) => id,
        None => {
            return Json(serde_json::json!({
                "status": "error",
                "message": "device_id is required",
            }))
        }
    };

    state
        .ingestor
        .registry()
        .register(&device_id, request.device_type, request.alias);
    info!(device_id = %device_id, "Registered device via API");

    Json(serde_json::json!({
        "status": "registered",
        "device_id": device_id,
    }))
}

#[instrument(skip(state))]
async fn set_alias(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    Json(request): Json<AliasRequest>,
) -> Result<Json<DeviceState>, ApiError> {
    state
        .ingestor
        .registry()
        .set_alias(&device_id, request.alias)
        .map(Json)
        .ok_or_else(device_not_found)
}

#[instrument(skip(state))]
async fn set_motion(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    Json(request): Json<MotionToggleRequest>,
) -> Result<Json<DeviceState>, ApiError> {
    state
        .ingestor
        .registry()
        .set_motion_enabled(&device_id, request.enabled)
        .map(Json)
        .ok_or_else(device_not_found)
}

/// Start the API server and run until `shutdown` resolves
pub async fn start_api_server(
    state: AppState,
    config: &ServerConfig,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting ingest API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .context("API server error")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IngestConfig;
    use crate::frame::test_support::solid_jpeg;
    use crate::frame::JPEG_SOI;
    use crate::motion::test_support::constant_factory;
    use crate::video::test_support::MemorySink;
    use crate::worker::test_support::RecordingHandler;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tempfile::TempDir;
    use tower::ServiceExt;

    struct TestApp {
        router: Router,
        ingestor: Arc<Ingestor>,
        _dir: TempDir,
    }

    fn test_app() -> TestApp {
        test_app_with(|config| config.server.live_view_interval_ms = 1)
    }

    fn test_app_with(tweak: impl FnOnce(&mut IngestConfig)) -> TestApp {
        let dir = tempfile::tempdir().unwrap();
        let mut config = IngestConfig::default();
        config.storage.root_dir = dir.path().to_path_buf();
        tweak(&mut config);

        let ingestor = Arc::new(Ingestor::with_handler(
            &config,
            Arc::new(MemorySink::new()),
            constant_factory(false),
            Arc::new(RecordingHandler::default()),
        ));
        let state = AppState::new(ingestor.clone(), &config.server).unwrap();

        TestApp {
            router: create_router(state, &config.server),
            ingestor,
            _dir: dir,
        }
    }

    async fn send(router: &Router, request: Request<Body>) -> Response {
        router.clone().oneshot(request).await.unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post_json(uri: &str, json: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(json.to_string()))
            .unwrap()
    }

    fn upload_request(device_id: &str, content_type: &str, body: impl Into<Body>) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(format!("/upload/{device_id}"))
            .header(header::CONTENT_TYPE, content_type)
            .body(body.into())
            .unwrap()
    }

    async fn body_bytes(response: Response) -> Bytes {
        response.into_body().collect().await.unwrap().to_bytes()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        serde_json::from_slice(&body_bytes(response).await).unwrap()
    }

    #[tokio::test]
    async fn test_root_and_health() {
        let app = test_app();

        let response = send(&app.router, get("/")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["detail"], "Hello and Welcome");

        let response = send(&app.router, get("/health")).await;
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["shutting_down"], false);
    }

    #[tokio::test]
    async fn test_upload_single_frame_then_snapshot() {
        let app = test_app();
        let jpeg = solid_jpeg(32, 24, [120, 40, 200]);

        let response = send(&app.router, upload_request("cam1", "image/jpeg", jpeg.clone())).await;
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["device_id"], "cam1");
        assert_eq!(json["accepted"], 1);
        assert_eq!(json["rejected"], 0);

        let response = send(&app.router, get("/snapshot/cam1")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "image/jpeg");
        assert_eq!(body_bytes(response).await, jpeg);
    }

    #[tokio::test]
    async fn test_upload_multipart_stream() {
        let app = test_app();
        let jpeg = solid_jpeg(16, 16, [0, 255, 0]);
        let mut body = Vec::new();
        for _ in 0..3 {
            body.extend_from_slice(b"--cam\r\nContent-Type: image/jpeg\r\n\r\n");
            body.extend_from_slice(&jpeg);
            body.extend_from_slice(b"\r\n");
        }

        let response = send(
            &app.router,
            upload_request("cam1", "multipart/x-mixed-replace; boundary=cam", body),
        )
        .await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["accepted"], 3);
    }

    #[tokio::test]
    async fn test_upload_without_frame_is_rejected() {
        let app = test_app();

        let response = send(&app.router, upload_request("cam1", "image/jpeg", "not a jpeg")).await;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["code"], "INVALID_FRAME");
        assert!(app.ingestor.registry().get("cam1").is_none());
    }

    #[tokio::test]
    async fn test_upload_during_shutdown_is_unavailable() {
        let app = test_app();
        app.ingestor.shutdown().await;

        let jpeg = solid_jpeg(8, 8, [1, 1, 1]);
        let response = send(&app.router, upload_request("cam1", "image/jpeg", jpeg)).await;

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body_json(response).await["code"], "SHUTTING_DOWN");
    }

    #[tokio::test]
    async fn test_snapshot_of_unknown_device_is_placeholder() {
        let app = test_app();

        let response = send(&app.router, get("/snapshot/nobody")).await;

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_bytes(response).await;
        assert!(body.starts_with(&JPEG_SOI));
    }

    #[tokio::test]
    async fn test_live_stream_framing() {
        let app = test_app();
        let jpeg = solid_jpeg(8, 8, [7, 7, 7]);
        app.ingestor.ingest_payload("cam1", jpeg.clone()).unwrap();

        let response = send(&app.router, get("/stream/cam1")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "multipart/x-mixed-replace; boundary=frame"
        );

        let mut body = response.into_body();
        let part = body.frame().await.unwrap().unwrap().into_data().unwrap();

        let mut expected = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n".to_vec();
        expected.extend_from_slice(&jpeg);
        expected.extend_from_slice(b"\r\n");
        assert_eq!(part, Bytes::from(expected));
    }

    #[tokio::test]
    async fn test_live_stream_with_zero_interval() {
        let app = test_app_with(|config| config.server.live_view_interval_ms = 0);

        let response = send(&app.router, get("/stream/cam1")).await;
        assert_eq!(response.status(), StatusCode::OK);

        let mut body = response.into_body();
        for _ in 0..2 {
            let part = body.frame().await.unwrap().unwrap().into_data().unwrap();
            assert!(part.starts_with(b"--frame\r\n"));
        }
    }

    #[tokio::test]
    async fn test_register_and_list_devices() {
        let app = test_app();

        let response = send(&app.router, post_json("/register_device", serde_json::json!({}))).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "error");

        let response = send(
            &app.router,
            post_json(
                "/register_device",
                serde_json::json!({ "device_id": "porch", "type": "doorbell", "alias": "Porch" }),
            ),
        )
        .await;
        let json = body_json(response).await;
        assert_eq!(json["status"], "registered");
        assert_eq!(json["device_id"], "porch");

        let json = body_json(send(&app.router, get("/devices")).await).await;
        let devices = json["devices"].as_array().unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0]["device_id"], "porch");
        assert_eq!(devices[0]["type"], "doorbell");
        assert_eq!(devices[0]["alias"], "Porch");
    }

    #[tokio::test]
    async fn test_alias_and_motion_toggle() {
        let app = test_app();

        let response = send(
            &app.router,
            post_json("/device/ghost/alias", serde_json::json!({ "alias": "Boo" })),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        app.ingestor.registry().register("cam1", None, None);

        let response = send(
            &app.router,
            post_json("/device/cam1/alias", serde_json::json!({ "alias": "Garage" })),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["alias"], "Garage");

        let response = send(
            &app.router,
            post_json("/device/cam1/motion", serde_json::json!({ "enabled": false })),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["motion_enabled"], false);

        // Per-device tuning fields from older clients do not fail the request.
        let response = send(
            &app.router,
            post_json(
                "/device/cam1/motion",
                serde_json::json!({
                    "enabled": true,
                    "pixel_threshold": 25,
                    "motion_threshold": 0.02,
                    "buffer_seconds": 3,
                    "min_recording_time": 5,
                    "fps": 15
                }),
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["motion_enabled"], true);
    }
}
