//! Camvault Ingest Service
//!
//! HTTP frame ingest for remote cameras. Devices push JPEG frames (one per
//! request, or a multipart stream of them); the service keeps the latest
//! frame per device for live viewing, writes rotating continuous recordings,
//! and cuts motion clips out of a per-device motion window in the background.
//!
//! ## Architecture
//!
//! ```text
//!  POST /upload/{id}
//!        │
//!        ▼
//! ┌──────────────┐   ┌─────────────────────── device lock ───────────────────────┐
//! │ Frame        │   │ ┌────────────┐  ┌──────────────┐  ┌──────────┐  ┌────────┐ │
//! │ Extractor    │──▶│ │ Frame      │  │ Continuous   │  │ Motion   │  │ Motion │ │
//! └──────────────┘   │ │ Store      │  │ Recorder     │  │ Detector │─▶│ Window │ │
//!                    │ └────────────┘  └──────────────┘  └──────────┘  └────────┘ │
//!                    └──────┬────────────────┬────────────────────────────────┬───┘
//!                           │                │                        ClipTask │
//!                           ▼                ▼                                 ▼
//!                    GET /stream/{id}   <device>/continuous/        ┌──────────────┐
//!                    GET /snapshot/{id}                             │ Worker Pool  │
//!                                                                   │ (clips)      │
//!                                                                   └──────┬───────┘
//!                                                                          ▼
//!                                                                  <device>/motion/
//! ```
//!
//! Shutdown flushes every partially filled motion window as one final
//! ClipTask and then drains the worker pool.

pub mod api;
pub mod clips;
pub mod config;
pub mod device;
pub mod extractor;
pub mod frame;
pub mod ingest;
pub mod layout;
pub mod motion;
pub mod recorder;
pub mod video;
pub mod worker;

pub use api::{create_router, start_api_server, AppState};
pub use clips::{find_motion_intervals, merge_intervals, ClipExtractor, ClipSettings, ClipTask, MotionInterval};
pub use config::IngestConfig;
pub use device::{DeviceRegistry, DeviceState, DeviceStatus};
pub use extractor::{FrameExtractor, Framing};
pub use frame::{EncodedFrame, Frame};
pub use ingest::{IngestError, Ingestor, ShutdownReport, UploadSummary};
pub use layout::StorageLayout;
pub use motion::{DetectorFactory, FrameDiffDetector, MotionDetector, MotionWindowBuffer};
pub use recorder::{ContinuousRecorder, SegmentBucket};
pub use video::{FfmpegSink, VideoSink, VideoWriter};
pub use worker::{ClipHandler, ClipWorkerPool, SubmitError};
