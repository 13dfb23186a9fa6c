//! Configuration management for the camvault ingest service.
//!
//! This module handles loading and validating configuration from environment
//! variables and configuration files.

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

const MINUTES_PER_DAY: u32 = 24 * 60;

/// Main configuration for the ingest service.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct IngestConfig {
    /// HTTP server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// On-disk layout for recordings, snapshots and clips
    #[serde(default)]
    pub storage: StorageConfig,

    /// Motion detection and clip extraction parameters
    #[serde(default)]
    pub motion: MotionConfig,

    /// Continuous recording configuration
    #[serde(default)]
    pub recording: RecordingConfig,

    /// Background clip worker configuration
    #[serde(default)]
    pub workers: WorkerConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address
    #[serde(default = "default_host")]
    pub host: String,

    /// Bind port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Allow cross-origin requests from any origin
    #[serde(default)]
    pub cors_enabled: bool,

    /// Delay between parts of the live-view stream in milliseconds
    #[serde(default = "default_live_view_interval_ms")]
    pub live_view_interval_ms: u64,

    /// Seconds without a frame before a device is reported offline
    #[serde(default = "default_device_timeout_secs")]
    pub device_timeout_secs: u64,
}

/// Persisted layout configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Base directory; each device gets `<root_dir>/<device>/...`
    #[serde(default = "default_root_dir")]
    pub root_dir: PathBuf,

    /// Container extension for recordings and clips
    #[serde(default = "default_container")]
    pub container: String,

    /// ffmpeg binary used by the video writer
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: String,
}

/// Motion detection and clip extraction configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MotionConfig {
    /// Per-pixel intensity difference counted as change
    #[serde(default = "default_pixel_threshold")]
    pub pixel_threshold: u8,

    /// Fraction of changed pixels that counts as motion
    #[serde(default = "default_motion_threshold")]
    pub motion_threshold: f32,

    /// Seconds of padding kept before and after motion
    #[serde(default = "default_buffer_seconds")]
    pub buffer_seconds: f32,

    /// Minimum clip length in seconds
    #[serde(default = "default_min_recording_seconds")]
    pub min_recording_seconds: f32,

    /// Nominal frame rate of the cameras
    #[serde(default = "default_fps")]
    pub fps: u32,

    /// Length of the motion window handed to the clip workers, in minutes
    #[serde(default = "default_segment_minutes")]
    pub segment_minutes: f32,

    /// Whether newly seen devices start with motion detection on
    #[serde(default = "default_enabled_by_default")]
    pub enabled_by_default: bool,
}

/// Continuous recording configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RecordingConfig {
    /// Rotation interval of continuous recordings in minutes
    #[serde(default = "default_rotation_minutes")]
    pub rotation_minutes: u32,

    /// Persist a still image every N frames (0 disables snapshots)
    #[serde(default = "default_snapshot_interval_frames")]
    pub snapshot_interval_frames: u64,
}

/// Background clip worker configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    /// Number of clip extraction workers
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,

    /// Maximum number of clip tasks waiting for a worker
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,

    /// Drop a segment instead of waiting when the queue is full
    #[serde(default)]
    pub drop_on_backpressure: bool,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (json, pretty)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Whether to include source code location
    #[serde(default)]
    pub include_location: bool,
}

// Default value functions
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8000
}
fn default_live_view_interval_ms() -> u64 {
    100
}
fn default_device_timeout_secs() -> u64 {
    30
}
fn default_root_dir() -> PathBuf {
    PathBuf::from("recordings")
}
fn default_container() -> String {
    "mp4".to_string()
}
fn default_ffmpeg_path() -> String {
    "ffmpeg".to_string()
}
fn default_pixel_threshold() -> u8 {
    30
}
fn default_motion_threshold() -> f32 {
    0.01
}
fn default_buffer_seconds() -> f32 {
    3.0
}
fn default_min_recording_seconds() -> f32 {
    5.0
}
fn default_fps() -> u32 {
    15
}
fn default_segment_minutes() -> f32 {
    1.0
}
fn default_enabled_by_default() -> bool {
    true
}
fn default_rotation_minutes() -> u32 {
    5
}
fn default_snapshot_interval_frames() -> u64 {
    100
}
fn default_num_workers() -> usize {
    2
}
fn default_queue_size() -> usize {
    16
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "json".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_enabled: false,
            live_view_interval_ms: default_live_view_interval_ms(),
            device_timeout_secs: default_device_timeout_secs(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root_dir: default_root_dir(),
            container: default_container(),
            ffmpeg_path: default_ffmpeg_path(),
        }
    }
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            pixel_threshold: default_pixel_threshold(),
            motion_threshold: default_motion_threshold(),
            buffer_seconds: default_buffer_seconds(),
            min_recording_seconds: default_min_recording_seconds(),
            fps: default_fps(),
            segment_minutes: default_segment_minutes(),
            enabled_by_default: default_enabled_by_default(),
        }
    }
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            rotation_minutes: default_rotation_minutes(),
            snapshot_interval_frames: default_snapshot_interval_frames(),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            num_workers: default_num_workers(),
            queue_size: default_queue_size(),
            drop_on_backpressure: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            include_location: false,
        }
    }
}

impl IngestConfig {
    /// Load configuration from file and environment variables.
    ///
    /// Configuration is loaded in the following order (later sources override earlier):
    /// 1. Default config file (config/default.toml)
    /// 2. Environment-specific config (config/{env}.toml)
    /// 3. Environment variables (prefixed with CAMVAULT_)
    pub fn load() -> Result<Self, ConfigError> {
        let run_mode = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let config = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // e.g. CAMVAULT_MOTION__FPS=10
            .add_source(
                Environment::with_prefix("CAMVAULT")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Create configuration from environment variables only.
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(
                Environment::with_prefix("CAMVAULT")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.storage.root_dir.as_os_str().is_empty() {
            return Err(ConfigValidationError::MissingField(
                "storage.root_dir".to_string(),
            ));
        }

        if self.server.live_view_interval_ms == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "server.live_view_interval_ms".to_string(),
                message: "Live view interval must be greater than 0".to_string(),
            });
        }

        if self.storage.container.is_empty() {
            return Err(ConfigValidationError::MissingField(
                "storage.container".to_string(),
            ));
        }

        if self.motion.fps == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "motion.fps".to_string(),
                message: "FPS must be greater than 0".to_string(),
            });
        }

        if !(0.0..=1.0).contains(&self.motion.motion_threshold) {
            return Err(ConfigValidationError::InvalidValue {
                field: "motion.motion_threshold".to_string(),
                message: "Threshold is a fraction between 0 and 1".to_string(),
            });
        }

        if self.motion.buffer_seconds < 0.0 || self.motion.min_recording_seconds < 0.0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "motion.buffer_seconds/min_recording_seconds".to_string(),
                message: "Durations must not be negative".to_string(),
            });
        }

        if self.motion.segment_minutes <= 0.0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "motion.segment_minutes".to_string(),
                message: "Segment length must be greater than 0".to_string(),
            });
        }

        let rotation = self.recording.rotation_minutes;
        if rotation == 0 || rotation > MINUTES_PER_DAY || MINUTES_PER_DAY % rotation != 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "recording.rotation_minutes".to_string(),
                message: "Rotation must divide the day (1440 minutes) evenly".to_string(),
            });
        }

        if self.workers.num_workers == 0 || self.workers.queue_size == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "workers.num_workers/queue_size".to_string(),
                message: "Worker count and queue size must be greater than 0".to_string(),
            });
        }

        if self.logging.format != "json" && self.logging.format != "pretty" {
            return Err(ConfigValidationError::InvalidValue {
                field: "logging.format".to_string(),
                message: "Format must be json or pretty".to_string(),
            });
        }

        Ok(())
    }
}

impl ServerConfig {
    /// Get the live-view pacing as Duration.
    pub fn live_view_interval(&self) -> Duration {
        Duration::from_millis(self.live_view_interval_ms)
    }

    /// Get the offline threshold as Duration.
    pub fn device_timeout(&self) -> Duration {
        Duration::from_secs(self.device_timeout_secs)
    }
}

impl MotionConfig {
    /// Frames of padding before and after a motion run.
    pub fn buffer_frames(&self) -> usize {
        (self.buffer_seconds * self.fps as f32).round() as usize
    }

    /// Minimum number of frames in a written clip.
    pub fn min_recording_frames(&self) -> usize {
        (self.min_recording_seconds * self.fps as f32).round() as usize
    }

    /// Capacity of the per-device motion window.
    pub fn segment_frames(&self) -> usize {
        ((self.segment_minutes * 60.0 * self.fps as f32).round() as usize).max(1)
    }
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}
