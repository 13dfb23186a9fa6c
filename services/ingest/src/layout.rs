//! Directory layout of persisted recordings.
//!
//! ```text
//! <root>/<device>/continuous/<YYYY-MM-DD>/<HH-MM>_to_<HH-MM>.<container>
//! <root>/<device>/continuous/<YYYY-MM-DD>/snapshot_<HH-MM-SS>.jpg
//! <root>/<device>/motion/<YYYY-MM-DD>/motion_<label>_clip<N>.<container>
//! ```

use crate::config::StorageConfig;
use crate::recorder::SegmentBucket;
use chrono::{DateTime, Local, NaiveDate};
use std::path::{Path, PathBuf};

/// Builds every path the service writes to.
#[derive(Debug, Clone)]
pub struct StorageLayout {
    root: PathBuf,
    container: String,
}

impl StorageLayout {
    pub fn new(root: impl Into<PathBuf>, container: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            container: container.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn container(&self) -> &str {
        &self.container
    }

    /// Directory holding continuous recordings and snapshots for one day.
    pub fn continuous_dir(&self, device_id: &str, date: NaiveDate) -> PathBuf {
        self.root
            .join(sanitize_path_component(device_id))
            .join("continuous")
            .join(date.format("%Y-%m-%d").to_string())
    }

    /// Continuous recording file for a bucket.
    pub fn continuous_file(&self, device_id: &str, bucket: &SegmentBucket) -> PathBuf {
        self.continuous_dir(device_id, bucket.date())
            .join(format!("{}.{}", bucket.file_stem(), self.container))
    }

    /// Periodic still image.
    pub fn snapshot_file(&self, device_id: &str, at: DateTime<Local>) -> PathBuf {
        self.continuous_dir(device_id, at.date_naive())
            .join(format!("snapshot_{}.jpg", at.format("%H-%M-%S")))
    }

    /// Directory holding motion clips for one day.
    pub fn motion_dir(&self, device_id: &str, date: NaiveDate) -> PathBuf {
        self.root
            .join(sanitize_path_component(device_id))
            .join("motion")
            .join(date.format("%Y-%m-%d").to_string())
    }

    /// Motion clip file; `clip_index` is 1-based.
    pub fn clip_file(&self, device_id: &str, date: NaiveDate, label: &str, clip_index: usize) -> PathBuf {
        self.motion_dir(device_id, date).join(format!(
            "motion_{}_clip{}.{}",
            sanitize_path_component(label),
            clip_index,
            self.container
        ))
    }
}

impl From<&StorageConfig> for StorageLayout {
    fn from(config: &StorageConfig) -> Self {
        Self::new(config.root_dir.clone(), config.container.clone())
    }
}

/// Sanitize a path component to prevent path traversal
pub fn sanitize_path_component(component: &str) -> String {
    component
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' => c,
            _ => '_',
        })
        .collect()
}
