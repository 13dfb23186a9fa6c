//! Clip extraction from motion window snapshots.
//!
//! Runs on the worker pool, never on the ingestion path. Interval selection
//! is pure; only [`ClipExtractor::process`] touches the video sink.

use crate::config::MotionConfig;
use crate::frame::EncodedFrame;
use crate::layout::StorageLayout;
use crate::motion::MotionSnapshot;
use crate::video::{VideoError, VideoSink};
use crate::worker::ClipHandler;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors for a single clip. None of them abort the remaining clips.
#[derive(Debug, Error)]
pub enum ClipError {
    #[error("Invalid frame range {start}..={end} for {len} frames")]
    InvalidRange { start: usize, end: usize, len: usize },

    #[error("Video error: {0}")]
    Video(#[from] VideoError),
}

/// Inclusive span of frame indices inside one snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MotionInterval {
    pub start: usize,
    pub end: usize,
}

impl MotionInterval {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start) + 1
    }

    pub fn contains(&self, index: usize) -> bool {
        (self.start..=self.end).contains(&index)
    }
}

/// Find padded motion intervals in a flag sequence and merge overlaps.
///
/// Motion starts on the first `true` outside an interval, padded back by
/// `buffer_frames`. It ends once the `buffer_frames` most recent flags,
/// up to and including the current one, are all `false`; the end is padded
/// forward by `buffer_frames`. Intervals shorter than `min_recording_frames`
/// are dropped before merging.
pub fn find_motion_intervals(
    flags: &[bool],
    buffer_frames: usize,
    min_recording_frames: usize,
) -> Vec<MotionInterval> {
    if !flags.iter().any(|&f| f) {
        return Vec::new();
    }

    let last = flags.len() - 1;
    let long_enough = |start: usize, end: usize| end - start + 1 >= min_recording_frames;

    let mut intervals = Vec::new();
    let mut open: Option<usize> = None;

    for (i, &flag) in flags.iter().enumerate() {
        match open {
            None if flag => open = Some(i.saturating_sub(buffer_frames)),
            Some(start) if !flag && quiet_through(flags, i, buffer_frames) => {
                let end = (i + buffer_frames).min(last);
                if long_enough(start, end) {
                    intervals.push(MotionInterval::new(start, end));
                }
                open = None;
            }
            _ => {}
        }
    }

    if let Some(start) = open {
        if long_enough(start, last) {
            intervals.push(MotionInterval::new(start, last));
        }
    }

    merge_intervals(intervals)
}

/// The `window` flags ending at `index` (fewer near the start) are all false.
fn quiet_through(flags: &[bool], index: usize, window: usize) -> bool {
    let from = (index + 1).saturating_sub(window);
    flags[from..=index].iter().all(|&f| !f)
}

/// Merge overlapping or touching-by-index intervals into a sorted disjoint set.
pub fn merge_intervals(mut intervals: Vec<MotionInterval>) -> Vec<MotionInterval> {
    intervals.sort_by_key(|i| i.start);

    let mut merged: Vec<MotionInterval> = Vec::with_capacity(intervals.len());
    for interval in intervals {
        match merged.last_mut() {
            Some(running) if interval.start <= running.end => {
                running.end = running.end.max(interval.end);
            }
            _ => merged.push(interval),
        }
    }
    merged
}

/// Immutable unit of work for the clip workers.
#[derive(Debug, Clone)]
pub struct ClipTask {
    pub device_id: String,

    /// Segment timestamp used in clip names
    pub label: String,

    pub frames: Vec<EncodedFrame>,
    pub flags: Vec<bool>,
}

impl ClipTask {
    pub fn new(device_id: impl Into<String>, label: impl Into<String>, snapshot: MotionSnapshot) -> Self {
        Self {
            device_id: device_id.into(),
            label: label.into(),
            frames: snapshot.frames,
            flags: snapshot.flags,
        }
    }

    pub fn has_motion(&self) -> bool {
        self.flags.iter().any(|&f| f)
    }
}

/// Frame-count parameters for clip extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClipSettings {
    pub buffer_frames: usize,
    pub min_recording_frames: usize,
    pub fps: u32,
}

impl From<&MotionConfig> for ClipSettings {
    fn from(config: &MotionConfig) -> Self {
        Self {
            buffer_frames: config.buffer_frames(),
            min_recording_frames: config.min_recording_frames(),
            fps: config.fps,
        }
    }
}

/// Outcome of processing one task.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClipReport {
    pub intervals: usize,
    pub written: Vec<PathBuf>,
    pub skipped: usize,
}

/// Writes one clip per merged motion interval.
pub struct ClipExtractor {
    settings: ClipSettings,
    layout: StorageLayout,
    sink: Arc<dyn VideoSink>,
}

impl ClipExtractor {
    pub fn new(settings: ClipSettings, layout: StorageLayout, sink: Arc<dyn VideoSink>) -> Self {
        Self {
            settings,
            layout,
            sink,
        }
    }

    pub fn settings(&self) -> ClipSettings {
        self.settings
    }

    /// Extract every clip of a task. Failed clips are logged and counted.
    pub fn process(&self, task: &ClipTask) -> ClipReport {
        let mut report = ClipReport::default();

        if !task.has_motion() {
            debug!(
                device_id = %task.device_id,
                frames = task.frames.len(),
                "No motion in segment, discarding"
            );
            return report;
        }

        let intervals = find_motion_intervals(
            &task.flags,
            self.settings.buffer_frames,
            self.settings.min_recording_frames,
        );
        report.intervals = intervals.len();

        for (index, interval) in intervals.iter().enumerate() {
            match self.write_clip(task, *interval, index + 1) {
                Ok(path) => {
                    info!(
                        device_id = %task.device_id,
                        path = %path.display(),
                        start = interval.start,
                        end = interval.end,
                        "Motion clip saved"
                    );
                    report.written.push(path);
                }
                Err(e) => {
                    warn!(
                        device_id = %task.device_id,
                        clip = index + 1,
                        error = %e,
                        "Skipping motion clip"
                    );
                    report.skipped += 1;
                }
            }
        }

        report
    }

    fn write_clip(&self, task: &ClipTask, interval: MotionInterval, clip_index: usize) -> Result<PathBuf, ClipError> {
        let frames = task
            .frames
            .get(interval.start..=interval.end)
            .filter(|frames| !frames.is_empty())
            .ok_or(ClipError::InvalidRange {
                start: interval.start,
                end: interval.end,
                len: task.frames.len(),
            })?;

        let first = &frames[0];
        let path = self.layout.clip_file(
            &task.device_id,
            first.captured_at.date_naive(),
            &task.label,
            clip_index,
        );

        let mut writer = self
            .sink
            .open(&path, first.width, first.height, self.settings.fps)?;
        for frame in frames {
            if let Err(e) = writer.write_frame(frame) {
                let _ = writer.finish();
                return Err(e.into());
            }
        }
        writer.finish()?;

        Ok(path)
    }
}

impl ClipHandler for ClipExtractor {
    fn handle(&self, task: ClipTask) {
        let report = self.process(&task);
        debug!(
            device_id = %task.device_id,
            intervals = report.intervals,
            written = report.written.len(),
            skipped = report.skipped,
            "Clip task finished"
        );
    }
}
