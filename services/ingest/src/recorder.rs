//! Continuous recording into rotating, time-bucketed video files.
//!
//! Every accepted frame is written to the file of the wall-clock bucket it
//! falls into. Writer failures get one retry with a fresh writer; after that
//! the frame is skipped for continuous recording only.

use crate::config::RecordingConfig;
use crate::frame::EncodedFrame;
use crate::layout::StorageLayout;
use crate::video::{VideoError, VideoSink, VideoWriter};
use chrono::{DateTime, Duration, Local, NaiveDate, NaiveTime, Timelike};
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Errors raised by the continuous recorder.
#[derive(Debug, Error)]
pub enum RecorderError {
    #[error("Video writer failed after retry: {0}")]
    Writer(#[from] VideoError),
}

/// Wall-clock interval naming one continuous recording file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SegmentBucket {
    date: NaiveDate,
    start: NaiveTime,
    rotation_minutes: u32,
}

impl SegmentBucket {
    /// Bucket containing `at`, with the day split into `rotation_minutes` slots.
    pub fn containing(at: DateTime<Local>, rotation_minutes: u32) -> Self {
        let rotation = rotation_minutes.clamp(1, 24 * 60);
        let minute_of_day = at.hour() * 60 + at.minute();
        let start_minute = minute_of_day - minute_of_day % rotation;

        Self {
            date: at.date_naive(),
            start: NaiveTime::from_hms_opt(start_minute / 60, start_minute % 60, 0)
                .unwrap_or(NaiveTime::MIN),
            rotation_minutes: rotation,
        }
    }

    pub fn date(&self) -> NaiveDate {
        self.date
    }

    pub fn start(&self) -> NaiveTime {
        self.start
    }

    /// End of the bucket; wraps to `00:00` at midnight.
    pub fn end(&self) -> NaiveTime {
        let (end, _) = self
            .start
            .overflowing_add_signed(Duration::minutes(self.rotation_minutes as i64));
        end
    }

    /// `HH-MM_to_HH-MM`
    pub fn file_stem(&self) -> String {
        format!(
            "{}_to_{}",
            self.start.format("%H-%M"),
            self.end().format("%H-%M")
        )
    }
}

/// Settings shared by all device recorders.
#[derive(Debug, Clone)]
pub struct RecorderSettings {
    pub rotation_minutes: u32,
    pub snapshot_interval_frames: u64,
    pub fps: u32,
}

impl RecorderSettings {
    pub fn new(config: &RecordingConfig, fps: u32) -> Self {
        Self {
            rotation_minutes: config.rotation_minutes,
            snapshot_interval_frames: config.snapshot_interval_frames,
            fps,
        }
    }
}

/// Everything a recorder needs from the outside for one write.
pub struct RecordContext<'a> {
    pub device_id: &'a str,
    pub sink: &'a dyn VideoSink,
    pub layout: &'a StorageLayout,
    pub settings: &'a RecorderSettings,
}

struct OpenSegment {
    bucket: SegmentBucket,
    writer: Box<dyn VideoWriter>,
}

/// Statistics for one device recorder.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RecorderStats {
    pub frames_written: u64,
    pub frames_skipped: u64,
    pub segments_opened: u64,
    pub snapshots_written: u64,
    pub snapshots_failed: u64,
}

/// Per-device continuous recorder. Lives inside the device lock.
#[derive(Default)]
pub struct ContinuousRecorder {
    current: Option<OpenSegment>,
    last_bucket: Option<SegmentBucket>,
    frame_counter: u64,
    stats: RecorderStats,
}

impl ContinuousRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> RecorderStats {
        self.stats
    }

    /// Bucket of the most recent frame.
    pub fn current_bucket(&self) -> Option<SegmentBucket> {
        self.last_bucket
    }

    /// Write one frame, rotating the file when the bucket changes.
    ///
    /// Failures are logged here; the returned error is informational and
    /// must not stop the frame from reaching other consumers.
    pub fn record(&mut self, frame: &EncodedFrame, ctx: &RecordContext<'_>) -> Result<(), RecorderError> {
        let bucket = SegmentBucket::containing(frame.captured_at, ctx.settings.rotation_minutes);

        if self.last_bucket != Some(bucket) {
            self.close_current(ctx.device_id);
            self.last_bucket = Some(bucket);
        }

        self.frame_counter += 1;
        self.maybe_snapshot(frame, ctx);

        let written = self.write_with_retry(frame, bucket, ctx);
        match &written {
            Ok(()) => self.stats.frames_written += 1,
            Err(e) => {
                self.stats.frames_skipped += 1;
                error!(
                    device_id = %ctx.device_id,
                    error = %e,
                    "Skipping frame for continuous recording"
                );
            }
        }

        written
    }

    /// Flush and close the open file, if any.
    pub fn close(&mut self, device_id: &str) {
        self.close_current(device_id);
        self.last_bucket = None;
    }

    fn write_with_retry(
        &mut self,
        frame: &EncodedFrame,
        bucket: SegmentBucket,
        ctx: &RecordContext<'_>,
    ) -> Result<(), RecorderError> {
        match self.try_write(frame, bucket, ctx) {
            Ok(()) => Ok(()),
            Err(first) => {
                warn!(
                    device_id = %ctx.device_id,
                    error = %first,
                    "Video writer failed, recreating"
                );
                // A broken writer is abandoned; the retry opens a fresh one.
                if let Some(segment) = self.current.take() {
                    let _ = segment.writer.finish();
                }
                self.try_write(frame, bucket, ctx).map_err(RecorderError::from)
            }
        }
    }

    fn try_write(
        &mut self,
        frame: &EncodedFrame,
        bucket: SegmentBucket,
        ctx: &RecordContext<'_>,
    ) -> Result<(), VideoError> {
        if self.current.is_none() {
            let path = ctx.layout.continuous_file(ctx.device_id, &bucket);
            let writer = ctx
                .sink
                .open(&path, frame.width, frame.height, ctx.settings.fps)?;
            self.stats.segments_opened += 1;
            info!(
                device_id = %ctx.device_id,
                path = %path.display(),
                width = frame.width,
                height = frame.height,
                "Started continuous recording segment"
            );
            self.current = Some(OpenSegment { bucket, writer });
        }

        match self.current.as_mut() {
            Some(segment) => segment.writer.write_frame(frame),
            None => Err(VideoError::Closed),
        }
    }

    fn close_current(&mut self, device_id: &str) {
        if let Some(segment) = self.current.take() {
            let stem = segment.bucket.file_stem();
            match segment.writer.finish() {
                Ok(()) => debug!(device_id = %device_id, segment = %stem, "Closed continuous segment"),
                Err(e) => warn!(
                    device_id = %device_id,
                    segment = %stem,
                    error = %e,
                    "Failed to finalize continuous segment"
                ),
            }
        }
    }

    fn maybe_snapshot(&mut self, frame: &EncodedFrame, ctx: &RecordContext<'_>) {
        let interval = ctx.settings.snapshot_interval_frames;
        if interval == 0 || self.frame_counter % interval != 0 {
            return;
        }

        let path = ctx.layout.snapshot_file(ctx.device_id, frame.captured_at);
        let result = path
            .parent()
            .map_or(Ok(()), std::fs::create_dir_all)
            .and_then(|()| std::fs::write(&path, &frame.payload));

        match result {
            Ok(()) => {
                self.stats.snapshots_written += 1;
                debug!(device_id = %ctx.device_id, path = %path.display(), "Saved snapshot");
            }
            Err(e) => {
                self.stats.snapshots_failed += 1;
                warn!(device_id = %ctx.device_id, path = %path.display(), error = %e, "Failed to save snapshot");
            }
        }
    }
}
