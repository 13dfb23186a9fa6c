//! Ingestion pipeline.
//!
//! Every carved payload goes through the same steps: decode, then under the
//! device lock update the frame store, write the continuous recording, run
//! detection and append to the motion window. A full window becomes a
//! [`ClipTask`] that is queued after the lock is released.
//!
//! Shutdown is flush-then-drain: new frames are refused, each partially
//! filled motion window is queued as one final task, recorders are closed
//! and the worker pool is drained.

use crate::clips::{ClipExtractor, ClipSettings, ClipTask};
use crate::config::IngestConfig;
use crate::device::{DeviceRegistry, DeviceTemplate};
use crate::extractor::FrameExtractor;
use crate::frame::{CodecError, Frame};
use crate::layout::StorageLayout;
use crate::motion::DetectorFactory;
use crate::recorder::{RecordContext, RecorderSettings};
use crate::video::VideoSink;
use crate::worker::{ClipHandler, ClipWorkerPool, PoolStats};
use bytes::Bytes;
use chrono::Local;
use futures::{Stream, StreamExt};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinError;
use tracing::{debug, info, warn};

/// Errors from frame ingestion.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("Failed to decode frame: {0}")]
    Codec(#[from] CodecError),

    #[error("Service is shutting down")]
    ShuttingDown,

    #[error("Ingest task failed: {0}")]
    Task(#[from] JoinError),
}

/// What happened to one accepted frame.
#[derive(Debug, Default)]
pub struct FrameOutcome {
    pub motion: bool,
    pub recorded: bool,
    /// Full motion window handed off by this frame
    pub task: Option<ClipTask>,
}

/// Result of one upload request.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UploadSummary {
    pub accepted: u64,
    pub rejected: u64,
    /// The body ended with a transport error
    pub truncated: bool,
}

/// Ingestion counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IngestStats {
    pub frames_accepted: u64,
    pub frames_rejected: u64,
    pub clip_tasks: u64,
}

/// Totals reported once shutdown completes.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    pub final_tasks: u64,
    pub ingest: IngestStats,
    pub pool: PoolStats,
}

/// Owns all devices and the clip worker pool.
pub struct Ingestor {
    registry: DeviceRegistry,
    layout: StorageLayout,
    sink: Arc<dyn VideoSink>,
    recorder_settings: RecorderSettings,
    pool: ClipWorkerPool,
    drop_on_backpressure: bool,
    /// Held shared by every frame in flight; shutdown takes it exclusively.
    gate: tokio::sync::RwLock<()>,
    shutting_down: AtomicBool,
    stats: RwLock<IngestStats>,
}

impl Ingestor {
    /// Build an ingestor whose workers extract clips into the storage root.
    ///
    /// Must be called within a Tokio runtime.
    pub fn new(config: &IngestConfig, sink: Arc<dyn VideoSink>, detectors: Arc<dyn DetectorFactory>) -> Self {
        let extractor = ClipExtractor::new(
            ClipSettings::from(&config.motion),
            StorageLayout::from(&config.storage),
            sink.clone(),
        );
        Self::with_handler(config, sink, detectors, Arc::new(extractor))
    }

    /// Build an ingestor with a custom clip handler.
    pub fn with_handler(
        config: &IngestConfig,
        sink: Arc<dyn VideoSink>,
        detectors: Arc<dyn DetectorFactory>,
        handler: Arc<dyn ClipHandler>,
    ) -> Self {
        let registry = DeviceRegistry::new(DeviceTemplate {
            window_capacity: config.motion.segment_frames(),
            detectors,
            motion_enabled: config.motion.enabled_by_default,
        });
        let pool = ClipWorkerPool::start(handler, config.workers.num_workers, config.workers.queue_size);

        Self {
            registry,
            layout: StorageLayout::from(&config.storage),
            sink,
            recorder_settings: RecorderSettings::new(&config.recording, config.motion.fps),
            pool,
            drop_on_backpressure: config.workers.drop_on_backpressure,
            gate: tokio::sync::RwLock::new(()),
            shutting_down: AtomicBool::new(false),
            stats: RwLock::new(IngestStats::default()),
        }
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> IngestStats {
        *self.stats.read()
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Run one payload through the device's pipeline.
    ///
    /// Does not queue the resulting task; see [`Ingestor::accept_payload`].
    pub fn ingest_payload(&self, device_id: &str, payload: Bytes) -> Result<FrameOutcome, IngestError> {
        if self.is_shutting_down() {
            return Err(IngestError::ShuttingDown);
        }

        let frame = match Frame::decode(payload, Local::now()) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(device_id = %device_id, error = %e, "Dropping undecodable frame");
                self.stats.write().frames_rejected += 1;
                return Err(e.into());
            }
        };

        let handle = self.registry.get_or_create(device_id);
        let mut guard = handle.lock();
        let slot = &mut *guard;

        slot.state.touch(frame.captured_at());
        slot.latest_frame = Some(frame.payload().clone());

        let encoded = frame.encoded();
        let ctx = RecordContext {
            device_id,
            sink: self.sink.as_ref(),
            layout: &self.layout,
            settings: &self.recorder_settings,
        };
        let recorded = slot.recorder.record(&encoded, &ctx).is_ok();

        let mut outcome = FrameOutcome {
            recorded,
            ..FrameOutcome::default()
        };

        if slot.state.motion_enabled {
            let detection = slot.detector.detect(&frame);
            outcome.motion = detection.motion;
            if detection.annotated.is_some() {
                slot.annotated_frame = detection.annotated;
            }

            if let Some(snapshot) = slot.motion.push(encoded, detection.motion) {
                debug!(
                    device_id = %device_id,
                    frames = snapshot.len(),
                    motion = snapshot.has_motion(),
                    "Motion window full"
                );
                let label = slot.next_clip_label(Local::now());
                outcome.task = Some(ClipTask::new(device_id, label, snapshot));
            }
        }
        drop(guard);

        let mut stats = self.stats.write();
        stats.frames_accepted += 1;
        if outcome.task.is_some() {
            stats.clip_tasks += 1;
        }

        Ok(outcome)
    }

    /// Ingest one payload on the blocking pool and queue any resulting clip task.
    pub async fn accept_payload(self: &Arc<Self>, device_id: &str, payload: Bytes) -> Result<FrameOutcome, IngestError> {
        let _gate = self.gate.read().await;

        let ingestor = Arc::clone(self);
        let owned_id = device_id.to_string();
        let mut outcome =
            tokio::task::spawn_blocking(move || ingestor.ingest_payload(&owned_id, payload)).await??;
        if let Some(task) = outcome.task.take() {
            self.dispatch(task).await;
        }
        Ok(outcome)
    }

    /// Carve a request body into frames and ingest them in arrival order.
    ///
    /// Undecodable or marker-less parts are counted as rejected. A body
    /// error stops reading; frames received before it are kept.
    pub async fn ingest_stream<S, E>(
        self: &Arc<Self>,
        device_id: &str,
        content_type: Option<&str>,
        stream: S,
    ) -> Result<UploadSummary, IngestError>
    where
        S: Stream<Item = Result<Bytes, E>>,
        E: std::fmt::Display,
    {
        let mut extractor = FrameExtractor::for_content_type(content_type);
        let mut stream = std::pin::pin!(stream);
        let mut summary = UploadSummary::default();

        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(chunk) => {
                    for payload in extractor.push(&chunk) {
                        self.accept_counted(device_id, payload, &mut summary).await?;
                    }
                }
                Err(e) => {
                    warn!(device_id = %device_id, error = %e, "Upload body error");
                    summary.truncated = true;
                    break;
                }
            }
        }

        if !summary.truncated {
            for payload in extractor.finish() {
                self.accept_counted(device_id, payload, &mut summary).await?;
            }
        }

        summary.rejected += extractor.stats().parts_rejected;

        debug!(
            device_id = %device_id,
            accepted = summary.accepted,
            rejected = summary.rejected,
            bytes = extractor.stats().bytes_received,
            "Upload finished"
        );

        Ok(summary)
    }

    /// Refuse new frames, flush partial motion windows and drain the pool.
    pub async fn shutdown(&self) -> ShutdownReport {
        {
            let _gate = self.gate.write().await;
            if self.shutting_down.swap(true, Ordering::SeqCst) {
                return self.report(0);
            }
        }

        info!(devices = self.registry.len(), "Flushing motion buffers");

        let mut final_tasks = 0;
        for handle in self.registry.handles() {
            // Closing a recorder waits on the encoder process.
            let flush = tokio::task::spawn_blocking({
                let handle = handle.clone();
                move || {
                    let mut slot = handle.lock();
                    slot.recorder.close(handle.id());
                    let snapshot = slot.motion.take()?;
                    let label = slot.next_clip_label(Local::now());
                    Some(ClipTask::new(handle.id(), label, snapshot))
                }
            });
            let task = match flush.await {
                Ok(task) => task,
                Err(e) => {
                    warn!(device_id = %handle.id(), error = %e, "Flushing device failed");
                    continue;
                }
            };

            if let Some(task) = task {
                debug!(device_id = %handle.id(), frames = task.frames.len(), "Queueing final motion segment");
                if let Err(e) = self.pool.submit(task).await {
                    warn!(device_id = %handle.id(), error = %e, "Final motion segment not queued");
                    continue;
                }
                final_tasks += 1;
            }
        }

        self.pool.shutdown().await;

        let report = self.report(final_tasks);
        info!(
            final_tasks = report.final_tasks,
            frames_accepted = report.ingest.frames_accepted,
            clip_tasks = report.ingest.clip_tasks + report.final_tasks,
            "Ingestor shut down"
        );
        report
    }

    async fn accept_counted(
        self: &Arc<Self>,
        device_id: &str,
        payload: Bytes,
        summary: &mut UploadSummary,
    ) -> Result<(), IngestError> {
        match self.accept_payload(device_id, payload).await {
            Ok(_) => summary.accepted += 1,
            Err(IngestError::Codec(_)) => summary.rejected += 1,
            Err(e) => return Err(e),
        }
        Ok(())
    }

    async fn dispatch(&self, task: ClipTask) {
        let device_id = task.device_id.clone();
        let result = if self.drop_on_backpressure {
            self.pool.try_submit(task)
        } else {
            self.pool.submit(task).await
        };

        if let Err(e) = result {
            warn!(device_id = %device_id, error = %e, "Clip task not queued");
        }
    }

    fn report(&self, final_tasks: u64) -> ShutdownReport {
        ShutdownReport {
            final_tasks,
            ingest: self.stats(),
            pool: self.pool.stats(),
        }
    }
}
