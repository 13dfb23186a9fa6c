//! Video writer seam.
//!
//! Recorders and the clip extractor only talk to [`VideoSink`] and
//! [`VideoWriter`]. The production sink pipes JPEG payloads into an `ffmpeg`
//! child process which encodes them to H.264 in the configured container.

use crate::frame::EncodedFrame;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use thiserror::Error;
use tracing::{debug, warn};

/// Errors that can occur while writing video.
#[derive(Debug, Error)]
pub enum VideoError {
    #[error("Failed to start encoder for {path}: {source}")]
    Spawn {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Video I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Encoder exited with status {status:?} for {path}")]
    Exited { path: PathBuf, status: Option<i32> },

    #[error("Writer is already closed")]
    Closed,
}

/// An open video file accepting frames in order.
pub trait VideoWriter: Send {
    /// Append one frame.
    fn write_frame(&mut self, frame: &EncodedFrame) -> Result<(), VideoError>;

    /// Flush and close the file.
    fn finish(self: Box<Self>) -> Result<(), VideoError>;
}

/// Opens video writers.
pub trait VideoSink: Send + Sync {
    fn open(
        &self,
        path: &Path,
        width: u32,
        height: u32,
        fps: u32,
    ) -> Result<Box<dyn VideoWriter>, VideoError>;
}

/// Sink backed by an external `ffmpeg` binary.
#[derive(Debug, Clone)]
pub struct FfmpegSink {
    binary: String,
}

impl FfmpegSink {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn command(&self, path: &Path, width: u32, height: u32, fps: u32) -> Command {
        let mut command = Command::new(&self.binary);
        command
            .args(["-hide_banner", "-loglevel", "error", "-y"])
            .args(["-f", "image2pipe", "-c:v", "mjpeg"])
            .args(["-framerate", &fps.to_string()])
            .args(["-i", "-"])
            // Odd sizes are not accepted by yuv420p.
            .args(["-vf", &format!("scale={}:{}", even(width), even(height))])
            .args(["-c:v", "libx264", "-preset", "veryfast", "-pix_fmt", "yuv420p"])
            .args(["-movflags", "+faststart"])
            .arg(path)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        command
    }
}

impl VideoSink for FfmpegSink {
    fn open(
        &self,
        path: &Path,
        width: u32,
        height: u32,
        fps: u32,
    ) -> Result<Box<dyn VideoWriter>, VideoError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut child = self
            .command(path, width, height, fps)
            .spawn()
            .map_err(|source| VideoError::Spawn {
                path: path.to_path_buf(),
                source,
            })?;

        let stdin = child.stdin.take().ok_or(VideoError::Closed)?;

        debug!(path = %path.display(), width, height, fps, "Opened video writer");

        Ok(Box::new(FfmpegWriter {
            path: path.to_path_buf(),
            child,
            stdin: Some(stdin),
        }))
    }
}

/// One running encoder process.
struct FfmpegWriter {
    path: PathBuf,
    child: Child,
    stdin: Option<ChildStdin>,
}

impl VideoWriter for FfmpegWriter {
    fn write_frame(&mut self, frame: &EncodedFrame) -> Result<(), VideoError> {
        let stdin = self.stdin.as_mut().ok_or(VideoError::Closed)?;
        stdin.write_all(&frame.payload)?;
        Ok(())
    }

    fn finish(mut self: Box<Self>) -> Result<(), VideoError> {
        // Closing stdin lets ffmpeg finalize the container.
        drop(self.stdin.take());
        let status = self.child.wait()?;
        if status.success() {
            debug!(path = %self.path.display(), "Closed video writer");
            Ok(())
        } else {
            Err(VideoError::Exited {
                path: self.path.clone(),
                status: status.code(),
            })
        }
    }
}

impl Drop for FfmpegWriter {
    fn drop(&mut self) {
        if self.stdin.take().is_some() {
            warn!(path = %self.path.display(), "Video writer dropped without finish");
            let _ = self.child.wait();
        }
    }
}

fn even(value: u32) -> u32 {
    (value.max(2)) & !1
}

#[cfg(test)]
pub(crate) mod test_support {
    //! In-memory sink recording what would have been encoded.

    use super::*;
    use parking_lot::Mutex;
    use std::sync::mpsc::Receiver;
    use std::sync::Arc;
    use std::time::Duration;

    /// A finished (or still open) file seen by [`MemorySink`].
    #[derive(Debug, Clone, Default)]
    pub struct MemoryFile {
        pub path: PathBuf,
        pub width: u32,
        pub height: u32,
        pub fps: u32,
        pub frames: Vec<EncodedFrame>,
        pub finished: bool,
    }

    #[derive(Default)]
    struct Shared {
        files: Vec<MemoryFile>,
        open_failures: usize,
        write_failures: usize,
        opens: usize,
    }

    /// Video sink that keeps everything in memory; failures can be scripted.
    #[derive(Clone, Default)]
    pub struct MemorySink {
        shared: Arc<Mutex<Shared>>,
        held_open: Arc<Mutex<Option<Receiver<()>>>>,
    }

    impl MemorySink {
        pub fn new() -> Self {
            Self::default()
        }

        /// The next `count` opens fail.
        pub fn fail_next_opens(&self, count: usize) {
            self.shared.lock().open_failures = count;
        }

        /// The next `count` frame writes fail.
        pub fn fail_next_writes(&self, count: usize) {
            self.shared.lock().write_failures = count;
        }

        /// The next open blocks until `release` fires (or five seconds pass).
        pub fn hold_next_open(&self, release: Receiver<()>) {
            *self.held_open.lock() = Some(release);
        }

        pub fn files(&self) -> Vec<MemoryFile> {
            self.shared.lock().files.clone()
        }

        pub fn open_attempts(&self) -> usize {
            self.shared.lock().opens
        }
    }

    impl VideoSink for MemorySink {
        fn open(
            &self,
            path: &Path,
            width: u32,
            height: u32,
            fps: u32,
        ) -> Result<Box<dyn VideoWriter>, VideoError> {
            let held = self.held_open.lock().take();
            if let Some(release) = held {
                let _ = release.recv_timeout(Duration::from_secs(5));
            }

            let mut shared = self.shared.lock();
            shared.opens += 1;
            if shared.open_failures > 0 {
                shared.open_failures -= 1;
                return Err(VideoError::Spawn {
                    path: path.to_path_buf(),
                    source: std::io::Error::new(std::io::ErrorKind::Other, "scripted failure"),
                });
            }
            shared.files.push(MemoryFile {
                path: path.to_path_buf(),
                width,
                height,
                fps,
                ..MemoryFile::default()
            });
            let index = shared.files.len() - 1;
            Ok(Box::new(MemoryWriter {
                shared: self.shared.clone(),
                index,
            }))
        }
    }

    struct MemoryWriter {
        shared: Arc<Mutex<Shared>>,
        index: usize,
    }

    impl VideoWriter for MemoryWriter {
        fn write_frame(&mut self, frame: &EncodedFrame) -> Result<(), VideoError> {
            let mut shared = self.shared.lock();
            if shared.write_failures > 0 {
                shared.write_failures -= 1;
                return Err(VideoError::Io(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "scripted failure",
                )));
            }
            shared.files[self.index].frames.push(frame.clone());
            Ok(())
        }

        fn finish(self: Box<Self>) -> Result<(), VideoError> {
            self.shared.lock().files[self.index].finished = true;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_even_dimensions() {
        assert_eq!(even(640), 640);
        assert_eq!(even(641), 640);
        assert_eq!(even(1), 2);
        assert_eq!(even(0), 2);
    }

    #[test]
    fn test_ffmpeg_command_arguments() {
        let sink = FfmpegSink::new("ffmpeg");
        let command = sink.command(Path::new("/tmp/out.mp4"), 641, 480, 15);
        let args: Vec<String> = command
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();

        assert_eq!(command.get_program(), "ffmpeg");
        assert!(args.windows(2).any(|w| w == ["-framerate", "15"]));
        assert!(args.windows(2).any(|w| w == ["-vf", "scale=640:480"]));
        assert_eq!(args.last().map(String::as_str), Some("/tmp/out.mp4"));
    }

    #[test]
    fn test_missing_binary_reports_spawn_error() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FfmpegSink::new("/nonexistent/ffmpeg-binary");
        let result = sink.open(&dir.path().join("clip.mp4"), 64, 48, 15);
        assert!(matches!(result, Err(VideoError::Spawn { .. })));
    }
}
