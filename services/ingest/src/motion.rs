//! Motion detection hook and the per-device motion window.
//!
//! Detection is an injected capability: the ingest path only needs a
//! boolean per frame (and optionally an annotated copy for live view). The
//! window accumulates `(frame, motion)` pairs until it holds one segment,
//! then hands the whole generation off in a single swap.

use crate::config::MotionConfig;
use crate::frame::{EncodedFrame, Frame};
use bytes::Bytes;
use image::GrayImage;
use std::sync::Arc;

/// Result of running detection on one frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Detection {
    /// Whether the frame shows motion
    pub motion: bool,

    /// Annotated JPEG for live viewing, if the detector renders one
    pub annotated: Option<Bytes>,
}

impl Detection {
    pub fn motion(motion: bool) -> Self {
        Self {
            motion,
            annotated: None,
        }
    }
}

/// Stateful per-device motion detector.
pub trait MotionDetector: Send {
    fn detect(&mut self, frame: &Frame) -> Detection;
}

/// Creates one detector per device.
pub trait DetectorFactory: Send + Sync {
    fn create(&self, device_id: &str) -> Box<dyn MotionDetector>;
}

impl<F> DetectorFactory for F
where
    F: Fn(&str) -> Box<dyn MotionDetector> + Send + Sync,
{
    fn create(&self, device_id: &str) -> Box<dyn MotionDetector> {
        self(device_id)
    }
}

/// Settings for [`FrameDiffDetector`].
#[derive(Debug, Clone, Copy)]
pub struct FrameDiffSettings {
    pub pixel_threshold: u8,
    pub motion_threshold: f32,
}

impl From<&MotionConfig> for FrameDiffSettings {
    fn from(config: &MotionConfig) -> Self {
        Self {
            pixel_threshold: config.pixel_threshold,
            motion_threshold: config.motion_threshold,
        }
    }
}

/// Consecutive-frame differencing on grayscale images.
///
/// A pixel counts as changed when its luma differs from the previous frame
/// by more than `pixel_threshold`; the frame shows motion when the changed
/// fraction exceeds `motion_threshold`.
pub struct FrameDiffDetector {
    settings: FrameDiffSettings,
    previous: Option<GrayImage>,
}

impl FrameDiffDetector {
    pub fn new(settings: FrameDiffSettings) -> Self {
        Self {
            settings,
            previous: None,
        }
    }

    /// Factory handing every device its own detector.
    pub fn factory(settings: FrameDiffSettings) -> Arc<dyn DetectorFactory> {
        Arc::new(move |_device_id: &str| -> Box<dyn MotionDetector> {
            Box::new(FrameDiffDetector::new(settings))
        })
    }

    fn changed_fraction(&self, previous: &GrayImage, current: &GrayImage) -> f32 {
        let threshold = self.settings.pixel_threshold;
        let changed = previous
            .as_raw()
            .iter()
            .zip(current.as_raw())
            .filter(|(a, b)| a.abs_diff(**b) > threshold)
            .count();
        changed as f32 / current.as_raw().len().max(1) as f32
    }
}

impl MotionDetector for FrameDiffDetector {
    fn detect(&mut self, frame: &Frame) -> Detection {
        let gray = image::imageops::grayscale(frame.pixels());

        let motion = match &self.previous {
            Some(previous) if previous.dimensions() == gray.dimensions() => {
                self.changed_fraction(previous, &gray) > self.settings.motion_threshold
            }
            // First frame, or the camera changed resolution.
            _ => false,
        };

        self.previous = Some(gray);
        Detection::motion(motion)
    }
}

/// Contents of one motion window generation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MotionSnapshot {
    pub frames: Vec<EncodedFrame>,
    pub flags: Vec<bool>,
}

impl MotionSnapshot {
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn has_motion(&self) -> bool {
        self.flags.iter().any(|&f| f)
    }
}

/// Fixed-capacity window of frames and motion flags.
#[derive(Debug)]
pub struct MotionWindowBuffer {
    frames: Vec<EncodedFrame>,
    flags: Vec<bool>,
    capacity: usize,
}

impl MotionWindowBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            frames: Vec::with_capacity(capacity),
            flags: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a frame; returns the full generation once capacity is reached.
    pub fn push(&mut self, frame: EncodedFrame, motion: bool) -> Option<MotionSnapshot> {
        self.frames.push(frame);
        self.flags.push(motion);

        if self.frames.len() >= self.capacity {
            self.take()
        } else {
            None
        }
    }

    /// Swap out whatever is buffered, leaving the window empty.
    pub fn take(&mut self) -> Option<MotionSnapshot> {
        if self.frames.is_empty() {
            return None;
        }
        let frames = std::mem::replace(&mut self.frames, Vec::with_capacity(self.capacity));
        let flags = std::mem::replace(&mut self.flags, Vec::with_capacity(self.capacity));
        Some(MotionSnapshot { frames, flags })
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    /// Detector replaying a fixed flag script, then reporting no motion.
    pub struct ScriptedDetector {
        script: VecDeque<bool>,
    }

    impl ScriptedDetector {
        pub fn new(script: impl IntoIterator<Item = bool>) -> Self {
            Self {
                script: script.into_iter().collect(),
            }
        }
    }

    impl MotionDetector for ScriptedDetector {
        fn detect(&mut self, _frame: &Frame) -> Detection {
            Detection::motion(self.script.pop_front().unwrap_or(false))
        }
    }

    struct ConstantDetector(bool);

    impl MotionDetector for ConstantDetector {
        fn detect(&mut self, _frame: &Frame) -> Detection {
            Detection::motion(self.0)
        }
    }

    /// Factory giving every device a detector that always answers `motion`.
    pub fn constant_factory(motion: bool) -> Arc<dyn DetectorFactory> {
        Arc::new(move |_: &str| -> Box<dyn MotionDetector> { Box::new(ConstantDetector(motion)) })
    }

    /// Factory handing out pre-built scripts by device id.
    pub fn scripted_factory(scripts: Vec<(&str, Vec<bool>)>) -> Arc<dyn DetectorFactory> {
        let scripts: Mutex<Vec<(String, Vec<bool>)>> = Mutex::new(
            scripts
                .into_iter()
                .map(|(id, flags)| (id.to_string(), flags))
                .collect(),
        );
        Arc::new(move |device_id: &str| -> Box<dyn MotionDetector> {
            let flags = scripts
                .lock()
                .iter()
                .find(|(id, _)| id == device_id)
                .map(|(_, flags)| flags.clone())
                .unwrap_or_default();
            Box::new(ScriptedDetector::new(flags))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::test_support::solid_frame;

    fn settings() -> FrameDiffSettings {
        FrameDiffSettings {
            pixel_threshold: 30,
            motion_threshold: 0.01,
        }
    }

    #[test]
    fn test_first_frame_never_moves() {
        let mut detector = FrameDiffDetector::new(settings());
        assert!(!detector.detect(&solid_frame(32, 32, [255, 255, 255])).motion);
    }

    #[test]
    fn test_static_scene_has_no_motion() {
        let mut detector = FrameDiffDetector::new(settings());
        let frame = solid_frame(32, 32, [90, 90, 90]);
        detector.detect(&frame);
        assert!(!detector.detect(&frame).motion);
    }

    #[test]
    fn test_large_change_is_motion() {
        let mut detector = FrameDiffDetector::new(settings());
        detector.detect(&solid_frame(32, 32, [0, 0, 0]));
        assert!(detector.detect(&solid_frame(32, 32, [255, 255, 255])).motion);
    }

    #[test]
    fn test_resolution_change_resets_reference() {
        let mut detector = FrameDiffDetector::new(settings());
        detector.detect(&solid_frame(32, 32, [0, 0, 0]));
        assert!(!detector.detect(&solid_frame(64, 48, [255, 255, 255])).motion);
        assert!(!detector.detect(&solid_frame(64, 48, [255, 255, 255])).motion);
    }

    #[test]
    fn test_window_hands_off_at_capacity() {
        let mut window = MotionWindowBuffer::new(3);
        let frame = solid_frame(8, 8, [1, 1, 1]).encoded();

        assert!(window.push(frame.clone(), false).is_none());
        assert!(window.push(frame.clone(), true).is_none());
        let snapshot = window.push(frame.clone(), false).expect("full window");

        assert_eq!(snapshot.flags, vec![false, true, false]);
        assert_eq!(snapshot.len(), 3);
        assert!(snapshot.has_motion());
        assert!(window.is_empty());
        assert_eq!(window.capacity(), 3);
    }

    #[test]
    fn test_window_never_loses_or_duplicates_frames() {
        let mut window = MotionWindowBuffer::new(4);
        let mut handed_off = Vec::new();

        for i in 0..10u8 {
            let mut frame = solid_frame(8, 8, [i, i, i]).encoded();
            frame.payload = Bytes::from(vec![i]);
            if let Some(snapshot) = window.push(frame, i % 3 == 0) {
                assert!(window.len() <= window.capacity());
                handed_off.extend(snapshot.frames);
            }
        }
        handed_off.extend(window.take().expect("partial window").frames);

        let order: Vec<u8> = handed_off.iter().map(|f| f.payload[0]).collect();
        assert_eq!(order, (0..10).collect::<Vec<u8>>());
        assert!(window.take().is_none());
    }
}
