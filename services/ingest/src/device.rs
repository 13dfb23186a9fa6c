//! Per-device state and the frame store.
//!
//! The registry map is only locked to find or insert a handle. All mutable
//! state of one device (status, latest frame, recorder, motion window,
//! detector) sits behind that device's own mutex, and no code path holds
//! two device locks at once.

use crate::motion::{DetectorFactory, MotionDetector, MotionWindowBuffer};
use crate::recorder::ContinuousRecorder;
use bytes::Bytes;
use chrono::{DateTime, Local};
use parking_lot::{Mutex, MutexGuard, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

const DEFAULT_DEVICE_TYPE: &str = "camera";
const CLIP_LABEL_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Connection status of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Online,
    Offline,
}

/// Externally visible description of a device.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceState {
    pub device_id: String,
    #[serde(rename = "type")]
    pub device_type: String,
    pub alias: Option<String>,
    pub status: DeviceStatus,
    pub last_seen: Option<DateTime<Local>>,
    pub motion_enabled: bool,
    pub frames_received: u64,
}

impl DeviceState {
    fn new(device_id: &str, motion_enabled: bool) -> Self {
        Self {
            device_id: device_id.to_string(),
            device_type: DEFAULT_DEVICE_TYPE.to_string(),
            alias: None,
            status: DeviceStatus::Offline,
            last_seen: None,
            motion_enabled,
            frames_received: 0,
        }
    }

    /// Record that a frame arrived.
    pub fn touch(&mut self, at: DateTime<Local>) {
        self.status = DeviceStatus::Online;
        self.last_seen = Some(at);
        self.frames_received += 1;
    }
}

/// Everything mutable about one device.
pub struct DeviceSlot {
    pub state: DeviceState,
    pub latest_frame: Option<Bytes>,
    pub annotated_frame: Option<Bytes>,
    pub recorder: ContinuousRecorder,
    pub motion: MotionWindowBuffer,
    pub detector: Box<dyn MotionDetector>,
    /// Motion windows handed off so far
    pub windows_handed_off: u64,
}

impl DeviceSlot {
    /// Label for the next motion window; the sequence keeps labels taken
    /// within the same second distinct.
    pub fn next_clip_label(&mut self, at: DateTime<Local>) -> String {
        self.windows_handed_off += 1;
        format!("{}_{}", at.format(CLIP_LABEL_FORMAT), self.windows_handed_off)
    }
}

/// A device and its lock.
pub struct DeviceHandle {
    id: String,
    slot: Mutex<DeviceSlot>,
}

impl DeviceHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn lock(&self) -> MutexGuard<'_, DeviceSlot> {
        self.slot.lock()
    }
}

/// How new devices are set up.
#[derive(Clone)]
pub struct DeviceTemplate {
    pub window_capacity: usize,
    pub detectors: Arc<dyn DetectorFactory>,
    pub motion_enabled: bool,
}

/// Registry of every device that has registered or sent a frame.
pub struct DeviceRegistry {
    devices: RwLock<HashMap<String, Arc<DeviceHandle>>>,
    template: DeviceTemplate,
}

impl DeviceRegistry {
    pub fn new(template: DeviceTemplate) -> Self {
        Self {
            devices: RwLock::new(HashMap::new()),
            template,
        }
    }

    /// Look up a device, creating it on first contact.
    pub fn get_or_create(&self, device_id: &str) -> Arc<DeviceHandle> {
        if let Some(handle) = self.devices.read().get(device_id) {
            return handle.clone();
        }

        self.devices
            .write()
            .entry(device_id.to_string())
            .or_insert_with(|| {
                debug!(device_id = %device_id, "New device");
                Arc::new(self.new_handle(device_id))
            })
            .clone()
    }

    pub fn get(&self, device_id: &str) -> Option<Arc<DeviceHandle>> {
        self.devices.read().get(device_id).cloned()
    }

    /// Snapshot of all handles; the map lock is released on return.
    pub fn handles(&self) -> Vec<Arc<DeviceHandle>> {
        self.devices.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.devices.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.read().is_empty()
    }

    /// Register a device explicitly, updating type and alias when given.
    pub fn register(&self, device_id: &str, device_type: Option<String>, alias: Option<String>) -> DeviceState {
        let handle = self.get_or_create(device_id);
        let mut slot = handle.lock();
        if let Some(device_type) = device_type {
            slot.state.device_type = device_type;
        }
        if alias.is_some() {
            slot.state.alias = alias;
        }
        info!(device_id = %device_id, device_type = %slot.state.device_type, "Device registered");
        slot.state.clone()
    }

    pub fn set_alias(&self, device_id: &str, alias: String) -> Option<DeviceState> {
        let handle = self.get(device_id)?;
        let mut slot = handle.lock();
        slot.state.alias = Some(alias);
        Some(slot.state.clone())
    }

    /// Toggle motion detection. Re-enabling starts from a fresh detector.
    pub fn set_motion_enabled(&self, device_id: &str, enabled: bool) -> Option<DeviceState> {
        let handle = self.get(device_id)?;
        let mut slot = handle.lock();
        if enabled && !slot.state.motion_enabled {
            slot.detector = self.template.detectors.create(device_id);
        }
        if !enabled {
            slot.annotated_frame = None;
        }
        slot.state.motion_enabled = enabled;
        info!(device_id = %device_id, enabled, "Motion detection toggled");
        Some(slot.state.clone())
    }

    /// Most recent raw frame of a device.
    pub fn latest_frame(&self, device_id: &str) -> Option<Bytes> {
        self.get(device_id)?.lock().latest_frame.clone()
    }

    /// Frame for live view: annotated when available, raw otherwise.
    pub fn live_frame(&self, device_id: &str) -> Option<Bytes> {
        let handle = self.get(device_id)?;
        let slot = handle.lock();
        slot.annotated_frame
            .clone()
            .or_else(|| slot.latest_frame.clone())
    }

    pub fn state(&self, device_id: &str) -> Option<DeviceState> {
        Some(self.get(device_id)?.lock().state.clone())
    }

    /// All device states, sorted by id.
    pub fn list(&self) -> Vec<DeviceState> {
        let mut states: Vec<DeviceState> = self
            .handles()
            .iter()
            .map(|handle| handle.lock().state.clone())
            .collect();
        states.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        states
    }

    /// Mark devices without a frame for longer than `timeout` offline.
    pub fn mark_stale(&self, now: DateTime<Local>, timeout: Duration) -> usize {
        let mut marked = 0;
        for handle in self.handles() {
            let mut slot = handle.lock();
            let stale = slot.state.status == DeviceStatus::Online
                && slot
                    .state
                    .last_seen
                    .and_then(|seen| (now - seen).to_std().ok())
                    .map_or(false, |age| age > timeout);
            if stale {
                slot.state.status = DeviceStatus::Offline;
                marked += 1;
                info!(device_id = %handle.id(), "Device went offline");
            }
        }
        marked
    }

    fn new_handle(&self, device_id: &str) -> DeviceHandle {
        DeviceHandle {
            id: device_id.to_string(),
            slot: Mutex::new(DeviceSlot {
                state: DeviceState::new(device_id, self.template.motion_enabled),
                latest_frame: None,
                annotated_frame: None,
                recorder: ContinuousRecorder::new(),
                motion: MotionWindowBuffer::new(self.template.window_capacity),
                detector: self.template.detectors.create(device_id),
                windows_handed_off: 0,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::motion::test_support::constant_factory;
    use chrono::TimeZone;

    fn registry() -> DeviceRegistry {
        DeviceRegistry::new(DeviceTemplate {
            window_capacity: 8,
            detectors: constant_factory(false),
            motion_enabled: true,
        })
    }

    #[test]
    fn test_get_or_create_returns_same_handle() {
        let registry = registry();
        let a = registry.get_or_create("cam1");
        let b = registry.get_or_create("cam1");

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);
        assert_eq!(a.lock().motion.capacity(), 8);
    }

    #[test]
    fn test_unknown_device_has_no_frame() {
        let registry = registry();
        assert!(registry.latest_frame("missing").is_none());
        assert!(registry.set_alias("missing", "x".into()).is_none());
        assert!(registry.set_motion_enabled("missing", false).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_register_and_list_sorted() {
        let registry = registry();
        registry.register("zeta", None, None);
        let state = registry.register("alpha", Some("doorbell".into()), Some("Front".into()));

        assert_eq!(state.device_type, "doorbell");
        assert_eq!(state.alias.as_deref(), Some("Front"));
        assert_eq!(state.status, DeviceStatus::Offline);

        let ids: Vec<String> = registry.list().into_iter().map(|s| s.device_id).collect();
        assert_eq!(ids, vec!["alpha", "zeta"]);

        // Re-registering without an alias keeps the old one.
        let again = registry.register("alpha", None, None);
        assert_eq!(again.alias.as_deref(), Some("Front"));
        assert_eq!(again.device_type, "doorbell");
    }

    #[test]
    fn test_live_frame_prefers_annotated() {
        let registry = registry();
        let handle = registry.get_or_create("cam1");
        handle.lock().latest_frame = Some(Bytes::from_static(b"raw"));
        assert_eq!(registry.live_frame("cam1"), Some(Bytes::from_static(b"raw")));

        handle.lock().annotated_frame = Some(Bytes::from_static(b"boxes"));
        assert_eq!(registry.live_frame("cam1"), Some(Bytes::from_static(b"boxes")));
        assert_eq!(registry.latest_frame("cam1"), Some(Bytes::from_static(b"raw")));

        registry.set_motion_enabled("cam1", false);
        assert_eq!(registry.live_frame("cam1"), Some(Bytes::from_static(b"raw")));
    }

    #[test]
    fn test_mark_stale() {
        let registry = registry();
        let seen = Local.with_ymd_and_hms(2024, 3, 9, 10, 0, 0).unwrap();
        registry.get_or_create("old").lock().state.touch(seen);
        registry
            .get_or_create("fresh")
            .lock()
            .state
            .touch(seen + chrono::Duration::seconds(50));
        registry.register("never", None, None);

        let now = seen + chrono::Duration::seconds(60);
        assert_eq!(registry.mark_stale(now, Duration::from_secs(30)), 1);

        assert_eq!(registry.state("old").unwrap().status, DeviceStatus::Offline);
        assert_eq!(registry.state("fresh").unwrap().status, DeviceStatus::Online);
        assert_eq!(registry.state("never").unwrap().status, DeviceStatus::Offline);
        assert_eq!(registry.mark_stale(now, Duration::from_secs(30)), 0);
    }

    #[test]
    fn test_state_serializes_lowercase_status() {
        let registry = registry();
        let state = registry.register("cam1", None, Some("Porch".into()));
        let json = serde_json::to_value(&state).unwrap();

        assert_eq!(json["status"], "offline");
        assert_eq!(json["type"], "camera");
        assert_eq!(json["alias"], "Porch");
        assert_eq!(json["motion_enabled"], true);
    }

    #[test]
    fn test_clip_labels_unique_within_one_second() {
        let registry = registry();
        let at = Local.with_ymd_and_hms(2024, 3, 9, 10, 15, 0).unwrap();
        let handle = registry.get_or_create("cam1");
        let mut slot = handle.lock();

        let first = slot.next_clip_label(at);
        let second = slot.next_clip_label(at);

        assert_eq!(first, "20240309_101500_1");
        assert_eq!(second, "20240309_101500_2");
    }
}
