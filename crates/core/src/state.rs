use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::events::{AlarmEvent, DeviceId};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Device {
    pub active: bool,
    pub last_update: Option<DateTime<Utc>>,
}

pub type Snapshot = BTreeMap<DeviceId, Device>;

/// Last known state of every siren.
///
/// Broker-confirmed status always overwrites whatever was applied
/// optimistically; nothing here ever removes a device.
#[derive(Debug, Default)]
pub struct Reconciler {
    devices: RwLock<[Device; DeviceId::COUNT]>,
}

impl Reconciler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds an event into the snapshot. Returns whether a device changed.
    ///
    /// Losing the connection keeps the last known flags; callers track the
    /// link separately and show the values as stale.
    pub fn apply(&self, event: &AlarmEvent) -> bool {
        match event {
            AlarmEvent::StatusReceived { device, active } => {
                self.set(*device, *active);
                true
            }
            AlarmEvent::ConnectionChanged(_)
            | AlarmEvent::ConnectionError(_)
            | AlarmEvent::UnparsedMessage { .. } => false,
        }
    }

    /// Reflects a locally issued command before the broker echoes it back.
    pub fn apply_optimistic(&self, device: DeviceId, active: bool) {
        self.set(device, active);
    }

    pub fn apply_optimistic_all(&self, active: bool) {
        for device in DeviceId::all() {
            self.set(device, active);
        }
    }

    pub fn get(&self, device: DeviceId) -> Device {
        self.devices.read().unwrap_or_else(PoisonError::into_inner)[device.index()]
    }

    pub fn get_all(&self) -> Snapshot {
        let devices = self.devices.read().unwrap_or_else(PoisonError::into_inner);
        DeviceId::all().map(|id| (id, devices[id.index()])).collect()
    }

    pub fn active_count(&self) -> usize {
        let devices = self.devices.read().unwrap_or_else(PoisonError::into_inner);
        devices.iter().filter(|d| d.active).count()
    }

    fn set(&self, device: DeviceId, active: bool) {
        let mut devices = self.devices.write().unwrap_or_else(PoisonError::into_inner);
        devices[device.index()] = Device {
            active,
            last_update: Some(Utc::now()),
        };
    }
}
