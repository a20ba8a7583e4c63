use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Identifier of one of the four field sirens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct DeviceId(u8);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("device id {0} is outside {min}..={max}", min = DeviceId::MIN, max = DeviceId::MAX)]
pub struct InvalidDeviceId(pub u64);

impl DeviceId {
    pub const MIN: u8 = 1;
    pub const MAX: u8 = 4;
    pub const COUNT: usize = (Self::MAX - Self::MIN + 1) as usize;

    pub fn new(id: u8) -> Option<Self> {
        (Self::MIN..=Self::MAX).contains(&id).then_some(Self(id))
    }

    pub fn get(self) -> u8 {
        self.0
    }

    /// Every device id in ascending order.
    pub fn all() -> impl Iterator<Item = DeviceId> {
        (Self::MIN..=Self::MAX).map(Self)
    }

    pub(crate) fn index(self) -> usize {
        (self.0 - Self::MIN) as usize
    }
}

impl TryFrom<u8> for DeviceId {
    type Error = InvalidDeviceId;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value).ok_or(InvalidDeviceId(value.into()))
    }
}

impl TryFrom<u64> for DeviceId {
    type Error = InvalidDeviceId;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        u8::try_from(value)
            .ok()
            .and_then(Self::new)
            .ok_or(InvalidDeviceId(value))
    }
}

impl From<DeviceId> for u8 {
    fn from(id: DeviceId) -> Self {
        id.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Everything observers get told about: link lifecycle and parsed status traffic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "value")]
pub enum AlarmEvent {
    ConnectionChanged(bool),
    ConnectionError(String),
    StatusReceived { device: DeviceId, active: bool },
    // diagnostic only
    UnparsedMessage { topic: String, payload: String },
}
