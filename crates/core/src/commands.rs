use serde::{Deserialize, Serialize};

use crate::events::DeviceId;

/// Operator intents accepted by the alarm service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum Command {
    Set { device: DeviceId, active: bool },
    SetAll(bool), // master switch
}

impl Command {
    /// Devices this command touches, in publish order.
    pub fn targets(&self) -> Vec<DeviceId> {
        match self {
            Command::Set { device, .. } => vec![*device],
            Command::SetAll(_) => DeviceId::all().collect(),
        }
    }

    pub fn active(&self) -> bool {
        match *self {
            Command::Set { active, .. } | Command::SetAll(active) => active,
        }
    }
}
