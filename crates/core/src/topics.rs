// Topic layout helpers matching the siren firmware (NodeMCU side)

use std::sync::LazyLock;

use regex::Regex;

use crate::events::{AlarmEvent, DeviceId};

pub const COMMAND_ROOT: &str = "sirena";
pub const STATUS_ROOT: &str = "estado";

/// Device-scoped status prefix; the id is appended without a separator.
const STATUS_PREFIX: &str = "estado/sirena";

// Older firmware reports every siren on one topic: "sirena <id> <on|off>"
pub const LEGACY_STATUS_TOPIC: &str = "estado/sirenas";

pub const ON: &str = "on";
pub const OFF: &str = "off";

static LEGACY_PAYLOAD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"sirena ([0-9]+) (on|off)").expect("legacy status pattern is valid"));

pub fn command_topic(device: DeviceId) -> String {
    format!("{}/{}", COMMAND_ROOT, device)
}

pub fn status_topic(device: DeviceId) -> String {
    format!("{}{}", STATUS_PREFIX, device)
}

/// Subscriptions issued on every successful connect: one per device, then the legacy topic.
pub fn status_topics() -> Vec<String> {
    DeviceId::all()
        .map(status_topic)
        .chain(std::iter::once(LEGACY_STATUS_TOPIC.to_string()))
        .collect()
}

pub fn encode_command(active: bool) -> &'static str {
    if active { ON } else { OFF }
}

/// Interprets one inbound status message.
///
/// Per-device topics are lossy on purpose: only a case-insensitive `on` is
/// active, anything else reads as off. The legacy topic yields nothing when
/// its payload doesn't match. Unknown topics come back as
/// [`AlarmEvent::UnparsedMessage`] so they can be inspected.
pub fn parse_status(topic: &str, payload: &str) -> Option<AlarmEvent> {
    if topic == LEGACY_STATUS_TOPIC {
        return parse_legacy(payload);
    }
    if let Some(device) = topic.strip_prefix(STATUS_PREFIX).and_then(parse_device) {
        return Some(AlarmEvent::StatusReceived {
            device,
            active: payload.eq_ignore_ascii_case(ON),
        });
    }
    Some(AlarmEvent::UnparsedMessage {
        topic: topic.to_string(),
        payload: payload.to_string(),
    })
}

fn parse_legacy(payload: &str) -> Option<AlarmEvent> {
    let caps = LEGACY_PAYLOAD.captures(payload)?;
    let device = parse_device(caps.get(1)?.as_str())?;
    Some(AlarmEvent::StatusReceived {
        device,
        active: caps.get(2)?.as_str() == ON,
    })
}

fn parse_device(digits: &str) -> Option<DeviceId> {
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse::<u64>().ok().and_then(|n| DeviceId::try_from(n).ok())
}
