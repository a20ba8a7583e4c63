use alarmctl_core::{AlarmEvent, DeviceId, Snapshot};
use alarmctl_mqtt::{AlarmService, ConnectionState};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize)]
pub struct AlarmsResponse {
    pub connection: ConnectionState,
    pub connected: bool,
    pub active_count: usize,
    pub total: usize,
    pub alarms: Snapshot,
}

impl AlarmsResponse {
    pub fn from_service(alarms: &AlarmService) -> Self {
        let connection = alarms.connection_state();
        Self {
            connection,
            connected: connection.is_connected(),
            active_count: alarms.active_count(),
            total: DeviceId::COUNT,
            alarms: alarms.get_all(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SetAlarmRequest {
    pub active: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct ConnectRequest {
    pub url: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CommandResponse {
    pub submitted: usize,
    pub alarms: Snapshot,
}

#[derive(Debug, Serialize)]
pub struct ConnectionResponse {
    pub state: ConnectionState,
    pub connected: bool,
    pub broker_url: String,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// One WebSocket message: the event (absent on the greeting frame) plus the
/// panel state as it stood when the event was delivered.
#[derive(Debug, Serialize)]
pub struct EventFrame {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event: Option<AlarmEvent>,
    pub alarms: AlarmsResponse,
}

impl EventFrame {
    pub fn greeting(alarms: &AlarmService) -> Self {
        Self { event: None, alarms: AlarmsResponse::from_service(alarms) }
    }

    pub fn event(event: AlarmEvent, alarms: &AlarmService) -> Self {
        Self { event: Some(event), alarms: AlarmsResponse::from_service(alarms) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_panel_serializes_all_four_sirens() {
        let alarms = AlarmService::new();
        let json = serde_json::to_value(AlarmsResponse::from_service(&alarms)).unwrap();

        assert_eq!(json["connection"], serde_json::json!({"state": "idle"}));
        assert_eq!(json["connected"], false);
        assert_eq!(json["active_count"], 0);
        assert_eq!(json["total"], 4);
        for id in ["1", "2", "3", "4"] {
            assert_eq!(json["alarms"][id], serde_json::json!({"active": false, "last_update": null}));
        }
    }

    #[test]
    fn greeting_frame_has_no_event() {
        let alarms = AlarmService::new();
        let json = serde_json::to_value(EventFrame::greeting(&alarms)).unwrap();
        assert!(json.get("event").is_none());

        let json = serde_json::to_value(EventFrame::event(AlarmEvent::ConnectionChanged(true), &alarms)).unwrap();
        assert_eq!(json["event"], serde_json::json!({"type": "ConnectionChanged", "value": true}));
    }
}
