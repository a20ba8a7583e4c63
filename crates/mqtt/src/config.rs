use hostname::get as get_hostname;
use std::env;
use std::time::Duration;

use url::Url;

use crate::error::ServiceError;

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub url: String,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive_secs: u16,
    pub clean_session: bool,
    pub reconnect_backoff_ms: u64,
    pub max_retries: u32,
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Tcp { host: String, port: u16 },
    // rumqttc wants the full url as the broker address for websockets
    Ws { url: String, port: u16 },
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: "ws://raspberrypi.local:8080".to_string(),
            client_id: default_client_id(),
            username: None,
            password: None,
            keep_alive_secs: 60,
            clean_session: true,
            reconnect_backoff_ms: 1000,
            max_retries: 5,
            connect_timeout_secs: 4,
        }
    }
}

impl BrokerConfig {
    pub fn from_env() -> Self {
        Self::from_vars(|key| env::var(key).ok())
    }

    // missing, empty or unparseable values keep their defaults
    pub fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = BrokerConfig::default();
        let var = |key: &str| lookup(key).filter(|v| !v.is_empty());

        if let Some(v) = var("ALARM_BROKER_URL") {
            cfg.url = v;
        }
        if let Some(v) = var("MQTT_CLIENT_ID") {
            cfg.client_id = v;
        }
        if let Some(v) = var("MQTT_USERNAME") {
            cfg.username = Some(v);
        }
        if let Some(v) = var("MQTT_PASSWORD") {
            cfg.password = Some(v);
        }
        if let Some(s) = var("MQTT_KEEP_ALIVE_SECS").and_then(|v| v.parse().ok()) {
            cfg.keep_alive_secs = s;
        }
        if let Some(b) = var("MQTT_CLEAN_SESSION").and_then(|v| parse_flag(&v)) {
            cfg.clean_session = b;
        }
        if let Some(ms) = var("MQTT_RECONNECT_BACKOFF_MS").and_then(|v| v.parse().ok()) {
            cfg.reconnect_backoff_ms = ms;
        }
        if let Some(n) = var("MQTT_MAX_RETRIES").and_then(|v| v.parse().ok()) {
            cfg.max_retries = n;
        }
        if let Some(s) = var("MQTT_CONNECT_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
            cfg.connect_timeout_secs = s;
        }

        cfg
    }

    pub fn endpoint(&self) -> Result<Endpoint, ServiceError> {
        let invalid = |reason: &str| ServiceError::InvalidUrl {
            url: self.url.clone(),
            reason: reason.to_string(),
        };
        let parsed = Url::parse(&self.url).map_err(|e| invalid(&e.to_string()))?;
        let host = parsed
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| invalid("missing host"))?
            .to_string();

        match parsed.scheme() {
            "mqtt" | "tcp" => Ok(Endpoint::Tcp {
                host,
                port: parsed.port().unwrap_or(1883),
            }),
            "ws" => Ok(Endpoint::Ws {
                port: parsed.port_or_known_default().unwrap_or(80),
                url: self.url.clone(),
            }),
            other => Err(ServiceError::UnsupportedScheme(other.to_string())),
        }
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn credentials(&self) -> Option<(&str, &str)> {
        let user = self.username.as_deref()?;
        Some((user, self.password.as_deref().unwrap_or("")))
    }
}

fn parse_flag(v: &str) -> Option<bool> {
    match v.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn default_client_id() -> String {
    let host = get_hostname()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown-host".to_string());
    let pid = std::process::id();
    format!("alarmctl-{}-{}", host, pid)
}
