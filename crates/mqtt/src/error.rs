use rumqttc::ClientError;
use thiserror::Error;

use crate::fsm::ConnectionState;

// Reported through AlarmEvent::ConnectionError, never returned as Err.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    #[error("broker connection failed: {0}")]
    Connect(String),
    #[error("broker connection lost: {0}")]
    Dropped(String),
    #[error("giving up after {attempts} reconnect attempts")]
    RetryExhausted { attempts: u32 },
    #[error("command on {topic} not delivered: {reason}")]
    PublishRejected { topic: String, reason: String },
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("broker connection is already {0}")]
    AlreadyActive(ConnectionState),
    #[error("not connected to the broker")]
    NotConnected,
    #[error("invalid broker url `{url}`: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("unsupported broker url scheme `{0}` (expected mqtt, tcp or ws)")]
    UnsupportedScheme(String),
    #[error("mqtt client id must be non-empty and must not start with a space")]
    InvalidClientId,
    #[error("no tokio runtime available to drive the broker connection")]
    NoRuntime,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("mqtt client request failed: {0}")]
    Client(#[from] ClientError),
    #[error("transport is closed")]
    Closed,
}
