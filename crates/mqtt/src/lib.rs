pub mod client;
pub mod config;
pub mod error;
pub mod fsm;
pub mod transport;

pub use client::AlarmService;
pub use config::{BrokerConfig, Endpoint};
pub use error::{LinkError, ServiceError, TransportError};
pub use fsm::{ConnectionMachine, ConnectionState};
pub use transport::Transport;
