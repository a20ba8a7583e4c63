use rumqttc::{AsyncClient, QoS};

use crate::error::TransportError;

// Calls only queue the request; the driver task puts it on the wire.
pub trait Transport: Send + Sync {
    fn subscribe(&self, topic: &str) -> Result<(), TransportError>;
    // QoS 1, not retained
    fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), TransportError>;
    fn disconnect(&self) -> Result<(), TransportError>;
}

impl Transport for AsyncClient {
    fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        Ok(self.try_subscribe(topic, QoS::AtLeastOnce)?)
    }

    fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), TransportError> {
        Ok(self.try_publish(topic, QoS::AtLeastOnce, false, payload.to_vec())?)
    }

    fn disconnect(&self) -> Result<(), TransportError> {
        Ok(self.try_disconnect()?)
    }
}
