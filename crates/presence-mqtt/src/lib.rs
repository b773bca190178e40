//! presence-mqtt: Publish channel for presence signals.
//!
//! One explicitly constructed MQTT session (TLS optional) with a bounded
//! connect, explicit connection state, and non-blocking publishes.

pub mod channel;
pub mod params;

pub use channel::{ChannelError, ConnectionSignal, ConnectionState, PublishChannel};
pub use params::ConnectionParams;
pub use rumqttc::QoS;

/// Anything presence payloads can be handed to.
pub trait Publisher {
    fn publish(&self, payload: &str, qos: QoS, retain: bool) -> Result<(), ChannelError>;
}

impl<P: Publisher + ?Sized> Publisher for std::sync::Arc<P> {
    fn publish(&self, payload: &str, qos: QoS, retain: bool) -> Result<(), ChannelError> {
        (**self).publish(payload, qos, retain)
    }
}

/// Map an MQTT QoS level number (0, 1, 2) to [`QoS`].
pub fn qos_from_level(level: u8) -> Option<QoS> {
    match level {
        0 => Some(QoS::AtMostOnce),
        1 => Some(QoS::AtLeastOnce),
        2 => Some(QoS::ExactlyOnce),
        _ => None,
    }
}
