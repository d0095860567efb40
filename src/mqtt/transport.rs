//! Trait seams between sessions and the network layer.
//!
//! A [`Transport`] is one MQTT client connection. Inbound traffic is pushed
//! to a [`DeliveryHandler`] from the transport's own event-loop task, never
//! from the task that drives the sample. The transport only keeps a weak
//! reference to its handler, so a session can own its connection without
//! forming a reference cycle.

use crate::config::QosLevel;
use crate::error::{ConnectError, LoadTestError};
use crate::mqtt::options::ConnectOptions;
use async_trait::async_trait;
use std::sync::Weak;
use std::time::Duration;

/// Callbacks invoked by a transport's event loop
pub trait DeliveryHandler: Send + Sync {
    /// A PUBLISH arrived on a subscribed topic
    fn on_message(&self, topic: &str, payload: &[u8]);

    /// An established connection dropped
    fn on_connection_lost(&self, cause: &str);

    /// An outgoing QoS 1/2 publish was written under `packet_id`
    fn on_publish_sent(&self, _packet_id: u16) {}

    /// Broker acknowledged an outgoing QoS 1/2 publish
    fn on_delivery_complete(&self, packet_id: u16);
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn client_id(&self) -> &str;

    fn broker_uri(&self) -> &str;

    fn is_connected(&self) -> bool;

    /// Replaces the handler receiving inbound events
    fn set_handler(&self, handler: Weak<dyn DeliveryHandler>);

    /// Single connect attempt, waiting at most `timeout` for the CONNACK
    async fn connect(&self, timeout: Duration) -> Result<(), ConnectError>;

    async fn subscribe(&self, topic: &str, qos: QosLevel) -> Result<(), LoadTestError>;

    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QosLevel,
        retain: bool,
    ) -> Result<(), LoadTestError>;

    /// Drops the connection without an orderly DISCONNECT. The transport is
    /// unusable afterwards.
    async fn force_disconnect(&self);
}

/// Builds not-yet-connected transports for the registry
pub trait TransportFactory: Send + Sync {
    fn create(&self, options: &ConnectOptions) -> Result<Box<dyn Transport>, LoadTestError>;
}
