//! Broker connection with lifecycle tracking and bounded connect retry

use crate::config::QosLevel;
use crate::error::{ConnectError, LoadTestError};
use crate::mqtt::options::ConnectOptions;
use crate::mqtt::transport::{DeliveryHandler, Transport};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Upper bound of connect attempts per [`Connection::connect_with_retry`] call
pub const MAX_CONNECT_ATTEMPTS: u32 = 3;

/// Pause between two failed connect attempts
pub const RETRY_PAUSE: Duration = Duration::from_millis(100);

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Lost,
}

/// One broker connection, shared between the registry and a single session
pub struct Connection {
    options: ConnectOptions,
    transport: Box<dyn Transport>,
    state: watch::Sender<ConnectionState>,
    last_error: Mutex<Option<ConnectError>>,
    closed: AtomicBool,
    /// Granted subscriptions, replayed after a clean-session reconnect
    subscriptions: Mutex<Vec<(String, QosLevel)>>,
}

impl Connection {
    pub fn new(options: ConnectOptions, transport: Box<dyn Transport>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            options,
            transport,
            state,
            last_error: Mutex::new(None),
            closed: AtomicBool::new(false),
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    pub fn client_id(&self) -> &str {
        self.transport.client_id()
    }

    pub fn broker_uri(&self) -> &str {
        self.transport.broker_uri()
    }

    pub fn options(&self) -> &ConnectOptions {
        &self.options
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Error of the most recent failed connect attempt
    pub fn last_error(&self) -> Option<ConnectError> {
        self.last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_handler(&self, handler: Weak<dyn DeliveryHandler>) {
        self.transport.set_handler(handler);
    }

    pub fn mark_lost(&self) {
        if !self.is_closed() {
            self.set_state(ConnectionState::Lost);
        }
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(client_id = %self.client_id(), "Connection state {:?} -> {:?}", previous, state);
        }
    }

    fn record_error(&self, err: Option<ConnectError>) {
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = err;
    }

    /// Connects unless already connected, trying at most
    /// [`MAX_CONNECT_ATTEMPTS`] times and stopping at the first success.
    /// Each attempt waits up to `timeout` for the broker.
    pub async fn connect_with_retry(&self, timeout: Duration) -> bool {
        if self.is_connected() {
            self.set_state(ConnectionState::Connected);
            return true;
        }

        info!(
            client_id = %self.client_id(),
            "Connecting to {} (timeout {} ms)",
            self.broker_uri(),
            timeout.as_millis()
        );

        let mut attempt = 0;
        while attempt < MAX_CONNECT_ATTEMPTS && !self.is_connected() && !self.is_closed() {
            attempt += 1;
            self.set_state(ConnectionState::Connecting);

            match self.transport.connect(timeout).await {
                Ok(()) => {
                    self.record_error(None);
                    info!(client_id = %self.client_id(), attempt, "Connected");
                }
                Err(e) => {
                    error!(client_id = %self.client_id(), attempt, "Connect attempt failed: {}", e);
                    self.record_error(Some(e));
                    let remaining = MAX_CONNECT_ATTEMPTS - attempt;
                    if remaining > 0 && !self.is_connected() && !self.is_closed() {
                        warn!(client_id = %self.client_id(), "Retrying connect, {} attempts left", remaining);
                        tokio::time::sleep(RETRY_PAUSE).await;
                    }
                }
            }
        }

        let connected = self.is_connected();
        self.set_state(if connected {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        });
        connected
    }

    /// Subscribes every topic at `qos`, stopping at the first rejected request
    pub async fn subscribe(&self, topics: &[String], qos: QosLevel) -> Result<(), LoadTestError> {
        for topic in topics {
            self.transport.subscribe(topic, qos).await?;
            debug!(client_id = %self.client_id(), "Subscribed to {} (qos {})", topic, qos.as_u8());
            self.remember_subscription(topic, qos);
        }
        Ok(())
    }

    fn remember_subscription(&self, topic: &str, qos: QosLevel) {
        let mut subscriptions = self
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match subscriptions.iter_mut().find(|(t, _)| t == topic) {
            Some(entry) => entry.1 = qos,
            None => subscriptions.push((topic.to_string(), qos)),
        }
    }

    pub fn subscriptions(&self) -> Vec<(String, QosLevel)> {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Subscribes again to everything granted so far. A clean-session broker
    /// forgets subscriptions together with the connection.
    pub async fn restore_subscriptions(&self) -> Result<usize, LoadTestError> {
        let subscriptions = self.subscriptions();
        for (topic, qos) in &subscriptions {
            self.transport.subscribe(topic, *qos).await?;
        }
        if !subscriptions.is_empty() {
            info!(client_id = %self.client_id(), "Restored {} subscriptions", subscriptions.len());
        }
        Ok(subscriptions.len())
    }

    pub async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QosLevel,
        retain: bool,
    ) -> Result<(), LoadTestError> {
        self.transport.publish(topic, payload, qos, retain).await
    }

    /// Tears the connection down without unsubscribing
    pub async fn force_disconnect(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.transport.force_disconnect().await;
        self.set_state(ConnectionState::Disconnected);
        info!(client_id = %self.client_id(), "Connection force-closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::memory::MemoryBroker;
    use crate::mqtt::transport::TransportFactory;

    fn connection(broker: &MemoryBroker, client_id: &str) -> Connection {
        let options = ConnectOptions {
            client_id: client_id.to_string(),
            broker_uri: "tcp://memory:1883".to_string(),
            keep_alive: Duration::from_secs(5),
            clean_session: false,
            credentials: None,
            channel_capacity: 10,
            ack_timeout: Duration::from_millis(100),
        };
        let transport = broker.create(&options).unwrap();
        Connection::new(options, transport)
    }

    #[tokio::test]
    async fn connects_on_first_attempt() {
        let broker = MemoryBroker::new();
        let conn = connection(&broker, "c1");
        assert_eq!(conn.state(), ConnectionState::Disconnected);

        assert!(conn.connect_with_retry(Duration::from_millis(50)).await);
        assert_eq!(conn.state(), ConnectionState::Connected);
        assert_eq!(broker.connect_attempts("c1"), 1);

        // already connected: no further attempt
        assert!(conn.connect_with_retry(Duration::from_millis(50)).await);
        assert_eq!(broker.connect_attempts("c1"), 1);
    }

    #[tokio::test]
    async fn stops_at_first_success() {
        let broker = MemoryBroker::new();
        let conn = connection(&broker, "c1");
        broker.fail_next_connects(
            "c1",
            [ConnectError::General("connection refused".to_string())],
        );

        assert!(conn.connect_with_retry(Duration::from_millis(50)).await);
        assert_eq!(broker.connect_attempts("c1"), 2);
        assert!(conn.last_error().is_none());
    }

    #[tokio::test]
    async fn gives_up_after_three_attempts() {
        let broker = MemoryBroker::new();
        let conn = connection(&broker, "c1");
        broker.fail_next_connects(
            "c1",
            (0..5).map(|_| ConnectError::Security("BadUserNamePassword".to_string())),
        );

        assert!(!conn.connect_with_retry(Duration::from_millis(50)).await);
        assert_eq!(broker.connect_attempts("c1"), MAX_CONNECT_ATTEMPTS as usize);
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(matches!(conn.last_error(), Some(ConnectError::Security(_))));
    }

    #[tokio::test]
    async fn offline_broker_times_out_each_attempt() {
        let broker = MemoryBroker::new();
        broker.set_offline(true);
        let conn = connection(&broker, "c1");

        let started = std::time::Instant::now();
        assert!(!conn.connect_with_retry(Duration::from_millis(30)).await);
        assert_eq!(broker.connect_attempts("c1"), 3);
        assert!(started.elapsed() >= Duration::from_millis(90));
        assert!(matches!(conn.last_error(), Some(ConnectError::Timeout(30))));
    }

    #[tokio::test]
    async fn granted_subscriptions_are_restored() {
        let broker = MemoryBroker::new();
        let conn = connection(&broker, "c1");
        assert!(conn.connect_with_retry(Duration::from_millis(50)).await);

        let topics = vec!["a/b".to_string(), "c/#".to_string()];
        conn.subscribe(&topics, QosLevel::AtLeastOnce).await.unwrap();
        conn.subscribe(&topics[..1], QosLevel::AtMostOnce).await.unwrap();
        assert_eq!(
            conn.subscriptions(),
            [
                ("a/b".to_string(), QosLevel::AtMostOnce),
                ("c/#".to_string(), QosLevel::AtLeastOnce)
            ]
        );
        assert_eq!(conn.restore_subscriptions().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn rejected_subscription_is_not_remembered() {
        let broker = MemoryBroker::new();
        let conn = connection(&broker, "c1");
        assert!(conn.connect_with_retry(Duration::from_millis(50)).await);
        broker.reject_subscriptions(true);

        assert!(conn.subscribe(&["a".to_string()], QosLevel::AtMostOnce).await.is_err());
        assert!(conn.subscriptions().is_empty());
    }

    #[tokio::test]
    async fn closed_connection_does_not_retry() {
        let broker = MemoryBroker::new();
        let conn = connection(&broker, "c1");
        conn.force_disconnect().await;

        assert!(!conn.connect_with_retry(Duration::from_millis(50)).await);
        assert_eq!(broker.connect_attempts("c1"), 0);
        assert!(conn.is_closed());
    }
}
