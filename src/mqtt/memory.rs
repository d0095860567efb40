//! In-process broker for dry runs and tests.
//!
//! [`MemoryBroker`] routes publishes to every connected transport whose
//! subscription filter matches, with `+` and `#` wildcards. It also exposes
//! knobs for scripting connect failures, rejecting subscriptions, injecting
//! traffic and severing connections, so session behavior can be exercised
//! without a network.

use crate::config::QosLevel;
use crate::error::{ConnectError, LoadTestError};
use crate::mqtt::options::ConnectOptions;
use crate::mqtt::transport::{DeliveryHandler, Transport, TransportFactory};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::Duration;
use tracing::debug;

/// Matches an MQTT topic against a subscription filter
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

struct ClientSlot {
    connected: AtomicBool,
    closed: AtomicBool,
    handler: RwLock<Option<Weak<dyn DeliveryHandler>>>,
    next_packet_id: AtomicU16,
}

impl ClientSlot {
    fn handler(&self) -> Option<Arc<dyn DeliveryHandler>> {
        self.handler
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(Weak::upgrade)
    }
}

struct SessionEntry {
    slot: Arc<ClientSlot>,
    clean_session: bool,
    subscriptions: Vec<(String, QosLevel)>,
}

#[derive(Default)]
struct BrokerState {
    sessions: HashMap<String, SessionEntry>,
    connect_failures: HashMap<String, VecDeque<ConnectError>>,
    connect_attempts: HashMap<String, usize>,
    reject_subscriptions: bool,
    offline: bool,
}

#[derive(Default)]
struct BrokerInner {
    state: Mutex<BrokerState>,
}

impl BrokerInner {
    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Delivers to matching subscribers outside the broker lock
    fn route(&self, topic: &str, payload: &[u8]) -> usize {
        let receivers: Vec<Arc<dyn DeliveryHandler>> = {
            let state = self.lock();
            state
                .sessions
                .values()
                .filter(|entry| entry.slot.connected.load(Ordering::SeqCst))
                .filter(|entry| {
                    entry
                        .subscriptions
                        .iter()
                        .any(|(filter, _)| topic_matches(filter, topic))
                })
                .filter_map(|entry| entry.slot.handler())
                .collect()
        };
        for receiver in &receivers {
            receiver.on_message(topic, payload);
        }
        receivers.len()
    }
}

/// Shared handle to an in-process broker
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues errors returned by the next connect attempts of `client_id`
    pub fn fail_next_connects(
        &self,
        client_id: &str,
        errors: impl IntoIterator<Item = ConnectError>,
    ) {
        self.inner
            .lock()
            .connect_failures
            .entry(client_id.to_string())
            .or_default()
            .extend(errors);
    }

    /// While offline, every connect attempt waits out its timeout
    pub fn set_offline(&self, offline: bool) {
        self.inner.lock().offline = offline;
    }

    pub fn reject_subscriptions(&self, reject: bool) {
        self.inner.lock().reject_subscriptions = reject;
    }

    pub fn connect_attempts(&self, client_id: &str) -> usize {
        self.inner
            .lock()
            .connect_attempts
            .get(client_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn is_connected(&self, client_id: &str) -> bool {
        self.inner
            .lock()
            .sessions
            .get(client_id)
            .map(|entry| entry.slot.connected.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    pub fn subscriptions(&self, client_id: &str) -> Vec<String> {
        self.inner
            .lock()
            .sessions
            .get(client_id)
            .map(|entry| entry.subscriptions.iter().map(|(f, _)| f.clone()).collect())
            .unwrap_or_default()
    }

    pub fn client_count(&self) -> usize {
        self.inner.lock().sessions.len()
    }

    /// Publishes as an outside client; returns the number of receivers
    pub fn inject(&self, topic: &str, payload: impl AsRef<[u8]>) -> usize {
        self.inner.route(topic, payload.as_ref())
    }

    /// Drops the connection of `client_id` and notifies its handler. A
    /// clean session loses its subscriptions with the connection.
    pub fn sever(&self, client_id: &str, cause: &str) {
        let handler = {
            let mut state = self.inner.lock();
            state.sessions.get_mut(client_id).and_then(|entry| {
                if !entry.slot.connected.swap(false, Ordering::SeqCst) {
                    return None;
                }
                if entry.clean_session {
                    entry.subscriptions.clear();
                }
                entry.slot.handler()
            })
        };
        if let Some(handler) = handler {
            debug!(client_id, "Severing connection: {}", cause);
            handler.on_connection_lost(cause);
        }
    }
}

impl TransportFactory for MemoryBroker {
    fn create(&self, options: &ConnectOptions) -> Result<Box<dyn Transport>, LoadTestError> {
        let slot = Arc::new(ClientSlot {
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            handler: RwLock::new(None),
            next_packet_id: AtomicU16::new(1),
        });
        self.inner.lock().sessions.insert(
            options.client_id.clone(),
            SessionEntry {
                slot: slot.clone(),
                clean_session: options.clean_session,
                subscriptions: Vec::new(),
            },
        );

        Ok(Box::new(MemoryTransport {
            client_id: options.client_id.clone(),
            broker_uri: options.broker_uri.clone(),
            broker: self.inner.clone(),
            slot,
        }))
    }
}

pub struct MemoryTransport {
    client_id: String,
    broker_uri: String,
    broker: Arc<BrokerInner>,
    slot: Arc<ClientSlot>,
}

#[async_trait]
impl Transport for MemoryTransport {
    fn client_id(&self) -> &str {
        &self.client_id
    }

    fn broker_uri(&self) -> &str {
        &self.broker_uri
    }

    fn is_connected(&self) -> bool {
        self.slot.connected.load(Ordering::SeqCst)
    }

    fn set_handler(&self, handler: Weak<dyn DeliveryHandler>) {
        *self
            .slot
            .handler
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    async fn connect(&self, timeout: Duration) -> Result<(), ConnectError> {
        if self.slot.closed.load(Ordering::SeqCst) {
            return Err(ConnectError::General("connection closed".to_string()));
        }
        if self.is_connected() {
            return Ok(());
        }

        let (offline, scripted) = {
            let mut state = self.broker.lock();
            *state
                .connect_attempts
                .entry(self.client_id.clone())
                .or_insert(0) += 1;
            let scripted = state
                .connect_failures
                .get_mut(&self.client_id)
                .and_then(VecDeque::pop_front);
            (state.offline, scripted)
        };

        if let Some(err) = scripted {
            return Err(err);
        }
        if offline {
            tokio::time::sleep(timeout).await;
            return Err(ConnectError::Timeout(timeout.as_millis() as u64));
        }

        self.slot.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn subscribe(&self, topic: &str, qos: QosLevel) -> Result<(), LoadTestError> {
        let mut state = self.broker.lock();
        if state.reject_subscriptions {
            return Err(LoadTestError::Subscribe(format!(
                "{}: rejected by broker",
                topic
            )));
        }
        if !self.is_connected() {
            return Err(LoadTestError::Subscribe(format!("{}: not connected", topic)));
        }
        let entry = state
            .sessions
            .get_mut(&self.client_id)
            .filter(|entry| Arc::ptr_eq(&entry.slot, &self.slot))
            .ok_or_else(|| LoadTestError::Subscribe(format!("{}: unknown session", topic)))?;
        if !entry.subscriptions.iter().any(|(f, _)| f == topic) {
            entry.subscriptions.push((topic.to_string(), qos));
        }
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QosLevel,
        _retain: bool,
    ) -> Result<(), LoadTestError> {
        if !self.is_connected() {
            return Err(LoadTestError::Publish(format!("{}: not connected", topic)));
        }
        self.broker.route(topic, &payload);

        if qos != QosLevel::AtMostOnce {
            let packet_id = self.slot.next_packet_id.fetch_add(1, Ordering::SeqCst);
            if let Some(handler) = self.slot.handler() {
                handler.on_publish_sent(packet_id);
                handler.on_delivery_complete(packet_id);
            }
        }
        Ok(())
    }

    async fn force_disconnect(&self) {
        self.slot.closed.store(true, Ordering::SeqCst);
        self.slot.connected.store(false, Ordering::SeqCst);
        let mut state = self.broker.lock();
        let owned = state
            .sessions
            .get(&self.client_id)
            .map(|entry| Arc::ptr_eq(&entry.slot, &self.slot))
            .unwrap_or(false);
        if owned {
            state.sessions.remove(&self.client_id);
        }
    }
}
