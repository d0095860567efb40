//! rumqttc-backed [`Transport`].
//!
//! A connect attempt hands the rumqttc [`EventLoop`] to a driver task. The
//! driver polls until the CONNACK (or the attempt timeout), reports the
//! outcome, then keeps polling and forwards inbound packets to the
//! [`DeliveryHandler`]. When the network drops, the driver parks the event
//! loop back in its slot before notifying the handler, so a reconnect can
//! pick it up immediately. A forced disconnect cancels the driver and drops
//! the event loop together with its socket.
//!
//! rumqttc only queues a SUBSCRIBE, so each request leaves a waiter behind.
//! Waiters are queued in request order; the driver binds the front one to
//! the packet id of the next outgoing SUBSCRIBE and resolves it with the
//! matching SUBACK.

use crate::config::QosLevel;
use crate::error::{ConnectError, LoadTestError};
use crate::mqtt::options::{ConnectOptions, Scheme};
use crate::mqtt::transport::{DeliveryHandler, Transport, TransportFactory};
use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Outgoing,
    Packet, QoS, SubAck, SubscribeReasonCode,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// rumqttc rejects shorter keep-alive intervals on some versions
const MIN_KEEP_ALIVE: Duration = Duration::from_secs(5);

type SubAckSender = oneshot::Sender<Result<(), String>>;

struct Shared {
    client_id: String,
    connected: AtomicBool,
    closed: CancellationToken,
    event_loop: Mutex<Option<EventLoop>>,
    handler: RwLock<Option<Weak<dyn DeliveryHandler>>>,
    /// Subscribe requests not yet written, oldest first
    queued_subscribes: Mutex<VecDeque<SubAckSender>>,
    /// Written subscribe requests by packet id
    sent_subscribes: Mutex<HashMap<u16, SubAckSender>>,
}

impl Shared {
    fn take_event_loop(&self) -> Option<EventLoop> {
        self.event_loop
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn park_event_loop(&self, event_loop: EventLoop) {
        *self.event_loop.lock().unwrap_or_else(PoisonError::into_inner) = Some(event_loop);
    }

    fn subscribe_sent(&self, pkid: u16) {
        let waiter = self
            .queued_subscribes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        match waiter {
            Some(waiter) => {
                self.sent_subscribes
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(pkid, waiter);
            }
            None => debug!(client_id = %self.client_id, pkid, "SUBSCRIBE without a waiter"),
        }
    }

    fn subscribe_acked(&self, suback: &SubAck) {
        let outcome = if suback
            .return_codes
            .iter()
            .any(|code| matches!(code, SubscribeReasonCode::Failure))
        {
            warn!(client_id = %self.client_id, "Broker rejected subscription {}", suback.pkid);
            Err("rejected by broker".to_string())
        } else {
            Ok(())
        };
        let waiter = self
            .sent_subscribes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&suback.pkid);
        if let Some(waiter) = waiter {
            let _ = waiter.send(outcome);
        }
    }

    /// Written subscribes died with the socket. Queued ones are still in the
    /// request channel and go out after a reconnect.
    fn drop_sent_subscribes(&self) {
        self.sent_subscribes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn dispatch(&self, deliver: impl FnOnce(&dyn DeliveryHandler)) {
        let handler = self
            .handler
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(Weak::upgrade);
        if let Some(handler) = handler {
            deliver(handler.as_ref());
        }
    }
}

pub struct RumqttTransport {
    broker_uri: String,
    client: AsyncClient,
    shared: Arc<Shared>,
    driver: Mutex<Option<JoinHandle<()>>>,
    connect_lock: tokio::sync::Mutex<()>,
    subscribe_lock: tokio::sync::Mutex<()>,
    ack_timeout: Duration,
}

impl RumqttTransport {
    pub fn new(options: &ConnectOptions) -> Result<Self, LoadTestError> {
        let mqtt_options = build_mqtt_options(options)?;
        let (client, event_loop) = AsyncClient::new(mqtt_options, options.channel_capacity);

        Ok(Self {
            broker_uri: options.broker_uri.clone(),
            client,
            shared: Arc::new(Shared {
                client_id: options.client_id.clone(),
                connected: AtomicBool::new(false),
                closed: CancellationToken::new(),
                event_loop: Mutex::new(Some(event_loop)),
                handler: RwLock::new(None),
                queued_subscribes: Mutex::new(VecDeque::new()),
                sent_subscribes: Mutex::new(HashMap::new()),
            }),
            driver: Mutex::new(None),
            connect_lock: tokio::sync::Mutex::new(()),
            subscribe_lock: tokio::sync::Mutex::new(()),
            ack_timeout: options.ack_timeout,
        })
    }
}

fn build_mqtt_options(options: &ConnectOptions) -> Result<MqttOptions, LoadTestError> {
    // rumqttc panics on these instead of returning an error
    if options.client_id.starts_with(' ') {
        return Err(LoadTestError::Config(format!(
            "client id '{}' starts with a space",
            options.client_id
        )));
    }
    if options.client_id.is_empty() && !options.clean_session {
        return Err(LoadTestError::Config(
            "empty client id requires CLEAN_SESSION".to_string(),
        ));
    }

    let address = options.address()?;
    let mut mqtt_options = match address.scheme {
        Scheme::Tcp | Scheme::Tls => {
            MqttOptions::new(&options.client_id, &address.host, address.port)
        }
        Scheme::Ws | Scheme::Wss => {
            MqttOptions::new(&options.client_id, address.websocket_url(), address.port)
        }
    };

    match address.scheme {
        Scheme::Tcp => {}
        Scheme::Tls => {
            mqtt_options.set_transport(rumqttc::Transport::Tls(Default::default()));
        }
        Scheme::Ws => {
            mqtt_options.set_transport(rumqttc::Transport::Ws);
        }
        Scheme::Wss => {
            mqtt_options.set_transport(rumqttc::Transport::Wss(Default::default()));
        }
    }

    mqtt_options
        .set_keep_alive(options.keep_alive.max(MIN_KEEP_ALIVE))
        .set_clean_session(options.clean_session);
    if let Some((user, password)) = &options.credentials {
        mqtt_options.set_credentials(user.clone(), password.clone());
    }

    Ok(mqtt_options)
}

fn to_rumqttc_qos(qos: QosLevel) -> QoS {
    match qos {
        QosLevel::AtMostOnce => QoS::AtMostOnce,
        QosLevel::AtLeastOnce => QoS::AtLeastOnce,
        QosLevel::ExactlyOnce => QoS::ExactlyOnce,
    }
}

/// rumqttc counts its network timeout in whole seconds
fn whole_seconds(timeout: Duration) -> u64 {
    let secs = timeout.as_secs() + u64::from(timeout.subsec_nanos() > 0);
    secs.max(1)
}

fn classify(err: &ConnectionError, timeout: Duration) -> ConnectError {
    match err {
        ConnectionError::NetworkTimeout => ConnectError::Timeout(timeout.as_millis() as u64),
        ConnectionError::ConnectionRefused(
            code @ (ConnectReturnCode::BadUserNamePassword | ConnectReturnCode::NotAuthorized),
        ) => ConnectError::Security(format!("{:?}", code)),
        ConnectionError::ConnectionRefused(code) => {
            ConnectError::General(format!("connection refused: {:?}", code))
        }
        other => ConnectError::General(other.to_string()),
    }
}

async fn drive(
    shared: Arc<Shared>,
    mut event_loop: EventLoop,
    connect_timeout: Duration,
    outcome: oneshot::Sender<Result<(), ConnectError>>,
) {
    event_loop
        .network_options
        .set_connection_timeout(whole_seconds(connect_timeout));

    let first = tokio::select! {
        _ = shared.closed.cancelled() => {
            let _ = outcome.send(Err(ConnectError::General("connection closed".to_string())));
            return;
        }
        polled = tokio::time::timeout(connect_timeout, event_loop.poll()) => polled,
    };

    match first {
        Ok(Ok(Event::Incoming(Packet::ConnAck(connack)))) => {
            debug!(client_id = %shared.client_id, "CONNACK received: {:?}", connack.code);
        }
        Ok(Ok(event)) => {
            debug!(client_id = %shared.client_id, "First event before CONNACK: {:?}", event);
        }
        Ok(Err(e)) => {
            shared.park_event_loop(event_loop);
            let _ = outcome.send(Err(classify(&e, connect_timeout)));
            return;
        }
        Err(_) => {
            shared.park_event_loop(event_loop);
            let _ = outcome.send(Err(ConnectError::Timeout(connect_timeout.as_millis() as u64)));
            return;
        }
    }

    shared.connected.store(true, Ordering::SeqCst);
    let _ = outcome.send(Ok(()));

    let cause = loop {
        tokio::select! {
            _ = shared.closed.cancelled() => {
                shared.connected.store(false, Ordering::SeqCst);
                debug!(client_id = %shared.client_id, "Event loop cancelled");
                return;
            }
            polled = event_loop.poll() => match polled {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    shared.dispatch(|h| h.on_message(&publish.topic, &publish.payload));
                }
                Ok(Event::Incoming(Packet::PubAck(ack))) => {
                    shared.dispatch(|h| h.on_delivery_complete(ack.pkid));
                }
                Ok(Event::Incoming(Packet::PubComp(comp))) => {
                    shared.dispatch(|h| h.on_delivery_complete(comp.pkid));
                }
                Ok(Event::Incoming(Packet::SubAck(suback))) => shared.subscribe_acked(&suback),
                Ok(Event::Outgoing(Outgoing::Subscribe(pkid))) => shared.subscribe_sent(pkid),
                Ok(Event::Outgoing(Outgoing::Publish(pkid))) if pkid != 0 => {
                    shared.dispatch(|h| h.on_publish_sent(pkid));
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    break "broker sent DISCONNECT".to_string();
                }
                Ok(_) => {}
                Err(e) => break e.to_string(),
            }
        }
    };

    shared.connected.store(false, Ordering::SeqCst);
    shared.drop_sent_subscribes();
    shared.park_event_loop(event_loop);
    warn!(client_id = %shared.client_id, "Connection lost: {}", cause);
    shared.dispatch(|h| h.on_connection_lost(&cause));
}

#[async_trait]
impl Transport for RumqttTransport {
    fn client_id(&self) -> &str {
        &self.shared.client_id
    }

    fn broker_uri(&self) -> &str {
        &self.broker_uri
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    fn set_handler(&self, handler: Weak<dyn DeliveryHandler>) {
        *self
            .shared
            .handler
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    async fn connect(&self, timeout: Duration) -> Result<(), ConnectError> {
        let _attempt = self.connect_lock.lock().await;

        if self.shared.closed.is_cancelled() {
            return Err(ConnectError::General("connection closed".to_string()));
        }
        if self.is_connected() {
            return Ok(());
        }

        let event_loop = self
            .shared
            .take_event_loop()
            .ok_or_else(|| ConnectError::General("event loop unavailable".to_string()))?;

        info!(client_id = %self.shared.client_id, "Connecting to {}", self.broker_uri);
        let (outcome_tx, outcome_rx) = oneshot::channel();
        let handle = tokio::spawn(drive(self.shared.clone(), event_loop, timeout, outcome_tx));
        *self.driver.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);

        match outcome_rx.await {
            Ok(result) => result,
            Err(_) => {
                error!(client_id = %self.shared.client_id, "Event loop stopped before connecting");
                Err(ConnectError::General(
                    "event loop stopped before connecting".to_string(),
                ))
            }
        }
    }

    /// Sends a SUBSCRIBE and waits up to the ack timeout for its SUBACK
    async fn subscribe(&self, topic: &str, qos: QosLevel) -> Result<(), LoadTestError> {
        if !self.is_connected() {
            return Err(LoadTestError::Subscribe(format!("{}: not connected", topic)));
        }

        let (ack_tx, ack_rx) = oneshot::channel();
        {
            let _ordered = self.subscribe_lock.lock().await;
            self.shared
                .queued_subscribes
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push_back(ack_tx);
            if let Err(e) = self.client.subscribe(topic, to_rumqttc_qos(qos)).await {
                self.shared
                    .queued_subscribes
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .pop_back();
                return Err(LoadTestError::Subscribe(format!("{}: {}", topic, e)));
            }
        }

        match tokio::time::timeout(self.ack_timeout, ack_rx).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(reason))) => Err(LoadTestError::Subscribe(format!("{}: {}", topic, reason))),
            Ok(Err(_)) => Err(LoadTestError::Subscribe(format!(
                "{}: connection lost before SUBACK",
                topic
            ))),
            Err(_) => Err(LoadTestError::Subscribe(format!(
                "{}: no SUBACK within {} ms",
                topic,
                self.ack_timeout.as_millis()
            ))),
        }
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QosLevel,
        retain: bool,
    ) -> Result<(), LoadTestError> {
        self.client
            .publish(topic, to_rumqttc_qos(qos), retain, payload)
            .await
            .map_err(|e| LoadTestError::Publish(format!("{}: {}", topic, e)))
    }

    async fn force_disconnect(&self) {
        self.shared.closed.cancel();
        self.shared.connected.store(false, Ordering::SeqCst);
        drop(self.shared.take_event_loop());
        self.shared.drop_sent_subscribes();
        self.shared
            .queued_subscribes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();

        let driver = self
            .driver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = driver {
            if let Err(e) = handle.await {
                warn!(client_id = %self.shared.client_id, "Event loop task ended abnormally: {}", e);
            }
        }
        debug!(client_id = %self.shared.client_id, "Forced disconnect complete");
    }
}

/// Production factory handing out rumqttc transports
#[derive(Debug, Clone, Copy, Default)]
pub struct RumqttFactory;

impl TransportFactory for RumqttFactory {
    fn create(&self, options: &ConnectOptions) -> Result<Box<dyn Transport>, LoadTestError> {
        Ok(Box::new(RumqttTransport::new(options)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(uri: &str) -> ConnectOptions {
        ConnectOptions {
            client_id: "unit".to_string(),
            broker_uri: uri.to_string(),
            keep_alive: Duration::ZERO,
            clean_session: true,
            credentials: Some(("user".to_string(), "pw".to_string())),
            channel_capacity: 10,
            ack_timeout: Duration::from_millis(100),
        }
    }

    #[test]
    fn options_follow_broker_uri() {
        let mqtt_options = build_mqtt_options(&options("tcp://broker:1999")).unwrap();
        assert_eq!(mqtt_options.broker_address(), ("broker".to_string(), 1999));
        assert_eq!(mqtt_options.client_id(), "unit");
        assert!(mqtt_options.clean_session());
        assert_eq!(mqtt_options.keep_alive(), MIN_KEEP_ALIVE);
    }

    #[test]
    fn refused_credentials_are_security_errors() {
        let timeout = Duration::from_secs(1);
        let err = ConnectionError::ConnectionRefused(ConnectReturnCode::NotAuthorized);
        assert!(matches!(classify(&err, timeout), ConnectError::Security(_)));

        let err = ConnectionError::ConnectionRefused(ConnectReturnCode::ServiceUnavailable);
        assert!(matches!(classify(&err, timeout), ConnectError::General(_)));
    }

    #[test]
    fn network_timeout_is_a_connect_timeout() {
        let err = ConnectionError::NetworkTimeout;
        assert_eq!(
            classify(&err, Duration::from_millis(8000)),
            ConnectError::Timeout(8000)
        );
    }

    #[test]
    fn network_timeout_covers_the_attempt() {
        assert_eq!(whole_seconds(Duration::from_millis(8000)), 8);
        assert_eq!(whole_seconds(Duration::from_millis(8001)), 9);
        assert_eq!(whole_seconds(Duration::from_millis(100)), 1);
        assert_eq!(whole_seconds(Duration::ZERO), 1);
    }

    #[test]
    fn client_ids_rumqttc_rejects_are_config_errors() {
        let empty = ConnectOptions {
            client_id: String::new(),
            clean_session: false,
            ..options("tcp://broker:1883")
        };
        assert!(matches!(
            build_mqtt_options(&empty),
            Err(LoadTestError::Config(_))
        ));
        assert!(RumqttFactory.create(&empty).is_err());

        let padded = ConnectOptions {
            client_id: " unit".to_string(),
            ..options("tcp://broker:1883")
        };
        assert!(matches!(
            build_mqtt_options(&padded),
            Err(LoadTestError::Config(_))
        ));

        let anonymous = ConnectOptions {
            client_id: String::new(),
            ..options("tcp://broker:1883")
        };
        assert!(build_mqtt_options(&anonymous).is_ok());
    }

    #[tokio::test]
    async fn subscribe_needs_a_connection() {
        let transport = RumqttTransport::new(&options("tcp://192.0.2.1:1883")).unwrap();
        let err = transport
            .subscribe("load/test", QosLevel::AtMostOnce)
            .await
            .unwrap_err();
        assert!(matches!(err, LoadTestError::Subscribe(_)));
    }

    #[tokio::test]
    async fn unreachable_broker_times_out_or_fails() {
        // reserved documentation address, never routable
        let transport = RumqttTransport::new(&options("tcp://192.0.2.1:1883")).unwrap();
        let result = transport.connect(Duration::from_millis(200)).await;
        assert!(result.is_err());
        assert!(!transport.is_connected());

        // the event loop is parked again and a second attempt is possible
        let again = transport.connect(Duration::from_millis(200)).await;
        assert!(again.is_err());
        transport.force_disconnect().await;
        assert!(transport.connect(Duration::from_millis(50)).await.is_err());
    }
}
