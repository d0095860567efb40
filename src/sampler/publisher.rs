//! Publisher session: send `ITERATIONS` messages per sample, spread over the
//! topic list, and wait for broker acknowledgments when QoS is above 0.

use crate::config::{QosLevel, SamplerConfig};
use crate::error::LoadTestError;
use crate::mqtt::connection::Connection;
use crate::mqtt::transport::DeliveryHandler;
use crate::registry::ConnectionRegistry;
use crate::sampler::reconnect::Reconnector;
use crate::sampler::result::{SampleRecorder, SampleResult};
use crate::sampler::session::{SessionCore, SessionHandle};
use crate::sampler::subscriber::POLL_INTERVAL;
use crate::sampler::topics::TopicSelector;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Default)]
struct AckState {
    outstanding: HashSet<u16>,
    acked: u64,
}

/// Packet ids written during the current sample. Acknowledgments for any
/// other id belong to an earlier sample and are not counted.
#[derive(Default)]
struct AckTracker {
    state: Mutex<AckState>,
    changed: Notify,
}

impl AckTracker {
    fn lock(&self) -> MutexGuard<'_, AckState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn begin(&self) {
        let mut state = self.lock();
        state.outstanding.clear();
        state.acked = 0;
    }

    fn sent(&self, packet_id: u16) {
        self.lock().outstanding.insert(packet_id);
    }

    fn acknowledge(&self, packet_id: u16) -> bool {
        let mut state = self.lock();
        if state.outstanding.remove(&packet_id) {
            state.acked += 1;
            true
        } else {
            false
        }
    }

    fn get(&self) -> u64 {
        self.lock().acked
    }
}

struct PublisherHandler {
    client_id: String,
    acks: Arc<AckTracker>,
    reconnect: Arc<Reconnector>,
}

impl DeliveryHandler for PublisherHandler {
    fn on_message(&self, topic: &str, _payload: &[u8]) {
        debug!(client_id = %self.client_id, "Ignoring inbound message on {}", topic);
    }

    fn on_connection_lost(&self, cause: &str) {
        self.reconnect.handle_loss(cause);
    }

    fn on_publish_sent(&self, packet_id: u16) {
        self.acks.sent(packet_id);
    }

    fn on_delivery_complete(&self, packet_id: u16) {
        if self.acks.acknowledge(packet_id) {
            debug!(client_id = %self.client_id, packet_id, "Delivery {} acknowledged", self.acks.get());
            self.acks.changed.notify_one();
        } else {
            debug!(client_id = %self.client_id, packet_id, "Ignoring acknowledgment from an earlier sample");
        }
    }
}

pub struct PublisherSession {
    core: SessionCore,
    selector: TopicSelector,
    acks: Arc<AckTracker>,
    handler: Option<Arc<PublisherHandler>>,
}

impl PublisherSession {
    pub fn new(
        config: SamplerConfig,
        registry: Arc<ConnectionRegistry>,
        cancel: CancellationToken,
    ) -> Result<Self, LoadTestError> {
        let core = SessionCore::new(config, registry, cancel)?;
        let selector = TopicSelector::new(core.topics.clone(), core.config.strategy)?;
        Ok(Self {
            core,
            selector,
            acks: Arc::new(AckTracker::default()),
            handler: None,
        })
    }

    pub fn client_id(&self) -> &str {
        &self.core.client_id
    }

    pub fn config(&self) -> &SamplerConfig {
        &self.core.config
    }

    pub fn handle(&self) -> SessionHandle {
        self.core.handle()
    }

    fn install_handler(&mut self, connection: &Arc<Connection>) {
        let handler = Arc::new(PublisherHandler {
            client_id: self.core.client_id.clone(),
            acks: self.acks.clone(),
            reconnect: Reconnector::new(connection, self.core.config.connection_timeout()),
        });
        let weak: Weak<dyn DeliveryHandler> = Arc::downgrade(&handler) as Weak<dyn DeliveryHandler>;
        connection.set_handler(weak);
        self.handler = Some(handler);
    }

    async fn prepare(&mut self, recorder: &mut SampleRecorder) -> Option<Arc<Connection>> {
        if self.core.is_interrupted() {
            self.core.interrupted(recorder);
            return None;
        }

        let connection = match self.core.ensure_connection().await {
            Ok((connection, fresh)) => {
                if fresh {
                    self.install_handler(&connection);
                }
                connection
            }
            Err(e) => {
                error!(client_id = %self.core.client_id, "Cannot register connection: {}", e);
                recorder.fail(e.to_string());
                return None;
            }
        };

        if let Some(handler) = &self.handler {
            handler.reconnect.enable();
        }
        if !connection
            .connect_with_retry(self.core.config.connection_timeout())
            .await
        {
            if self.core.is_interrupted() {
                self.core.interrupted(recorder);
            } else {
                self.core.connect_failed(recorder, &connection);
            }
            return None;
        }
        Some(connection)
    }

    /// Publishes one batch. Failures are reported in the result.
    pub async fn sample(&mut self) -> SampleResult {
        let mut recorder = SampleRecorder::new(&self.core.config.label);
        recorder.sample_start();

        let Some(connection) = self.prepare(&mut recorder).await else {
            return recorder.finish();
        };

        self.acks.begin();
        let config = &self.core.config;
        let payload = config.message.as_bytes().to_vec();
        let mut published = 0u64;
        let mut failure = None;

        for i in 0..config.iterations {
            if self.core.is_interrupted() {
                break;
            }
            let topic = self.selector.next();
            match connection
                .publish(topic, payload.clone(), config.qos, config.retain)
                .await
            {
                Ok(()) => published += 1,
                Err(e) => {
                    error!(client_id = %self.core.client_id, "Failed to publish to {}: {}", topic, e);
                    failure = Some(format!("Failed to publish to {}: {}", topic, e));
                    break;
                }
            }

            if i + 1 < config.iterations && !config.publisher_throttle().is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(config.publisher_throttle()) => {}
                    _ = self.core.cancel.cancelled() => {}
                }
            }
        }

        let acked = if config.qos != QosLevel::AtMostOnce && failure.is_none() {
            self.wait_for_acks(published).await
        } else {
            published
        };

        recorder.sample_end();
        if let Some(handler) = &self.handler {
            handler.reconnect.disable();
        }

        let config = &self.core.config;
        let topics = self.selector.topics().join(",");
        recorder
            .sampler_data(format!(
                "Published {} messages\nTopic: {}\nBroker: {}\nMy client ID: {}",
                published, topics, config.host, self.core.client_id
            ))
            .headers(format!("topic: {}", topics))
            .data(config.message.clone())
            .message_count(published);

        if let Some(failure) = failure {
            recorder.fail(failure);
        } else if self.core.is_interrupted() {
            recorder.fail(format!(
                "Publishing interrupted after {} of {} messages",
                published, config.iterations
            ));
        } else if acked < published {
            warn!(client_id = %self.core.client_id, "{} of {} deliveries acknowledged", acked, published);
            recorder.fail(format!(
                "Only {} of {} deliveries acknowledged",
                acked, published
            ));
        } else {
            info!(client_id = %self.core.client_id, "Published {} messages", published);
            recorder.ok().message(format!("Published {} messages", published));
        }
        recorder.finish()
    }

    /// Waits until `expected` acknowledgments arrived, the sampler timeout
    /// passed or the session was interrupted; returns the acknowledged count
    async fn wait_for_acks(&self, expected: u64) -> u64 {
        let deadline = Instant::now() + self.core.config.sampler_timeout();
        loop {
            let acked = self.acks.get();
            if acked >= expected || self.core.is_interrupted() {
                return acked;
            }
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => return self.acks.get(),
                _ = self.core.cancel.cancelled() => return self.acks.get(),
                _ = self.acks.changed.notified() => {}
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
            }
        }
    }

    pub async fn close(&mut self) {
        if let Some(handler) = &self.handler {
            handler.reconnect.disable();
        }
        self.core.release().await;
        self.handler = None;
    }
}
