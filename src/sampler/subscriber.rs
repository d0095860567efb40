//! Subscriber session: listen on the configured topics until the target
//! message count, the sampler timeout or an interrupt ends the window.
//!
//! # State Machine
//!
//! ```text
//! Init ──► Connecting ──► Connected ──► Subscribed ──► Sampling ──► Closed
//!              │              │
//!              └──────────────┴──► failed SampleResult
//! ```
//!
//! Every sample walks the machine once. The connection is acquired from the
//! registry on the first sample and reused afterwards.

use crate::config::SamplerConfig;
use crate::error::LoadTestError;
use crate::mqtt::connection::Connection;
use crate::mqtt::message::ReceivedMessage;
use crate::mqtt::transport::DeliveryHandler;
use crate::registry::ConnectionRegistry;
use crate::sampler::reconnect::Reconnector;
use crate::sampler::result::{SampleRecorder, SampleResult};
use crate::sampler::session::{SessionCore, SessionHandle};
use crate::sampler::window::{Delivery, SampleWindow};
use statum::{machine, state};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Coarse wake-up of the sampling wait, on top of arrival notifications
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Why a sampling window stopped waiting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowEnd {
    Open,
    TargetReached,
    Deadline,
    Interrupted,
}

#[state]
#[derive(Debug, Clone)]
pub enum SubscribeState {
    Init,
    Connecting,
    Connected,
    Subscribed,
    Sampling,
    Closed,
}

#[machine]
pub struct SubscribeRun<S: SubscribeState> {
    recorder: SampleRecorder,
    connection: Option<Arc<Connection>>,
    deadline: Option<Instant>,
    end: WindowEnd,
}

impl<S: SubscribeState> SubscribeRun<S> {
    fn connection_or_fail(&mut self, core: &SessionCore) -> Option<Arc<Connection>> {
        if self.connection.is_none() {
            self.recorder
                .fail(format!("Sampler {} has no connection", core.client_id));
        }
        self.connection.clone()
    }
}

impl SubscribeRun<Init> {
    fn start(label: &str) -> Self {
        let mut recorder = SampleRecorder::new(label);
        recorder.sample_start();
        Self::new(recorder, None, None, WindowEnd::Open)
    }

    async fn acquire(
        mut self,
        session: &mut SubscriberSession,
    ) -> Result<SubscribeRun<Connecting>, SampleResult> {
        if session.core.is_interrupted() {
            session.core.interrupted(&mut self.recorder);
            return Err(self.recorder.finish());
        }

        match session.core.ensure_connection().await {
            Ok((connection, fresh)) => {
                if fresh {
                    session.install_handler(&connection);
                }
                self.connection = Some(connection);
                Ok(self.transition())
            }
            Err(e) => {
                error!(client_id = %session.core.client_id, "Cannot register connection: {}", e);
                self.recorder
                    .fail(e.to_string())
                    .sampler_data(format!(
                        "ERROR: Could not register client {} for broker: {}",
                        session.core.client_id, session.core.config.host
                    ));
                Err(self.recorder.finish())
            }
        }
    }
}

impl SubscribeRun<Connecting> {
    async fn connect(
        mut self,
        session: &SubscriberSession,
    ) -> Result<SubscribeRun<Connected>, SampleResult> {
        let Some(connection) = self.connection_or_fail(&session.core) else {
            return Err(self.recorder.finish());
        };
        if let Some(handler) = &session.handler {
            handler.reconnect.enable();
        }

        if connection
            .connect_with_retry(session.core.config.connection_timeout())
            .await
        {
            return Ok(self.transition());
        }

        if session.core.is_interrupted() {
            session.core.interrupted(&mut self.recorder);
        } else {
            session.core.connect_failed(&mut self.recorder, &connection);
        }
        Err(self.recorder.finish())
    }
}

impl SubscribeRun<Connected> {
    async fn subscribe(
        mut self,
        session: &SubscriberSession,
    ) -> Result<SubscribeRun<Subscribed>, SampleResult> {
        let Some(connection) = self.connection_or_fail(&session.core) else {
            return Err(self.recorder.finish());
        };
        let core = &session.core;

        // retained messages may arrive right after SUBACK
        if let Err(e) = session.window.open(core.config.aggregate.target()) {
            self.recorder.fail(e.to_string()).data(format!("{:?}", e));
            return Err(self.recorder.finish());
        }

        match connection.subscribe(&core.topics, core.config.qos).await {
            Ok(()) => {
                info!(client_id = %core.client_id, "Subscribed to {}", core.config.topic);
                Ok(self.transition())
            }
            Err(e) => {
                let _ = session.window.close();
                error!(client_id = %core.client_id, "Failed to subscribe to {}: {}", core.config.topic, e);
                self.recorder
                    .fail(format!("Failed to subscribe to {}: {}", core.config.topic, e))
                    .sampler_data(format!(
                        "Topic: {}\nBroker: {}\nMy client ID: {}",
                        core.config.topic, core.config.host, core.client_id
                    ));
                Err(self.recorder.finish())
            }
        }
    }
}

impl SubscribeRun<Subscribed> {
    fn open_window(mut self, session: &SubscriberSession) -> SubscribeRun<Sampling> {
        let timeout = session.core.config.sampler_timeout();
        debug!(
            client_id = %session.core.client_id,
            "Sampling for up to {} ms, target {}",
            timeout.as_millis(),
            session.core.config.aggregate
        );
        self.deadline = Some(Instant::now() + timeout);
        self.transition()
    }
}

impl SubscribeRun<Sampling> {
    async fn wait(mut self, session: &mut SubscriberSession) -> SubscribeRun<Closed> {
        let deadline = self.deadline.unwrap_or_else(Instant::now);
        let mut poll = tokio::time::interval(POLL_INTERVAL);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        self.end = loop {
            if session.window.is_stopped() {
                break WindowEnd::TargetReached;
            }
            if session.core.is_interrupted() {
                break WindowEnd::Interrupted;
            }
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => break WindowEnd::Deadline,
                _ = session.core.cancel.cancelled() => break WindowEnd::Interrupted,
                _ = session.window.arrival() => {}
                _ = poll.tick() => {}
            }
        };

        if let Some(handler) = &session.handler {
            handler.reconnect.disable();
        }
        if self.end == WindowEnd::Interrupted {
            warn!(client_id = %session.core.client_id, "Sampling interrupted");
            session.core.release().await;
        }
        self.transition()
    }
}

impl SubscribeRun<Closed> {
    fn finalize(mut self, session: &SubscriberSession) -> SampleResult {
        self.recorder.sample_end();
        match session.window.close() {
            Ok(messages) => self.summarize(&session.core, &messages),
            Err(e) => {
                error!(client_id = %session.core.client_id, "Cannot read sample window: {}", e);
                self.recorder
                    .fail(format!("Sampler {} failed: {}", session.core.client_id, e))
                    .data(format!("{:?}", e));
            }
        }
        self.recorder.finish()
    }

    fn summarize(&mut self, core: &SessionCore, messages: &[ReceivedMessage]) {
        let count = messages.len() as u64;
        let payloads: String = messages
            .iter()
            .map(|m| format!("{}\n", m.payload))
            .collect();
        let host = &core.config.host;

        self.recorder
            .sampler_data(format!(
                "Listened {} messages\nTopic: {}\nBroker: {}\nMy client ID: {}",
                count, core.config.topic, host, core.client_id
            ))
            .headers(format!("topic: {}", core.config.topic))
            .message_count(count)
            .data(payloads.clone());

        let target = core.config.aggregate.target();
        if self.end == WindowEnd::Interrupted {
            self.recorder.fail(format!(
                "Sampling interrupted after {} messages from broker: {}",
                count, host
            ));
        } else if count == 0 {
            self.recorder
                .fail(format!("No messages received from broker: {}", host));
        } else if let Some(target) = target.filter(|t| count < *t) {
            let exhausted =
                LoadTestError::TimeoutExhausted(format!("{} of {} messages", count, target));
            warn!(client_id = %core.client_id, "{}", exhausted);
            self.recorder.fail(format!(
                "Fewer than anticipated messages received from broker: {} ({} of {})",
                host, count, target
            ));
        } else {
            self.recorder
                .ok()
                .message(format!("Received {} messages: \n{}", count, payloads));
        }

        info!(client_id = %core.client_id, "Sample closed ({:?}): {} messages", self.end, count);
    }
}

struct SubscriberHandler {
    client_id: String,
    window: Arc<SampleWindow>,
    reconnect: Arc<Reconnector>,
}

impl DeliveryHandler for SubscriberHandler {
    fn on_message(&self, topic: &str, payload: &[u8]) {
        match self
            .window
            .deliver(ReceivedMessage::from_publish(topic, payload))
        {
            Ok(Delivery::Appended(count)) => {
                debug!(client_id = %self.client_id, "Message {} on {}", count, topic)
            }
            Ok(Delivery::TargetReached(count)) => {
                info!(client_id = %self.client_id, "All {} messages received", count)
            }
            Ok(Delivery::Dropped) => {
                debug!(client_id = %self.client_id, "Dropped message on {}: window closed", topic)
            }
            Err(e) => error!(client_id = %self.client_id, "Cannot store message: {}", e),
        }
    }

    fn on_connection_lost(&self, cause: &str) {
        self.reconnect.handle_loss(cause);
    }

    fn on_delivery_complete(&self, _packet_id: u16) {}
}

pub struct SubscriberSession {
    core: SessionCore,
    window: Arc<SampleWindow>,
    handler: Option<Arc<SubscriberHandler>>,
}

impl SubscriberSession {
    /// Validates `config` and resolves the client id. No connection is
    /// opened before the first [`sample`](Self::sample).
    pub fn new(
        config: SamplerConfig,
        registry: Arc<ConnectionRegistry>,
        cancel: CancellationToken,
    ) -> Result<Self, LoadTestError> {
        Ok(Self {
            core: SessionCore::new(config, registry, cancel)?,
            window: Arc::new(SampleWindow::new()),
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

    /// Messages of the current or most recent window, in arrival order
    pub fn messages(&self) -> Vec<ReceivedMessage> {
        self.window.snapshot().unwrap_or_default()
    }

    pub fn connection(&self) -> Option<Arc<Connection>> {
        self.core.connection.clone()
    }

    pub fn is_reconnecting(&self) -> bool {
        self.handler
            .as_ref()
            .map(|h| h.reconnect.is_reconnecting())
            .unwrap_or(false)
    }

    fn install_handler(&mut self, connection: &Arc<Connection>) {
        let handler = Arc::new(SubscriberHandler {
            client_id: self.core.client_id.clone(),
            window: self.window.clone(),
            reconnect: Reconnector::new(connection, self.core.config.connection_timeout()),
        });
        let weak: Weak<dyn DeliveryHandler> = Arc::downgrade(&handler) as Weak<dyn DeliveryHandler>;
        connection.set_handler(weak);
        self.handler = Some(handler);
    }

    /// Runs one sampling window. Failures are reported in the result.
    pub async fn sample(&mut self) -> SampleResult {
        let run = SubscribeRun::start(&self.core.config.label);
        let run = match run.acquire(self).await {
            Ok(run) => run,
            Err(failed) => return failed,
        };
        let run = match run.connect(self).await {
            Ok(run) => run,
            Err(failed) => return failed,
        };
        let run = match run.subscribe(self).await {
            Ok(run) => run,
            Err(failed) => return failed,
        };
        let run = run.open_window(self).wait(self).await;
        run.finalize(self)
    }

    /// Force-closes the connection and frees the client id
    pub async fn close(&mut self) {
        if let Some(handler) = &self.handler {
            handler.reconnect.disable();
        }
        let _ = self.window.close();
        self.core.release().await;
        self.handler = None;
    }
}
