//! Connection bookkeeping shared by subscriber and publisher sessions

use crate::config::SamplerConfig;
use crate::error::LoadTestError;
use crate::identifier::resolve_client_id;
use crate::mqtt::connection::Connection;
use crate::mqtt::options::ConnectOptions;
use crate::registry::ConnectionRegistry;
use crate::sampler::result::SampleRecorder;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

pub(crate) struct SessionCore {
    pub config: SamplerConfig,
    pub client_id: String,
    pub topics: Vec<String>,
    pub registry: Arc<ConnectionRegistry>,
    pub connection: Option<Arc<Connection>>,
    pub cancel: CancellationToken,
}

impl SessionCore {
    pub fn new(
        config: SamplerConfig,
        registry: Arc<ConnectionRegistry>,
        cancel: CancellationToken,
    ) -> Result<Self, LoadTestError> {
        config.validate()?;
        let client_id = resolve_client_id(&config);
        let topics = config.topics();
        Ok(Self {
            config,
            client_id,
            topics,
            registry,
            connection: None,
            cancel,
        })
    }

    pub fn is_interrupted(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Returns the session's connection, registering a new one on first use
    /// or after the previous one was force-closed. The flag is `true` when the
    /// connection was just registered and still needs a handler.
    pub async fn ensure_connection(&mut self) -> Result<(Arc<Connection>, bool), LoadTestError> {
        if let Some(connection) = &self.connection {
            if !connection.is_closed() {
                return Ok((connection.clone(), false));
            }
            debug!(client_id = %self.client_id, "Previous connection was closed, registering again");
            self.registry.release(&self.client_id).await;
            self.connection = None;
        }

        let options = ConnectOptions::from_config(&self.config, &self.client_id);
        let connection = self.registry.acquire(&options).await?;
        self.connection = Some(connection.clone());
        Ok((connection, true))
    }

    /// Force-closes the connection and removes it from the registry
    pub async fn release(&mut self) {
        if self.connection.take().is_some() {
            self.registry.release(&self.client_id).await;
        }
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            client_id: self.client_id.clone(),
            registry: self.registry.clone(),
            cancel: self.cancel.clone(),
        }
    }

    /// Records the failure for a connection that could not be established
    pub fn connect_failed(&self, recorder: &mut SampleRecorder, connection: &Connection) {
        let last_error = connection
            .last_error()
            .map(|e| e.to_string())
            .unwrap_or_else(|| "unknown error".to_string());
        error!(client_id = %self.client_id, "Cannot connect to broker {}: {}", self.config.host, last_error);
        recorder
            .fail(format!(
                "Cannot connect to broker: {} with {}",
                self.config.host, last_error
            ))
            .sampler_data(format!("ERROR: Could not connect to broker: {}", self.config.host));
    }

    pub fn interrupted(&self, recorder: &mut SampleRecorder) {
        recorder
            .fail(format!("Sampler {} was interrupted", self.client_id))
            .sampler_data(format!("Broker: {}\nMy client ID: {}", self.config.host, self.client_id));
    }
}

/// Cloneable interrupt switch for a running session
#[derive(Clone)]
pub struct SessionHandle {
    client_id: String,
    registry: Arc<ConnectionRegistry>,
    cancel: CancellationToken,
}

impl SessionHandle {
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Cancels the session and force-closes its connection without
    /// unsubscribing. A parked sampling wait returns within one poll interval.
    pub async fn interrupt(&self) {
        self.cancel.cancel();
        self.registry.release(&self.client_id).await;
    }

    pub fn is_interrupted(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
