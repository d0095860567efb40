//! # Connection Registry
//!
//! Maps client identifiers to live broker connections so that no two
//! virtual users ever share, or both open, a connection under the same id.
//!
//! The registry is an explicitly owned value: the runner creates one per test
//! and hands an `Arc` to every session. Each mutation happens under a single
//! write guard, which makes "check for duplicate, then insert" atomic.
//! Message state is never stored here; the registry only owns the mapping.

use crate::error::LoadTestError;
use crate::mqtt::connection::Connection;
use crate::mqtt::options::ConnectOptions;
use crate::mqtt::transport::TransportFactory;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info};

pub struct ConnectionRegistry {
    factory: Arc<dyn TransportFactory>,
    connections: RwLock<HashMap<String, Arc<Connection>>>,
}

impl ConnectionRegistry {
    pub fn new(factory: Arc<dyn TransportFactory>) -> Self {
        Self {
            factory,
            connections: RwLock::new(HashMap::new()),
        }
    }

    /// Creates and registers a not-yet-connected connection for
    /// `options.client_id`. Fails if that id is already registered.
    pub async fn acquire(&self, options: &ConnectOptions) -> Result<Arc<Connection>, LoadTestError> {
        let mut connections = self.connections.write().await;
        if connections.contains_key(&options.client_id) {
            error!(client_id = %options.client_id, "Duplicate client id");
            return Err(LoadTestError::DuplicateIdentifier(
                options.client_id.clone(),
            ));
        }

        let transport = self.factory.create(options)?;
        let connection = Arc::new(Connection::new(options.clone(), transport));
        connections.insert(options.client_id.clone(), connection.clone());
        info!(client_id = %options.client_id, "Registered connection to {}", options.broker_uri);
        Ok(connection)
    }

    pub async fn lookup(&self, client_id: &str) -> Option<Arc<Connection>> {
        self.connections.read().await.get(client_id).cloned()
    }

    /// Force-disconnects and removes `client_id`; unknown ids are ignored
    pub async fn release(&self, client_id: &str) {
        let removed = self.connections.write().await.remove(client_id);
        if let Some(connection) = removed {
            connection.force_disconnect().await;
            info!(client_id, "Released connection");
        }
    }

    /// Force-disconnects and removes every entry, returning how many there were
    pub async fn drain(&self) -> usize {
        let drained: Vec<Arc<Connection>> = {
            let mut connections = self.connections.write().await;
            connections.drain().map(|(_, conn)| conn).collect()
        };
        for connection in &drained {
            connection.force_disconnect().await;
        }
        if !drained.is_empty() {
            info!("Drained {} connections", drained.len());
        }
        drained.len()
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }
}
