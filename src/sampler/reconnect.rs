//! Auto-reconnect after connection loss.
//!
//! At most one reconnect runs per connection at a time: the first loss
//! notification wins a compare-and-set on `in_progress` and spawns the
//! reconnect task, later notifications return immediately until it finishes.
//! A clean-session broker drops subscriptions with the connection, so those
//! are subscribed again before the reconnect counts as completed.

use crate::mqtt::connection::Connection;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub struct Reconnector {
    connection: Weak<Connection>,
    timeout: Duration,
    enabled: AtomicBool,
    in_progress: AtomicBool,
    completed: AtomicU64,
}

impl Reconnector {
    pub fn new(connection: &Arc<Connection>, timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            connection: Arc::downgrade(connection),
            timeout,
            enabled: AtomicBool::new(true),
            in_progress: AtomicBool::new(false),
            completed: AtomicU64::new(0),
        })
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::SeqCst);
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::SeqCst);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn is_reconnecting(&self) -> bool {
        self.in_progress.load(Ordering::SeqCst)
    }

    /// Number of reconnects that ended connected
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::SeqCst)
    }

    /// Called from the delivery task when the broker connection drops.
    /// Returns the spawned reconnect task, if one was started.
    pub fn handle_loss(self: &Arc<Self>, cause: &str) -> Option<JoinHandle<bool>> {
        let connection = self.connection.upgrade()?;
        connection.mark_lost();

        if connection.is_closed() {
            debug!(client_id = %connection.client_id(), "Connection closed, not reconnecting");
            return None;
        }
        if !self.is_enabled() {
            info!(client_id = %connection.client_id(), "Connection lost: {}. Auto-reconnect disabled", cause);
            return None;
        }
        if self
            .in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!(client_id = %connection.client_id(), "Reconnect already in progress");
            return None;
        }

        let Ok(runtime) = Handle::try_current() else {
            error!(client_id = %connection.client_id(), "No runtime available for reconnect");
            self.in_progress.store(false, Ordering::SeqCst);
            return None;
        };

        warn!(client_id = %connection.client_id(), "Connection lost: {}. Trying to reconnect", cause);
        let this = self.clone();
        Some(runtime.spawn(async move {
            let connected = connection.connect_with_retry(this.timeout).await;
            if connected {
                info!(client_id = %connection.client_id(), "Reconnected");
                if connection.options().clean_session {
                    if let Err(e) = connection.restore_subscriptions().await {
                        error!(client_id = %connection.client_id(), "Cannot restore subscriptions: {}", e);
                    }
                }
                this.completed.fetch_add(1, Ordering::SeqCst);
            } else {
                error!(client_id = %connection.client_id(), "Reconnect failed");
            }
            this.in_progress.store(false, Ordering::SeqCst);
            connected
        }))
    }
}
