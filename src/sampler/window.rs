//! Per-session message buffer shared between the delivery task and the
//! sampling task.
//!
//! The delivery side only ever calls [`SampleWindow::deliver`]; the sampling
//! side opens, waits on and closes the window. Appending, counting and the
//! target check happen under one mutex guard, and closing sets the stop flag
//! under that same guard before the snapshot is taken.

use crate::error::LoadTestError;
use crate::mqtt::message::ReceivedMessage;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::Notify;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Stored; carries the updated count
    Appended(u64),
    /// Stored as the last message of the window
    TargetReached(u64),
    /// Window already stopped, nothing was stored
    Dropped,
}

#[derive(Default)]
struct WindowState {
    messages: Vec<ReceivedMessage>,
    target: Option<u64>,
    stopped: bool,
}

pub struct SampleWindow {
    state: Mutex<WindowState>,
    received: AtomicU64,
    arrived: Notify,
}

impl Default for SampleWindow {
    fn default() -> Self {
        Self::new()
    }
}

impl SampleWindow {
    /// Creates a stopped window; deliveries are dropped until [`open`](Self::open)
    pub fn new() -> Self {
        Self {
            state: Mutex::new(WindowState {
                stopped: true,
                ..WindowState::default()
            }),
            received: AtomicU64::new(0),
            arrived: Notify::new(),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, WindowState>, LoadTestError> {
        self.state
            .lock()
            .map_err(|_| LoadTestError::State("sample window lock poisoned".to_string()))
    }

    /// Clears the buffer and starts accepting deliveries up to `target`
    pub fn open(&self, target: Option<u64>) -> Result<(), LoadTestError> {
        let mut state = self.lock()?;
        state.messages.clear();
        state.target = target;
        state.stopped = false;
        self.received.store(0, Ordering::SeqCst);
        Ok(())
    }

    pub fn deliver(&self, message: ReceivedMessage) -> Result<Delivery, LoadTestError> {
        let reached = {
            let mut state = self.lock()?;
            if state.stopped {
                return Ok(Delivery::Dropped);
            }
            state.messages.push(message);
            let count = self.received.fetch_add(1, Ordering::SeqCst) + 1;
            if state.target == Some(count) {
                state.stopped = true;
                Delivery::TargetReached(count)
            } else {
                Delivery::Appended(count)
            }
        };
        self.arrived.notify_one();
        Ok(reached)
    }

    /// Resolves on the next delivery, or immediately if one happened since
    /// the last wait
    pub async fn arrival(&self) {
        self.arrived.notified().await
    }

    pub fn received(&self) -> u64 {
        self.received.load(Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        self.lock().map(|state| state.stopped).unwrap_or(true)
    }

    /// Stops the window and returns the ordered buffer contents
    pub fn close(&self) -> Result<Vec<ReceivedMessage>, LoadTestError> {
        let mut state = self.lock()?;
        state.stopped = true;
        Ok(state.messages.clone())
    }

    /// Buffer contents without changing the window state
    pub fn snapshot(&self) -> Result<Vec<ReceivedMessage>, LoadTestError> {
        Ok(self.lock()?.messages.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn msg(payload: &str) -> ReceivedMessage {
        ReceivedMessage::from_publish("t", payload.as_bytes())
    }

    #[test]
    fn new_window_drops_deliveries() {
        let window = SampleWindow::new();
        assert_eq!(window.deliver(msg("early")).unwrap(), Delivery::Dropped);
        assert_eq!(window.received(), 0);
    }

    #[test]
    fn target_stops_the_window() {
        let window = SampleWindow::new();
        window.open(Some(2)).unwrap();

        assert_eq!(window.deliver(msg("a")).unwrap(), Delivery::Appended(1));
        assert_eq!(window.deliver(msg("b")).unwrap(), Delivery::TargetReached(2));
        assert!(window.is_stopped());
        assert_eq!(window.deliver(msg("c")).unwrap(), Delivery::Dropped);

        let payloads: Vec<_> = window.close().unwrap().into_iter().map(|m| m.payload).collect();
        assert_eq!(payloads, ["a", "b"]);
    }

    #[test]
    fn close_stops_unlimited_window() {
        let window = SampleWindow::new();
        window.open(None).unwrap();
        window.deliver(msg("a")).unwrap();
        assert_eq!(window.close().unwrap().len(), 1);
        assert_eq!(window.deliver(msg("late")).unwrap(), Delivery::Dropped);
        assert_eq!(window.snapshot().unwrap().len(), 1);
    }

    #[test]
    fn reopen_clears_previous_window() {
        let window = SampleWindow::new();
        window.open(None).unwrap();
        window.deliver(msg("old")).unwrap();
        window.close().unwrap();

        window.open(Some(1)).unwrap();
        assert_eq!(window.received(), 0);
        assert!(window.snapshot().unwrap().is_empty());
    }

    #[tokio::test]
    async fn concurrent_deliveries_count_the_target_once() {
        let window = Arc::new(SampleWindow::new());
        window.open(Some(50)).unwrap();

        let tasks: Vec<_> = (0..8)
            .map(|worker| {
                let window = window.clone();
                tokio::spawn(async move {
                    let mut reached = 0;
                    for i in 0..20 {
                        if let Delivery::TargetReached(_) =
                            window.deliver(msg(&format!("{}-{}", worker, i))).unwrap()
                        {
                            reached += 1;
                        }
                    }
                    reached
                })
            })
            .collect();

        let mut reached = 0;
        for task in tasks {
            reached += task.await.unwrap();
        }
        assert_eq!(reached, 1);
        assert_eq!(window.received(), 50);
        assert_eq!(window.close().unwrap().len(), 50);
    }

    #[tokio::test]
    async fn arrival_wakes_a_waiter() {
        let window = Arc::new(SampleWindow::new());
        window.open(None).unwrap();

        let waiter = {
            let window = window.clone();
            tokio::spawn(async move { window.arrival().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        window.deliver(msg("x")).unwrap();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
