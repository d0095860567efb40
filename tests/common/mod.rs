#![allow(dead_code)]

use mqtt_loadtest::mqtt::MemoryBroker;
use mqtt_loadtest::{Aggregate, ConnectionRegistry, SamplerConfig};
use std::sync::{Arc, Once};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::Level;

static INIT: Once = Once::new();

/// Installs a test-writer subscriber once per test binary.
/// `MQTT_LOADTEST_DEBUG=1` raises the level to debug.
pub fn init_tracing() {
    INIT.call_once(|| {
        let level = if std::env::var("MQTT_LOADTEST_DEBUG").is_ok() {
            Level::DEBUG
        } else {
            Level::WARN
        };
        let _ = tracing_subscriber::fmt()
            .with_max_level(level)
            .with_target(true)
            .with_test_writer()
            .try_init();
    });
}

pub fn setup() -> (MemoryBroker, Arc<ConnectionRegistry>) {
    init_tracing();
    let broker = MemoryBroker::new();
    let registry = Arc::new(ConnectionRegistry::new(Arc::new(broker.clone())));
    (broker, registry)
}

pub fn subscriber_config(client_id: &str, aggregate: Aggregate, sampler_timeout_ms: u64) -> SamplerConfig {
    SamplerConfig {
        client_id: client_id.to_string(),
        topic: "load/test".to_string(),
        aggregate,
        connection_timeout_ms: 100,
        sampler_timeout_ms,
        ..SamplerConfig::default()
    }
}

/// Injects `payloads` on `topic` after `delay`, in order
pub fn feed(broker: &MemoryBroker, topic: &str, payloads: Vec<String>, delay: Duration) -> JoinHandle<usize> {
    let broker = broker.clone();
    let topic = topic.to_string();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        payloads
            .iter()
            .map(|payload| broker.inject(&topic, payload))
            .sum()
    })
}

pub fn numbered(prefix: &str, count: usize) -> Vec<String> {
    (0..count).map(|i| format!("{}{}", prefix, i)).collect()
}
