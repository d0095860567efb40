//! # Samplers
//!
//! A sampler is one virtual user's session against the broker. Each call to
//! `sample()` produces exactly one [`SampleResult`]; errors never escape as
//! `Err`.
//!
//! ```text
//! sampler/
//! ├── subscriber.rs  - Subscribe-and-sample state machine
//! ├── publisher.rs   - Publish-N-messages session
//! ├── session.rs     - Registry bookkeeping and the interrupt handle
//! ├── window.rs      - Message buffer shared with the delivery task
//! ├── reconnect.rs   - Single-flight auto-reconnect
//! ├── topics.rs      - Topic distribution for publishers
//! └── result.rs      - SampleResult and its recorder
//! ```

pub mod publisher;
pub mod reconnect;
pub mod result;
pub mod session;
pub mod subscriber;
pub mod topics;
pub mod window;

pub use publisher::PublisherSession;
pub use result::{SampleResult, RESPONSE_FAILED, RESPONSE_OK};
pub use session::SessionHandle;
pub use subscriber::SubscriberSession;

use crate::config::SamplerConfig;
use crate::error::LoadTestError;
use crate::registry::ConnectionRegistry;
use serde::Deserialize;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    Subscriber,
    Publisher,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Subscriber => write!(f, "subscriber"),
            Role::Publisher => write!(f, "publisher"),
        }
    }
}

pub enum Sampler {
    Subscriber(SubscriberSession),
    Publisher(PublisherSession),
}

impl Sampler {
    pub fn new(
        role: Role,
        config: SamplerConfig,
        registry: Arc<ConnectionRegistry>,
        cancel: CancellationToken,
    ) -> Result<Self, LoadTestError> {
        Ok(match role {
            Role::Subscriber => Sampler::Subscriber(SubscriberSession::new(config, registry, cancel)?),
            Role::Publisher => Sampler::Publisher(PublisherSession::new(config, registry, cancel)?),
        })
    }

    pub fn client_id(&self) -> &str {
        match self {
            Sampler::Subscriber(s) => s.client_id(),
            Sampler::Publisher(p) => p.client_id(),
        }
    }

    pub fn handle(&self) -> SessionHandle {
        match self {
            Sampler::Subscriber(s) => s.handle(),
            Sampler::Publisher(p) => p.handle(),
        }
    }

    pub async fn sample(&mut self) -> SampleResult {
        match self {
            Sampler::Subscriber(s) => s.sample().await,
            Sampler::Publisher(p) => p.sample().await,
        }
    }

    pub async fn close(&mut self) {
        match self {
            Sampler::Subscriber(s) => s.close().await,
            Sampler::Publisher(p) => p.close().await,
        }
    }
}
