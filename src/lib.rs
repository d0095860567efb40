//! # mqtt-loadtest
//!
//! Load-generation samplers for MQTT brokers. A subscriber sampler listens on
//! one or more topics and reports how many messages arrived within a bounded
//! window; a publisher sampler sends a configured batch of messages.
//!
//! ## Module Architecture
//!
//! ```text
//! src/
//! ├── config.rs      - SamplerConfig and its flat-parameter / TOML forms
//! ├── error.rs       - ConnectError and LoadTestError
//! ├── identifier.rs  - Random client id suffixes
//! ├── registry.rs    - Client id → connection map shared by all users
//! ├── mqtt/          - Transports, connection lifecycle, connect retry
//! ├── sampler/       - Subscriber and publisher sessions
//! └── runner.rs      - Virtual users, lifecycle hooks, run summary
//! ```

pub mod config;
pub mod error;
pub mod identifier;
pub mod mqtt;
pub mod registry;
pub mod runner;
pub mod sampler;

pub use config::{Aggregate, QosLevel, SamplerConfig, Strategy};
pub use error::{ConnectError, LoadTestError};
pub use identifier::generate_client_id;
pub use registry::ConnectionRegistry;
pub use runner::{LoadTest, RunReport, TestPlan};
pub use sampler::{
    PublisherSession, Role, SampleResult, Sampler, SessionHandle, SubscriberSession,
    RESPONSE_FAILED, RESPONSE_OK,
};
