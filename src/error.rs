//! Error definitions for the load-test library

use thiserror::Error;

/// Failure of a single connect attempt against a broker
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectError {
    /// Broker refused the credentials or the client is not authorized
    #[error("security error: {0}")]
    Security(String),

    /// Network, protocol or refusal error not related to authentication
    #[error("connect error: {0}")]
    General(String),

    /// No CONNACK arrived within the connection timeout
    #[error("connect attempt timed out after {0} ms")]
    Timeout(u64),
}

/// Error types for registry, session and configuration operations
#[derive(Debug, Error)]
pub enum LoadTestError {
    /// Another session already holds a connection for this client id
    #[error("duplicate client id: {0}")]
    DuplicateIdentifier(String),

    /// Connecting to the broker failed
    #[error(transparent)]
    Connect(#[from] ConnectError),

    /// Subscribe request could not be issued
    #[error("subscribe failed: {0}")]
    Subscribe(String),

    /// Publish request could not be issued
    #[error("publish failed: {0}")]
    Publish(String),

    /// Sampling window closed without the anticipated messages
    #[error("sampling window exhausted: {0}")]
    TimeoutExhausted(String),

    /// Invalid or incomplete sampler configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Shared session state became unusable
    #[error("session state error: {0}")]
    State(String),
}
