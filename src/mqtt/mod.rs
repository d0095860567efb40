//! # MQTT Client Layer
//!
//! Everything that talks to a broker lives here. Sessions never touch
//! rumqttc directly; they go through a [`connection::Connection`], which wraps
//! a [`transport::Transport`] and adds lifecycle state plus bounded connect
//! retry.
//!
//! ## Module Architecture
//!
//! ```text
//! mqtt/
//! ├── options.rs           - Broker URI parsing and connect options
//! ├── transport.rs         - Transport / DeliveryHandler / TransportFactory seams
//! ├── rumqtt_transport.rs  - rumqttc-backed transport and its event-loop driver
//! ├── memory.rs            - In-process broker for dry runs and tests
//! ├── connection.rs        - Connection state machine and connect-with-retry
//! └── message.rs           - Captured inbound messages
//! ```
//!
//! ## Event Flow
//!
//! ```text
//! Broker ──► EventLoop task ──► DeliveryHandler (session) ──► SampleWindow
//!                 │
//!                 └─ connection lost ──► reconnect task ──► Connection::connect_with_retry
//! ```
//!
//! Inbound callbacks run on the transport's task, never on the task that
//! drives a sample. Handlers must therefore be `Send + Sync` and keep their
//! critical sections short.

pub mod connection;
pub mod memory;
pub mod message;
pub mod options;
pub mod rumqtt_transport;
pub mod transport;

pub use connection::{Connection, ConnectionState, MAX_CONNECT_ATTEMPTS};
pub use memory::MemoryBroker;
pub use message::ReceivedMessage;
pub use options::{BrokerAddress, ConnectOptions};
pub use rumqtt_transport::{RumqttFactory, RumqttTransport};
pub use transport::{DeliveryHandler, Transport, TransportFactory};
