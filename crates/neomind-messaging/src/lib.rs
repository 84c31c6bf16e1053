//! Messaging network primitives for NeoMind command routing.
//!
//! Provides:
//! - Address scheme for command, internal command and response endpoints
//! - Wire message model with the well-known application properties
//! - Delivery settlement handles (accept, reject, release, modify)
//! - Receiver and sender link primitives with an explicit lifecycle
//! - The `Connection` trait implemented by messaging network clients
//! - An in-memory loopback connection for tests and local wiring

pub mod address;
pub mod connection;
pub mod delivery;
pub mod error;
pub mod link;
pub mod memory;
pub mod message;

// Re-exports
pub use address::{
    target_address, ResourceIdentifier, COMMAND_ENDPOINT, COMMAND_RESPONSE_ENDPOINT,
    NORTHBOUND_COMMAND_REQUEST_ENDPOINT, NORTHBOUND_COMMAND_RESPONSE_ENDPOINT,
};

pub use connection::{Connection, ConnectionEvent, SharedConnection};

pub use delivery::{Delivery, DeliveryOutcome, DeliveryReceipt};

pub use error::{MessagingError, Result};

pub use link::{
    InboundMessage, LinkHandle, LinkState, QoS, ReceiverEndpoint, ReceiverLink, SenderLink,
};

pub use memory::InMemoryConnection;

pub use message::{properties, ApplicationProperties, Message};
