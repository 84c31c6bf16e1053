//! Connection to the messaging network.
//!
//! The connection owns the transport. Components built on top of it only
//! need liveness checks, link creation and lifecycle notifications:
//!
//! ```text
//! Command router            Connection                Messaging network
//! ┌──────────────┐         ┌──────────────┐          ┌────────────────┐
//! │  consumers   │◀────────│  receivers   │◀─────────│  command/...   │
//! │  delegation  │────────▶│  senders     │─────────▶│  command_...   │
//! │  responses   │◀────────│  events      │          │                │
//! └──────────────┘         └──────────────┘          └────────────────┘
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

use crate::error::Result;
use crate::link::{QoS, ReceiverLink, SenderLink};

/// Lifecycle notification published by a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionEvent {
    /// First successful connect
    Connected,
    /// Connection lost; all links are gone
    Disconnected,
    /// Connection re-established after a loss
    Reconnected,
}

/// Connection to the messaging network.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Wait until the connection is live.
    ///
    /// Fails with a timeout if it does not become live within `timeout`.
    async fn is_connected(&self, timeout: Duration) -> Result<()>;

    /// Open a receiver link on an address.
    ///
    /// The returned link is open.
    async fn create_receiver(
        &self,
        address: &str,
        qos: QoS,
        initial_credits: u32,
    ) -> Result<ReceiverLink>;

    /// Open a sender link on an address.
    async fn create_sender(&self, address: &str, qos: QoS) -> Result<Box<dyn SenderLink>>;

    /// Subscribe to connection lifecycle events.
    fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent>;
}

/// Shared connection handle.
pub type SharedConnection = Arc<dyn Connection>;
