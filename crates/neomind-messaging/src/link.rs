//! Receiver and sender links.
//!
//! A receiver link is a pair of halves: the [`ReceiverLink`] held by the
//! consuming component and the [`ReceiverEndpoint`] held by the connection
//! that pushes messages into it. Both halves share one [`LinkHandle`] whose
//! lifecycle is an explicit state machine:
//!
//! ```text
//! Requested ──▶ Open ──┬──▶ ClosedRemote   peer closed the link
//!                      ├──▶ ClosedLocal    owner closed the link
//!                      └──▶ Detached       connection was lost
//! ```
//!
//! Terminal states are final. Observers subscribe to transitions through
//! [`LinkHandle::watch`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

use crate::delivery::{Delivery, DeliveryOutcome, DeliveryReceipt};
use crate::error::{MessagingError, Result};
use crate::message::Message;

/// Delivery guarantee requested for a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QoS {
    /// Pre-settled transfers
    AtMostOnce,
    /// Transfers settled by the receiver
    AtLeastOnce,
}

/// Lifecycle state of a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LinkState {
    /// Attach requested, not yet confirmed
    Requested,
    /// Usable
    Open,
    /// Closed by the peer
    ClosedRemote,
    /// Closed by the owner
    ClosedLocal,
    /// Lost together with the connection
    Detached,
}

impl LinkState {
    /// Check if the state is final.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            LinkState::ClosedRemote | LinkState::ClosedLocal | LinkState::Detached
        )
    }
}

/// Message received on a link together with its delivery handle.
#[derive(Debug)]
pub struct InboundMessage {
    pub delivery: Delivery,
    pub message: Message,
}

/// Shared lifecycle handle of a receiver link.
#[derive(Debug, Clone)]
pub struct LinkHandle {
    address: Arc<str>,
    state: Arc<watch::Sender<LinkState>>,
}

impl LinkHandle {
    fn new(address: &str) -> Self {
        let (state, _) = watch::channel(LinkState::Requested);
        Self {
            address: Arc::from(address),
            state: Arc::new(state),
        }
    }

    /// Get the link address.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Get the current state.
    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    /// Check if the link is open.
    pub fn is_open(&self) -> bool {
        self.state() == LinkState::Open
    }

    /// Subscribe to state transitions.
    pub fn watch(&self) -> watch::Receiver<LinkState> {
        self.state.subscribe()
    }

    /// Close the link locally.
    ///
    /// Returns `false` if the link already was in a terminal state.
    pub fn close(&self) -> bool {
        self.transition(LinkState::ClosedLocal)
    }

    /// Mark the link as closed by the peer.
    pub fn close_remotely(&self) -> bool {
        self.transition(LinkState::ClosedRemote)
    }

    /// Mark the link as lost with its connection.
    pub fn detach(&self) -> bool {
        self.transition(LinkState::Detached)
    }

    fn open(&self) -> bool {
        self.state.send_if_modified(|state| {
            if *state == LinkState::Requested {
                *state = LinkState::Open;
                true
            } else {
                false
            }
        })
    }

    fn transition(&self, target: LinkState) -> bool {
        self.state.send_if_modified(|state| {
            if state.is_terminal() {
                false
            } else {
                *state = target;
                true
            }
        })
    }
}

/// Consuming half of a receiver link.
#[derive(Debug)]
pub struct ReceiverLink {
    messages: mpsc::Receiver<InboundMessage>,
    handle: LinkHandle,
}

impl ReceiverLink {
    /// Create a receiver link and the endpoint a connection delivers through.
    ///
    /// `credits` bounds the number of unconsumed messages buffered on the link.
    pub fn channel(address: &str, credits: u32) -> (ReceiverLink, ReceiverEndpoint) {
        let capacity = usize::try_from(credits.max(1)).unwrap_or(usize::MAX);
        let (tx, rx) = mpsc::channel(capacity);
        let handle = LinkHandle::new(address);

        let link = ReceiverLink {
            messages: rx,
            handle: handle.clone(),
        };
        let endpoint = ReceiverEndpoint { tx, handle };
        (link, endpoint)
    }

    /// Get the link address.
    pub fn address(&self) -> &str {
        self.handle.address()
    }

    /// Get the lifecycle handle.
    pub fn handle(&self) -> &LinkHandle {
        &self.handle
    }

    /// Receive the next message.
    ///
    /// Returns `None` once the connection side of the link is gone.
    pub async fn recv(&mut self) -> Option<InboundMessage> {
        self.messages.recv().await
    }

    /// Split into the message stream and the lifecycle handle.
    pub fn into_parts(self) -> (mpsc::Receiver<InboundMessage>, LinkHandle) {
        (self.messages, self.handle)
    }
}

/// Connection half of a receiver link.
#[derive(Debug, Clone)]
pub struct ReceiverEndpoint {
    tx: mpsc::Sender<InboundMessage>,
    handle: LinkHandle,
}

impl ReceiverEndpoint {
    /// Get the lifecycle handle.
    pub fn handle(&self) -> &LinkHandle {
        &self.handle
    }

    /// Confirm the attach, moving the link from requested to open.
    pub fn open(&self) -> bool {
        self.handle.open()
    }

    /// Check if the link accepts messages.
    pub fn is_open(&self) -> bool {
        self.handle.is_open() && !self.tx.is_closed()
    }

    /// Push a message into the link.
    ///
    /// Waits for credit if the consumer is behind.
    pub async fn deliver(&self, message: Message) -> Result<DeliveryReceipt> {
        if !self.handle.is_open() {
            return Err(MessagingError::LinkClosed(self.handle.address().to_string()));
        }
        let (delivery, receipt) = Delivery::channel();
        self.tx
            .send(InboundMessage { delivery, message })
            .await
            .map_err(|_| MessagingError::LinkClosed(self.handle.address().to_string()))?;
        Ok(receipt)
    }
}

/// Sending link bound to one address.
#[async_trait]
pub trait SenderLink: Send + Sync {
    /// Get the target address.
    fn address(&self) -> &str;

    /// Send a message and wait for the remote outcome.
    async fn send(&self, message: Message) -> Result<DeliveryOutcome>;

    /// Close the link.
    async fn close(&self);

    /// Send a message and require it to be accepted.
    async fn send_and_wait_for_outcome(&self, message: Message) -> Result<()> {
        match self.send(message).await? {
            DeliveryOutcome::Accepted => Ok(()),
            outcome => Err(MessagingError::NotAccepted(outcome)),
        }
    }
}
