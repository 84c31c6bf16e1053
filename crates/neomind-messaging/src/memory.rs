//! In-memory loopback connection (for testing and local wiring).
//!
//! Messages sent on a sender link are routed to the first open receiver
//! link attached to the sender's address (not the message's `address`
//! field); the receiver's settlement becomes the
//! sender's outcome. A message for an address without receivers is
//! released. The connection also offers fault injection: refusing links,
//! delaying link establishment, toggling liveness, closing links remotely
//! and simulating disconnect/reconnect.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};

use crate::connection::{Connection, ConnectionEvent};
use crate::delivery::DeliveryOutcome;
use crate::error::{MessagingError, Result};
use crate::link::{QoS, ReceiverEndpoint, ReceiverLink, SenderLink};
use crate::message::Message;

const EVENT_CHANNEL_CAPACITY: usize = 16;

#[derive(Default)]
struct NetworkState {
    receivers: HashMap<String, Vec<ReceiverEndpoint>>,
    receiver_attempts: HashMap<String, usize>,
    refused_receivers: HashSet<String>,
    refused_senders: HashSet<String>,
    open_delay: Option<Duration>,
    sent: Vec<(String, Message)>,
    open_senders: usize,
}

struct Network {
    connected: watch::Sender<bool>,
    events: broadcast::Sender<ConnectionEvent>,
    state: Mutex<NetworkState>,
}

impl Network {
    fn is_live(&self) -> bool {
        *self.connected.borrow()
    }

    fn route(&self, message: &Message, address: &str) -> Option<ReceiverEndpoint> {
        let mut state = self.state.lock();
        state.sent.push((address.to_string(), message.clone()));
        let endpoints = state.receivers.get_mut(address)?;
        endpoints.retain(|e| !e.handle().state().is_terminal());
        endpoints.iter().find(|e| e.is_open()).cloned()
    }
}

/// Loopback connection.
#[derive(Clone)]
pub struct InMemoryConnection {
    network: Arc<Network>,
}

impl InMemoryConnection {
    /// Create a live connection.
    pub fn new() -> Self {
        let (connected, _) = watch::channel(true);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            network: Arc::new(Network {
                connected,
                events,
                state: Mutex::new(NetworkState::default()),
            }),
        }
    }

    /// Check if the connection is live.
    pub fn is_live(&self) -> bool {
        self.network.is_live()
    }

    /// Drop the connection.
    ///
    /// All receiver links are detached and a `Disconnected` event is published.
    pub fn disconnect(&self) {
        self.network.connected.send_replace(false);
        let endpoints: Vec<ReceiverEndpoint> = {
            let mut state = self.network.state.lock();
            state.receivers.drain().flat_map(|(_, e)| e).collect()
        };
        for endpoint in endpoints {
            endpoint.handle().detach();
        }
        tracing::debug!("in-memory connection disconnected");
        let _ = self.network.events.send(ConnectionEvent::Disconnected);
    }

    /// Re-establish the connection and publish a `Reconnected` event.
    pub fn reconnect(&self) {
        self.network.connected.send_replace(true);
        tracing::debug!("in-memory connection reconnected");
        let _ = self.network.events.send(ConnectionEvent::Reconnected);
    }

    /// Toggle liveness without publishing events or touching links.
    pub fn set_available(&self, available: bool) {
        self.network.connected.send_replace(available);
    }

    /// Refuse receiver links on an address.
    pub fn refuse_receivers(&self, address: &str) {
        self.network
            .state
            .lock()
            .refused_receivers
            .insert(address.to_string());
    }

    /// Accept receiver links on an address again.
    pub fn accept_receivers(&self, address: &str) {
        self.network.state.lock().refused_receivers.remove(address);
    }

    /// Refuse sender links on an address.
    pub fn refuse_senders(&self, address: &str) {
        self.network
            .state
            .lock()
            .refused_senders
            .insert(address.to_string());
    }

    /// Accept sender links on an address again.
    pub fn accept_senders(&self, address: &str) {
        self.network.state.lock().refused_senders.remove(address);
    }

    /// Delay every receiver link establishment.
    pub fn set_open_delay(&self, delay: Option<Duration>) {
        self.network.state.lock().open_delay = delay;
    }

    /// Get the number of receiver link attempts made for an address.
    pub fn receiver_attempts(&self, address: &str) -> usize {
        self.network
            .state
            .lock()
            .receiver_attempts
            .get(address)
            .copied()
            .unwrap_or(0)
    }

    /// Get the number of open receiver links on an address.
    pub fn open_receivers(&self, address: &str) -> usize {
        self.network
            .state
            .lock()
            .receivers
            .get(address)
            .map(|endpoints| endpoints.iter().filter(|e| e.is_open()).count())
            .unwrap_or(0)
    }

    /// Close all receiver links on an address from the network side.
    ///
    /// Returns the number of links closed.
    pub fn close_remotely(&self, address: &str) -> usize {
        let endpoints = self
            .network
            .state
            .lock()
            .receivers
            .remove(address)
            .unwrap_or_default();
        endpoints
            .iter()
            .filter(|e| e.handle().close_remotely())
            .count()
    }

    /// Get all messages sent on sender links to an address.
    pub fn sent_to(&self, address: &str) -> Vec<Message> {
        self.network
            .state
            .lock()
            .sent
            .iter()
            .filter(|(link, _)| link == address)
            .map(|(_, message)| message.clone())
            .collect()
    }

    /// Get the number of sender links not yet closed.
    pub fn open_senders(&self) -> usize {
        self.network.state.lock().open_senders
    }
}

impl Default for InMemoryConnection {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connection for InMemoryConnection {
    async fn is_connected(&self, timeout: Duration) -> Result<()> {
        let mut rx = self.network.connected.subscribe();
        let live = async { rx.wait_for(|live| *live).await.map(|_| ()) };
        match tokio::time::timeout(timeout, live).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(MessagingError::NotConnected),
            Err(_) => Err(MessagingError::Timeout(
                u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            )),
        }
    }

    async fn create_receiver(
        &self,
        address: &str,
        _qos: QoS,
        initial_credits: u32,
    ) -> Result<ReceiverLink> {
        let delay = {
            let mut state = self.network.state.lock();
            *state
                .receiver_attempts
                .entry(address.to_string())
                .or_default() += 1;
            state.open_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if !self.network.is_live() {
            return Err(MessagingError::NotConnected);
        }

        let mut state = self.network.state.lock();
        if state.refused_receivers.contains(address) {
            return Err(MessagingError::LinkOpenFailed {
                address: address.to_string(),
                reason: "link refused by peer".to_string(),
            });
        }

        let (link, endpoint) = ReceiverLink::channel(address, initial_credits);
        endpoint.open();
        state
            .receivers
            .entry(address.to_string())
            .or_default()
            .push(endpoint);

        tracing::trace!(address = %address, "receiver link attached");
        Ok(link)
    }

    async fn create_sender(&self, address: &str, _qos: QoS) -> Result<Box<dyn SenderLink>> {
        if !self.network.is_live() {
            return Err(MessagingError::NotConnected);
        }

        let mut state = self.network.state.lock();
        if state.refused_senders.contains(address) {
            return Err(MessagingError::LinkOpenFailed {
                address: address.to_string(),
                reason: "link refused by peer".to_string(),
            });
        }
        state.open_senders += 1;

        tracing::trace!(address = %address, "sender link attached");
        Ok(Box::new(InMemorySender {
            address: address.to_string(),
            network: Arc::clone(&self.network),
            closed: AtomicBool::new(false),
        }))
    }

    fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.network.events.subscribe()
    }
}

struct InMemorySender {
    address: String,
    network: Arc<Network>,
    closed: AtomicBool,
}

#[async_trait]
impl SenderLink for InMemorySender {
    fn address(&self) -> &str {
        &self.address
    }

    async fn send(&self, mut message: Message) -> Result<DeliveryOutcome> {
        if self.closed.load(Ordering::Acquire) {
            return Err(MessagingError::LinkClosed(self.address.clone()));
        }
        if !self.network.is_live() {
            return Err(MessagingError::NotConnected);
        }

        if message.message_id.is_none() {
            message.message_id = Some(uuid::Uuid::new_v4().to_string());
        }
        if message.address.is_none() {
            message.address = Some(self.address.clone());
        }

        let Some(endpoint) = self.network.route(&message, &self.address) else {
            tracing::trace!(address = %self.address, "no receiver attached, releasing message");
            return Ok(DeliveryOutcome::Released);
        };

        match endpoint.deliver(message).await {
            Ok(receipt) => receipt.outcome().await,
            Err(_) => Ok(DeliveryOutcome::Released),
        }
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let mut state = self.network.state.lock();
            state.open_senders = state.open_senders.saturating_sub(1);
        }
    }
}
