//! Tenant-scoped command consumers.
//!
//! The [`CommandConsumerFactory`] owns one receiver link per tenant on the
//! north-bound command address. Links are created lazily through the
//! [`ClientCache`], so concurrent requests for the same tenant share one
//! link construction. Each inbound command is handed to the
//! [`MappingAndDelegatingCommandHandler`].
//!
//! Link lifecycle:
//! - closed by the peer: the cache entry is dropped and a recreation sweep
//!   is scheduled, the tenant stays registered
//! - closed locally: the cache entry and the registration are dropped
//! - detached with the connection: state is reset by `on_disconnect`
//!
//! Recreation sweeps are single-flight. A trigger arriving while a sweep
//! runs sets a flag that starts exactly one more sweep afterwards. A sweep
//! with failed attempts is retried after `recreate_consumers_delay_ms`.

use neomind_messaging::{
    target_address, ConnectionEvent, InboundMessage, LinkHandle, LinkState, QoS,
    SharedConnection, NORTHBOUND_COMMAND_REQUEST_ENDPOINT,
};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use tokio::sync::{broadcast, mpsc};
use tracing::Instrument;

use crate::cache::{ClientCache, EntryId};
use crate::config::CommandRouterConfig;
use crate::error::{Result, RouterError};
use crate::handler::MappingAndDelegatingCommandHandler;
use crate::resolver::CommandTargetMapper;
use crate::stats::RouterStats;

/// Open receiver link of one tenant.
#[derive(Debug, Clone)]
pub struct TenantConsumer {
    id: EntryId,
    tenant_id: Arc<str>,
    link: LinkHandle,
}

impl TenantConsumer {
    /// Get the tenant ID.
    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    /// Get the link address.
    pub fn address(&self) -> &str {
        self.link.address()
    }

    /// Get the current link state.
    pub fn state(&self) -> LinkState {
        self.link.state()
    }

    pub fn is_open(&self) -> bool {
        self.link.is_open()
    }

    /// Close the link locally.
    pub fn close(&self) -> bool {
        self.link.close()
    }
}

/// Tenants a consumer link is wanted for.
#[derive(Debug, Default)]
struct TenantRegistry {
    /// Tenants with an open link
    registered: HashSet<String>,
    /// Tenants that lost their link with the connection
    replay: HashSet<String>,
    /// Links whose pump is running, by cache entry
    links: HashMap<EntryId, TenantConsumer>,
    /// Incremented on every disconnect
    epoch: u64,
}

impl TenantRegistry {
    fn wanted(&self) -> Vec<String> {
        self.registered.union(&self.replay).cloned().collect()
    }

    fn open_links(&self, tenant_id: &str) -> Vec<TenantConsumer> {
        self.links
            .values()
            .filter(|consumer| consumer.tenant_id() == tenant_id && consumer.is_open())
            .cloned()
            .collect()
    }
}

struct Inner {
    connection: SharedConnection,
    config: CommandRouterConfig,
    consumers: ClientCache<TenantConsumer>,
    tenants: Mutex<TenantRegistry>,
    handler: OnceLock<Arc<MappingAndDelegatingCommandHandler>>,
    recreating: AtomicBool,
    recreate_again: AtomicBool,
    stats: Arc<RouterStats>,
}

/// Creates and maintains tenant command consumer links on one connection.
#[derive(Clone)]
pub struct CommandConsumerFactory {
    inner: Arc<Inner>,
}

impl CommandConsumerFactory {
    /// Create a factory for an existing connection.
    pub fn new(connection: SharedConnection, config: CommandRouterConfig) -> Self {
        Self::with_stats(connection, config, Arc::new(RouterStats::new()))
    }

    /// Create a factory sharing an existing set of counters.
    pub fn with_stats(
        connection: SharedConnection,
        config: CommandRouterConfig,
        stats: Arc<RouterStats>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                connection,
                config,
                consumers: ClientCache::new(),
                tenants: Mutex::new(TenantRegistry::default()),
                handler: OnceLock::new(),
                recreating: AtomicBool::new(false),
                recreate_again: AtomicBool::new(false),
                stats,
            }),
        }
    }

    /// Initialize the factory with the mapper resolving command targets.
    ///
    /// Subscribes to connection events and starts the first recreation
    /// sweep. Must be called from within a Tokio runtime, exactly once.
    pub fn initialize(&self, mapper: Arc<dyn CommandTargetMapper>) -> Result<()> {
        let handler = Arc::new(MappingAndDelegatingCommandHandler::new(
            Arc::clone(&self.inner.connection),
            mapper,
            self.inner.config.send_timeout(),
            Arc::clone(&self.inner.stats),
        ));
        self.inner
            .handler
            .set(handler)
            .map_err(|_| RouterError::AlreadyInitialized)?;

        let events = self.inner.connection.subscribe();
        tokio::spawn(watch_connection(Arc::downgrade(&self.inner), events));

        tracing::info!("Command consumer factory initialized");
        self.inner.recreate_consumers();
        Ok(())
    }

    /// Check if `initialize` has been called.
    pub fn is_initialized(&self) -> bool {
        self.inner.handler.get().is_some()
    }

    /// Make sure a command consumer link exists for a tenant.
    ///
    /// Waits for the connection to become live, then creates the link unless
    /// it exists or is being created already. A failure is returned to the
    /// caller only; background recreation is driven by sweeps.
    pub async fn create_command_consumer(&self, tenant_id: &str) -> Result<()> {
        let span = tracing::debug_span!("create_command_consumer", tenant_id = %tenant_id);
        async {
            if !self.is_initialized() {
                tracing::error!("Command consumer factory not initialized");
                return Err(RouterError::NotInitialized);
            }
            self.inner.get_or_create_consumer(tenant_id).await.map(|_| ())
        }
        .instrument(span)
        .await
    }

    /// Close the command consumer link of a tenant.
    ///
    /// The tenant is no longer recreated by sweeps. Returns `false` if no
    /// open consumer exists for the tenant.
    pub fn close_command_consumer(&self, tenant_id: &str) -> bool {
        let consumers = self.inner.tenants.lock().open_links(tenant_id);
        let mut closed = false;
        for consumer in &consumers {
            closed |= consumer.close();
            self.inner.on_local_close(consumer);
        }
        closed
    }

    /// Reset all consumer state after the connection was lost.
    pub fn on_disconnect(&self) {
        self.inner.on_disconnect();
    }

    /// Recreate consumer links after the connection was re-established.
    pub fn on_reconnect(&self) {
        self.inner.recreate_consumers();
    }

    /// Get the open consumer of a tenant.
    pub fn consumer(&self, tenant_id: &str) -> Option<TenantConsumer> {
        self.inner.tenants.lock().open_links(tenant_id).into_iter().next()
    }

    /// Get the tenants with a registered consumer link, sorted.
    pub fn registered_tenants(&self) -> Vec<String> {
        let mut tenants: Vec<String> =
            self.inner.tenants.lock().registered.iter().cloned().collect();
        tenants.sort();
        tenants
    }

    /// Get the tenants waiting to be recreated after a disconnect, sorted.
    pub fn replay_tenants(&self) -> Vec<String> {
        let mut tenants: Vec<String> = self.inner.tenants.lock().replay.iter().cloned().collect();
        tenants.sort();
        tenants
    }

    /// Check if a recreation sweep is running.
    pub fn is_recreating(&self) -> bool {
        self.inner.recreating.load(Ordering::Acquire)
    }

    /// Get the router statistics.
    pub fn stats(&self) -> Arc<RouterStats> {
        Arc::clone(&self.inner.stats)
    }

    pub fn config(&self) -> &CommandRouterConfig {
        &self.inner.config
    }
}

impl Inner {
    async fn get_or_create_consumer(self: &Arc<Self>, tenant_id: &str) -> Result<TenantConsumer> {
        self.connection
            .is_connected(self.config.connection_check_timeout())
            .await?;

        let inner = Arc::clone(self);
        let tenant = tenant_id.to_string();
        self.consumers
            .get_or_create(tenant_id, move |id| inner.new_consumer(tenant, id))
            .await
            .inspect_err(|e| {
                tracing::debug!(
                    tenant_id = %tenant_id,
                    error = %e,
                    "Failed to create command consumer"
                );
            })
    }

    async fn new_consumer(
        self: Arc<Self>,
        tenant_id: String,
        id: EntryId,
    ) -> Result<TenantConsumer> {
        let handler = self.handler.get().cloned().ok_or(RouterError::NotInitialized)?;
        let epoch = self.tenants.lock().epoch;
        let address = target_address(NORTHBOUND_COMMAND_REQUEST_ENDPOINT, &tenant_id, None);
        tracing::trace!(
            tenant_id = %tenant_id,
            address = %address,
            "Creating new command consumer"
        );

        let link = self
            .connection
            .create_receiver(&address, QoS::AtLeastOnce, self.config.initial_credits)
            .await?;
        let (messages, handle) = link.into_parts();

        let consumer = TenantConsumer {
            id,
            tenant_id: Arc::from(tenant_id.as_str()),
            link: handle,
        };
        {
            let mut tenants = self.tenants.lock();
            if tenants.epoch != epoch {
                drop(tenants);
                consumer.close();
                tracing::debug!(
                    tenant_id = %tenant_id,
                    "Discarding command consumer opened before disconnect"
                );
                return Err(RouterError::Unavailable(
                    "connection lost while opening command consumer".to_string(),
                ));
            }
            tenants.replay.remove(&tenant_id);
            tenants.registered.insert(tenant_id.clone());
            // Tracked outside the cache so a disconnect reaches unpolled entries
            tenants.links.insert(id, consumer.clone());
        }

        tokio::spawn(run_consumer(
            Arc::downgrade(&self),
            consumer.clone(),
            messages,
            handler,
        ));

        tracing::debug!(tenant_id = %tenant_id, address = %address, "Created command consumer");
        Ok(consumer)
    }

    fn on_local_close(&self, consumer: &TenantConsumer) {
        let removed = self.consumers.remove_entry(consumer.tenant_id(), consumer.id);
        // A newer consumer of the tenant keeps its registration
        let superseded = !removed && self.consumers.contains_key(consumer.tenant_id());
        let mut tenants = self.tenants.lock();
        tenants.links.remove(&consumer.id);
        if superseded {
            return;
        }
        tenants.registered.remove(consumer.tenant_id());
        tenants.replay.remove(consumer.tenant_id());
    }

    fn on_remote_close(self: &Arc<Self>, consumer: &TenantConsumer) {
        self.consumers.remove_entry(consumer.tenant_id(), consumer.id);
        self.recreate_consumers_with_delay();
    }

    fn on_disconnect(&self) {
        // Constructions finishing from here on see the new epoch
        let (replay_tenants, stale) = {
            let mut tenants = self.tenants.lock();
            tenants.epoch += 1;
            let registered = std::mem::take(&mut tenants.registered);
            tenants.replay.extend(registered);
            let stale: Vec<TenantConsumer> = tenants.links.drain().map(|(_, c)| c).collect();
            (tenants.replay.len(), stale)
        };

        let cleared = self.consumers.clear();
        for consumer in &stale {
            consumer.link.detach();
        }

        tracing::info!(
            cleared_consumers = cleared,
            replay_tenants = replay_tenants,
            "Cleared command consumer state after disconnect"
        );
    }

    fn recreate_consumers(self: &Arc<Self>) {
        if self
            .recreating
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!("Already recreating command consumers");
            self.recreate_again.store(true, Ordering::Release);
            return;
        }

        self.stats.recreation_sweep_started();
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let succeeded = inner.run_sweep().await;
            inner.recreating.store(false, Ordering::Release);
            if inner.recreate_again.swap(false, Ordering::AcqRel) || !succeeded {
                if succeeded {
                    inner.recreate_consumers();
                } else {
                    inner.recreate_consumers_with_delay();
                }
            }
        });
    }

    fn recreate_consumers_with_delay(self: &Arc<Self>) {
        let inner = Arc::downgrade(self);
        let delay = self.config.recreate_consumers_delay();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = inner.upgrade() {
                inner.recreate_consumers();
            }
        });
    }

    /// Returns `false` if the connection or any link creation failed.
    async fn run_sweep(self: &Arc<Self>) -> bool {
        tracing::debug!("Recreating command consumer links");
        if let Err(e) = self
            .connection
            .is_connected(self.config.connection_check_timeout())
            .await
        {
            tracing::debug!(
                error = %e,
                "Connection not available for recreating command consumers"
            );
            return false;
        }

        let tenants = self.tenants.lock().wanted();
        let attempts = tenants.iter().map(|tenant_id| {
            tracing::debug!(tenant_id = %tenant_id, "Recreating command consumer link");
            self.get_or_create_consumer(tenant_id)
        });
        let results = futures::future::join_all(attempts).await;

        let failed = results.iter().filter(|r| r.is_err()).count();
        if failed > 0 {
            tracing::warn!(
                failed = failed,
                total = results.len(),
                "Failed to recreate command consumer links"
            );
        }
        failed == 0
    }
}

async fn watch_connection(inner: Weak<Inner>, mut events: broadcast::Receiver<ConnectionEvent>) {
    loop {
        let event = match events.recv().await {
            Ok(event) => Some(event),
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                tracing::warn!(
                    missed = missed,
                    "Missed connection events, resetting command consumers"
                );
                None
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        let Some(inner) = inner.upgrade() else {
            break;
        };
        match event {
            Some(ConnectionEvent::Disconnected) => inner.on_disconnect(),
            Some(ConnectionEvent::Reconnected) => inner.recreate_consumers(),
            Some(ConnectionEvent::Connected) => {}
            None => {
                // A missed event may have been a disconnect
                inner.on_disconnect();
                inner.recreate_consumers();
            }
        }
    }
    tracing::trace!("Connection event watcher stopped");
}

/// Pump inbound commands of one link until it leaves the open state, then
/// run the close hook matching the final state.
async fn run_consumer(
    inner: Weak<Inner>,
    consumer: TenantConsumer,
    mut messages: mpsc::Receiver<InboundMessage>,
    handler: Arc<MappingAndDelegatingCommandHandler>,
) {
    let mut state = consumer.link.watch();
    while !consumer.link.state().is_terminal() {
        tokio::select! {
            inbound = messages.recv() => match inbound {
                Some(InboundMessage { delivery, message }) => {
                    let handler = Arc::clone(&handler);
                    let tenant_id = Arc::clone(&consumer.tenant_id);
                    tokio::spawn(async move {
                        handler.map_and_delegate(&tenant_id, delivery, message).await;
                    });
                }
                None => break,
            },
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    // Commands buffered on a closed link are handed back to the network
    messages.close();
    while let Ok(inbound) = messages.try_recv() {
        let _ = inbound.delivery.release();
    }

    let Some(inner) = inner.upgrade() else {
        return;
    };
    inner.tenants.lock().links.remove(&consumer.id);
    match consumer.state() {
        LinkState::ClosedRemote => {
            tracing::debug!(
                tenant_id = %consumer.tenant_id(),
                "Command consumer link closed remotely"
            );
            inner.on_remote_close(&consumer);
        }
        LinkState::ClosedLocal => {
            tracing::debug!(
                tenant_id = %consumer.tenant_id(),
                "Command consumer link closed locally"
            );
            inner.on_local_close(&consumer);
        }
        state => {
            tracing::debug!(
                tenant_id = %consumer.tenant_id(),
                state = ?state,
                "Command consumer link stopped"
            );
            inner.consumers.remove_entry(consumer.tenant_id(), consumer.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::StaticTargetMapper;
    use neomind_messaging::InMemoryConnection;
    use std::time::Duration;

    fn factory(connection: &InMemoryConnection) -> CommandConsumerFactory {
        CommandConsumerFactory::new(Arc::new(connection.clone()), CommandRouterConfig::default())
    }

    #[tokio::test]
    async fn test_initialize_twice_fails() {
        let factory = factory(&InMemoryConnection::new());
        let mapper = Arc::new(StaticTargetMapper::new());

        assert!(factory.initialize(mapper.clone()).is_ok());
        assert_eq!(factory.initialize(mapper), Err(RouterError::AlreadyInitialized));
    }

    #[tokio::test]
    async fn test_not_initialized() {
        let connection = InMemoryConnection::new();
        let factory = factory(&connection);

        let result = factory.create_command_consumer("tenantA").await;
        assert_eq!(result, Err(RouterError::NotInitialized));
        assert_eq!(result.unwrap_err().status_code(), 503);
        assert_eq!(connection.receiver_attempts("command/tenantA"), 0);
    }

    #[tokio::test]
    async fn test_stale_link_discarded_after_disconnect() {
        let connection = InMemoryConnection::new();
        connection.set_open_delay(Some(Duration::from_millis(50)));
        let factory = factory(&connection);
        factory.initialize(Arc::new(StaticTargetMapper::new())).unwrap();

        let pending = {
            let factory = factory.clone();
            tokio::spawn(async move { factory.create_command_consumer("tenantA").await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        factory.on_disconnect();

        assert!(matches!(pending.await.unwrap(), Err(RouterError::Unavailable(_))));
        assert!(factory.registered_tenants().is_empty());
        assert!(factory.consumer("tenantA").is_none());
        assert_eq!(connection.open_receivers("command/tenantA"), 0);
    }

    #[tokio::test]
    async fn test_detached_link_leaves_cache() {
        let connection = InMemoryConnection::new();
        let factory = factory(&connection);
        factory.initialize(Arc::new(StaticTargetMapper::new())).unwrap();
        factory.create_command_consumer("tenantA").await.unwrap();

        // Detached without the disconnect reaching the factory
        let consumer = factory.consumer("tenantA").unwrap();
        consumer.link.detach();

        for _ in 0..100 {
            if !factory.inner.consumers.contains_key("tenantA") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!factory.inner.consumers.contains_key("tenantA"));
        assert!(factory.consumer("tenantA").is_none());

        factory.create_command_consumer("tenantA").await.unwrap();
        assert_eq!(connection.receiver_attempts("command/tenantA"), 2);
        assert_eq!(connection.open_receivers("command/tenantA"), 1);
    }
}
