//! Mapping and delegation of inbound commands.
//!
//! A command received on a tenant link is validated, its target adapter
//! instance is resolved and the command is forwarded to the
//! instance-scoped address. The remote outcome of the forward becomes the
//! outcome of the original delivery. Every delivery is settled exactly once.

use neomind_messaging::{
    target_address, Delivery, DeliveryOutcome, Message, MessagingError, QoS, SharedConnection,
    COMMAND_ENDPOINT,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::Instrument;

use crate::command::CommandMessage;
use crate::resolver::{CommandTarget, CommandTargetMapper};
use crate::stats::RouterStats;

/// Forwards commands to the adapter instance serving the target device.
pub struct MappingAndDelegatingCommandHandler {
    connection: SharedConnection,
    mapper: Arc<dyn CommandTargetMapper>,
    send_timeout: Duration,
    stats: Arc<RouterStats>,
}

impl MappingAndDelegatingCommandHandler {
    pub fn new(
        connection: SharedConnection,
        mapper: Arc<dyn CommandTargetMapper>,
        send_timeout: Duration,
        stats: Arc<RouterStats>,
    ) -> Self {
        Self {
            connection,
            mapper,
            send_timeout,
            stats,
        }
    }

    /// Map a command to its target adapter instance and delegate it.
    ///
    /// Never fails: resolution and forwarding problems are logged and turn
    /// into a `Released` (or `Rejected` for malformed commands) settlement.
    pub async fn map_and_delegate(&self, tenant_id: &str, delivery: Delivery, message: Message) {
        self.stats.command_received();
        let span = tracing::debug_span!(
            "map_and_delegate",
            tenant_id = %tenant_id,
            delivery = delivery.id(),
            device_id = tracing::field::Empty,
            adapter_instance_id = tracing::field::Empty,
        );

        let outcome = self.delegate(tenant_id, &message).instrument(span.clone()).await;

        match &outcome {
            DeliveryOutcome::Accepted => self.stats.command_forwarded(),
            DeliveryOutcome::Rejected { .. } => self.stats.command_rejected(),
            _ => self.stats.command_released(),
        }

        let _entered = span.enter();
        match delivery.settle(outcome.clone()) {
            Ok(()) => tracing::debug!(outcome = %outcome, "Command delivery settled"),
            Err(e) => tracing::warn!(error = %e, "Failed to settle command delivery"),
        }
    }

    async fn delegate(&self, tenant_id: &str, message: &Message) -> DeliveryOutcome {
        let command = match CommandMessage::from_message(tenant_id, message) {
            Ok(command) => command,
            Err(e) => {
                tracing::debug!(error = %e, "Rejecting malformed command");
                return DeliveryOutcome::rejected(e.0);
            }
        };

        let span = tracing::Span::current();
        span.record("device_id", command.device_id.as_str());

        let target = match self.mapper.get_target(tenant_id, &command.device_id).await {
            Ok(Some(target)) => target,
            Ok(None) => {
                tracing::debug!("No adapter instance found for command target, releasing");
                return DeliveryOutcome::Released;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to resolve command target, releasing");
                return DeliveryOutcome::Released;
            }
        };
        span.record("adapter_instance_id", target.adapter_instance_id.as_str());

        let address = target_address(
            COMMAND_ENDPOINT,
            tenant_id,
            Some(&target.adapter_instance_id),
        );
        let forward = forward_message(&command, &address, &target);

        match self.forward(&address, forward).await {
            Ok(outcome) => {
                tracing::debug!(
                    command = %command.name,
                    address = %address,
                    outcome = %outcome,
                    "Command forwarded to adapter instance"
                );
                outcome
            }
            Err(e) => {
                tracing::warn!(
                    address = %address,
                    error = %e,
                    "Failed to forward command, releasing"
                );
                DeliveryOutcome::Released
            }
        }
    }

    async fn forward(
        &self,
        address: &str,
        message: Message,
    ) -> Result<DeliveryOutcome, MessagingError> {
        let sender = self.connection.create_sender(address, QoS::AtLeastOnce).await?;
        let result = match tokio::time::timeout(self.send_timeout, sender.send(message)).await {
            Ok(result) => result,
            Err(_) => Err(MessagingError::Timeout(duration_ms(self.send_timeout))),
        };
        sender.close().await;
        result
    }
}

fn forward_message(command: &CommandMessage, address: &str, target: &CommandTarget) -> Message {
    let mut message = command.message().clone();
    message.address = Some(address.to_string());
    message.add_tenant_id(&command.tenant_id);
    message.add_device_id(&command.device_id);
    if let Some(gateway_id) = &target.gateway_id {
        message.add_via(gateway_id);
    }
    message
}

pub(crate) fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
