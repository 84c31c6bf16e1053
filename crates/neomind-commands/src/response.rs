//! Command response sender.
//!
//! Sends the response of a command back to the command issuer on
//! `command_response/{tenant}/{reply-id}`. A sender link is opened per
//! response and closed once the outcome is known.

use neomind_messaging::{
    target_address, Message, MessagingError, QoS, SharedConnection, COMMAND_RESPONSE_ENDPOINT,
    NORTHBOUND_COMMAND_RESPONSE_ENDPOINT,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::Instrument;

use crate::command::{CommandResponse, MessagingType};
use crate::config::CommandRouterConfig;
use crate::error::Result;
use crate::handler::duration_ms;
use crate::stats::RouterStats;

/// Sends command responses over the messaging network.
pub struct CommandResponseSender {
    connection: SharedConnection,
    jms_vendor_props_enabled: bool,
    send_timeout: Duration,
    stats: Arc<RouterStats>,
}

impl CommandResponseSender {
    pub fn new(
        connection: SharedConnection,
        config: &CommandRouterConfig,
        stats: Arc<RouterStats>,
    ) -> Self {
        Self {
            connection,
            jms_vendor_props_enabled: config.jms_vendor_props_enabled,
            send_timeout: config.send_timeout(),
            stats,
        }
    }

    /// Get the messaging type this sender uses.
    pub fn messaging_type(&self) -> MessagingType {
        MessagingType::Amqp
    }

    /// Send a command response and wait for it to be accepted.
    ///
    /// Failures are mapped onto [`RouterError`](crate::RouterError) server
    /// errors.
    pub async fn send_command_response(&self, response: CommandResponse) -> Result<()> {
        let span = tracing::debug_span!(
            "forward_command_response",
            tenant_id = %response.tenant_id,
            device_id = %response.device_id,
            correlation_id = %response.correlation_id,
            status = response.status,
        );

        let result = self.send(&response).instrument(span.clone()).await;

        let _entered = span.enter();
        match &result {
            Ok(()) => {
                self.stats.response_sent();
                tracing::debug!("Command response sent");
            }
            Err(e) => {
                self.stats.response_failed();
                tracing::debug!(error = %e, "Failed to send command response");
            }
        }
        result.map_err(Into::into)
    }

    async fn send(&self, response: &CommandResponse) -> std::result::Result<(), MessagingError> {
        let sender_address = target_address(
            COMMAND_RESPONSE_ENDPOINT,
            &response.tenant_id,
            Some(&response.reply_to_id),
        );
        let sender = self
            .connection
            .create_sender(&sender_address, QoS::AtLeastOnce)
            .await?;

        let message = self.create_downstream_message(response);
        if response.messaging_type != self.messaging_type() {
            tracing::debug!(
                "using messaging type {} instead of type {} used for the original command",
                self.messaging_type(),
                response.messaging_type
            );
        }

        let outcome = sender.send_and_wait_for_outcome(message);
        let result = match tokio::time::timeout(self.send_timeout, outcome).await {
            Ok(result) => result,
            Err(_) => Err(MessagingError::Timeout(duration_ms(self.send_timeout))),
        };
        sender.close().await;
        result
    }

    fn create_downstream_message(&self, response: &CommandResponse) -> Message {
        let mut message = Message::new();
        message.set_application_properties(&response.additional_properties);
        message.set_creation_time();
        message.correlation_id = Some(response.correlation_id.clone());
        message.set_payload(response.content_type.clone(), response.payload.clone());
        message.add_status(response.status);
        message.address = Some(target_address(
            NORTHBOUND_COMMAND_RESPONSE_ENDPOINT,
            &response.tenant_id,
            Some(&response.reply_to_id),
        ));
        message.add_tenant_id(&response.tenant_id);
        message.add_device_id(&response.device_id);
        if self.jms_vendor_props_enabled {
            message.add_jms_vendor_properties();
        }
        message
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use neomind_messaging::{properties, InMemoryConnection};

    fn sender(jms_vendor_props_enabled: bool) -> CommandResponseSender {
        let config = CommandRouterConfig {
            jms_vendor_props_enabled,
            ..Default::default()
        };
        CommandResponseSender::new(
            Arc::new(InMemoryConnection::new()),
            &config,
            Arc::new(RouterStats::new()),
        )
    }

    #[test]
    fn test_downstream_message_fields() {
        let response = CommandResponse::new("tenantA", "dev1", "app-1", "corr-1", 200)
            .with_payload("text/plain", b"done".to_vec())
            .with_property("custom", 7);

        let message = sender(false).create_downstream_message(&response);
        assert_eq!(message.address.as_deref(), Some("command_response/tenantA/app-1"));
        assert_eq!(message.correlation_id.as_deref(), Some("corr-1"));
        assert_eq!(message.status(), Some(200));
        assert_eq!(message.tenant_id(), Some("tenantA"));
        assert_eq!(message.device_id(), Some("dev1"));
        assert_eq!(message.content_type.as_deref(), Some("text/plain"));
        assert_eq!(message.payload.as_deref(), Some(&b"done"[..]));
        assert_eq!(message.application_properties.get("custom"), Some(&serde_json::json!(7)));
        assert!(message.creation_time.is_some());
        assert!(!message
            .application_properties
            .contains_key(properties::JMS_AMQP_CONTENT_TYPE));
    }

    #[test]
    fn test_vendor_properties_only_when_enabled() {
        let response = CommandResponse::new("tenantA", "dev1", "app-1", "corr-1", 200)
            .with_payload("text/plain", b"done".to_vec());

        let message = sender(true).create_downstream_message(&response);
        assert_eq!(
            message.string_property(properties::JMS_AMQP_CONTENT_TYPE),
            Some("text/plain")
        );
    }
}
