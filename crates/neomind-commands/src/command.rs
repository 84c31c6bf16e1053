//! Command data structures.
//!
//! Defines the command received on a tenant link and the response sent
//! back to the command issuer.

use neomind_messaging::{
    ApplicationProperties, Message, ResourceIdentifier, NORTHBOUND_COMMAND_REQUEST_ENDPOINT,
    NORTHBOUND_COMMAND_RESPONSE_ENDPOINT,
};
use serde::{Deserialize, Serialize};

/// Tenant identifier.
pub type TenantId = String;

/// Device identifier.
pub type DeviceId = String;

/// Messaging infrastructure a command or response travelled on.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub enum MessagingType {
    /// AMQP 1.0 messaging network
    #[default]
    Amqp,
    /// Kafka based messaging
    Kafka,
    /// Google Pub/Sub based messaging
    Pubsub,
}

impl MessagingType {
    /// Get the messaging type name.
    pub fn type_name(&self) -> &'static str {
        match self {
            MessagingType::Amqp => "amqp",
            MessagingType::Kafka => "kafka",
            MessagingType::Pubsub => "pubsub",
        }
    }
}

impl std::fmt::Display for MessagingType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.type_name())
    }
}

/// A command message that failed validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed command message: {0}")]
pub struct InvalidCommand(pub String);

fn non_empty(value: &Option<String>) -> Option<String> {
    value.clone().filter(|s| !s.is_empty())
}

/// A validated command received on a tenant-scoped link.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandMessage {
    /// Tenant of the link the command arrived on
    pub tenant_id: TenantId,
    /// Target device
    pub device_id: DeviceId,
    /// Command name
    pub name: String,
    /// Correlation ID (falls back to the message ID)
    pub correlation_id: Option<String>,
    /// Reply ID taken from the reply-to address
    pub reply_to_id: Option<String>,
    /// Content type of the payload
    pub content_type: Option<String>,
    /// Payload bytes
    pub payload: Option<Vec<u8>>,
    /// Application properties
    pub application_properties: ApplicationProperties,
    message: Message,
}

impl CommandMessage {
    /// Validate a message received on the link of `tenant_id`.
    ///
    /// The device ID comes from the address (`command/{tenant}/{device}`) or
    /// the `device_id` property. Requests (messages with a reply-to address)
    /// need a correlation or message ID and a reply-to address of the form
    /// `command_response/{tenant}/{reply-id}`.
    pub fn from_message(tenant_id: &str, message: &Message) -> Result<Self, InvalidCommand> {
        let mut device_id = None;
        if let Some(address) = message.address.as_deref().and_then(ResourceIdentifier::parse) {
            if !address.has_endpoint(NORTHBOUND_COMMAND_REQUEST_ENDPOINT) {
                return Err(InvalidCommand(format!(
                    "address endpoint must be '{}'",
                    NORTHBOUND_COMMAND_REQUEST_ENDPOINT
                )));
            }
            if address.tenant_id.as_deref().is_some_and(|t| t != tenant_id) {
                return Err(InvalidCommand(
                    "address tenant does not match link tenant".to_string(),
                ));
            }
            device_id = address.resource_id;
        }

        let device_id = device_id
            .or_else(|| message.device_id().map(str::to_string))
            .filter(|d| !d.is_empty())
            .ok_or_else(|| InvalidCommand("missing device id".to_string()))?;

        let name = non_empty(&message.subject)
            .ok_or_else(|| InvalidCommand("missing command name".to_string()))?;

        let reply_to_id = match non_empty(&message.reply_to) {
            None => None,
            Some(reply_to) => Some(parse_reply_to(tenant_id, &reply_to)?),
        };

        let correlation_id =
            non_empty(&message.correlation_id).or_else(|| non_empty(&message.message_id));
        if reply_to_id.is_some() && correlation_id.is_none() {
            return Err(InvalidCommand(
                "request command requires a correlation id or message id".to_string(),
            ));
        }

        Ok(Self {
            tenant_id: tenant_id.to_string(),
            device_id,
            name,
            correlation_id,
            reply_to_id,
            content_type: message.content_type.clone(),
            payload: message.payload.clone(),
            application_properties: message.application_properties.clone(),
            message: message.clone(),
        })
    }

    /// Check if no response is expected.
    pub fn is_one_way(&self) -> bool {
        self.reply_to_id.is_none()
    }

    /// Get the message the command was parsed from.
    pub fn message(&self) -> &Message {
        &self.message
    }

    /// Encode correlation ID and reply ID into a request ID.
    ///
    /// Returns `None` for one-way commands and for correlation IDs longer
    /// than 255 bytes.
    pub fn request_id(&self) -> Option<String> {
        let correlation_id = self.correlation_id.as_deref()?;
        let reply_to_id = self.reply_to_id.as_deref()?;
        encode_request_id(correlation_id, reply_to_id)
    }
}

fn parse_reply_to(tenant_id: &str, reply_to: &str) -> Result<String, InvalidCommand> {
    let invalid = || {
        InvalidCommand(format!(
            "reply-to address must be '{}/{}/<reply-id>'",
            NORTHBOUND_COMMAND_RESPONSE_ENDPOINT, tenant_id
        ))
    };
    let address = ResourceIdentifier::parse(reply_to).ok_or_else(invalid)?;
    if !address.has_endpoint(NORTHBOUND_COMMAND_RESPONSE_ENDPOINT)
        || address.tenant_id.as_deref() != Some(tenant_id)
    {
        return Err(invalid());
    }
    address.resource_id.ok_or_else(invalid)
}

/// Encode a request ID as `{len:02x}{correlation-id}{reply-id}`.
pub fn encode_request_id(correlation_id: &str, reply_to_id: &str) -> Option<String> {
    if correlation_id.is_empty() || correlation_id.len() > 0xff || reply_to_id.is_empty() {
        return None;
    }
    Some(format!(
        "{:02x}{}{}",
        correlation_id.len(),
        correlation_id,
        reply_to_id
    ))
}

/// Decode a request ID into correlation ID and reply ID.
pub fn decode_request_id(request_id: &str) -> Option<(String, String)> {
    let len = usize::from_str_radix(request_id.get(..2)?, 16).ok()?;
    let correlation_id = request_id.get(2..2 + len)?;
    let reply_to_id = request_id.get(2 + len..)?;
    if correlation_id.is_empty() || reply_to_id.is_empty() {
        return None;
    }
    Some((correlation_id.to_string(), reply_to_id.to_string()))
}

/// Response to a command, sent back to the command issuer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResponse {
    /// Tenant ID
    pub tenant_id: TenantId,
    /// Device that executed the command
    pub device_id: DeviceId,
    /// Reply ID of the command issuer
    pub reply_to_id: String,
    /// Correlation ID of the command
    pub correlation_id: String,
    /// Status code of the command execution
    pub status: u16,
    /// Content type of the payload
    pub content_type: Option<String>,
    /// Payload bytes
    pub payload: Option<Vec<u8>>,
    /// Messaging type the original command was received on
    #[serde(default)]
    pub messaging_type: MessagingType,
    /// Additional properties to include in the response message
    #[serde(default)]
    pub additional_properties: ApplicationProperties,
}

impl CommandResponse {
    /// Create a response without payload.
    pub fn new(
        tenant_id: impl Into<String>,
        device_id: impl Into<String>,
        reply_to_id: impl Into<String>,
        correlation_id: impl Into<String>,
        status: u16,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            device_id: device_id.into(),
            reply_to_id: reply_to_id.into(),
            correlation_id: correlation_id.into(),
            status,
            content_type: None,
            payload: None,
            messaging_type: MessagingType::default(),
            additional_properties: ApplicationProperties::new(),
        }
    }

    /// Create a response from a request ID.
    ///
    /// Returns `None` if the request ID cannot be decoded or the status code
    /// is invalid.
    pub fn from_request_id(
        request_id: &str,
        tenant_id: impl Into<String>,
        device_id: impl Into<String>,
        status: u16,
    ) -> Option<Self> {
        if !Self::is_valid_status_code(status) {
            return None;
        }
        let (correlation_id, reply_to_id) = decode_request_id(request_id)?;
        Some(Self::new(tenant_id, device_id, reply_to_id, correlation_id, status))
    }

    /// Set content type and payload.
    pub fn with_payload(
        mut self,
        content_type: impl Into<String>,
        payload: impl Into<Vec<u8>>,
    ) -> Self {
        self.content_type = Some(content_type.into());
        self.payload = Some(payload.into());
        self
    }

    /// Set the messaging type of the original command.
    pub fn with_messaging_type(mut self, messaging_type: MessagingType) -> Self {
        self.messaging_type = messaging_type;
        self
    }

    /// Add an additional property.
    pub fn with_property(
        mut self,
        name: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.additional_properties.insert(name.into(), value.into());
        self
    }

    /// Check if a status code is valid for a command response.
    pub fn is_valid_status_code(status: u16) -> bool {
        (200..600).contains(&status)
    }

    /// Check if the command succeeded.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}
