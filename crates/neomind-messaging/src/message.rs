//! Wire message model.
//!
//! A message carries the standard header fields plus free-form application
//! properties. Tenant id, device id, status and gateway (`via`) travel as
//! application properties under the names in [`properties`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Application properties of a message.
pub type ApplicationProperties = HashMap<String, serde_json::Value>;

/// Well-known application property names.
pub mod properties {
    pub const TENANT_ID: &str = "tenant_id";
    pub const DEVICE_ID: &str = "device_id";
    pub const STATUS: &str = "status";
    pub const VIA: &str = "via";
    pub const JMS_AMQP_CONTENT_TYPE: &str = "JMS_AMQP_CONTENT_TYPE";
    pub const JMS_AMQP_CONTENT_ENCODING: &str = "JMS_AMQP_CONTENT_ENCODING";
}

/// A message transferred over the messaging network.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Target address
    pub address: Option<String>,
    /// Message ID
    pub message_id: Option<String>,
    /// Correlation ID
    pub correlation_id: Option<String>,
    /// Subject (command name for command messages)
    pub subject: Option<String>,
    /// Reply-to address
    pub reply_to: Option<String>,
    /// Content type of the payload
    pub content_type: Option<String>,
    /// Content encoding of the payload
    pub content_encoding: Option<String>,
    /// Creation time
    pub creation_time: Option<DateTime<Utc>>,
    /// Payload bytes
    pub payload: Option<Vec<u8>>,
    /// Application properties
    #[serde(default)]
    pub application_properties: ApplicationProperties,
}

impl Message {
    /// Create an empty message.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the address.
    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    /// Set the message ID.
    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }

    /// Set the correlation ID.
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Set the subject.
    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    /// Set the reply-to address.
    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    /// Set content type and payload.
    pub fn with_payload(
        mut self,
        content_type: impl Into<String>,
        payload: impl Into<Vec<u8>>,
    ) -> Self {
        self.set_payload(Some(content_type.into()), Some(payload.into()));
        self
    }

    /// Add an application property.
    pub fn with_property(
        mut self,
        name: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.add_property(name, value);
        self
    }

    /// Replace all application properties.
    pub fn set_application_properties(&mut self, properties: &ApplicationProperties) {
        self.application_properties = properties.clone();
    }

    /// Add an application property, replacing any previous value.
    pub fn add_property(&mut self, name: impl Into<String>, value: impl Into<serde_json::Value>) {
        self.application_properties.insert(name.into(), value.into());
    }

    /// Get an application property as a string.
    pub fn string_property(&self, name: &str) -> Option<&str> {
        self.application_properties
            .get(name)
            .and_then(serde_json::Value::as_str)
    }

    /// Set the creation time to now.
    pub fn set_creation_time(&mut self) {
        self.creation_time = Some(Utc::now());
    }

    /// Set content type and payload.
    ///
    /// An empty payload is stored as no payload.
    pub fn set_payload(&mut self, content_type: Option<String>, payload: Option<Vec<u8>>) {
        self.content_type = content_type;
        self.payload = payload.filter(|p| !p.is_empty());
    }

    /// Add the tenant ID property.
    pub fn add_tenant_id(&mut self, tenant_id: &str) {
        self.add_property(properties::TENANT_ID, tenant_id);
    }

    /// Add the device ID property.
    pub fn add_device_id(&mut self, device_id: &str) {
        self.add_property(properties::DEVICE_ID, device_id);
    }

    /// Add the status property.
    pub fn add_status(&mut self, status: u16) {
        self.add_property(properties::STATUS, status);
    }

    /// Add the gateway property.
    pub fn add_via(&mut self, gateway_id: &str) {
        self.add_property(properties::VIA, gateway_id);
    }

    /// Add the JMS vendor properties for content type and encoding.
    ///
    /// Each property is only added if the corresponding header is set.
    pub fn add_jms_vendor_properties(&mut self) {
        if let Some(content_type) = self.content_type.clone().filter(|s| !s.is_empty()) {
            self.add_property(properties::JMS_AMQP_CONTENT_TYPE, content_type);
        }
        if let Some(encoding) = self.content_encoding.clone().filter(|s| !s.is_empty()) {
            self.add_property(properties::JMS_AMQP_CONTENT_ENCODING, encoding);
        }
    }

    /// Get the tenant ID property.
    pub fn tenant_id(&self) -> Option<&str> {
        self.string_property(properties::TENANT_ID)
    }

    /// Get the device ID property.
    pub fn device_id(&self) -> Option<&str> {
        self.string_property(properties::DEVICE_ID)
    }

    /// Get the status property.
    pub fn status(&self) -> Option<u16> {
        self.application_properties
            .get(properties::STATUS)
            .and_then(serde_json::Value::as_u64)
            .and_then(|s| u16::try_from(s).ok())
    }

    /// Get the payload length in bytes.
    pub fn payload_size(&self) -> usize {
        self.payload.as_ref().map(Vec::len).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_well_known_properties() {
        let mut msg = Message::new();
        msg.add_tenant_id("tenantA");
        msg.add_device_id("dev1");
        msg.add_status(200);

        assert_eq!(msg.tenant_id(), Some("tenantA"));
        assert_eq!(msg.device_id(), Some("dev1"));
        assert_eq!(msg.status(), Some(200));
    }

    #[test]
    fn test_empty_payload_is_dropped() {
        let msg = Message::new().with_payload("text/plain", Vec::new());
        assert_eq!(msg.content_type.as_deref(), Some("text/plain"));
        assert!(msg.payload.is_none());
        assert_eq!(msg.payload_size(), 0);
    }

    #[test]
    fn test_jms_vendor_properties_only_for_present_headers() {
        let mut msg = Message::new().with_payload("application/json", b"{}".to_vec());
        msg.add_jms_vendor_properties();

        assert_eq!(
            msg.string_property(properties::JMS_AMQP_CONTENT_TYPE),
            Some("application/json")
        );
        assert!(
            !msg.application_properties
                .contains_key(properties::JMS_AMQP_CONTENT_ENCODING)
        );
    }

    #[test]
    fn test_set_application_properties_replaces() {
        let mut msg = Message::new().with_property("old", 1);
        let mut props = ApplicationProperties::new();
        props.insert("new".to_string(), serde_json::json!("x"));

        msg.set_application_properties(&props);
        assert!(!msg.application_properties.contains_key("old"));
        assert_eq!(msg.string_property("new"), Some("x"));
    }
}
