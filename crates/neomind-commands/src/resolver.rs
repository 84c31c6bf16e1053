//! Command target resolution.
//!
//! A [`CommandTargetMapper`] maps a device to the protocol adapter instance
//! that currently serves it, optionally through a gateway.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Adapter instance (and optional gateway) a command is delivered to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommandTarget {
    /// Protocol adapter instance the device is connected to
    pub adapter_instance_id: String,
    /// Gateway acting on behalf of the device
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway_id: Option<String>,
}

impl CommandTarget {
    /// Target a device connected directly to an adapter instance.
    pub fn new(adapter_instance_id: impl Into<String>) -> Self {
        Self {
            adapter_instance_id: adapter_instance_id.into(),
            gateway_id: None,
        }
    }

    /// Target a device connected through a gateway.
    pub fn via_gateway(
        adapter_instance_id: impl Into<String>,
        gateway_id: impl Into<String>,
    ) -> Self {
        Self {
            adapter_instance_id: adapter_instance_id.into(),
            gateway_id: Some(gateway_id.into()),
        }
    }
}

/// Resolves the target of a command.
#[async_trait]
pub trait CommandTargetMapper: Send + Sync {
    /// Get the target for a device.
    ///
    /// Returns `Ok(None)` if no adapter instance currently serves the device.
    async fn get_target(&self, tenant_id: &str, device_id: &str) -> Result<Option<CommandTarget>>;
}

/// Mapper backed by an in-process table.
#[derive(Debug, Default)]
pub struct StaticTargetMapper {
    targets: DashMap<(String, String), CommandTarget>,
}

impl StaticTargetMapper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map a device to an adapter instance.
    pub fn set_target(&self, tenant_id: &str, device_id: &str, adapter_instance_id: &str) {
        self.insert(tenant_id, device_id, CommandTarget::new(adapter_instance_id));
    }

    /// Map a device to an adapter instance through a gateway.
    pub fn set_gateway_target(
        &self,
        tenant_id: &str,
        device_id: &str,
        adapter_instance_id: &str,
        gateway_id: &str,
    ) {
        self.insert(
            tenant_id,
            device_id,
            CommandTarget::via_gateway(adapter_instance_id, gateway_id),
        );
    }

    /// Remove the mapping of a device.
    pub fn remove(&self, tenant_id: &str, device_id: &str) -> Option<CommandTarget> {
        self.targets
            .remove(&(tenant_id.to_string(), device_id.to_string()))
            .map(|(_, target)| target)
    }

    /// Get the number of mapped devices.
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    fn insert(&self, tenant_id: &str, device_id: &str, target: CommandTarget) {
        tracing::debug!(
            tenant_id = %tenant_id,
            device_id = %device_id,
            adapter_instance_id = %target.adapter_instance_id,
            "Command target mapped"
        );
        self.targets
            .insert((tenant_id.to_string(), device_id.to_string()), target);
    }
}

#[async_trait]
impl CommandTargetMapper for StaticTargetMapper {
    async fn get_target(&self, tenant_id: &str, device_id: &str) -> Result<Option<CommandTarget>> {
        Ok(self
            .targets
            .get(&(tenant_id.to_string(), device_id.to_string()))
            .map(|entry| entry.value().clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_mapper() {
        let mapper = StaticTargetMapper::new();
        mapper.set_target("tenantA", "dev1", "adapter-1");
        mapper.set_gateway_target("tenantA", "dev2", "adapter-2", "gw-1");

        assert_eq!(
            mapper.get_target("tenantA", "dev1").await.unwrap(),
            Some(CommandTarget::new("adapter-1"))
        );
        assert_eq!(
            mapper.get_target("tenantA", "dev2").await.unwrap(),
            Some(CommandTarget::via_gateway("adapter-2", "gw-1"))
        );
        // Same device id, other tenant
        assert_eq!(mapper.get_target("tenantB", "dev1").await.unwrap(), None);

        assert!(mapper.remove("tenantA", "dev1").is_some());
        assert_eq!(mapper.get_target("tenantA", "dev1").await.unwrap(), None);
        assert_eq!(mapper.len(), 1);
    }
}
