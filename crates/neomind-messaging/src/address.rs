//! Address scheme of the messaging network.
//!
//! Addresses have the form `endpoint/tenant[/resource]`:
//!
//! ```text
//! command/{tenant}                          tenant-scoped inbound commands
//! command_internal/{tenant}/{instance}      commands for one adapter instance
//! command_response/{tenant}/{reply-id}      responses for one command issuer
//! ```

/// Endpoint on which business applications send commands.
pub const NORTHBOUND_COMMAND_REQUEST_ENDPOINT: &str = "command";

/// Endpoint on which business applications receive command responses.
pub const NORTHBOUND_COMMAND_RESPONSE_ENDPOINT: &str = "command_response";

/// Endpoint on which adapter instances receive delegated commands.
pub const COMMAND_ENDPOINT: &str = "command_internal";

/// Endpoint to which command responses are sent downstream.
pub const COMMAND_RESPONSE_ENDPOINT: &str = "command_response";

const SEPARATOR: char = '/';

/// Build the address for an endpoint, tenant and optional resource.
pub fn target_address(endpoint: &str, tenant_id: &str, resource_id: Option<&str>) -> String {
    match resource_id {
        Some(resource) if !resource.is_empty() => {
            format!("{}{}{}{}{}", endpoint, SEPARATOR, tenant_id, SEPARATOR, resource)
        }
        _ => format!("{}{}{}", endpoint, SEPARATOR, tenant_id),
    }
}

/// Parsed form of an address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceIdentifier {
    /// Endpoint name
    pub endpoint: String,
    /// Tenant segment
    pub tenant_id: Option<String>,
    /// Everything after the tenant segment
    pub resource_id: Option<String>,
}

impl ResourceIdentifier {
    /// Parse an address into its segments.
    ///
    /// The resource id keeps any further separators, so reply ids containing
    /// `/` survive the round trip. Returns `None` for an empty address.
    pub fn parse(address: &str) -> Option<Self> {
        let address = address.trim_matches(SEPARATOR);
        if address.is_empty() {
            return None;
        }

        let mut parts = address.splitn(3, SEPARATOR);
        let endpoint = parts.next()?.to_string();
        let tenant_id = parts.next().filter(|s| !s.is_empty()).map(str::to_string);
        let resource_id = parts.next().filter(|s| !s.is_empty()).map(str::to_string);

        Some(Self {
            endpoint,
            tenant_id,
            resource_id,
        })
    }

    /// Check whether the address belongs to the given endpoint.
    pub fn has_endpoint(&self, endpoint: &str) -> bool {
        self.endpoint == endpoint
    }
}

impl std::fmt::Display for ResourceIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.endpoint)?;
        if let Some(tenant) = &self.tenant_id {
            write!(f, "{}{}", SEPARATOR, tenant)?;
        }
        if let Some(resource) = &self.resource_id {
            write!(f, "{}{}", SEPARATOR, resource)?;
        }
        Ok(())
    }
}
