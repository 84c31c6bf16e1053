//! Command routing for north-bound device commands.
//!
//! Provides:
//! - Tenant-scoped command consumer links with reconnect-driven recreation
//! - A keyed client cache with at most one construction in flight per key
//! - Mapping and delegation of commands to the serving adapter instance
//! - Command response sending back to the command issuer
//! - Router configuration and runtime statistics

pub mod cache;
pub mod command;
pub mod config;
pub mod consumer;
pub mod error;
pub mod handler;
pub mod resolver;
pub mod response;
pub mod stats;

// Re-exports
pub use cache::{ClientCache, EntryId};

pub use command::{
    decode_request_id, encode_request_id, CommandMessage, CommandResponse, DeviceId,
    InvalidCommand, MessagingType, TenantId,
};

pub use config::CommandRouterConfig;

pub use consumer::{CommandConsumerFactory, TenantConsumer};

pub use error::{Result, RouterError, STATUS_INTERNAL_ERROR, STATUS_SERVICE_UNAVAILABLE};

pub use handler::MappingAndDelegatingCommandHandler;

pub use resolver::{CommandTarget, CommandTargetMapper, StaticTargetMapper};

pub use response::CommandResponseSender;

pub use stats::{RouterStats, RouterStatsSnapshot};
