#![warn(
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    clippy::pedantic
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::large_enum_variant,
    clippy::missing_errors_doc
)]
#![forbid(unsafe_code)]

mod config;
pub mod service;

pub use config::{CONFIG, DynAppConfig, SqlDialect, StorageDriver, set_config_file};
pub use service::{DriverId, EventLogId, ProviderKind, RuleId, TenantId};

pub mod implementations;

pub mod api;
mod request_metadata;
pub mod request_tracing;

pub use async_trait;
pub use axum;
pub use request_metadata::{
    RequestMetadata, X_REQUEST_ID_HEADER_NAME, X_TENANT_ID_HEADER_NAME,
};
pub use sqlx;
pub use tokio;
pub use tokio_util::sync::CancellationToken;
pub use tracing;

#[cfg(test)]
mod tests;
