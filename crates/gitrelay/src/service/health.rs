//! Health reporting for backing services.

use async_trait::async_trait;

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "kebab-case", tag = "status", content = "detail")]
pub enum Health {
    Healthy,
    Unhealthy(String),
}

impl Health {
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        matches!(self, Health::Healthy)
    }
}

/// Implemented by every backend that participates in `/health`.
#[async_trait]
pub trait HealthExt: Send + Sync {
    async fn health(&self) -> Health;
}

#[derive(Debug, Clone, serde::Serialize, utoipa::ToSchema)]
pub struct HealthReport {
    pub healthy: bool,
    pub services: Vec<ServiceHealth>,
}

#[derive(Debug, Clone, serde::Serialize, utoipa::ToSchema)]
pub struct ServiceHealth {
    pub name: String,
    #[serde(flatten)]
    pub health: Health,
}

/// Collect health from named providers into a single report.
pub async fn collect_health(providers: &[(&str, &(dyn HealthExt))]) -> HealthReport {
    let mut services = Vec::with_capacity(providers.len());
    for (name, provider) in providers {
        services.push(ServiceHealth {
            name: (*name).to_string(),
            health: provider.health().await,
        });
    }
    HealthReport {
        healthy: services.iter().all(|s| s.health.is_healthy()),
        services,
    }
}
