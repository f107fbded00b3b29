//! Postgres store backend (sqlx).

mod dbutils;
mod driver;
mod event_log;
mod installation;
mod namespace;
mod provider;
mod rule;

use async_trait::async_trait;
use sqlx::PgPool;

use crate::{
    CONFIG,
    service::{
        DriverId, EventLogId, ProviderKind, RuleId, TenantId,
        health::{Health, HealthExt},
        store::{
            BreakdownPage, BreakdownQuery, Driver, DriverFilter, EventLogAnalytics,
            EventLogFilter, EventLogRecord, EventLogStatus, Installation, InstallationFilter,
            Namespace, NamespaceFilter, ProviderInstance, ProviderInstanceFilter, RouterStore,
            Rule, RuleWithDriver, StoreError, TimeseriesBucket, TimeseriesInterval,
        },
    },
};

/// Embedded migrations, applied by the binary's `migrate` subcommand or on
/// startup with `storage.auto_migrate`.
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresStore;

#[derive(Debug, Clone)]
pub struct PostgresState {
    read_pool: PgPool,
    write_pool: PgPool,
}

impl PostgresState {
    #[must_use]
    pub fn from_pools(read_pool: PgPool, write_pool: PgPool) -> Self {
        Self {
            read_pool,
            write_pool,
        }
    }

    #[must_use]
    pub fn read_pool(&self) -> &PgPool {
        &self.read_pool
    }

    #[must_use]
    pub fn write_pool(&self) -> &PgPool {
        &self.write_pool
    }
}

#[async_trait]
impl HealthExt for PostgresState {
    async fn health(&self) -> Health {
        match sqlx::query("SELECT 1").execute(&self.read_pool).await {
            Ok(_) => Health::Healthy,
            Err(e) => Health::Unhealthy(e.to_string()),
        }
    }
}

/// Connection pool from the configured DSN.
pub async fn get_pool() -> anyhow::Result<PgPool> {
    let storage = &CONFIG.storage;
    if storage.dsn.is_empty() {
        anyhow::bail!("storage.dsn is not configured");
    }
    sqlx::postgres::PgPoolOptions::new()
        .max_connections(storage.pool_connections)
        .acquire_timeout(std::time::Duration::from_secs(storage.acquire_timeout_secs))
        .connect(&storage.dsn)
        .await
        .map_err(|e| anyhow::anyhow!(e).context("connecting to postgres"))
}

/// Apply pending migrations.
pub async fn migrate(pool: &PgPool) -> anyhow::Result<()> {
    MIGRATOR
        .run(pool)
        .await
        .map_err(|e| anyhow::anyhow!(e).context("running migrations"))
}

#[async_trait]
impl RouterStore for PostgresStore {
    type State = PostgresState;

    async fn list_provider_instances(
        tenant: &TenantId,
        filter: ProviderInstanceFilter,
        state: Self::State,
    ) -> Result<Vec<ProviderInstance>, StoreError> {
        provider::list(tenant, &filter, state.read_pool()).await
    }

    async fn get_provider_instance(
        tenant: &TenantId,
        provider: ProviderKind,
        key: &str,
        state: Self::State,
    ) -> Result<Option<ProviderInstance>, StoreError> {
        provider::get(tenant, provider, key, state.read_pool()).await
    }

    async fn resolve_provider_instances(
        provider: ProviderKind,
        state: Self::State,
    ) -> Result<Vec<ProviderInstance>, StoreError> {
        provider::resolve(provider, state.read_pool()).await
    }

    async fn upsert_provider_instance(
        instance: ProviderInstance,
        state: Self::State,
    ) -> Result<ProviderInstance, StoreError> {
        provider::upsert(instance, state.write_pool()).await
    }

    async fn delete_provider_instance(
        tenant: &TenantId,
        provider: ProviderKind,
        key: &str,
        state: Self::State,
    ) -> Result<(), StoreError> {
        provider::delete(tenant, provider, key, state.write_pool()).await
    }

    async fn list_installations(
        tenant: &TenantId,
        filter: InstallationFilter,
        state: Self::State,
    ) -> Result<Vec<Installation>, StoreError> {
        installation::list(tenant, &filter, state.read_pool()).await
    }

    async fn get_installation_by_id(
        tenant: &TenantId,
        provider: ProviderKind,
        installation_id: &str,
        state: Self::State,
    ) -> Result<Option<Installation>, StoreError> {
        installation::get_by_id(tenant, provider, installation_id, state.read_pool()).await
    }

    async fn get_installation_by_account(
        tenant: &TenantId,
        provider: ProviderKind,
        account_id: &str,
        state: Self::State,
    ) -> Result<Option<Installation>, StoreError> {
        installation::get_by_account(tenant, provider, account_id, state.read_pool()).await
    }

    async fn resolve_installation(
        provider: ProviderKind,
        installation_id: &str,
        state: Self::State,
    ) -> Result<Option<Installation>, StoreError> {
        installation::resolve(provider, installation_id, state.read_pool()).await
    }

    async fn upsert_installation(
        installation: Installation,
        state: Self::State,
    ) -> Result<Installation, StoreError> {
        installation::upsert(installation, state.write_pool()).await
    }

    async fn delete_installation(
        tenant: &TenantId,
        provider: ProviderKind,
        installation_id: &str,
        state: Self::State,
    ) -> Result<(), StoreError> {
        installation::delete(tenant, provider, installation_id, state.write_pool()).await
    }

    async fn list_namespaces(
        tenant: &TenantId,
        filter: NamespaceFilter,
        state: Self::State,
    ) -> Result<Vec<Namespace>, StoreError> {
        namespace::list(tenant, &filter, state.read_pool()).await
    }

    async fn resolve_namespace(
        provider: ProviderKind,
        repo_id: &str,
        state: Self::State,
    ) -> Result<Option<Namespace>, StoreError> {
        namespace::resolve(provider, repo_id, state.read_pool()).await
    }

    async fn upsert_namespace(
        namespace: Namespace,
        state: Self::State,
    ) -> Result<Namespace, StoreError> {
        namespace::upsert(namespace, state.write_pool()).await
    }

    async fn delete_namespace(
        tenant: &TenantId,
        provider: ProviderKind,
        provider_instance_key: &str,
        repo_id: &str,
        state: Self::State,
    ) -> Result<(), StoreError> {
        namespace::delete(tenant, provider, provider_instance_key, repo_id, state.write_pool())
            .await
    }

    async fn set_namespace_webhooks_enabled(
        tenant: &TenantId,
        provider: ProviderKind,
        provider_instance_key: &str,
        repo_id: &str,
        enabled: bool,
        state: Self::State,
    ) -> Result<Namespace, StoreError> {
        namespace::set_webhooks_enabled(
            tenant,
            provider,
            provider_instance_key,
            repo_id,
            enabled,
            state.write_pool(),
        )
        .await
    }

    async fn list_drivers(
        tenant: &TenantId,
        filter: DriverFilter,
        state: Self::State,
    ) -> Result<Vec<Driver>, StoreError> {
        driver::list(tenant, &filter, state.read_pool()).await
    }

    async fn get_driver(
        tenant: &TenantId,
        id: DriverId,
        state: Self::State,
    ) -> Result<Option<Driver>, StoreError> {
        driver::get(tenant, id, state.read_pool()).await
    }

    async fn get_driver_by_name(
        tenant: &TenantId,
        name: &str,
        state: Self::State,
    ) -> Result<Option<Driver>, StoreError> {
        driver::get_by_name(tenant, name, state.read_pool()).await
    }

    async fn upsert_driver(driver: Driver, state: Self::State) -> Result<Driver, StoreError> {
        driver::upsert(driver, state.write_pool()).await
    }

    async fn delete_driver(
        tenant: &TenantId,
        id: DriverId,
        state: Self::State,
    ) -> Result<(), StoreError> {
        driver::delete(tenant, id, state.write_pool()).await
    }

    async fn list_rules(
        tenant: &TenantId,
        state: Self::State,
    ) -> Result<Vec<RuleWithDriver>, StoreError> {
        rule::list(tenant, state.read_pool()).await
    }

    async fn get_rule(
        tenant: &TenantId,
        id: RuleId,
        state: Self::State,
    ) -> Result<Option<RuleWithDriver>, StoreError> {
        rule::get(tenant, id, state.read_pool()).await
    }

    async fn create_rule(rule: Rule, state: Self::State) -> Result<Rule, StoreError> {
        rule::create(rule, state.write_pool()).await
    }

    async fn update_rule(rule: Rule, state: Self::State) -> Result<Rule, StoreError> {
        rule::update(rule, state.write_pool()).await
    }

    async fn delete_rule(
        tenant: &TenantId,
        id: RuleId,
        state: Self::State,
    ) -> Result<(), StoreError> {
        rule::delete(tenant, id, state.write_pool()).await
    }

    async fn insert_event_logs(
        records: Vec<EventLogRecord>,
        state: Self::State,
    ) -> Result<(), StoreError> {
        event_log::insert_batch(records, state.write_pool()).await
    }

    async fn update_event_log_status(
        tenant: &TenantId,
        id: EventLogId,
        status: EventLogStatus,
        error_message: Option<String>,
        state: Self::State,
    ) -> Result<EventLogRecord, StoreError> {
        event_log::update_status(tenant, id, status, error_message, state.write_pool()).await
    }

    async fn get_event_log(
        tenant: &TenantId,
        id: EventLogId,
        state: Self::State,
    ) -> Result<Option<EventLogRecord>, StoreError> {
        event_log::get(tenant, id, state.read_pool()).await
    }

    async fn list_event_logs(
        tenant: &TenantId,
        filter: EventLogFilter,
        limit: usize,
        offset: usize,
        state: Self::State,
    ) -> Result<Vec<EventLogRecord>, StoreError> {
        event_log::list(tenant, &filter, limit, offset, state.read_pool()).await
    }

    async fn get_event_log_analytics(
        tenant: &TenantId,
        filter: EventLogFilter,
        state: Self::State,
    ) -> Result<EventLogAnalytics, StoreError> {
        event_log::analytics(tenant, &filter, state.read_pool()).await
    }

    async fn get_event_log_timeseries(
        tenant: &TenantId,
        filter: EventLogFilter,
        interval: TimeseriesInterval,
        state: Self::State,
    ) -> Result<Vec<TimeseriesBucket>, StoreError> {
        event_log::timeseries(tenant, &filter, interval, state.read_pool()).await
    }

    async fn get_event_log_breakdown(
        tenant: &TenantId,
        query: BreakdownQuery,
        state: Self::State,
    ) -> Result<BreakdownPage, StoreError> {
        event_log::breakdown(tenant, &query, state.read_pool()).await
    }
}
