use sqlx::{PgPool, postgres::PgRow};

use super::dbutils::{DBErrorHandler, get_col};
use crate::service::{
    ProviderKind, TenantId,
    store::{ProviderInstance, ProviderInstanceFilter, StoreError},
};

const COLUMNS: &str = "tenant_id, provider, key, app_id, private_key, client_id, \
     client_secret, webhook_secret, api_base_url, webhook_path, enabled, created_at, updated_at";

fn map_row(row: &PgRow) -> Result<ProviderInstance, StoreError> {
    let provider: String = get_col(row, "provider")?;
    Ok(ProviderInstance {
        tenant_id: TenantId::from(get_col::<String>(row, "tenant_id")?),
        provider: provider
            .parse::<ProviderKind>()
            .map_err(|_| StoreError::validation(format!("corrupt provider value `{provider}`")))?,
        key: get_col(row, "key")?,
        app_id: get_col(row, "app_id")?,
        private_key: get_col(row, "private_key")?,
        client_id: get_col(row, "client_id")?,
        client_secret: get_col(row, "client_secret")?,
        webhook_secret: get_col(row, "webhook_secret")?,
        api_base_url: get_col(row, "api_base_url")?,
        webhook_path: get_col(row, "webhook_path")?,
        enabled: get_col(row, "enabled")?,
        created_at: get_col(row, "created_at")?,
        updated_at: get_col(row, "updated_at")?,
    })
}

pub(super) async fn list(
    tenant: &TenantId,
    filter: &ProviderInstanceFilter,
    pool: &PgPool,
) -> Result<Vec<ProviderInstance>, StoreError> {
    let mut query = sqlx::QueryBuilder::<sqlx::Postgres>::new(format!(
        "SELECT {COLUMNS} FROM provider_instance WHERE tenant_id = "
    ));
    query.push_bind(tenant.as_str());
    if let Some(provider) = filter.provider {
        query.push(" AND provider = ").push_bind(provider.to_string());
    }
    if let Some(key) = &filter.key {
        query.push(" AND key = ").push_bind(key.clone());
    }
    if let Some(enabled) = filter.enabled {
        query.push(" AND enabled = ").push_bind(enabled);
    }
    query.push(" ORDER BY provider, key");
    let rows = query
        .build()
        .fetch_all(pool)
        .await
        .map_err(|e| e.into_store_backend_error())?;
    rows.iter().map(map_row).collect()
}

pub(super) async fn get(
    tenant: &TenantId,
    provider: ProviderKind,
    key: &str,
    pool: &PgPool,
) -> Result<Option<ProviderInstance>, StoreError> {
    let row = sqlx::query(&format!(
        "SELECT {COLUMNS} FROM provider_instance \
         WHERE tenant_id = $1 AND provider = $2 AND key = $3"
    ))
    .bind(tenant.as_str())
    .bind(provider.to_string())
    .bind(key)
    .fetch_optional(pool)
    .await
    .map_err(|e| e.into_store_backend_error())?;
    row.as_ref().map(map_row).transpose()
}

pub(super) async fn resolve(
    provider: ProviderKind,
    pool: &PgPool,
) -> Result<Vec<ProviderInstance>, StoreError> {
    let rows = sqlx::query(&format!(
        "SELECT {COLUMNS} FROM provider_instance WHERE provider = $1 AND enabled"
    ))
    .bind(provider.to_string())
    .fetch_all(pool)
    .await
    .map_err(|e| e.into_store_backend_error())?;
    rows.iter().map(map_row).collect()
}

pub(super) async fn upsert(
    instance: ProviderInstance,
    pool: &PgPool,
) -> Result<ProviderInstance, StoreError> {
    let row = sqlx::query(&format!(
        "INSERT INTO provider_instance \
            (tenant_id, provider, key, app_id, private_key, client_id, client_secret, \
             webhook_secret, api_base_url, webhook_path, enabled) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11) \
         ON CONFLICT (tenant_id, provider, key) DO UPDATE SET \
            app_id = EXCLUDED.app_id, \
            private_key = EXCLUDED.private_key, \
            client_id = EXCLUDED.client_id, \
            client_secret = EXCLUDED.client_secret, \
            webhook_secret = EXCLUDED.webhook_secret, \
            api_base_url = EXCLUDED.api_base_url, \
            webhook_path = EXCLUDED.webhook_path, \
            enabled = EXCLUDED.enabled, \
            updated_at = now() \
         RETURNING {COLUMNS}"
    ))
    .bind(instance.tenant_id.as_str())
    .bind(instance.provider.to_string())
    .bind(&instance.key)
    .bind(&instance.app_id)
    .bind(&instance.private_key)
    .bind(&instance.client_id)
    .bind(&instance.client_secret)
    .bind(&instance.webhook_secret)
    .bind(&instance.api_base_url)
    .bind(&instance.webhook_path)
    .bind(instance.enabled)
    .fetch_one(pool)
    .await
    .map_err(|e| e.into_store_backend_error())?;
    map_row(&row)
}

pub(super) async fn delete(
    tenant: &TenantId,
    provider: ProviderKind,
    key: &str,
    pool: &PgPool,
) -> Result<(), StoreError> {
    sqlx::query("DELETE FROM provider_instance WHERE tenant_id = $1 AND provider = $2 AND key = $3")
        .bind(tenant.as_str())
        .bind(provider.to_string())
        .bind(key)
        .execute(pool)
        .await
        .map_err(|e| e.into_store_backend_error())?;
    Ok(())
}
