use sqlx::{PgPool, postgres::PgRow};

use super::dbutils::{DBErrorHandler, get_col};
use crate::service::{
    ProviderKind, TenantId,
    store::{Installation, InstallationFilter, StoreError},
};

const COLUMNS: &str = "tenant_id, provider, account_id, installation_id, provider_instance_key, \
     access_token, refresh_token, token_expires_at, created_at, updated_at";

fn map_row(row: &PgRow) -> Result<Installation, StoreError> {
    let provider: String = get_col(row, "provider")?;
    Ok(Installation {
        tenant_id: TenantId::from(get_col::<String>(row, "tenant_id")?),
        provider: provider
            .parse::<ProviderKind>()
            .map_err(|_| StoreError::validation(format!("corrupt provider value `{provider}`")))?,
        account_id: get_col(row, "account_id")?,
        installation_id: get_col(row, "installation_id")?,
        provider_instance_key: get_col(row, "provider_instance_key")?,
        access_token: get_col(row, "access_token")?,
        refresh_token: get_col(row, "refresh_token")?,
        token_expires_at: get_col(row, "token_expires_at")?,
        created_at: get_col(row, "created_at")?,
        updated_at: get_col(row, "updated_at")?,
    })
}

pub(super) async fn list(
    tenant: &TenantId,
    filter: &InstallationFilter,
    pool: &PgPool,
) -> Result<Vec<Installation>, StoreError> {
    let mut query = sqlx::QueryBuilder::<sqlx::Postgres>::new(format!(
        "SELECT {COLUMNS} FROM installation WHERE tenant_id = "
    ));
    query.push_bind(tenant.as_str());
    if let Some(provider) = filter.provider {
        query.push(" AND provider = ").push_bind(provider.to_string());
    }
    if let Some(account_id) = &filter.account_id {
        query.push(" AND account_id = ").push_bind(account_id.clone());
    }
    if let Some(installation_id) = &filter.installation_id {
        query
            .push(" AND installation_id = ")
            .push_bind(installation_id.clone());
    }
    if let Some(key) = &filter.provider_instance_key {
        query
            .push(" AND provider_instance_key = ")
            .push_bind(key.clone());
    }
    query.push(" ORDER BY updated_at DESC");
    let rows = query
        .build()
        .fetch_all(pool)
        .await
        .map_err(|e| e.into_store_backend_error())?;
    rows.iter().map(map_row).collect()
}

pub(super) async fn get_by_id(
    tenant: &TenantId,
    provider: ProviderKind,
    installation_id: &str,
    pool: &PgPool,
) -> Result<Option<Installation>, StoreError> {
    let row = sqlx::query(&format!(
        "SELECT {COLUMNS} FROM installation \
         WHERE tenant_id = $1 AND provider = $2 AND installation_id = $3 \
         ORDER BY updated_at DESC LIMIT 1"
    ))
    .bind(tenant.as_str())
    .bind(provider.to_string())
    .bind(installation_id)
    .fetch_optional(pool)
    .await
    .map_err(|e| e.into_store_backend_error())?;
    row.as_ref().map(map_row).transpose()
}

pub(super) async fn get_by_account(
    tenant: &TenantId,
    provider: ProviderKind,
    account_id: &str,
    pool: &PgPool,
) -> Result<Option<Installation>, StoreError> {
    let row = sqlx::query(&format!(
        "SELECT {COLUMNS} FROM installation \
         WHERE tenant_id = $1 AND provider = $2 AND account_id = $3 \
         ORDER BY updated_at DESC LIMIT 1"
    ))
    .bind(tenant.as_str())
    .bind(provider.to_string())
    .bind(account_id)
    .fetch_optional(pool)
    .await
    .map_err(|e| e.into_store_backend_error())?;
    row.as_ref().map(map_row).transpose()
}

pub(super) async fn resolve(
    provider: ProviderKind,
    installation_id: &str,
    pool: &PgPool,
) -> Result<Option<Installation>, StoreError> {
    let row = sqlx::query(&format!(
        "SELECT {COLUMNS} FROM installation \
         WHERE provider = $1 AND installation_id = $2 \
         ORDER BY updated_at DESC LIMIT 1"
    ))
    .bind(provider.to_string())
    .bind(installation_id)
    .fetch_optional(pool)
    .await
    .map_err(|e| e.into_store_backend_error())?;
    row.as_ref().map(map_row).transpose()
}

pub(super) async fn upsert(
    installation: Installation,
    pool: &PgPool,
) -> Result<Installation, StoreError> {
    let row = sqlx::query(&format!(
        "INSERT INTO installation \
            (tenant_id, provider, account_id, installation_id, provider_instance_key, \
             access_token, refresh_token, token_expires_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
         ON CONFLICT (tenant_id, provider, account_id, installation_id, provider_instance_key) \
         DO UPDATE SET \
            access_token = EXCLUDED.access_token, \
            refresh_token = EXCLUDED.refresh_token, \
            token_expires_at = EXCLUDED.token_expires_at, \
            updated_at = now() \
         RETURNING {COLUMNS}"
    ))
    .bind(installation.tenant_id.as_str())
    .bind(installation.provider.to_string())
    .bind(&installation.account_id)
    .bind(&installation.installation_id)
    .bind(&installation.provider_instance_key)
    .bind(&installation.access_token)
    .bind(&installation.refresh_token)
    .bind(installation.token_expires_at)
    .fetch_one(pool)
    .await
    .map_err(|e| e.into_store_backend_error())?;
    map_row(&row)
}

pub(super) async fn delete(
    tenant: &TenantId,
    provider: ProviderKind,
    installation_id: &str,
    pool: &PgPool,
) -> Result<(), StoreError> {
    sqlx::query(
        "DELETE FROM installation \
         WHERE tenant_id = $1 AND provider = $2 AND installation_id = $3",
    )
    .bind(tenant.as_str())
    .bind(provider.to_string())
    .bind(installation_id)
    .execute(pool)
    .await
    .map_err(|e| e.into_store_backend_error())?;
    Ok(())
}
