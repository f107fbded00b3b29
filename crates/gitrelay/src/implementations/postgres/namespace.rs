use sqlx::{PgPool, postgres::PgRow};

use super::dbutils::{DBErrorHandler, get_col};
use crate::service::{
    ProviderKind, TenantId,
    store::{Namespace, NamespaceFilter, StoreError},
};

const COLUMNS: &str = "tenant_id, provider, provider_instance_key, repo_id, account_id, \
     installation_id, owner, name, full_name, visibility, default_branch, clone_url, html_url, \
     webhooks_enabled, created_at, updated_at";

fn map_row(row: &PgRow) -> Result<Namespace, StoreError> {
    let provider: String = get_col(row, "provider")?;
    Ok(Namespace {
        tenant_id: TenantId::from(get_col::<String>(row, "tenant_id")?),
        provider: provider
            .parse::<ProviderKind>()
            .map_err(|_| StoreError::validation(format!("corrupt provider value `{provider}`")))?,
        provider_instance_key: get_col(row, "provider_instance_key")?,
        repo_id: get_col(row, "repo_id")?,
        account_id: get_col(row, "account_id")?,
        installation_id: get_col(row, "installation_id")?,
        owner: get_col(row, "owner")?,
        name: get_col(row, "name")?,
        full_name: get_col(row, "full_name")?,
        visibility: get_col(row, "visibility")?,
        default_branch: get_col(row, "default_branch")?,
        clone_url: get_col(row, "clone_url")?,
        html_url: get_col(row, "html_url")?,
        webhooks_enabled: get_col(row, "webhooks_enabled")?,
        created_at: get_col(row, "created_at")?,
        updated_at: get_col(row, "updated_at")?,
    })
}

pub(super) async fn list(
    tenant: &TenantId,
    filter: &NamespaceFilter,
    pool: &PgPool,
) -> Result<Vec<Namespace>, StoreError> {
    let mut query = sqlx::QueryBuilder::<sqlx::Postgres>::new(format!(
        "SELECT {COLUMNS} FROM namespace WHERE tenant_id = "
    ));
    query.push_bind(tenant.as_str());
    if let Some(provider) = filter.provider {
        query.push(" AND provider = ").push_bind(provider.to_string());
    }
    if let Some(key) = &filter.provider_instance_key {
        query
            .push(" AND provider_instance_key = ")
            .push_bind(key.clone());
    }
    if let Some(repo_id) = &filter.repo_id {
        query.push(" AND repo_id = ").push_bind(repo_id.clone());
    }
    if let Some(full_name) = &filter.full_name {
        query.push(" AND full_name = ").push_bind(full_name.clone());
    }
    if let Some(enabled) = filter.webhooks_enabled {
        query.push(" AND webhooks_enabled = ").push_bind(enabled);
    }
    query.push(" ORDER BY full_name");
    let rows = query
        .build()
        .fetch_all(pool)
        .await
        .map_err(|e| e.into_store_backend_error())?;
    rows.iter().map(map_row).collect()
}

pub(super) async fn resolve(
    provider: ProviderKind,
    repo_id: &str,
    pool: &PgPool,
) -> Result<Option<Namespace>, StoreError> {
    let row = sqlx::query(&format!(
        "SELECT {COLUMNS} FROM namespace WHERE provider = $1 AND repo_id = $2 \
         ORDER BY updated_at DESC LIMIT 1"
    ))
    .bind(provider.to_string())
    .bind(repo_id)
    .fetch_optional(pool)
    .await
    .map_err(|e| e.into_store_backend_error())?;
    row.as_ref().map(map_row).transpose()
}

pub(super) async fn upsert(namespace: Namespace, pool: &PgPool) -> Result<Namespace, StoreError> {
    let row = sqlx::query(&format!(
        "INSERT INTO namespace \
            (tenant_id, provider, provider_instance_key, repo_id, account_id, installation_id, \
             owner, name, full_name, visibility, default_branch, clone_url, html_url, \
             webhooks_enabled) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14) \
         ON CONFLICT (tenant_id, provider, provider_instance_key, repo_id) DO UPDATE SET \
            account_id = EXCLUDED.account_id, \
            installation_id = EXCLUDED.installation_id, \
            owner = EXCLUDED.owner, \
            name = EXCLUDED.name, \
            full_name = EXCLUDED.full_name, \
            visibility = EXCLUDED.visibility, \
            default_branch = EXCLUDED.default_branch, \
            clone_url = EXCLUDED.clone_url, \
            html_url = EXCLUDED.html_url, \
            webhooks_enabled = EXCLUDED.webhooks_enabled, \
            updated_at = now() \
         RETURNING {COLUMNS}"
    ))
    .bind(namespace.tenant_id.as_str())
    .bind(namespace.provider.to_string())
    .bind(&namespace.provider_instance_key)
    .bind(&namespace.repo_id)
    .bind(&namespace.account_id)
    .bind(&namespace.installation_id)
    .bind(&namespace.owner)
    .bind(&namespace.name)
    .bind(&namespace.full_name)
    .bind(&namespace.visibility)
    .bind(&namespace.default_branch)
    .bind(&namespace.clone_url)
    .bind(&namespace.html_url)
    .bind(namespace.webhooks_enabled)
    .fetch_one(pool)
    .await
    .map_err(|e| e.into_store_backend_error())?;
    map_row(&row)
}

pub(super) async fn delete(
    tenant: &TenantId,
    provider: ProviderKind,
    provider_instance_key: &str,
    repo_id: &str,
    pool: &PgPool,
) -> Result<(), StoreError> {
    sqlx::query(
        "DELETE FROM namespace WHERE tenant_id = $1 AND provider = $2 \
         AND provider_instance_key = $3 AND repo_id = $4",
    )
    .bind(tenant.as_str())
    .bind(provider.to_string())
    .bind(provider_instance_key)
    .bind(repo_id)
    .execute(pool)
    .await
    .map_err(|e| e.into_store_backend_error())?;
    Ok(())
}

pub(super) async fn set_webhooks_enabled(
    tenant: &TenantId,
    provider: ProviderKind,
    provider_instance_key: &str,
    repo_id: &str,
    enabled: bool,
    pool: &PgPool,
) -> Result<Namespace, StoreError> {
    let row = sqlx::query(&format!(
        "UPDATE namespace SET webhooks_enabled = $5, updated_at = now() \
         WHERE tenant_id = $1 AND provider = $2 AND provider_instance_key = $3 AND repo_id = $4 \
         RETURNING {COLUMNS}"
    ))
    .bind(tenant.as_str())
    .bind(provider.to_string())
    .bind(provider_instance_key)
    .bind(repo_id)
    .bind(enabled)
    .fetch_optional(pool)
    .await
    .map_err(|e| e.into_store_backend_error())?
    .ok_or_else(|| StoreError::not_found("namespace"))?;
    map_row(&row)
}
