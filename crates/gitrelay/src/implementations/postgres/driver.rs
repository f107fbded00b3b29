use sqlx::{PgPool, postgres::PgRow};

use super::dbutils::{DBErrorHandler, get_col};
use crate::service::{
    DriverId, TenantId,
    store::{Driver, DriverFilter, StoreError},
};

const COLUMNS: &str = "id, tenant_id, name, config, enabled, created_at, updated_at";

fn map_row(row: &PgRow) -> Result<Driver, StoreError> {
    Ok(Driver {
        id: DriverId::new(get_col(row, "id")?),
        tenant_id: TenantId::from(get_col::<String>(row, "tenant_id")?),
        name: get_col(row, "name")?,
        config: get_col(row, "config")?,
        enabled: get_col(row, "enabled")?,
        created_at: get_col(row, "created_at")?,
        updated_at: get_col(row, "updated_at")?,
    })
}

pub(super) async fn list(
    tenant: &TenantId,
    filter: &DriverFilter,
    pool: &PgPool,
) -> Result<Vec<Driver>, StoreError> {
    let mut query = sqlx::QueryBuilder::<sqlx::Postgres>::new(format!(
        "SELECT {COLUMNS} FROM driver WHERE tenant_id = "
    ));
    query.push_bind(tenant.as_str());
    if let Some(name) = &filter.name {
        query.push(" AND name = ").push_bind(name.clone());
    }
    if let Some(enabled) = filter.enabled {
        query.push(" AND enabled = ").push_bind(enabled);
    }
    query.push(" ORDER BY name");
    let rows = query
        .build()
        .fetch_all(pool)
        .await
        .map_err(|e| e.into_store_backend_error())?;
    rows.iter().map(map_row).collect()
}

pub(super) async fn get(
    tenant: &TenantId,
    id: DriverId,
    pool: &PgPool,
) -> Result<Option<Driver>, StoreError> {
    let row = sqlx::query(&format!(
        "SELECT {COLUMNS} FROM driver WHERE tenant_id = $1 AND id = $2"
    ))
    .bind(tenant.as_str())
    .bind(*id)
    .fetch_optional(pool)
    .await
    .map_err(|e| e.into_store_backend_error())?;
    row.as_ref().map(map_row).transpose()
}

pub(super) async fn get_by_name(
    tenant: &TenantId,
    name: &str,
    pool: &PgPool,
) -> Result<Option<Driver>, StoreError> {
    let row = sqlx::query(&format!(
        "SELECT {COLUMNS} FROM driver WHERE tenant_id = $1 AND name = $2"
    ))
    .bind(tenant.as_str())
    .bind(name)
    .fetch_optional(pool)
    .await
    .map_err(|e| e.into_store_backend_error())?;
    row.as_ref().map(map_row).transpose()
}

pub(super) async fn upsert(driver: Driver, pool: &PgPool) -> Result<Driver, StoreError> {
    let row = sqlx::query(&format!(
        "INSERT INTO driver (id, tenant_id, name, config, enabled) \
         VALUES ($1, $2, $3, $4, $5) \
         ON CONFLICT (tenant_id, name) DO UPDATE SET \
            config = EXCLUDED.config, \
            enabled = EXCLUDED.enabled, \
            updated_at = now() \
         RETURNING {COLUMNS}"
    ))
    .bind(*driver.id)
    .bind(driver.tenant_id.as_str())
    .bind(&driver.name)
    .bind(&driver.config)
    .bind(driver.enabled)
    .fetch_one(pool)
    .await
    .map_err(|e| e.into_store_backend_error())?;
    map_row(&row)
}

pub(super) async fn delete(
    tenant: &TenantId,
    id: DriverId,
    pool: &PgPool,
) -> Result<(), StoreError> {
    sqlx::query("DELETE FROM driver WHERE tenant_id = $1 AND id = $2")
        .bind(tenant.as_str())
        .bind(*id)
        .execute(pool)
        .await
        .map_err(|e| e.into_store_backend_error())?;
    Ok(())
}
