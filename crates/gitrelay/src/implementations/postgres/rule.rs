use sqlx::{PgPool, postgres::PgRow};

use super::dbutils::{DBErrorHandler, get_col};
use crate::service::{
    DriverId, RuleId, TenantId,
    store::{Rule, RuleWithDriver, StoreError},
};

const JOINED_COLUMNS: &str = "r.id, r.tenant_id, r.when_expr, r.emit, r.driver_id, \
     r.transform_js, r.position, r.created_at, r.updated_at, \
     d.name AS driver_name, d.config AS driver_config, d.enabled AS driver_enabled";

fn map_rule(row: &PgRow) -> Result<Rule, StoreError> {
    Ok(Rule {
        id: RuleId::new(get_col(row, "id")?),
        tenant_id: TenantId::from(get_col::<String>(row, "tenant_id")?),
        when: get_col(row, "when_expr")?,
        emit: get_col(row, "emit")?,
        driver_id: get_col::<Option<uuid::Uuid>>(row, "driver_id")?.map(DriverId::new),
        transform_js: get_col(row, "transform_js")?,
        position: get_col(row, "position")?,
        created_at: get_col(row, "created_at")?,
        updated_at: get_col(row, "updated_at")?,
    })
}

fn map_joined(row: &PgRow) -> Result<RuleWithDriver, StoreError> {
    Ok(RuleWithDriver {
        rule: map_rule(row)?,
        driver_name: get_col(row, "driver_name")?,
        driver_config: get_col(row, "driver_config")?,
        driver_enabled: get_col(row, "driver_enabled")?,
    })
}

pub(super) async fn list(
    tenant: &TenantId,
    pool: &PgPool,
) -> Result<Vec<RuleWithDriver>, StoreError> {
    let rows = sqlx::query(&format!(
        "SELECT {JOINED_COLUMNS} FROM rule r \
         LEFT JOIN driver d ON d.id = r.driver_id \
         WHERE r.tenant_id = $1 \
         ORDER BY r.position"
    ))
    .bind(tenant.as_str())
    .fetch_all(pool)
    .await
    .map_err(|e| e.into_store_backend_error())?;
    rows.iter().map(map_joined).collect()
}

pub(super) async fn get(
    tenant: &TenantId,
    id: RuleId,
    pool: &PgPool,
) -> Result<Option<RuleWithDriver>, StoreError> {
    let row = sqlx::query(&format!(
        "SELECT {JOINED_COLUMNS} FROM rule r \
         LEFT JOIN driver d ON d.id = r.driver_id \
         WHERE r.tenant_id = $1 AND r.id = $2"
    ))
    .bind(tenant.as_str())
    .bind(*id)
    .fetch_optional(pool)
    .await
    .map_err(|e| e.into_store_backend_error())?;
    row.as_ref().map(map_joined).transpose()
}

pub(super) async fn create(rule: Rule, pool: &PgPool) -> Result<Rule, StoreError> {
    let row = sqlx::query(
        "INSERT INTO rule (id, tenant_id, when_expr, emit, driver_id, transform_js, position) \
         VALUES ($1, $2, $3, $4, $5, $6, nextval('rule_position_seq')) \
         RETURNING id, tenant_id, when_expr, emit, driver_id, transform_js, position, \
                   created_at, updated_at",
    )
    .bind(*rule.id)
    .bind(rule.tenant_id.as_str())
    .bind(&rule.when)
    .bind(&rule.emit)
    .bind(rule.driver_id.map(|d| *d))
    .bind(&rule.transform_js)
    .fetch_one(pool)
    .await
    .map_err(|e| e.into_store_backend_error())?;
    map_rule(&row)
}

pub(super) async fn update(rule: Rule, pool: &PgPool) -> Result<Rule, StoreError> {
    let row = sqlx::query(
        "UPDATE rule SET when_expr = $3, emit = $4, driver_id = $5, transform_js = $6, \
            updated_at = now() \
         WHERE tenant_id = $1 AND id = $2 \
         RETURNING id, tenant_id, when_expr, emit, driver_id, transform_js, position, \
                   created_at, updated_at",
    )
    .bind(rule.tenant_id.as_str())
    .bind(*rule.id)
    .bind(&rule.when)
    .bind(&rule.emit)
    .bind(rule.driver_id.map(|d| *d))
    .bind(&rule.transform_js)
    .fetch_optional(pool)
    .await
    .map_err(|e| e.into_store_backend_error())?
    .ok_or_else(|| StoreError::not_found("rule"))?;
    map_rule(&row)
}

pub(super) async fn delete(
    tenant: &TenantId,
    id: RuleId,
    pool: &PgPool,
) -> Result<(), StoreError> {
    sqlx::query("DELETE FROM rule WHERE tenant_id = $1 AND id = $2")
        .bind(tenant.as_str())
        .bind(*id)
        .execute(pool)
        .await
        .map_err(|e| e.into_store_backend_error())?;
    Ok(())
}
