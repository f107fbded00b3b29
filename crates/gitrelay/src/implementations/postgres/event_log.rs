use chrono::{DateTime, Utc};
use sqlx::{PgPool, postgres::PgRow};

use super::dbutils::{DBErrorHandler, get_col};
use crate::service::{
    EventLogId, ProviderKind, RuleId, TenantId,
    store::{
        BreakdownGroupBy, BreakdownPage, BreakdownQuery, BreakdownRow, BreakdownSortBy,
        CountBucket, EventLogAnalytics, EventLogFilter, EventLogRecord, EventLogStatus,
        StoreError, TimeseriesBucket, TimeseriesInterval, percentile,
    },
};

const COLUMNS: &str = "id, tenant_id, provider, name, request_id, state_id, installation_id, \
     namespace_id, namespace_name, topic, rule_id, rule_when, drivers, headers, body, body_hash, \
     status, error_message, matched, latency_ms, created_at, updated_at";

fn map_row(row: &PgRow) -> Result<EventLogRecord, StoreError> {
    let provider: String = get_col(row, "provider")?;
    let status: String = get_col(row, "status")?;
    Ok(EventLogRecord {
        id: EventLogId::new(get_col(row, "id")?),
        tenant_id: TenantId::from(get_col::<String>(row, "tenant_id")?),
        provider: provider
            .parse::<ProviderKind>()
            .map_err(|_| StoreError::validation(format!("corrupt provider value `{provider}`")))?,
        name: get_col(row, "name")?,
        request_id: get_col(row, "request_id")?,
        state_id: get_col(row, "state_id")?,
        installation_id: get_col(row, "installation_id")?,
        namespace_id: get_col(row, "namespace_id")?,
        namespace_name: get_col(row, "namespace_name")?,
        topic: get_col(row, "topic")?,
        rule_id: get_col::<Option<uuid::Uuid>>(row, "rule_id")?.map(RuleId::new),
        rule_when: get_col(row, "rule_when")?,
        drivers: get_col(row, "drivers")?,
        headers: get_col(row, "headers")?,
        body: get_col(row, "body")?,
        body_hash: get_col(row, "body_hash")?,
        status: status
            .parse::<EventLogStatus>()
            .map_err(|_| StoreError::validation(format!("corrupt status value `{status}`")))?,
        error_message: get_col(row, "error_message")?,
        matched: get_col(row, "matched")?,
        latency_ms: get_col(row, "latency_ms")?,
        created_at: get_col(row, "created_at")?,
        updated_at: get_col(row, "updated_at")?,
    })
}

/// Start a builder with the tenant guard and every set filter field ANDed
/// on.
fn filtered(
    select: &str,
    tenant: &TenantId,
    filter: &EventLogFilter,
) -> sqlx::QueryBuilder<'static, sqlx::Postgres> {
    let mut query =
        sqlx::QueryBuilder::<sqlx::Postgres>::new(format!("{select} WHERE tenant_id = "));
    query.push_bind(tenant.as_str().to_string());
    if let Some(provider) = filter.provider {
        query.push(" AND provider = ").push_bind(provider.to_string());
    }
    if let Some(name) = &filter.name {
        query.push(" AND name = ").push_bind(name.clone());
    }
    if let Some(request_id) = &filter.request_id {
        query.push(" AND request_id = ").push_bind(request_id.clone());
    }
    if let Some(topic) = &filter.topic {
        query.push(" AND topic = ").push_bind(topic.clone());
    }
    if let Some(rule_id) = filter.rule_id {
        query.push(" AND rule_id = ").push_bind(*rule_id);
    }
    if let Some(installation_id) = &filter.installation_id {
        query
            .push(" AND installation_id = ")
            .push_bind(installation_id.clone());
    }
    if let Some(namespace_id) = &filter.namespace_id {
        query
            .push(" AND namespace_id = ")
            .push_bind(namespace_id.clone());
    }
    if let Some(status) = filter.status {
        query.push(" AND status = ").push_bind(status.to_string());
    }
    if let Some(matched) = filter.matched {
        query.push(" AND matched = ").push_bind(matched);
    }
    if let Some(start_time) = filter.start_time {
        query.push(" AND created_at >= ").push_bind(start_time);
    }
    if let Some(end_time) = filter.end_time {
        query.push(" AND created_at <= ").push_bind(end_time);
    }
    query
}

pub(super) async fn insert_batch(
    records: Vec<EventLogRecord>,
    pool: &PgPool,
) -> Result<(), StoreError> {
    if records.is_empty() {
        return Ok(());
    }
    let mut tx = pool
        .begin()
        .await
        .map_err(|e| e.into_store_backend_error())?;
    for record in &records {
        sqlx::query(&format!(
            "INSERT INTO event_log ({COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, \
                     $17, $18, $19, $20, $21, $22)"
        ))
        .bind(*record.id)
        .bind(record.tenant_id.as_str())
        .bind(record.provider.to_string())
        .bind(&record.name)
        .bind(&record.request_id)
        .bind(&record.state_id)
        .bind(&record.installation_id)
        .bind(&record.namespace_id)
        .bind(&record.namespace_name)
        .bind(&record.topic)
        .bind(record.rule_id.map(|r| *r))
        .bind(&record.rule_when)
        .bind(&record.drivers)
        .bind(&record.headers)
        .bind(&record.body)
        .bind(&record.body_hash)
        .bind(record.status.to_string())
        .bind(&record.error_message)
        .bind(record.matched)
        .bind(record.latency_ms)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| e.into_store_backend_error())?;
    }
    tx.commit().await.map_err(|e| e.into_store_backend_error())?;
    Ok(())
}

pub(super) async fn update_status(
    tenant: &TenantId,
    id: EventLogId,
    status: EventLogStatus,
    error_message: Option<String>,
    pool: &PgPool,
) -> Result<EventLogRecord, StoreError> {
    let mut tx = pool
        .begin()
        .await
        .map_err(|e| e.into_store_backend_error())?;
    let row = sqlx::query(&format!(
        "SELECT {COLUMNS} FROM event_log WHERE tenant_id = $1 AND id = $2 FOR UPDATE"
    ))
    .bind(tenant.as_str())
    .bind(*id)
    .fetch_optional(&mut *tx)
    .await
    .map_err(|e| e.into_store_backend_error())?
    .ok_or_else(|| StoreError::not_found("event log"))?;
    let current = map_row(&row)?;

    if current.status == status {
        // Terminal updates are idempotent.
        tx.rollback()
            .await
            .map_err(|e| e.into_store_backend_error())?;
        return Ok(current);
    }
    if !current.status.can_transition_to(status) {
        tx.rollback()
            .await
            .map_err(|e| e.into_store_backend_error())?;
        return Err(StoreError::IllegalTransition {
            from: current.status.to_string(),
            to: status.to_string(),
        });
    }

    let set_latency = status.is_terminal();
    let row = sqlx::query(&format!(
        "UPDATE event_log SET \
            status = $3, \
            error_message = COALESCE($4, error_message), \
            updated_at = now(), \
            latency_ms = CASE WHEN $5 THEN \
                (EXTRACT(EPOCH FROM (now() - created_at)) * 1000)::bigint \
                ELSE latency_ms END \
         WHERE tenant_id = $1 AND id = $2 \
         RETURNING {COLUMNS}"
    ))
    .bind(tenant.as_str())
    .bind(*id)
    .bind(status.to_string())
    .bind(error_message)
    .bind(set_latency)
    .fetch_one(&mut *tx)
    .await
    .map_err(|e| e.into_store_backend_error())?;
    tx.commit().await.map_err(|e| e.into_store_backend_error())?;
    map_row(&row)
}

pub(super) async fn get(
    tenant: &TenantId,
    id: EventLogId,
    pool: &PgPool,
) -> Result<Option<EventLogRecord>, StoreError> {
    let row = sqlx::query(&format!(
        "SELECT {COLUMNS} FROM event_log WHERE tenant_id = $1 AND id = $2"
    ))
    .bind(tenant.as_str())
    .bind(*id)
    .fetch_optional(pool)
    .await
    .map_err(|e| e.into_store_backend_error())?;
    row.as_ref().map(map_row).transpose()
}

pub(super) async fn list(
    tenant: &TenantId,
    filter: &EventLogFilter,
    limit: usize,
    offset: usize,
    pool: &PgPool,
) -> Result<Vec<EventLogRecord>, StoreError> {
    let mut query = filtered(
        &format!("SELECT {COLUMNS} FROM event_log"),
        tenant,
        filter,
    );
    query.push(" ORDER BY created_at DESC");
    query.push(" LIMIT ").push_bind(limit as i64);
    query.push(" OFFSET ").push_bind(offset as i64);
    let rows = query
        .build()
        .fetch_all(pool)
        .await
        .map_err(|e| e.into_store_backend_error())?;
    rows.iter().map(map_row).collect()
}

async fn count_group(
    tenant: &TenantId,
    filter: &EventLogFilter,
    key_expr: &str,
    pool: &PgPool,
) -> Result<Vec<CountBucket>, StoreError> {
    let mut query = filtered(
        &format!("SELECT {key_expr} AS key, COUNT(*) AS count FROM event_log"),
        tenant,
        filter,
    );
    query.push(format!(" GROUP BY {key_expr} ORDER BY count DESC, key"));
    let rows = query
        .build()
        .fetch_all(pool)
        .await
        .map_err(|e| e.into_store_backend_error())?;
    rows.iter()
        .map(|row| {
            Ok(CountBucket {
                key: get_col::<Option<String>>(row, "key")?.unwrap_or_default(),
                count: get_col(row, "count")?,
            })
        })
        .collect()
}

pub(super) async fn analytics(
    tenant: &TenantId,
    filter: &EventLogFilter,
    pool: &PgPool,
) -> Result<EventLogAnalytics, StoreError> {
    let mut totals = filtered(
        "SELECT COUNT(*) AS total, \
            COUNT(*) FILTER (WHERE matched) AS matched, \
            COUNT(*) FILTER (WHERE status = 'failed') AS failed, \
            COUNT(DISTINCT request_id) AS distinct_req \
         FROM event_log",
        tenant,
        filter,
    );
    let row = totals
        .build()
        .fetch_one(pool)
        .await
        .map_err(|e| e.into_store_backend_error())?;

    Ok(EventLogAnalytics {
        total: get_col(&row, "total")?,
        matched: get_col(&row, "matched")?,
        failed: get_col(&row, "failed")?,
        distinct_request_ids: get_col(&row, "distinct_req")?,
        by_provider: count_group(tenant, filter, "provider", pool).await?,
        by_event: count_group(tenant, filter, "name", pool).await?,
        by_topic: count_group(tenant, filter, "topic", pool).await?,
        by_rule: count_group(tenant, filter, "rule_id::text", pool).await?,
        by_installation: count_group(tenant, filter, "installation_id", pool).await?,
        by_namespace: count_group(tenant, filter, "namespace_name", pool).await?,
    })
}

pub(super) async fn timeseries(
    tenant: &TenantId,
    filter: &EventLogFilter,
    interval: TimeseriesInterval,
    pool: &PgPool,
) -> Result<Vec<TimeseriesBucket>, StoreError> {
    let trunc = match interval {
        TimeseriesInterval::Hour => "hour",
        TimeseriesInterval::Day => "day",
        TimeseriesInterval::Week => "week",
    };
    let mut query = filtered(
        &format!(
            "SELECT date_trunc('{trunc}', created_at) AS bucket_start, \
                COUNT(*) AS event_count, \
                COUNT(*) FILTER (WHERE matched) AS matched_count, \
                COUNT(*) FILTER (WHERE status = 'failed') AS failure_count, \
                COUNT(DISTINCT request_id) AS distinct_req \
             FROM event_log"
        ),
        tenant,
        filter,
    );
    query.push(" GROUP BY bucket_start ORDER BY bucket_start");
    let rows = query
        .build()
        .fetch_all(pool)
        .await
        .map_err(|e| e.into_store_backend_error())?;

    let mut populated: Vec<TimeseriesBucket> = rows
        .iter()
        .map(|row| {
            Ok(TimeseriesBucket {
                bucket_start: get_col(row, "bucket_start")?,
                event_count: get_col(row, "event_count")?,
                matched_count: get_col(row, "matched_count")?,
                failure_count: get_col(row, "failure_count")?,
                distinct_req: get_col(row, "distinct_req")?,
            })
        })
        .collect::<Result<_, StoreError>>()?;

    // Zero-fill so callers always see contiguous buckets. date_trunc keeps
    // every bucket on the same grid, so stepping by the interval lands on
    // the populated starts exactly.
    let Some(first) = populated.first().map(|b| b.bucket_start) else {
        return Ok(populated);
    };
    let last = populated.last().map_or(first, |b| b.bucket_start);
    let by_start: std::collections::BTreeMap<DateTime<Utc>, TimeseriesBucket> =
        populated.drain(..).map(|b| (b.bucket_start, b)).collect();

    let mut filled = Vec::new();
    let mut cursor = first;
    while cursor <= last {
        filled.push(by_start.get(&cursor).cloned().unwrap_or(TimeseriesBucket {
            bucket_start: cursor,
            event_count: 0,
            matched_count: 0,
            failure_count: 0,
            distinct_req: 0,
        }));
        cursor += interval.duration();
    }
    Ok(filled)
}

pub(super) async fn breakdown(
    tenant: &TenantId,
    query: &BreakdownQuery,
    pool: &PgPool,
) -> Result<BreakdownPage, StoreError> {
    let key_expr = match query.group_by {
        BreakdownGroupBy::Provider => "provider",
        BreakdownGroupBy::Event => "name",
        BreakdownGroupBy::Topic => "topic",
        BreakdownGroupBy::Rule => "rule_id::text",
        BreakdownGroupBy::Installation => "installation_id",
        BreakdownGroupBy::Namespace => "namespace_name",
    };
    let sort_expr = match query.sort_by {
        BreakdownSortBy::Events => "events",
        BreakdownSortBy::Matched => "matched",
        BreakdownSortBy::Failed => "failed",
    };
    let direction = if query.desc { "DESC" } else { "ASC" };
    let offset: i64 = query
        .page_token
        .as_deref()
        .and_then(|t| t.parse().ok())
        .unwrap_or(0);
    let page_size = query.page_size.max(1) as i64;

    let mut builder = filtered(
        &format!(
            "SELECT {key_expr} AS key, \
                COUNT(*) AS events, \
                COUNT(*) FILTER (WHERE matched) AS matched, \
                COUNT(*) FILTER (WHERE status = 'failed') AS failed, \
                array_agg(latency_ms ORDER BY latency_ms) \
                    FILTER (WHERE latency_ms IS NOT NULL) AS latencies \
             FROM event_log"
        ),
        tenant,
        &query.filter,
    );
    builder.push(format!(
        " GROUP BY {key_expr} ORDER BY {sort_expr} {direction}, key"
    ));
    builder.push(" LIMIT ").push_bind(page_size + 1);
    builder.push(" OFFSET ").push_bind(offset);
    let rows = builder
        .build()
        .fetch_all(pool)
        .await
        .map_err(|e| e.into_store_backend_error())?;

    let has_more = rows.len() as i64 > page_size;
    let mut out = Vec::with_capacity(rows.len().min(query.page_size));
    for row in rows.iter().take(query.page_size) {
        let latencies: Option<Vec<i64>> = get_col(row, "latencies")?;
        let latencies = latencies.unwrap_or_default();
        let (p50, p95, p99) = if query.include_latency {
            (
                percentile(&latencies, 0.50),
                percentile(&latencies, 0.95),
                percentile(&latencies, 0.99),
            )
        } else {
            (None, None, None)
        };
        out.push(BreakdownRow {
            key: get_col::<Option<String>>(row, "key")?.unwrap_or_default(),
            events: get_col(row, "events")?,
            matched: get_col(row, "matched")?,
            failed: get_col(row, "failed")?,
            p50_latency_ms: p50,
            p95_latency_ms: p95,
            p99_latency_ms: p99,
        });
    }
    Ok(BreakdownPage {
        rows: out,
        next_page_token: has_more.then(|| (offset + page_size).to_string()),
    })
}
