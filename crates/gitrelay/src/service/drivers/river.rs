//! River job-queue backend: inserts a job row into a Postgres-backed
//! queue table for each published envelope.

use async_trait::async_trait;
use sqlx::PgPool;

use super::BrokerPublisher;
use crate::service::Envelope;

const DEFAULT_TABLE: &str = "river_job";
const DEFAULT_QUEUE: &str = "default";
const DEFAULT_MAX_ATTEMPTS: i32 = 25;

#[derive(Debug, serde::Deserialize)]
struct RiverConfig {
    dsn: String,
    /// Job kind consumers register a worker for.
    kind: String,
    queue: Option<String>,
    table: Option<String>,
    max_attempts: Option<i32>,
}

#[derive(Debug)]
pub struct RiverPublisher {
    pool: PgPool,
    kind: String,
    queue: String,
    table: String,
    max_attempts: i32,
}

impl RiverPublisher {
    pub async fn connect(config: &serde_json::Value) -> anyhow::Result<Self> {
        let parsed: RiverConfig = serde_json::from_value(config.clone())
            .map_err(|e| anyhow::anyhow!("invalid riverqueue driver config: {e}"))?;
        let table = parsed.table.unwrap_or_else(|| DEFAULT_TABLE.to_string());
        if !table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            anyhow::bail!("riverqueue table name must be alphanumeric");
        }
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(4)
            .connect(&parsed.dsn)
            .await?;
        Ok(Self {
            pool,
            kind: parsed.kind,
            queue: parsed.queue.unwrap_or_else(|| DEFAULT_QUEUE.to_string()),
            table,
            max_attempts: parsed.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS),
        })
    }
}

#[async_trait]
impl BrokerPublisher for RiverPublisher {
    fn name(&self) -> &'static str {
        "riverqueue"
    }

    async fn publish(&self, topic: &str, envelope: &Envelope) -> anyhow::Result<()> {
        let args = serde_json::to_value(envelope)?;
        let metadata = serde_json::json!({"topic": topic, "tenant_id": envelope.tenant_id});
        let sql = format!(
            "INSERT INTO {table}
                (args, kind, max_attempts, priority, queue, scheduled_at, state, metadata)
             VALUES ($1, $2, $3, 1, $4, now(), 'available', $5)",
            table = self.table
        );
        sqlx::query(&sql)
            .bind(args)
            .bind(&self.kind)
            .bind(self.max_attempts)
            .bind(&self.queue)
            .bind(metadata)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.pool.close().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_requires_kind() {
        let parsed: Result<RiverConfig, _> =
            serde_json::from_value(serde_json::json!({"dsn": "postgres://x"}));
        assert!(parsed.is_err());
        let parsed: Result<RiverConfig, _> = serde_json::from_value(
            serde_json::json!({"dsn": "postgres://x", "kind": "gitrelay_event"}),
        );
        assert!(parsed.is_ok());
    }
}
