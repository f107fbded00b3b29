//! SQL broker backend: appends envelopes to a table, initializing the
//! schema on demand. Supports the postgres and mysql dialects.

use std::sync::Once;

use async_trait::async_trait;
use base64::Engine as _;
use sqlx::AnyPool;

use super::BrokerPublisher;
use crate::{SqlDialect, service::Envelope};

const DEFAULT_TABLE: &str = "gitrelay_events";

static INSTALL_DRIVERS: Once = Once::new();

#[derive(Debug, serde::Deserialize)]
struct SqlConfig {
    dsn: String,
    dialect: SqlDialect,
    table: Option<String>,
}

#[derive(Debug)]
pub struct SqlPublisher {
    pool: AnyPool,
    dialect: SqlDialect,
    table: String,
}

impl SqlPublisher {
    pub async fn connect(config: &serde_json::Value) -> anyhow::Result<Self> {
        let parsed: SqlConfig = serde_json::from_value(config.clone())
            .map_err(|e| anyhow::anyhow!("invalid sql driver config: {e}"))?;
        let table = parsed.table.unwrap_or_else(|| DEFAULT_TABLE.to_string());
        if !table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            anyhow::bail!("sql driver table name must be alphanumeric");
        }

        INSTALL_DRIVERS.call_once(sqlx::any::install_default_drivers);
        let pool = sqlx::any::AnyPoolOptions::new()
            .max_connections(4)
            .connect(&parsed.dsn)
            .await?;

        let publisher = Self {
            pool,
            dialect: parsed.dialect,
            table,
        };
        publisher.init_schema().await?;
        Ok(publisher)
    }

    async fn init_schema(&self) -> anyhow::Result<()> {
        let ddl = match self.dialect {
            SqlDialect::Postgres => format!(
                "CREATE TABLE IF NOT EXISTS {table} (
                    id VARCHAR(36) PRIMARY KEY,
                    topic TEXT NOT NULL,
                    envelope TEXT NOT NULL,
                    payload TEXT NOT NULL,
                    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
                )",
                table = self.table
            ),
            SqlDialect::Mysql => format!(
                "CREATE TABLE IF NOT EXISTS {table} (
                    id VARCHAR(36) PRIMARY KEY,
                    topic TEXT NOT NULL,
                    envelope TEXT NOT NULL,
                    payload TEXT NOT NULL,
                    created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
                )",
                table = self.table
            ),
        };
        sqlx::query(&ddl).execute(&self.pool).await?;
        Ok(())
    }

    fn insert_sql(&self) -> String {
        match self.dialect {
            SqlDialect::Postgres => format!(
                "INSERT INTO {table} (id, topic, envelope, payload) VALUES ($1, $2, $3, $4)",
                table = self.table
            ),
            SqlDialect::Mysql => format!(
                "INSERT INTO {table} (id, topic, envelope, payload) VALUES (?, ?, ?, ?)",
                table = self.table
            ),
        }
    }
}

#[async_trait]
impl BrokerPublisher for SqlPublisher {
    fn name(&self) -> &'static str {
        "sql"
    }

    async fn publish(&self, topic: &str, envelope: &Envelope) -> anyhow::Result<()> {
        let envelope_json = serde_json::to_string(envelope)?;
        let payload_b64 = base64::engine::general_purpose::STANDARD.encode(&envelope.payload);
        sqlx::query(&self.insert_sql())
            .bind(uuid::Uuid::new_v4().to_string())
            .bind(topic)
            .bind(envelope_json)
            .bind(payload_b64)
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
    fn config_requires_dialect() {
        let parsed: Result<SqlConfig, _> =
            serde_json::from_value(serde_json::json!({"dsn": "postgres://x"}));
        assert!(parsed.is_err());
        let parsed: Result<SqlConfig, _> = serde_json::from_value(
            serde_json::json!({"dsn": "postgres://x", "dialect": "postgres"}),
        );
        assert!(parsed.is_ok());
    }
}
