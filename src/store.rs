use crate::partition::{expired_months, missing_months, retention_cutoff, PartitionMonth, PARENT_TABLE};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, error, info};
use serde_json::Value;
use sqlx::types::Json;
use sqlx::{Pool, Postgres};
use std::collections::HashMap;

/// Receives collected values.
#[async_trait]
pub trait MetricSink: Send + Sync {
    async fn insert(
        &self,
        time: DateTime<Utc>,
        server_id: i32,
        metric_id: i32,
        value: &Value,
    ) -> Result<(), String>;
}

/// Creates and retires monthly partitions of `metric_value`.
#[async_trait]
pub trait PartitionHousekeeping: Send + Sync {
    async fn ensure_future_partitions(&self, months_forward: u32) -> Result<Vec<String>, String>;

    async fn retire_old_partitions(&self, retention_months: u32) -> Result<Vec<String>, String>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerEntry {
    pub name: String,
    pub environment: String,
    pub host: String,
    pub port: u16,
    pub ssl_mode: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricEntry {
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricGroupEntry {
    pub name: String,
    pub description: String,
    pub metrics: Vec<MetricEntry>,
}

const SCHEMA_SQL: [(&str, &str); 4] = [
    (
        "metric_group",
        r#"
        CREATE TABLE IF NOT EXISTS metric_group (
            metric_group_id SERIAL PRIMARY KEY,
            metric_group_name TEXT NOT NULL UNIQUE,
            description TEXT NOT NULL DEFAULT ''
        )
        "#,
    ),
    (
        "metric",
        r#"
        CREATE TABLE IF NOT EXISTS metric (
            metric_id SERIAL PRIMARY KEY,
            metric_group_id INTEGER NOT NULL REFERENCES metric_group (metric_group_id),
            metric_name TEXT NOT NULL UNIQUE,
            description TEXT NOT NULL DEFAULT ''
        )
        "#,
    ),
    (
        "server",
        r#"
        CREATE TABLE IF NOT EXISTS server (
            server_id SERIAL PRIMARY KEY,
            environment_name TEXT NOT NULL DEFAULT '',
            name TEXT NOT NULL UNIQUE,
            host TEXT NOT NULL,
            port INTEGER NOT NULL,
            timezone TEXT NOT NULL DEFAULT 'UTC',
            ssl_mode TEXT NOT NULL DEFAULT 'disable',
            is_active BOOLEAN NOT NULL DEFAULT TRUE
        )
        "#,
    ),
    (
        "metric_value",
        r#"
        CREATE TABLE IF NOT EXISTS metric_value (
            time TIMESTAMPTZ NOT NULL,
            server_id INTEGER NOT NULL,
            metric_id INTEGER NOT NULL,
            metric_value JSONB NOT NULL,
            PRIMARY KEY (server_id, metric_id, time)
        ) PARTITION BY RANGE (time)
        "#,
    ),
];

const UPSERT_METRIC_GROUP_SQL: &str = r#"
    INSERT INTO metric_group (metric_group_name, description)
    VALUES ($1, $2)
    ON CONFLICT (metric_group_name) DO UPDATE
    SET description = excluded.description
    RETURNING metric_group_id
"#;

const UPSERT_METRIC_SQL: &str = r#"
    INSERT INTO metric (metric_group_id, metric_name, description)
    VALUES ($1, $2, $3)
    ON CONFLICT (metric_name) DO UPDATE
    SET metric_group_id = excluded.metric_group_id,
        description = excluded.description
    RETURNING metric_id
"#;

const UPSERT_SERVER_SQL: &str = r#"
    INSERT INTO server (environment_name, name, host, port, timezone, ssl_mode, is_active)
    VALUES ($1, $2, $3, $4, 'UTC', $5, TRUE)
    ON CONFLICT (name) DO UPDATE
    SET environment_name = excluded.environment_name,
        host = excluded.host,
        port = excluded.port,
        timezone = excluded.timezone,
        ssl_mode = excluded.ssl_mode
    RETURNING server_id
"#;

const LIST_PARTITIONS_SQL: &str = r#"
    SELECT child.relname::text
    FROM pg_inherits i
    JOIN pg_class child ON child.oid = i.inhrelid
    JOIN pg_class parent ON parent.oid = i.inhparent
    WHERE parent.relname = $1
    ORDER BY child.relname
"#;

/// The central time-series store.
#[derive(Clone)]
pub struct PgMetricStore {
    pool: Pool<Postgres>,
}

impl PgMetricStore {
    /// Wraps `pool` and creates the schema if it is missing.
    pub async fn new(pool: Pool<Postgres>) -> Result<Self, String> {
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    pub async fn init_schema(&self) -> Result<(), String> {
        for (table, ddl) in SCHEMA_SQL {
            sqlx::query(ddl)
                .execute(&self.pool)
                .await
                .map_err(|e| format!("Failed to create table {}: {}", table, e))?;
        }
        debug!("Metrics store schema is in place");
        Ok(())
    }

    pub fn get_pool(&self) -> &Pool<Postgres> {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Names of the `metric_value` partitions that follow the monthly naming
    /// scheme, in name order.
    pub async fn list_partitions(&self) -> Result<Vec<String>, String> {
        let names: Vec<String> = sqlx::query_scalar(LIST_PARTITIONS_SQL)
            .bind(PARENT_TABLE)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| format!("Failed to list partitions: {}", e))?;

        Ok(names
            .into_iter()
            .filter(|name| PartitionMonth::from_table_name(name).is_some())
            .collect())
    }

    /// Upserts groups and their metrics in one transaction.
    pub async fn sync_metric_dictionary(
        &self,
        groups: &[MetricGroupEntry],
    ) -> Result<HashMap<String, i32>, String> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| format!("Failed to begin transaction: {}", e))?;

        let mut metric_ids = HashMap::new();
        for group in groups {
            debug!("Upserting metric group: {}", group.name);
            let group_id: i32 = sqlx::query_scalar(UPSERT_METRIC_GROUP_SQL)
                .bind(&group.name)
                .bind(&group.description)
                .fetch_one(&mut *tx)
                .await
                .map_err(|e| format!("Failed to upsert metric group '{}': {}", group.name, e))?;

            for metric in &group.metrics {
                let metric_id: i32 = sqlx::query_scalar(UPSERT_METRIC_SQL)
                    .bind(group_id)
                    .bind(&metric.name)
                    .bind(&metric.description)
                    .fetch_one(&mut *tx)
                    .await
                    .map_err(|e| {
                        format!(
                            "Failed to upsert metric '{}' of group '{}': {}",
                            metric.name, group.name, e
                        )
                    })?;
                metric_ids.insert(metric.name.clone(), metric_id);
            }
        }

        tx.commit()
            .await
            .map_err(|e| format!("Failed to commit metric dictionary: {}", e))?;

        info!(
            "Metric dictionary synchronised ({} groups, {} metrics)",
            groups.len(),
            metric_ids.len()
        );
        Ok(metric_ids)
    }

    pub async fn sync_servers(&self, servers: &[ServerEntry]) -> Result<HashMap<String, i32>, String> {
        let mut server_ids = HashMap::new();
        for server in servers {
            let server_id: i32 = sqlx::query_scalar(UPSERT_SERVER_SQL)
                .bind(&server.environment)
                .bind(&server.name)
                .bind(&server.host)
                .bind(server.port as i32)
                .bind(&server.ssl_mode)
                .fetch_one(&self.pool)
                .await
                .map_err(|e| format!("Failed to save server '{}': {}", server.name, e))?;
            server_ids.insert(server.name.clone(), server_id);
        }
        info!("Server registry synchronised ({} servers)", server_ids.len());
        Ok(server_ids)
    }
}

#[async_trait]
impl MetricSink for PgMetricStore {
    async fn insert(
        &self,
        time: DateTime<Utc>,
        server_id: i32,
        metric_id: i32,
        value: &Value,
    ) -> Result<(), String> {
        sqlx::query(
            r#"
            INSERT INTO metric_value (time, server_id, metric_id, metric_value)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(time)
        .bind(server_id)
        .bind(metric_id)
        .bind(Json(value))
        .execute(&self.pool)
        .await
        .map_err(|e| {
            format!(
                "Failed to insert metric value (server_id={}, metric_id={}): {}",
                server_id, metric_id, e
            )
        })?;
        Ok(())
    }
}

#[async_trait]
impl PartitionHousekeeping for PgMetricStore {
    async fn ensure_future_partitions(&self, months_forward: u32) -> Result<Vec<String>, String> {
        let wanted = PartitionMonth::current().range_forward(months_forward);
        let existing = self.list_partitions().await?;

        let mut created = Vec::new();
        for month in missing_months(&wanted, &existing) {
            sqlx::query(&month.create_table_sql())
                .execute(&self.pool)
                .await
                .map_err(|e| format!("Failed to create partition {}: {}", month.table_name(), e))?;
            info!("Created partition {} for {}", month.table_name(), month);
            created.push(month.table_name());
        }
        Ok(created)
    }

    /// Drops every expired partition it can, oldest first, and reports the
    /// ones that could not be dropped as an error.
    async fn retire_old_partitions(&self, retention_months: u32) -> Result<Vec<String>, String> {
        let cutoff = retention_cutoff(PartitionMonth::current(), retention_months);
        let existing = self.list_partitions().await?;

        let mut dropped = Vec::new();
        let mut failed = Vec::new();
        for month in expired_months(&existing, cutoff) {
            match sqlx::query(&month.drop_table_sql()).execute(&self.pool).await {
                Ok(_) => {
                    info!("Dropped expired partition {}", month.table_name());
                    dropped.push(month.table_name());
                }
                Err(e) => {
                    error!("Failed to drop partition {}: {}", month.table_name(), e);
                    failed.push(month.table_name());
                }
            }
        }

        if failed.is_empty() {
            Ok(dropped)
        } else {
            Err(format!(
                "Failed to drop {} expired partition(s): {}",
                failed.len(),
                failed.join(", ")
            ))
        }
    }
}
