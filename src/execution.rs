use crate::models::{Collection, TaskSpec};
use crate::scheduler::ScheduledTask;
use crate::store::MetricSink;
use async_trait::async_trait;
use chrono::Utc;
use log::debug;
use serde_json::Value;
use futures::TryStreamExt;
use sqlx::postgres::PgRow;
use sqlx::{Column, Either, PgPool, Row, TypeInfo};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Why a single collection attempt produced no value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CollectError {
    #[error("expected exactly 1 row, but the query returned no rows")]
    NoRows,
    #[error("expected exactly 1 row, but the query returned {0} rows")]
    TooManyRows(usize),
    #[error("expected exactly 1 column, but got {0} columns")]
    WrongColumnCount(usize),
    #[error("expected column type 'json' or 'jsonb', but got '{0}'")]
    NotJson(String),
    #[error("query failed: {0}")]
    Query(String),
    #[error("query timed out after {0:?}")]
    Timeout(Duration),
    #[error("failed to store metric value: {0}")]
    Store(String),
    #[error("collection function '{0}' is not implemented")]
    UnknownFunction(String),
    #[error("collection cancelled")]
    Cancelled,
}

impl CollectError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::UnknownFunction(_) | Self::Cancelled)
    }

    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            Self::NoRows | Self::TooManyRows(_) | Self::WrongColumnCount(_) | Self::NotJson(_)
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScriptColumn {
    pub name: String,
    pub type_name: String,
}

/// Rows returned by a collection script. Only JSON-typed cells are decoded;
/// every other cell is `None`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScriptResult {
    pub columns: Vec<ScriptColumn>,
    pub rows: Vec<Vec<Option<Value>>>,
}

pub fn is_json_type(type_name: &str) -> bool {
    type_name.eq_ignore_ascii_case("json") || type_name.eq_ignore_ascii_case("jsonb")
}

/// Enforces the one-row, one-JSON-column contract.
///
/// `Ok(None)` means the single cell was SQL NULL: nothing to store this cycle.
pub fn single_json_value(result: ScriptResult) -> Result<Option<Value>, CollectError> {
    // Drivers only report column metadata alongside a row.
    if result.rows.is_empty() && result.columns.is_empty() {
        return Err(CollectError::NoRows);
    }
    if result.columns.len() != 1 {
        return Err(CollectError::WrongColumnCount(result.columns.len()));
    }
    let type_name = &result.columns[0].type_name;
    if !is_json_type(type_name) {
        return Err(CollectError::NotJson(type_name.to_lowercase()));
    }

    let mut rows = result.rows.into_iter();
    let first = rows.next().ok_or(CollectError::NoRows)?;
    let extra = rows.count();
    if extra > 0 {
        return Err(CollectError::TooManyRows(extra + 1));
    }

    Ok(first.into_iter().next().flatten())
}

/// A monitored server that can run collection scripts.
#[async_trait]
pub trait MetricSource: Send + Sync {
    async fn run_script(&self, script: &str) -> Result<ScriptResult, CollectError>;
}

#[derive(Clone)]
pub struct PgMetricSource {
    pool: PgPool,
}

impl PgMetricSource {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MetricSource for PgMetricSource {
    /// Runs `script` verbatim, so it may hold several statements. Only the
    /// rows of the last statement that returned any are checked against the
    /// contract.
    async fn run_script(&self, script: &str) -> Result<ScriptResult, CollectError> {
        let items: Vec<Either<_, PgRow>> = sqlx::raw_sql(script)
            .fetch_many(&self.pool)
            .try_collect()
            .await
            .map_err(|e| CollectError::Query(e.to_string()))?;
        script_result_from_rows(&last_result_set(items))
    }
}

/// Splits a multi-statement stream at each statement result and keeps the
/// rows of the last statement that produced rows.
pub fn last_result_set<Q, R>(items: Vec<Either<Q, R>>) -> Vec<R> {
    let mut last = Vec::new();
    let mut current = Vec::new();
    for item in items {
        match item {
            Either::Right(row) => current.push(row),
            Either::Left(_) => {
                if !current.is_empty() {
                    last = std::mem::take(&mut current);
                }
            }
        }
    }
    if current.is_empty() {
        last
    } else {
        current
    }
}

fn script_result_from_rows(rows: &[PgRow]) -> Result<ScriptResult, CollectError> {
    let columns: Vec<ScriptColumn> = rows
        .first()
        .map(|row| {
            row.columns()
                .iter()
                .map(|c| ScriptColumn {
                    name: c.name().to_string(),
                    type_name: c.type_info().name().to_string(),
                })
                .collect()
        })
        .unwrap_or_default();

    let mut decoded = Vec::with_capacity(rows.len());
    for row in rows {
        let mut cells = Vec::with_capacity(columns.len());
        for (i, column) in columns.iter().enumerate() {
            if !is_json_type(&column.type_name) {
                cells.push(None);
                continue;
            }
            let cell = row.try_get::<Option<Value>, _>(i).map_err(|e| {
                CollectError::Query(format!("failed to decode column '{}': {}", column.name, e))
            })?;
            cells.push(cell);
        }
        decoded.push(cells);
    }

    Ok(ScriptResult {
        columns,
        rows: decoded,
    })
}

/// Runs `script` under the per-attempt deadline and the cycle's cancellation.
pub async fn fetch_metric_value(
    source: &dyn MetricSource,
    script: &str,
    query_timeout: Duration,
    cancel: &CancellationToken,
) -> Result<Option<Value>, CollectError> {
    let result = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(CollectError::Cancelled),
        outcome = tokio::time::timeout(query_timeout, source.run_script(script)) => {
            outcome.map_err(|_| CollectError::Timeout(query_timeout))??
        }
    };
    single_json_value(result)
}

/// A resolved task bound to its monitored server and to the store.
pub struct MetricTask {
    spec: TaskSpec,
    source: Arc<dyn MetricSource>,
    sink: Arc<dyn MetricSink>,
}

impl MetricTask {
    pub fn new(spec: TaskSpec, source: Arc<dyn MetricSource>, sink: Arc<dyn MetricSink>) -> Self {
        Self { spec, source, sink }
    }

    pub fn spec(&self) -> &TaskSpec {
        &self.spec
    }

    pub(crate) fn source(&self) -> &dyn MetricSource {
        self.source.as_ref()
    }

    /// One collection attempt: zero or one stored value.
    pub async fn collect(&self, cancel: &CancellationToken) -> Result<(), CollectError> {
        match &self.spec.collection {
            Collection::Sql { script, .. } => {
                let value =
                    fetch_metric_value(self.source(), script, self.spec.query_timeout, cancel)
                        .await?;
                match value {
                    Some(value) => self.store(&value).await,
                    None => {
                        debug!("{}: script returned NULL, nothing stored", self.spec.label());
                        Ok(())
                    }
                }
            }
            Collection::Function(function) => crate::functions::run(*function, self, cancel).await,
        }
    }

    pub(crate) async fn store(&self, value: &Value) -> Result<(), CollectError> {
        self.sink
            .insert(Utc::now(), self.spec.server_id, self.spec.metric_id, value)
            .await
            .map_err(CollectError::Store)
    }
}

#[async_trait]
impl ScheduledTask for MetricTask {
    fn name(&self) -> String {
        self.spec.label()
    }

    async fn run(&self, cancel: &CancellationToken) -> Result<(), CollectError> {
        self.collect(cancel).await
    }
}
