//! In-memory stand-ins for the monitored server and the store.

use crate::execution::{CollectError, MetricSource, ScriptColumn, ScriptResult};
use crate::models::{Collection, SchedulePolicy, TaskSpec};
use crate::store::MetricSink;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub(crate) fn json_result(value: Option<Value>) -> ScriptResult {
    ScriptResult {
        columns: vec![ScriptColumn {
            name: "metric_value".to_string(),
            type_name: "JSONB".to_string(),
        }],
        rows: vec![vec![value]],
    }
}

pub(crate) fn sql_task_spec(policy: SchedulePolicy, query_timeout: Duration) -> TaskSpec {
    TaskSpec {
        server_name: "pg-main".to_string(),
        metric_name: "active_connections".to_string(),
        server_id: 7,
        metric_id: 42,
        collection: Collection::Sql {
            script_path: PathBuf::from("sql/active_connections.sql"),
            script: Arc::from("SELECT jsonb_build_object('value', count(*)) FROM pg_stat_activity"),
        },
        query_timeout,
        policy,
    }
}

pub(crate) struct FakeSource {
    responses: Mutex<VecDeque<Result<ScriptResult, CollectError>>>,
    fallback: Result<ScriptResult, CollectError>,
    delay: Option<Duration>,
    calls: AtomicUsize,
    scripts: Mutex<Vec<String>>,
}

impl FakeSource {
    pub(crate) fn always(result: Result<ScriptResult, CollectError>) -> Self {
        Self::sequence(Vec::new(), result)
    }

    /// Replies with `responses` in order, then with `fallback` forever.
    pub(crate) fn sequence(
        responses: Vec<Result<ScriptResult, CollectError>>,
        fallback: Result<ScriptResult, CollectError>,
    ) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            fallback,
            delay: None,
            calls: AtomicUsize::new(0),
            scripts: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn scripts(&self) -> Vec<String> {
        self.scripts.lock().unwrap().clone()
    }
}

#[async_trait]
impl MetricSource for FakeSource {
    async fn run_script(&self, script: &str) -> Result<ScriptResult, CollectError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.scripts.lock().unwrap().push(script.to_string());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = self.responses.lock().unwrap().pop_front();
        next.unwrap_or_else(|| self.fallback.clone())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct StoredValue {
    pub time: DateTime<Utc>,
    pub server_id: i32,
    pub metric_id: i32,
    pub value: Value,
}

#[derive(Default)]
pub(crate) struct MemorySink {
    rows: Mutex<Vec<StoredValue>>,
    failures_left: AtomicUsize,
    attempts: AtomicUsize,
}

impl MemorySink {
    /// Rejects the first `count` inserts.
    pub(crate) fn failing(count: usize) -> Self {
        let sink = Self::default();
        sink.failures_left.store(count, Ordering::SeqCst);
        sink
    }

    pub(crate) fn rows(&self) -> Vec<StoredValue> {
        self.rows.lock().unwrap().clone()
    }

    pub(crate) fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MetricSink for MemorySink {
    async fn insert(
        &self,
        time: DateTime<Utc>,
        server_id: i32,
        metric_id: i32,
        value: &Value,
    ) -> Result<(), String> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err("connection reset by peer".to_string());
        }
        self.rows.lock().unwrap().push(StoredValue {
            time,
            server_id,
            metric_id,
            value: value.clone(),
        });
        Ok(())
    }
}
