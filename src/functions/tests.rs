use super::*;
use crate::models::{Collection, SchedulePolicy};
use crate::testing::{json_result, sql_task_spec, FakeSource, MemorySink};
use std::sync::Arc;
use std::time::Duration;

fn uptime_task(source: Arc<FakeSource>, sink: Arc<MemorySink>) -> MetricTask {
    let mut spec = sql_task_spec(
        SchedulePolicy {
            interval: Duration::from_secs(60),
            max_retries: 3,
            retry_delay: Duration::from_secs(5),
        },
        Duration::from_secs(5),
    );
    spec.metric_name = "uptime".to_string();
    spec.collection = Collection::Function(BuiltinFunction::PostgresUptime);
    MetricTask::new(spec, source, sink)
}

#[tokio::test]
async fn test_uptime_stores_probe_result() {
    let source = Arc::new(FakeSource::always(Ok(json_result(Some(json!({"value": 3600.5}))))));
    let sink = Arc::new(MemorySink::default());
    let task = uptime_task(source.clone(), sink.clone());

    task.collect(&CancellationToken::new()).await.unwrap();

    assert_eq!(source.scripts(), vec![UPTIME_SQL.to_string()]);
    let rows = sink.rows();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].value, json!({"value": 3600.5}));
}

#[tokio::test]
async fn test_uptime_records_zero_when_server_is_down() {
    let source = Arc::new(FakeSource::always(Err(CollectError::Query(
        "connection refused".to_string(),
    ))));
    let sink = Arc::new(MemorySink::default());
    let task = uptime_task(source, sink.clone());

    task.collect(&CancellationToken::new()).await.unwrap();

    let rows = sink.rows();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].value, json!({"value": 0}));
}

#[tokio::test(start_paused = true)]
async fn test_uptime_records_zero_on_timeout() {
    let source = Arc::new(
        FakeSource::always(Ok(json_result(Some(json!({"value": 1}))))).with_delay(Duration::from_secs(30)),
    );
    let sink = Arc::new(MemorySink::default());
    let task = uptime_task(source, sink.clone());

    task.collect(&CancellationToken::new()).await.unwrap();
    assert_eq!(sink.rows()[0].value, json!({"value": 0}));
}

#[tokio::test]
async fn test_uptime_reports_store_failure_for_sentinel() {
    let source = Arc::new(FakeSource::always(Err(CollectError::Query(
        "connection refused".to_string(),
    ))));
    let sink = Arc::new(MemorySink::failing(1));
    let task = uptime_task(source, sink.clone());

    let err = task.collect(&CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, CollectError::Store(_)));
    assert!(sink.rows().is_empty());
}

#[tokio::test]
async fn test_uptime_does_not_record_when_cancelled() {
    let source = Arc::new(FakeSource::always(Ok(json_result(Some(json!({"value": 1}))))));
    let sink = Arc::new(MemorySink::default());
    let task = uptime_task(source, sink.clone());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = task.collect(&cancel).await.unwrap_err();
    assert_eq!(err, CollectError::Cancelled);
    assert_eq!(sink.attempts(), 0);
}
