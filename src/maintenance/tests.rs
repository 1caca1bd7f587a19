use super::*;
use std::sync::Mutex;

#[derive(Default)]
struct FakeHousekeeping {
    calls: Mutex<Vec<String>>,
    fail_ensure: bool,
}

#[async_trait]
impl PartitionHousekeeping for FakeHousekeeping {
    async fn ensure_future_partitions(&self, months_forward: u32) -> Result<Vec<String>, String> {
        self.calls.lock().unwrap().push(format!("ensure:{months_forward}"));
        if self.fail_ensure {
            return Err("permission denied for schema public".to_string());
        }
        Ok(vec!["metric_value_y2026m11".to_string()])
    }

    async fn retire_old_partitions(&self, retention_months: u32) -> Result<Vec<String>, String> {
        self.calls.lock().unwrap().push(format!("retire:{retention_months}"));
        Ok(vec!["metric_value_y2025m09".to_string()])
    }
}

#[tokio::test]
async fn test_run_once_creates_then_retires() {
    let store = Arc::new(FakeHousekeeping::default());
    let maintenance = PartitionMaintenance::new(store.clone(), 3, Some(12));

    let report = maintenance.run_once().await.unwrap();

    assert_eq!(*store.calls.lock().unwrap(), vec!["ensure:3", "retire:12"]);
    assert_eq!(report.created, vec!["metric_value_y2026m11"]);
    assert_eq!(report.dropped, vec!["metric_value_y2025m09"]);
}

#[tokio::test]
async fn test_run_once_without_retention_never_drops() {
    let store = Arc::new(FakeHousekeeping::default());
    let maintenance = PartitionMaintenance::new(store.clone(), 2, None);

    let report = maintenance.run_once().await.unwrap();

    assert_eq!(*store.calls.lock().unwrap(), vec!["ensure:2"]);
    assert!(report.dropped.is_empty());
}

#[tokio::test]
async fn test_failure_maps_to_retryable_store_error() {
    let store = Arc::new(FakeHousekeeping {
        fail_ensure: true,
        ..Default::default()
    });
    let maintenance = PartitionMaintenance::new(store.clone(), 3, Some(12));

    let err = maintenance.run(&CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, CollectError::Store(_)));
    assert!(err.is_retryable());
    // Retirement is not attempted after a failed creation pass.
    assert_eq!(*store.calls.lock().unwrap(), vec!["ensure:3"]);
}
