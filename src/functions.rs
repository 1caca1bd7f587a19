use crate::execution::{fetch_metric_value, CollectError, MetricTask};
use crate::models::BuiltinFunction;
use log::{error, warn};
use serde_json::json;
use tokio_util::sync::CancellationToken;

pub const UPTIME_SQL: &str = "SELECT jsonb_build_object('value', EXTRACT(EPOCH FROM (now() - pg_postmaster_start_time()))) AS metric_value";

pub async fn run(
    function: BuiltinFunction,
    task: &MetricTask,
    cancel: &CancellationToken,
) -> Result<(), CollectError> {
    match function {
        BuiltinFunction::PostgresUptime => collect_postgres_uptime(task, cancel).await,
    }
}

/// Records server uptime in seconds. An unreachable server is recorded as
/// `{"value": 0}` and the attempt still counts as a success.
async fn collect_postgres_uptime(
    task: &MetricTask,
    cancel: &CancellationToken,
) -> Result<(), CollectError> {
    let spec = task.spec();
    match fetch_metric_value(task.source(), UPTIME_SQL, spec.query_timeout, cancel).await {
        Ok(Some(value)) => task.store(&value).await,
        Ok(None) => Ok(()),
        Err(CollectError::Cancelled) => Err(CollectError::Cancelled),
        Err(err) => {
            warn!(
                "{}: failed to collect PostgreSQL uptime, recording 0 instead: {}",
                spec.label(),
                err
            );
            task.store(&json!({ "value": 0 })).await.map_err(|store_err| {
                error!(
                    "{}: failed to record zero uptime after probe failure: {}",
                    spec.label(),
                    store_err
                );
                store_err
            })
        }
    }
}

#[cfg(test)]
mod tests;
