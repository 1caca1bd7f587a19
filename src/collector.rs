use crate::execution::MetricTask;
use crate::scheduler::{OverlapPolicy, SchedulerError, TaskScheduler};
use futures::future::join_all;
use log::{error, info};
use std::sync::Arc;

pub struct ScheduledMetric {
    pub server_name: String,
    pub metric_name: String,
    pub scheduler: TaskScheduler,
}

/// Owns one scheduler per (server, metric) pair.
pub struct Collector {
    metrics: Vec<ScheduledMetric>,
}

impl Collector {
    pub fn new(tasks: Vec<MetricTask>, overlap: OverlapPolicy) -> Self {
        let metrics = tasks
            .into_iter()
            .map(|task| {
                let spec = task.spec();
                let server_name = spec.server_name.clone();
                let metric_name = spec.metric_name.clone();
                let policy = spec.policy;
                ScheduledMetric {
                    server_name,
                    metric_name,
                    scheduler: TaskScheduler::with_overlap_policy(Arc::new(task), policy, overlap),
                }
            })
            .collect();
        Self { metrics }
    }

    /// Starts every scheduler in order. Stops at the first failure; the ones
    /// already started keep running.
    pub fn start(&self) -> Result<(), SchedulerError> {
        for metric in &self.metrics {
            if let Err(err) = metric.scheduler.start() {
                error!(
                    "Failed to start collection of '{}' on '{}': {}",
                    metric.metric_name, metric.server_name, err
                );
                return Err(err);
            }
        }
        info!("Collector started {} scheduler(s)", self.metrics.len());
        Ok(())
    }

    pub async fn stop(&self) {
        join_all(self.metrics.iter().map(|metric| metric.scheduler.stop())).await;
        info!("Collector stopped {} scheduler(s)", self.metrics.len());
    }

    pub fn schedulers(&self) -> &[ScheduledMetric] {
        &self.metrics
    }

    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }
}
