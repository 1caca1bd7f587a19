use crate::execution::CollectError;
use crate::scheduler::ScheduledTask;
use crate::store::PartitionHousekeeping;
use async_trait::async_trait;
use log::{debug, info};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub created: Vec<String>,
    pub dropped: Vec<String>,
}

/// Keeps `months_ahead` future partitions in place and drops the ones older
/// than the retention window.
pub struct PartitionMaintenance {
    store: Arc<dyn PartitionHousekeeping>,
    months_ahead: u32,
    /// `None` keeps partitions forever.
    retention_months: Option<u32>,
}

impl PartitionMaintenance {
    pub fn new(
        store: Arc<dyn PartitionHousekeeping>,
        months_ahead: u32,
        retention_months: Option<u32>,
    ) -> Self {
        Self {
            store,
            months_ahead,
            retention_months,
        }
    }

    pub async fn run_once(&self) -> Result<MaintenanceReport, String> {
        let created = self.store.ensure_future_partitions(self.months_ahead).await?;
        let dropped = match self.retention_months {
            Some(months) => self.store.retire_old_partitions(months).await?,
            None => Vec::new(),
        };

        if created.is_empty() && dropped.is_empty() {
            debug!("Partition maintenance: nothing to do");
        } else {
            info!(
                "Partition maintenance: created {} partition(s), dropped {}",
                created.len(),
                dropped.len()
            );
        }
        Ok(MaintenanceReport { created, dropped })
    }
}

#[async_trait]
impl ScheduledTask for PartitionMaintenance {
    fn name(&self) -> String {
        "partition-maintenance".to_string()
    }

    async fn run(&self, cancel: &CancellationToken) -> Result<(), CollectError> {
        if cancel.is_cancelled() {
            return Err(CollectError::Cancelled);
        }
        self.run_once().await.map(|_| ()).map_err(CollectError::Store)
    }
}

#[cfg(test)]
mod tests;
