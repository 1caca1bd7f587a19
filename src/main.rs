use anyhow::{anyhow, Context, Result};
use clap::Parser;
use log::{debug, error, info, warn};
use pgpulse::collector::Collector;
use pgpulse::config::{self, AppConfig};
use pgpulse::execution::{MetricSource, MetricTask, PgMetricSource};
use pgpulse::maintenance::PartitionMaintenance;
use pgpulse::models::SchedulePolicy;
use pgpulse::scheduler::TaskScheduler;
use pgpulse::store::{MetricSink, PartitionHousekeeping, PgMetricStore};
use pgpulse::{connections, logging};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "pgpulse", version, about = "Polls PostgreSQL servers and stores metric values")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, env = "PGPULSE_CONFIG", default_value = "pgpulse.toml")]
    config: PathBuf,

    /// Validate the configuration, print the resolved tasks and exit
    #[arg(long)]
    check: bool,
}

const MAINTENANCE_RETRIES: u32 = 3;
const MAINTENANCE_RETRY_DELAY: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    // Before argument parsing, so `.env` can also supply PGPULSE_CONFIG.
    let env_file = config::load_env_file(Path::new(".env"));
    let cli = Cli::parse();

    let config = AppConfig::load(&cli.config).map_err(|e| anyhow!(e))?;
    logging::init(&config.log).map_err(|e| anyhow!(e))?;
    match env_file {
        Ok(true) => info!("Loaded environment variables from .env"),
        Ok(false) => debug!("No .env file, using the process environment"),
        Err(e) => warn!("{}", e),
    }
    info!("Configuration loaded from {}", cli.config.display());

    if cli.check {
        return print_plans(&config);
    }

    let pool = connections::create_pool(&config.metrics_db)
        .await
        .map_err(|e| anyhow!(e))
        .context("metrics store is unreachable")?;
    let store = PgMetricStore::new(pool).await.map_err(|e| anyhow!(e))?;

    let server_ids = store
        .sync_servers(&config.server_entries())
        .await
        .map_err(|e| anyhow!(e))?;
    let metric_ids = store
        .sync_metric_dictionary(&config.metric_dictionary())
        .await
        .map_err(|e| anyhow!(e))?;

    let housekeeping: Arc<dyn PartitionHousekeeping> = Arc::new(store.clone());
    let maintenance = Arc::new(PartitionMaintenance::new(
        housekeeping,
        config.storage.partitions_ahead_months,
        config.storage.retention(),
    ));
    maintenance
        .run_once()
        .await
        .map_err(|e| anyhow!(e))
        .context("initial partition maintenance failed")?;

    let maintenance_scheduler = TaskScheduler::new(
        maintenance,
        SchedulePolicy {
            interval: config.storage.maintenance_interval,
            max_retries: MAINTENANCE_RETRIES,
            retry_delay: MAINTENANCE_RETRY_DELAY,
        },
    );

    let mut sources: HashMap<String, Arc<dyn MetricSource>> = HashMap::new();
    for server in &config.servers {
        let pool = connections::create_lazy_pool(server).map_err(|e| anyhow!(e))?;
        sources.insert(server.display_name(), Arc::new(PgMetricSource::new(pool)));
    }

    let sink: Arc<dyn MetricSink> = Arc::new(store.clone());
    let mut tasks = Vec::new();
    for spec in config
        .resolve_tasks(&server_ids, &metric_ids)
        .map_err(|e| anyhow!(e))?
    {
        let source = sources
            .get(&spec.server_name)
            .cloned()
            .ok_or_else(|| anyhow!("no connection pool for server '{}'", spec.server_name))?;
        tasks.push(MetricTask::new(spec, source, Arc::clone(&sink)));
    }
    if tasks.is_empty() {
        warn!("No metrics are assigned to any server; only partition maintenance will run");
    }

    let collector = Collector::new(tasks, config.scheduler.overlap);
    let started = maintenance_scheduler
        .start()
        .and_then(|_| collector.start());
    if let Err(err) = started {
        error!("Startup aborted: {}", err);
        collector.stop().await;
        maintenance_scheduler.stop().await;
        store.close().await;
        return Err(err.into());
    }
    info!("pgpulse running with {} metric task(s)", collector.len());

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Shutdown signal received");

    collector.stop().await;
    maintenance_scheduler.stop().await;
    store.close().await;
    info!("pgpulse stopped");
    Ok(())
}

fn print_plans(config: &AppConfig) -> Result<()> {
    let plans = config.task_plans().map_err(|e| anyhow!(e))?;
    println!("Configuration OK: {} task(s)", plans.len());
    for plan in &plans {
        println!(
            "  {}/{}  {}  interval={:?} timeout={:?} retries={} retry_delay={:?}",
            plan.server_name,
            plan.metric_name,
            plan.collection.describe(),
            plan.policy.interval,
            plan.query_timeout,
            plan.policy.max_retries,
            plan.policy.retry_delay
        );
    }
    Ok(())
}
