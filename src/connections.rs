use crate::config::DbConnectionConfig;
use log::info;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode};
use sqlx::{ConnectOptions, Pool, Postgres};
use std::time::Duration;

const APPLICATION_NAME: &str = "pgpulse";

pub fn parse_ssl_mode(mode: &str) -> Result<PgSslMode, String> {
    match mode {
        "disable" => Ok(PgSslMode::Disable),
        "allow" => Ok(PgSslMode::Allow),
        "prefer" => Ok(PgSslMode::Prefer),
        "require" => Ok(PgSslMode::Require),
        "verify-ca" => Ok(PgSslMode::VerifyCa),
        "verify-full" => Ok(PgSslMode::VerifyFull),
        other => Err(format!("Unsupported ssl_mode '{}'", other)),
    }
}

pub fn connect_options(config: &DbConnectionConfig) -> Result<PgConnectOptions, String> {
    let mut options = PgConnectOptions::new()
        .host(&config.host)
        .port(config.port)
        .username(&config.user)
        .database(&config.dbname)
        .ssl_mode(parse_ssl_mode(&config.ssl_mode)?)
        .application_name(APPLICATION_NAME);

    if let Some(password) = &config.password {
        options = options.password(password);
    }

    Ok(options.log_statements(log::LevelFilter::Debug))
}

fn pool_options(config: &DbConnectionConfig) -> PgPoolOptions {
    PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(0)
        .acquire_timeout(config.acquire_timeout)
        .idle_timeout(Duration::from_secs(300))
        .max_lifetime(Duration::from_secs(1800))
}

/// Connects eagerly, so an unreachable store fails at startup.
pub async fn create_pool(config: &DbConnectionConfig) -> Result<Pool<Postgres>, String> {
    let options = connect_options(config)?;
    let pool = pool_options(config)
        .connect_with(options)
        .await
        .map_err(|e| {
            let err_msg = e.to_string();
            if err_msg.contains("connection refused") {
                return format!(
                    "Connection refused: check that PostgreSQL is running on {}:{}",
                    config.host, config.port
                );
            }
            if err_msg.contains("timed out") {
                return format!(
                    "Connection to {}:{} timed out after {:?}",
                    config.host, config.port, config.acquire_timeout
                );
            }
            format!("Failed to create pool for {}: {}", config.display_name(), e)
        })?;
    info!("Connected to {}", config.display_name());
    Ok(pool)
}

/// Opens connections on first use. Monitored servers may be down at startup;
/// their collection cycles fail and retry instead.
pub fn create_lazy_pool(config: &DbConnectionConfig) -> Result<Pool<Postgres>, String> {
    let options = connect_options(config)?;
    Ok(pool_options(config).connect_lazy_with(options))
}
