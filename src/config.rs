use crate::models::{BuiltinFunction, Collection, CollectionKind, SchedulePolicy, TaskSpec};
use crate::scheduler::OverlapPolicy;
use crate::store::{MetricEntry, MetricGroupEntry, ServerEntry};
use log::{info, warn, LevelFilter};
use regex::{Captures, Regex};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

pub const SSL_MODES: &[&str] = &["disable", "allow", "prefer", "require", "verify-ca", "verify-full"];

#[derive(Deserialize, Debug, Clone)]
pub struct AppConfig {
    #[serde(default)]
    pub log: LogConfig,
    pub metrics_db: DbConnectionConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub defaults: DefaultsConfig,
    #[serde(default)]
    pub servers: Vec<DbConnectionConfig>,
    #[serde(default)]
    pub metric_groups: Vec<MetricGroupConfig>,
    #[serde(default)]
    pub assignments: Vec<ServerAssignment>,
    /// Directory `sql_file` paths are resolved against.
    #[serde(skip)]
    pub base_dir: PathBuf,
}

#[derive(Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Deserialize, Debug, Clone)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
    /// Appended to instead of stdout when set.
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
            file: None,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct DbConnectionConfig {
    /// Defaults to `host:port_dbname`.
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub environment: String,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub user: String,
    #[serde(default)]
    pub password: Option<String>,
    pub dbname: String,
    #[serde(default = "default_ssl_mode")]
    pub ssl_mode: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_acquire_timeout", with = "humantime_serde")]
    pub acquire_timeout: Duration,
}

impl DbConnectionConfig {
    pub fn display_name(&self) -> String {
        match &self.name {
            Some(name) if !name.trim().is_empty() => name.clone(),
            _ => format!("{}:{}_{}", self.host, self.port, self.dbname),
        }
    }

    fn validate(&self, context: &str) -> Result<(), String> {
        if self.host.trim().is_empty() {
            return Err(format!("{}: host is required", context));
        }
        if self.port == 0 {
            return Err(format!("{}: port must be greater than 0", context));
        }
        if self.user.trim().is_empty() {
            return Err(format!("{}: user is required", context));
        }
        if self.dbname.trim().is_empty() {
            return Err(format!("{}: dbname is required", context));
        }
        if !SSL_MODES.contains(&self.ssl_mode.as_str()) {
            return Err(format!(
                "{}: unsupported ssl_mode '{}' (expected one of: {})",
                context,
                self.ssl_mode,
                SSL_MODES.join(", ")
            ));
        }
        if self.max_connections == 0 {
            return Err(format!("{}: max_connections must be greater than 0", context));
        }
        Ok(())
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_partitions_ahead")]
    pub partitions_ahead_months: u32,
    /// `0` keeps every partition.
    #[serde(default = "default_retention_months")]
    pub retention_months: u32,
    #[serde(default = "default_maintenance_interval", with = "humantime_serde")]
    pub maintenance_interval: Duration,
}

impl StorageConfig {
    pub fn retention(&self) -> Option<u32> {
        (self.retention_months > 0).then_some(self.retention_months)
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            partitions_ahead_months: default_partitions_ahead(),
            retention_months: default_retention_months(),
            maintenance_interval: default_maintenance_interval(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct SchedulerConfig {
    #[serde(default)]
    pub overlap: OverlapPolicy,
}

#[derive(Deserialize, Debug, Clone)]
pub struct DefaultsConfig {
    #[serde(default = "default_interval", with = "humantime_serde")]
    pub interval: Duration,
    #[serde(default = "default_query_timeout", with = "humantime_serde")]
    pub query_timeout: Duration,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay", with = "humantime_serde")]
    pub retry_delay: Duration,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            interval: default_interval(),
            query_timeout: default_query_timeout(),
            max_retries: default_max_retries(),
            retry_delay: default_retry_delay(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct MetricGroupConfig {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub metrics: Vec<MetricConfig>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct MetricConfig {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub collection: CollectionKind,
    #[serde(default)]
    pub sql_file: Option<PathBuf>,
    #[serde(default, alias = "go_function")]
    pub function: Option<String>,
    #[serde(default, with = "humantime_serde")]
    pub interval: Option<Duration>,
    #[serde(default, with = "humantime_serde")]
    pub query_timeout: Option<Duration>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default, with = "humantime_serde")]
    pub retry_delay: Option<Duration>,
}

/// Metrics collected from one server.
#[derive(Deserialize, Debug, Clone)]
pub struct ServerAssignment {
    pub server: String,
    #[serde(default)]
    pub metrics: Vec<MetricOverride>,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct MetricOverride {
    pub name: String,
    #[serde(default, with = "humantime_serde")]
    pub interval: Option<Duration>,
    #[serde(default, with = "humantime_serde")]
    pub query_timeout: Option<Duration>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default, with = "humantime_serde")]
    pub retry_delay: Option<Duration>,
}

/// A resolved (server, metric) pairing before dictionary ids are known.
#[derive(Debug, Clone)]
pub struct TaskPlan {
    pub server_name: String,
    pub metric_name: String,
    pub collection: Collection,
    pub query_timeout: Duration,
    pub policy: SchedulePolicy,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_port() -> u16 {
    5432
}

fn default_ssl_mode() -> String {
    "disable".to_string()
}

fn default_max_connections() -> u32 {
    5
}

fn default_acquire_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_partitions_ahead() -> u32 {
    3
}

fn default_retention_months() -> u32 {
    12
}

fn default_maintenance_interval() -> Duration {
    Duration::from_secs(3600)
}

fn default_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_query_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay() -> Duration {
    Duration::from_secs(5)
}

fn default_true() -> bool {
    true
}

fn env_var_pattern() -> Result<Regex, String> {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}")
        .map_err(|e| format!("Invalid variable pattern: {}", e))
}

fn expand_with(
    pattern: &Regex,
    raw: &str,
    lookup: &dyn Fn(&str) -> Option<String>,
    missing: &mut Vec<String>,
) -> String {
    pattern
        .replace_all(raw, |caps: &Captures| {
            let name = &caps[1];
            match lookup(name) {
                Some(value) => value,
                None => {
                    if !missing.iter().any(|m| m == name) {
                        missing.push(name.to_string());
                    }
                    String::new()
                }
            }
        })
        .into_owned()
}

fn missing_vars_error(missing: &[String]) -> String {
    format!(
        "Undefined environment variable(s) in config: {}",
        missing.join(", ")
    )
}

/// Replaces every `${VAR}` with its value. Unset variables are an error.
pub fn expand_env_vars(
    raw: &str,
    lookup: &dyn Fn(&str) -> Option<String>,
) -> Result<String, String> {
    let pattern = env_var_pattern()?;
    let mut missing = Vec::new();
    let expanded = expand_with(&pattern, raw, lookup, &mut missing);
    if !missing.is_empty() {
        return Err(missing_vars_error(&missing));
    }
    Ok(expanded)
}

/// Expands `${VAR}` inside the string values of a parsed document. Keys and
/// comments are left alone, and substituted text is never re-parsed as TOML.
pub fn expand_env_in_document(
    document: &mut toml::Value,
    lookup: &dyn Fn(&str) -> Option<String>,
) -> Result<(), String> {
    let pattern = env_var_pattern()?;
    let mut missing = Vec::new();
    expand_value(document, &pattern, lookup, &mut missing);
    if !missing.is_empty() {
        return Err(missing_vars_error(&missing));
    }
    Ok(())
}

fn expand_value(
    value: &mut toml::Value,
    pattern: &Regex,
    lookup: &dyn Fn(&str) -> Option<String>,
    missing: &mut Vec<String>,
) {
    match value {
        toml::Value::String(text) => {
            if pattern.is_match(text) {
                *text = expand_with(pattern, text, lookup, missing);
            }
        }
        toml::Value::Array(items) => {
            for item in items {
                expand_value(item, pattern, lookup, missing);
            }
        }
        toml::Value::Table(table) => {
            for (_, item) in table.iter_mut() {
                expand_value(item, pattern, lookup, missing);
            }
        }
        _ => {}
    }
}

/// Loads `path` into the process environment. Variables that are already set
/// keep their values. A missing file is not an error and yields `false`.
pub fn load_env_file(path: &Path) -> Result<bool, String> {
    match dotenvy::from_path(path) {
        Ok(()) => Ok(true),
        Err(e) if e.not_found() => Ok(false),
        Err(e) => Err(format!("Failed to load {}: {}", path.display(), e)),
    }
}

impl AppConfig {
    /// Reads and validates the configuration at `path`. `${VAR}` references
    /// in string values are expanded after parsing.
    pub fn load(path: &Path) -> Result<Self, String> {
        Self::load_with(path, &|key: &str| std::env::var(key).ok())
    }

    pub fn load_with(path: &Path, lookup: &dyn Fn(&str) -> Option<String>) -> Result<Self, String> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file {}: {}", path.display(), e))?;
        let mut document: toml::Value = toml::from_str(&raw)
            .map_err(|e| format!("{}: Failed to parse config: {}", path.display(), e))?;
        expand_env_in_document(&mut document, lookup)?;

        let mut config = document
            .try_into::<Self>()
            .map_err(|e| format!("{}: Failed to parse config: {}", path.display(), e))?;
        config.base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        config.apply_env_overrides_from(lookup);
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, String> {
        toml::from_str(content).map_err(|e| format!("Failed to parse config: {}", e))
    }

    /// `METRICS_DB_*` and `METRICS_LOG_LEVEL` take precedence over the file.
    pub fn apply_env_overrides_from(&mut self, lookup: &dyn Fn(&str) -> Option<String>) {
        let non_empty = |key: &str| lookup(key).filter(|value| !value.is_empty());

        if let Some(host) = non_empty("METRICS_DB_HOST") {
            self.metrics_db.host = host;
        }
        if let Some(user) = non_empty("METRICS_DB_USER") {
            self.metrics_db.user = user;
        }
        if let Some(password) = non_empty("METRICS_DB_PASSWORD") {
            self.metrics_db.password = Some(password);
        }
        if let Some(dbname) = non_empty("METRICS_DB_NAME") {
            self.metrics_db.dbname = dbname;
        }
        if let Some(level) = non_empty("METRICS_LOG_LEVEL") {
            self.log.level = level;
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        self.log
            .level
            .parse::<LevelFilter>()
            .map_err(|_| format!("log.level: unknown level '{}'", self.log.level))?;

        self.metrics_db.validate("metrics_db")?;
        check_positive("storage.maintenance_interval", self.storage.maintenance_interval)?;
        check_positive("defaults.interval", self.defaults.interval)?;
        check_positive("defaults.query_timeout", self.defaults.query_timeout)?;

        let mut server_names = HashSet::new();
        for (index, server) in self.servers.iter().enumerate() {
            let name = server.display_name();
            server.validate(&format!("servers[{}] '{}'", index, name))?;
            if !server_names.insert(name.clone()) {
                return Err(format!("Duplicate server name: '{}'", name));
            }
        }

        let mut group_names = HashSet::new();
        let mut metrics: HashMap<&str, &MetricConfig> = HashMap::new();
        for group in &self.metric_groups {
            if group.name.trim().is_empty() {
                return Err("metric_groups: group name is required".to_string());
            }
            if !group_names.insert(group.name.as_str()) {
                return Err(format!("Duplicate metric group name: '{}'", group.name));
            }
            for metric in &group.metrics {
                validate_metric(&group.name, metric)?;
                if metrics.insert(metric.name.as_str(), metric).is_some() {
                    return Err(format!("Duplicate metric name: '{}'", metric.name));
                }
            }
        }

        let mut assigned_servers = HashSet::new();
        for assignment in &self.assignments {
            if !server_names.contains(&assignment.server) {
                return Err(format!(
                    "assignments: unknown server '{}'",
                    assignment.server
                ));
            }
            if !assigned_servers.insert(assignment.server.as_str()) {
                return Err(format!(
                    "assignments: server '{}' is listed more than once",
                    assignment.server
                ));
            }
            let mut assigned_metrics = HashSet::new();
            for item in &assignment.metrics {
                if !metrics.contains_key(item.name.as_str()) {
                    return Err(format!(
                        "assignments '{}': unknown metric '{}'",
                        assignment.server, item.name
                    ));
                }
                if !assigned_metrics.insert(item.name.as_str()) {
                    return Err(format!(
                        "assignments '{}': metric '{}' is listed more than once",
                        assignment.server, item.name
                    ));
                }
                let context = format!("assignments '{}' / '{}'", assignment.server, item.name);
                check_optional_positive(&context, "interval", item.interval)?;
                check_optional_positive(&context, "query_timeout", item.query_timeout)?;
            }
        }

        Ok(())
    }

    pub fn server(&self, name: &str) -> Option<&DbConnectionConfig> {
        self.servers.iter().find(|server| server.display_name() == name)
    }

    fn find_metric(&self, name: &str) -> Option<(&MetricGroupConfig, &MetricConfig)> {
        self.metric_groups.iter().find_map(|group| {
            group
                .metrics
                .iter()
                .find(|metric| metric.name == name)
                .map(|metric| (group, metric))
        })
    }

    /// Applies override, then metric, then global defaults.
    pub fn merged_policy(
        &self,
        metric: &MetricConfig,
        item: &MetricOverride,
    ) -> (SchedulePolicy, Duration) {
        let defaults = &self.defaults;
        let policy = SchedulePolicy {
            interval: item.interval.or(metric.interval).unwrap_or(defaults.interval),
            max_retries: item
                .max_retries
                .or(metric.max_retries)
                .unwrap_or(defaults.max_retries),
            retry_delay: item
                .retry_delay
                .or(metric.retry_delay)
                .unwrap_or(defaults.retry_delay),
        };
        let query_timeout = item
            .query_timeout
            .or(metric.query_timeout)
            .unwrap_or(defaults.query_timeout);
        (policy, query_timeout)
    }

    /// Resolves every assignment into a plan. SQL scripts are read here, so a
    /// missing file fails before anything is scheduled.
    pub fn task_plans(&self) -> Result<Vec<TaskPlan>, String> {
        let mut scripts: HashMap<PathBuf, Arc<str>> = HashMap::new();
        let mut plans = Vec::new();

        for assignment in &self.assignments {
            for item in &assignment.metrics {
                let (group, metric) = self.find_metric(&item.name).ok_or_else(|| {
                    format!("assignments '{}': unknown metric '{}'", assignment.server, item.name)
                })?;
                if !group.enabled {
                    info!(
                        "Skipping metric '{}' on '{}': group '{}' is disabled",
                        metric.name, assignment.server, group.name
                    );
                    continue;
                }

                let collection = match metric.collection {
                    CollectionKind::Sql => {
                        let relative = metric.sql_file.as_ref().ok_or_else(|| {
                            format!("metric '{}': sql_file is required", metric.name)
                        })?;
                        let path = self.base_dir.join(relative);
                        let script = match scripts.get(&path) {
                            Some(script) => Arc::clone(script),
                            None => {
                                let script = load_script(&path)?;
                                scripts.insert(path.clone(), Arc::clone(&script));
                                script
                            }
                        };
                        Collection::Sql {
                            script_path: path,
                            script,
                        }
                    }
                    CollectionKind::Function => {
                        let name = metric.function.as_deref().unwrap_or_default();
                        let function = BuiltinFunction::from_name(name)
                            .map_err(|e| format!("metric '{}': {}", metric.name, e))?;
                        Collection::Function(function)
                    }
                };

                let (policy, query_timeout) = self.merged_policy(metric, item);
                plans.push(TaskPlan {
                    server_name: assignment.server.clone(),
                    metric_name: metric.name.clone(),
                    collection,
                    query_timeout,
                    policy,
                });
            }
        }
        Ok(plans)
    }

    /// Attaches dictionary ids to every plan.
    pub fn resolve_tasks(
        &self,
        server_ids: &HashMap<String, i32>,
        metric_ids: &HashMap<String, i32>,
    ) -> Result<Vec<TaskSpec>, String> {
        self.task_plans()?
            .into_iter()
            .map(|plan| {
                let server_id = *server_ids
                    .get(&plan.server_name)
                    .ok_or_else(|| format!("No server id for '{}'", plan.server_name))?;
                let metric_id = *metric_ids
                    .get(&plan.metric_name)
                    .ok_or_else(|| format!("No metric id for '{}'", plan.metric_name))?;
                Ok(TaskSpec {
                    server_name: plan.server_name,
                    metric_name: plan.metric_name,
                    server_id,
                    metric_id,
                    collection: plan.collection,
                    query_timeout: plan.query_timeout,
                    policy: plan.policy,
                })
            })
            .collect()
    }

    pub fn metric_dictionary(&self) -> Vec<MetricGroupEntry> {
        self.metric_groups
            .iter()
            .map(|group| MetricGroupEntry {
                name: group.name.clone(),
                description: group.description.clone(),
                metrics: group
                    .metrics
                    .iter()
                    .map(|metric| MetricEntry {
                        name: metric.name.clone(),
                        description: metric.description.clone(),
                    })
                    .collect(),
            })
            .collect()
    }

    pub fn server_entries(&self) -> Vec<ServerEntry> {
        self.servers
            .iter()
            .map(|server| ServerEntry {
                name: server.display_name(),
                environment: server.environment.clone(),
                host: server.host.clone(),
                port: server.port,
                ssl_mode: server.ssl_mode.clone(),
            })
            .collect()
    }
}

fn validate_metric(group: &str, metric: &MetricConfig) -> Result<(), String> {
    let context = format!("metric '{}' (group '{}')", metric.name, group);
    if metric.name.trim().is_empty() {
        return Err(format!("group '{}': metric name is required", group));
    }
    match metric.collection {
        CollectionKind::Sql => {
            if metric.sql_file.is_none() {
                return Err(format!("{}: sql_file is required for sql collection", context));
            }
            if metric.function.is_some() {
                warn!("{}: 'function' is ignored for sql collection", context);
            }
        }
        CollectionKind::Function => {
            let name = metric
                .function
                .as_deref()
                .ok_or_else(|| format!("{}: function is required for function collection", context))?;
            BuiltinFunction::from_name(name).map_err(|e| format!("{}: {}", context, e))?;
        }
    }
    check_optional_positive(&context, "interval", metric.interval)?;
    check_optional_positive(&context, "query_timeout", metric.query_timeout)?;
    Ok(())
}

fn check_positive(field: &str, value: Duration) -> Result<(), String> {
    if value.is_zero() {
        return Err(format!("{} must be greater than 0", field));
    }
    Ok(())
}

fn check_optional_positive(context: &str, field: &str, value: Option<Duration>) -> Result<(), String> {
    match value {
        Some(value) if value.is_zero() => Err(format!("{}: {} must be greater than 0", context, field)),
        _ => Ok(()),
    }
}

fn load_script(path: &Path) -> Result<Arc<str>, String> {
    let script = std::fs::read_to_string(path)
        .map_err(|e| format!("Failed to read SQL script {}: {}", path.display(), e))?;
    if script.trim().is_empty() {
        return Err(format!("SQL script {} is empty", path.display()));
    }
    Ok(Arc::from(script))
}
