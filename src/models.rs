use crate::execution::CollectError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CollectionKind {
    #[default]
    Sql,
    #[serde(alias = "go_func")]
    Function,
}

impl CollectionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sql => "sql",
            Self::Function => "function",
        }
    }
}

/// Built-in collection routines. The set is closed: a configured name either
/// resolves to one of these or the configuration is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BuiltinFunction {
    PostgresUptime,
}

impl BuiltinFunction {
    pub const ALL: &'static [BuiltinFunction] = &[BuiltinFunction::PostgresUptime];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PostgresUptime => "postgres_uptime",
        }
    }

    pub fn from_name(name: &str) -> Result<Self, CollectError> {
        match name.trim() {
            "postgres_uptime" | "collectPostgresUptime" => Ok(Self::PostgresUptime),
            other => Err(CollectError::UnknownFunction(other.to_string())),
        }
    }
}

#[derive(Debug, Clone)]
pub enum Collection {
    Sql {
        script_path: PathBuf,
        script: Arc<str>,
    },
    Function(BuiltinFunction),
}

impl Collection {
    pub fn kind(&self) -> CollectionKind {
        match self {
            Self::Sql { .. } => CollectionKind::Sql,
            Self::Function(_) => CollectionKind::Function,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Self::Sql { script_path, .. } => format!("sql:{}", script_path.display()),
            Self::Function(function) => format!("function:{}", function.as_str()),
        }
    }
}

/// Timing policy of one scheduled unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulePolicy {
    pub interval: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl SchedulePolicy {
    pub fn total_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

/// One (server, metric) pairing with its merged execution parameters.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub server_name: String,
    pub metric_name: String,
    pub server_id: i32,
    pub metric_id: i32,
    pub collection: Collection,
    pub query_timeout: Duration,
    pub policy: SchedulePolicy,
}

impl TaskSpec {
    pub fn label(&self) -> String {
        format!("{}/{}", self.server_name, self.metric_name)
    }
}
