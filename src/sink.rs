//! Optional write-through of per-execution records to a pluggable logging
//! backend. Sink failures are observability failures: callers log them and
//! carry on, they never affect reconciliation outcome.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use snafu::prelude::*;
use std::sync::Arc;
use tracing::info;

use crate::config::LoggingConfig;
use crate::providers::sinks::{ElasticsearchSink, MySqlSink, PostgresSink};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("database error: {source}"))]
    Database { source: sqlx::Error },

    #[snafu(display("http error: {source}"))]
    Http { source: reqwest::Error },

    #[snafu(display("backend rejected record: {message}"))]
    Rejected { message: String },

    #[snafu(display("logging backend '{backend}' is not supported"))]
    UnsupportedBackend { backend: String },

    #[snafu(display("incomplete logging configuration: {message}"))]
    IncompleteConfig { message: String },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Whether the recorded execution left the service reachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ServiceStatus {
    Up,
    Down,
}

impl ServiceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ServiceStatus::Up => "UP",
            ServiceStatus::Down => "DOWN",
        }
    }
}

/// One record per task execution.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRecord {
    pub service_name: String,
    pub service_type: String,
    pub status: ServiceStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub response_time_ms: i64,
    pub timestamp: DateTime<Utc>,
}

/// Single-method sink contract. Implementations open their own connection
/// per write and close it; acceptable for low-throughput observability,
/// not a hot path.
#[async_trait]
pub trait Sink: Send + Sync {
    async fn append(&self, record: &ExecutionRecord) -> Result<()>;
}

/// Build the configured sink, or `None` when logging is disabled.
pub fn from_config(config: &LoggingConfig) -> Result<Option<Arc<dyn Sink>>> {
    if !config.enabled {
        return Ok(None);
    }
    let backend = config.backend.as_deref().unwrap_or_default();
    let sink: Arc<dyn Sink> = match backend {
        "postgres" => Arc::new(PostgresSink::new(config)?),
        "mysql" => Arc::new(MySqlSink::new(config)?),
        "elasticsearch" => Arc::new(ElasticsearchSink::new(config)?),
        // Kafka is recognised in configuration but has no in-tree adapter.
        other => {
            return UnsupportedBackendSnafu { backend: other }.fail();
        }
    };
    info!(backend, "execution log sink enabled");
    Ok(Some(sink))
}
