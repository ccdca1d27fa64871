use async_trait::async_trait;
use snafu::prelude::*;
use sqlx::Connection;
use sqlx::postgres::PgConnection;

use crate::config::LoggingConfig;
use crate::sink::{DatabaseSnafu, ExecutionRecord, Result, Sink};

const INSERT: &str = "INSERT INTO execution_log \
    (service_name, service_type, status, error_message, response_time_ms, created_at) \
    VALUES ($1, $2, $3, $4, $5, $6)";

/// PostgreSQL adapter; one connection per write.
pub struct PostgresSink {
    dsn: String,
}

impl PostgresSink {
    pub fn new(config: &LoggingConfig) -> Result<Self> {
        Ok(PostgresSink {
            dsn: super::database_dsn(config, "postgres", 5432)?,
        })
    }
}

#[async_trait]
impl Sink for PostgresSink {
    async fn append(&self, record: &ExecutionRecord) -> Result<()> {
        let mut conn = PgConnection::connect(&self.dsn)
            .await
            .context(DatabaseSnafu)?;
        sqlx::query(INSERT)
            .bind(&record.service_name)
            .bind(&record.service_type)
            .bind(record.status.as_str())
            .bind(record.error_message.as_deref())
            .bind(record.response_time_ms)
            .bind(record.timestamp)
            .execute(&mut conn)
            .await
            .context(DatabaseSnafu)?;
        conn.close().await.context(DatabaseSnafu)?;
        Ok(())
    }
}
