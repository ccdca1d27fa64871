use async_trait::async_trait;
use snafu::prelude::*;
use sqlx::Connection;
use sqlx::mysql::MySqlConnection;

use crate::config::LoggingConfig;
use crate::sink::{DatabaseSnafu, ExecutionRecord, Result, Sink};

const INSERT: &str = "INSERT INTO execution_log \
    (service_name, service_type, status, error_message, response_time_ms, created_at) \
    VALUES (?, ?, ?, ?, ?, ?)";

/// MySQL adapter; one connection per write.
pub struct MySqlSink {
    dsn: String,
}

impl MySqlSink {
    pub fn new(config: &LoggingConfig) -> Result<Self> {
        Ok(MySqlSink {
            dsn: super::database_dsn(config, "mysql", 3306)?,
        })
    }
}

#[async_trait]
impl Sink for MySqlSink {
    async fn append(&self, record: &ExecutionRecord) -> Result<()> {
        let mut conn = MySqlConnection::connect(&self.dsn)
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
