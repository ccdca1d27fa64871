use async_trait::async_trait;
use snafu::prelude::*;

use crate::config::LoggingConfig;
use crate::sink::{ExecutionRecord, HttpSnafu, IncompleteConfigSnafu, RejectedSnafu, Result, Sink};

const DEFAULT_INDEX: &str = "execution-log";

/// Elasticsearch adapter: one `_doc` POST per record.
pub struct ElasticsearchSink {
    endpoint: String,
}

impl ElasticsearchSink {
    pub fn new(config: &LoggingConfig) -> Result<Self> {
        let host = config.host.as_deref().context(IncompleteConfigSnafu {
            message: "host is required",
        })?;
        let port = config.port.unwrap_or(9200);
        let index = config.index.as_deref().unwrap_or(DEFAULT_INDEX);
        Ok(ElasticsearchSink {
            endpoint: format!("http://{host}:{port}/{index}/_doc"),
        })
    }
}

#[async_trait]
impl Sink for ElasticsearchSink {
    async fn append(&self, record: &ExecutionRecord) -> Result<()> {
        let client = reqwest::Client::new();
        let response = client
            .post(&self.endpoint)
            .json(record)
            .send()
            .await
            .context(HttpSnafu)?;
        let status = response.status();
        ensure!(
            status.is_success(),
            RejectedSnafu {
                message: format!("{} returned {status}", self.endpoint),
            }
        );
        Ok(())
    }
}
