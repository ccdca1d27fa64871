//! The two reconcilers and their shared status-write discipline.

pub mod task;
pub mod workflow;

use kube::api::{Api, PostParams};
use serde::Serialize;
use serde::de::DeserializeOwned;
use snafu::prelude::*;
use std::fmt::Debug;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("api error: {source}"))]
    Api { source: kube::Error },

    #[snafu(display("serialization error: {source}"))]
    Serde { source: serde_json::Error },

    #[snafu(display("status write on '{name}' kept conflicting"))]
    Conflict { name: String },

    #[snafu(display("cron gate error: {source}"))]
    Cron { source: crate::cron::Error },

    #[snafu(display("input resolution error: {source}"))]
    Inputs { source: crate::inputs::Error },

    #[snafu(display("template task '{name}' not found"))]
    TemplateMissing { name: String },

    #[snafu(display("child task '{name}' was not deleted in time"))]
    DeletionTimeout { name: String },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Bounded optimistic-concurrency attempts before falling through to a
/// requeue.
const STATUS_WRITE_ATTEMPTS: usize = 4;

/// Re-read-and-retry status write. Each attempt fetches the latest object,
/// applies `mutate`, and replaces the status subresource; a 409 restarts
/// the loop, anything else propagates. Exhausting the attempts yields
/// [`Error::Conflict`], which reconcilers map to a short requeue.
pub async fn update_status<K, F>(api: &Api<K>, name: &str, mutate: F) -> Result<K>
where
    K: kube::Resource + Clone + DeserializeOwned + Serialize + Debug,
    F: Fn(&mut K),
{
    for _ in 0..STATUS_WRITE_ATTEMPTS {
        let mut latest = api.get_status(name).await.context(ApiSnafu)?;
        mutate(&mut latest);
        let data = serde_json::to_vec(&latest).context(SerdeSnafu)?;
        match api.replace_status(name, &PostParams::default(), data).await {
            Ok(updated) => return Ok(updated),
            Err(kube::Error::Api(ae)) if ae.code == 409 => continue,
            Err(e) => return Err(Error::Api { source: e }),
        }
    }
    ConflictSnafu { name }.fail()
}
