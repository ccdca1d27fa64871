//! Lease-based leader election. Only one controller instance acts at a
//! time; followers block in [`acquire`] and take over when the lease
//! expires. Losing the lease terminates the hold loop so the process can
//! exit and restart as a follower.

use chrono::Utc;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::api::{Api, ObjectMeta, PostParams};
use kube::Client;
use snafu::prelude::*;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("lease api error: {source}"))]
    Api { source: kube::Error },

    #[snafu(display("leadership lost: lease '{lease}' is now held by '{holder}'"))]
    Lost { lease: String, holder: String },
}

pub type Result<T> = std::result::Result<T, Error>;

const LEASE_DURATION_SECS: i32 = 30;
const RETRY_INTERVAL: Duration = Duration::from_secs(5);
const RENEW_INTERVAL: Duration = Duration::from_secs(10);

/// A held leadership lease.
pub struct Leadership {
    api: Api<Lease>,
    lease_name: String,
    identity: String,
}

/// Block until this instance holds the lease.
pub async fn acquire(client: Client, namespace: &str, lease_name: &str) -> Result<Leadership> {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "magpie".to_string());
    let identity = format!("{host}-{}", uuid::Uuid::new_v4());
    let leadership = Leadership {
        api: Api::namespaced(client, namespace),
        lease_name: lease_name.to_string(),
        identity,
    };

    loop {
        if leadership.try_acquire().await? {
            info!(lease = %leadership.lease_name, identity = %leadership.identity, "acquired leadership");
            return Ok(leadership);
        }
        debug!(lease = %leadership.lease_name, "lease held elsewhere, waiting");
        tokio::time::sleep(RETRY_INTERVAL).await;
    }
}

impl Leadership {
    /// Renew the lease until it is lost. Resolves only on loss, so the
    /// caller can `select!` it against the controller futures.
    pub async fn hold(self) -> Error {
        loop {
            tokio::time::sleep(RENEW_INTERVAL).await;
            match self.try_acquire().await {
                Ok(true) => {}
                Ok(false) => {
                    let holder = self
                        .current_holder()
                        .await
                        .unwrap_or_else(|| "unknown".to_string());
                    return LostSnafu {
                        lease: self.lease_name.clone(),
                        holder,
                    }
                    .build();
                }
                Err(e) => {
                    // Transient api failure; the lease is still ours until
                    // it expires, so keep trying.
                    warn!(error = %e, "lease renewal attempt failed");
                }
            }
        }
    }

    async fn current_holder(&self) -> Option<String> {
        self.api
            .get_opt(&self.lease_name)
            .await
            .ok()
            .flatten()
            .and_then(|l| l.spec)
            .and_then(|s| s.holder_identity)
    }

    /// Create, renew, or take over the lease. Returns false when another
    /// live holder owns it.
    async fn try_acquire(&self) -> Result<bool> {
        let now = MicroTime(Utc::now());
        let existing = self.api.get_opt(&self.lease_name).await.context(ApiSnafu)?;

        let Some(mut lease) = existing else {
            let lease = Lease {
                metadata: ObjectMeta {
                    name: Some(self.lease_name.clone()),
                    ..ObjectMeta::default()
                },
                spec: Some(LeaseSpec {
                    holder_identity: Some(self.identity.clone()),
                    lease_duration_seconds: Some(LEASE_DURATION_SECS),
                    acquire_time: Some(now.clone()),
                    renew_time: Some(now),
                    lease_transitions: Some(0),
                    ..LeaseSpec::default()
                }),
            };
            return match self.api.create(&PostParams::default(), &lease).await {
                Ok(_) => Ok(true),
                Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(false),
                Err(e) => Err(Error::Api { source: e }),
            };
        };

        let spec = lease.spec.clone().unwrap_or_default();
        let ours = spec.holder_identity.as_deref() == Some(self.identity.as_str());
        let expired = match &spec.renew_time {
            Some(renew) => {
                let duration = i64::from(spec.lease_duration_seconds.unwrap_or(LEASE_DURATION_SECS));
                renew.0 + chrono::Duration::seconds(duration) < now.0
            }
            None => true,
        };
        if !ours && !expired {
            return Ok(false);
        }

        let transitions = spec.lease_transitions.unwrap_or(0) + i32::from(!ours);
        lease.spec = Some(LeaseSpec {
            holder_identity: Some(self.identity.clone()),
            lease_duration_seconds: Some(LEASE_DURATION_SECS),
            acquire_time: if ours { spec.acquire_time } else { Some(now.clone()) },
            renew_time: Some(now),
            lease_transitions: Some(transitions),
            ..LeaseSpec::default()
        });

        // Replace keeps the resource version, so a racing taker loses with
        // a conflict instead of clobbering us.
        match self
            .api
            .replace(&self.lease_name, &PostParams::default(), &lease)
            .await
        {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(false),
            Err(e) => Err(Error::Api { source: e }),
        }
    }
}
