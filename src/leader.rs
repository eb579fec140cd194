//! Lease-based leader election
//!
//! Only one operator replica may trigger bootstraps. Replicas contend for a
//! `coordination.k8s.io/v1` Lease; the holder renews it on an interval and
//! everyone else waits for it to expire. Takeovers carry the observed
//! `resourceVersion`, so two replicas racing for an expired lease cannot both win.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::api::{Api, ObjectMeta, Patch, PatchParams, PostParams};
use kube::Client;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Lease used by the operator
pub const LEASE_NAME: &str = "talos-bootstrap-leader";

const FIELD_MANAGER: &str = "talos-bootstrap";

/// Timing and identity for one contender
#[derive(Clone, Debug)]
pub struct LeaseConfig {
    pub name: String,
    pub namespace: String,
    pub identity: String,
    /// Lease validity written on every acquire and renew
    pub lease_duration: Duration,
    pub renew_interval: Duration,
    pub retry_interval: Duration,
}

impl LeaseConfig {
    pub fn new(namespace: impl Into<String>, identity: impl Into<String>) -> Self {
        Self {
            name: LEASE_NAME.to_string(),
            namespace: namespace.into(),
            identity: identity.into(),
            lease_duration: Duration::from_secs(15),
            renew_interval: Duration::from_secs(10),
            retry_interval: Duration::from_secs(5),
        }
    }

    fn duration_secs(&self) -> i32 {
        i32::try_from(self.lease_duration.as_secs()).unwrap_or(i32::MAX)
    }
}

/// What a contender should do with the lease it just read
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LeaseAction {
    /// We hold it; extend it
    Renew,
    /// Free or expired; claim it
    TakeOver { previous: Option<String> },
    /// Someone else holds a live lease
    Wait { holder: String },
}

/// Decide on a lease without touching the API
pub fn lease_action(spec: Option<&LeaseSpec>, config: &LeaseConfig, now: DateTime<Utc>) -> LeaseAction {
    let holder = spec
        .and_then(|s| s.holder_identity.clone())
        .filter(|h| !h.is_empty());

    let Some(holder) = holder else {
        return LeaseAction::TakeOver { previous: None };
    };
    if holder == config.identity {
        return LeaseAction::Renew;
    }

    let expires_at = spec.and_then(|s| {
        let renewed = s.renew_time.as_ref().or(s.acquire_time.as_ref())?;
        let secs = s.lease_duration_seconds.unwrap_or(config.duration_secs());
        Some(renewed.0 + chrono::Duration::seconds(i64::from(secs)))
    });

    match expires_at {
        Some(expiry) if now <= expiry => LeaseAction::Wait { holder },
        _ => LeaseAction::TakeOver {
            previous: Some(holder),
        },
    }
}

/// Merge patch extending our own lease
pub fn renew_patch(config: &LeaseConfig, now: DateTime<Utc>) -> serde_json::Value {
    serde_json::json!({
        "spec": {
            "renewTime": MicroTime(now),
            "leaseDurationSeconds": config.duration_secs(),
        }
    })
}

/// Merge patch claiming a lease last seen at `resource_version`
pub fn takeover_patch(
    config: &LeaseConfig,
    resource_version: Option<&str>,
    transitions: i32,
    now: DateTime<Utc>,
) -> serde_json::Value {
    serde_json::json!({
        "metadata": { "resourceVersion": resource_version },
        "spec": {
            "holderIdentity": config.identity,
            "acquireTime": MicroTime(now),
            "renewTime": MicroTime(now),
            "leaseDurationSeconds": config.duration_secs(),
            "leaseTransitions": transitions.saturating_add(1),
        }
    })
}

/// Fresh lease held by `config.identity`
pub fn new_lease(config: &LeaseConfig, now: DateTime<Utc>) -> Lease {
    Lease {
        metadata: ObjectMeta {
            name: Some(config.name.clone()),
            namespace: Some(config.namespace.clone()),
            ..Default::default()
        },
        spec: Some(LeaseSpec {
            holder_identity: Some(config.identity.clone()),
            acquire_time: Some(MicroTime(now)),
            renew_time: Some(MicroTime(now)),
            lease_duration_seconds: Some(config.duration_secs()),
            lease_transitions: Some(0),
            ..Default::default()
        }),
    }
}

fn api_code(error: &kube::Error) -> Option<u16> {
    match error {
        kube::Error::Api(response) => Some(response.code),
        _ => None,
    }
}

/// One election round; `Ok(true)` when we hold the lease afterwards
pub async fn try_acquire_or_renew(leases: &Api<Lease>, config: &LeaseConfig) -> Result<bool> {
    let now = Utc::now();
    let params = PatchParams::apply(FIELD_MANAGER);

    let Some(existing) = leases.get_opt(&config.name).await? else {
        return match leases.create(&PostParams::default(), &new_lease(config, now)).await {
            Ok(_) => {
                info!("Created lease {} held by {}", config.name, config.identity);
                Ok(true)
            }
            Err(e) if api_code(&e) == Some(409) => Ok(false),
            Err(e) => Err(Error::KubeError(e)),
        };
    };

    let spec = existing.spec.as_ref();
    match lease_action(spec, config, now) {
        LeaseAction::Renew => {
            leases
                .patch(&config.name, &params, &Patch::Merge(&renew_patch(config, now)))
                .await?;
            Ok(true)
        }
        LeaseAction::TakeOver { previous } => {
            info!("Lease {} free (last holder {:?}), taking over", config.name, previous);
            let transitions = spec.and_then(|s| s.lease_transitions).unwrap_or(0);
            let patch = takeover_patch(
                config,
                existing.metadata.resource_version.as_deref(),
                transitions,
                now,
            );
            match leases.patch(&config.name, &params, &Patch::Merge(&patch)).await {
                Ok(_) => Ok(true),
                // 409: someone else patched first; 404: the lease was deleted meanwhile
                Err(e) if matches!(api_code(&e), Some(404 | 409)) => {
                    debug!("Lost the race for lease {}", config.name);
                    Ok(false)
                }
                Err(e) => Err(Error::KubeError(e)),
            }
        }
        LeaseAction::Wait { holder } => {
            debug!("Lease {} held by {}", config.name, holder);
            Ok(false)
        }
    }
}

/// Contend for the lease forever, mirroring the outcome into `is_leader`
pub async fn run_leader_election(client: Client, config: LeaseConfig, is_leader: Arc<AtomicBool>) {
    let leases: Api<Lease> = Api::namespaced(client, &config.namespace);

    loop {
        let leading = match try_acquire_or_renew(&leases, &config).await {
            Ok(leading) => leading,
            Err(e) => {
                warn!("Leader election error: {}", e);
                false
            }
        };

        let was_leading = is_leader.swap(leading, Ordering::Relaxed);
        match (was_leading, leading) {
            (false, true) => info!("Acquired leadership for lease {}", config.name),
            (true, false) => warn!("Lost leadership for lease {}", config.name),
            _ => {}
        }

        tokio::time::sleep(if leading {
            config.renew_interval
        } else {
            config.retry_interval
        })
        .await;
    }
}
