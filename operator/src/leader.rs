//! Lease-based leader election (`--leader-elect`).
//!
//! Replicas race for a `coordination.k8s.io/v1` Lease. The holder renews it
//! every third of the lease duration; others take it over once it has gone
//! unrenewed for a full duration. Every write carries the resource version it
//! was read at, so two candidates never both win the same round.

use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use k8s_openapi::api::coordination::v1::Lease;
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::{Client, ResourceExt};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::config::ControllerConfig;
use crate::error::Error;

/// What a candidate should do with the Lease as it currently stands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// No Lease yet.
    Create,
    /// We hold it.
    Renew,
    /// Free or expired.
    TakeOver,
    /// Someone else holds a live Lease.
    Follow { holder: String },
}

impl Decision {
    pub fn is_leader_attempt(&self) -> bool {
        !matches!(self, Decision::Follow { .. })
    }
}

/// Holder, last renewal and duration as recorded on the Lease.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LeaseRecord {
    pub holder: Option<String>,
    pub renew_time: Option<DateTime<Utc>>,
    pub acquire_time: Option<DateTime<Utc>>,
    pub duration_secs: Option<i64>,
    pub transitions: i64,
}

impl LeaseRecord {
    /// Time fields are read through their RFC 3339 wire form.
    pub fn from_lease(lease: &Lease) -> Self {
        let spec = lease
            .spec
            .as_ref()
            .and_then(|s| serde_json::to_value(s).ok())
            .unwrap_or_default();
        let time = |key: &str| {
            spec.get(key)
                .and_then(|v| v.as_str())
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|t| t.with_timezone(&Utc))
        };
        Self {
            holder: spec
                .get("holderIdentity")
                .and_then(|v| v.as_str())
                .filter(|h| !h.is_empty())
                .map(str::to_string),
            renew_time: time("renewTime"),
            acquire_time: time("acquireTime"),
            duration_secs: spec.get("leaseDurationSeconds").and_then(|v| v.as_i64()),
            transitions: spec
                .get("leaseTransitions")
                .and_then(|v| v.as_i64())
                .unwrap_or_default(),
        }
    }

    fn expired(&self, now: DateTime<Utc>, fallback: Duration) -> bool {
        let Some(renewed) = self.renew_time else {
            return true;
        };
        let secs = self
            .duration_secs
            .unwrap_or(fallback.as_secs() as i64);
        renewed + chrono::Duration::seconds(secs) < now
    }
}

pub fn decide(current: Option<&LeaseRecord>, identity: &str, now: DateTime<Utc>, duration: Duration) -> Decision {
    let Some(record) = current else {
        return Decision::Create;
    };
    match record.holder.as_deref() {
        Some(holder) if holder == identity => Decision::Renew,
        None => Decision::TakeOver,
        Some(_) if record.expired(now, duration) => Decision::TakeOver,
        Some(holder) => Decision::Follow {
            holder: holder.to_string(),
        },
    }
}

fn micro_time(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// The Lease body a candidate writes after deciding to lead.
pub fn desired_lease(
    name: &str,
    identity: &str,
    current: Option<&Lease>,
    decision: &Decision,
    now: DateTime<Utc>,
    duration: Duration,
) -> Result<Lease, Error> {
    let record = current.map(LeaseRecord::from_lease).unwrap_or_default();
    let (acquired, transitions) = match decision {
        Decision::Renew => (record.acquire_time.unwrap_or(now), record.transitions),
        Decision::TakeOver => (now, record.transitions + 1),
        Decision::Create | Decision::Follow { .. } => (now, 0),
    };

    let mut lease: Lease = serde_json::from_value(json!({
        "apiVersion": "coordination.k8s.io/v1",
        "kind": "Lease",
        "metadata": { "name": name },
        "spec": {
            "holderIdentity": identity,
            "leaseDurationSeconds": duration.as_secs(),
            "acquireTime": micro_time(acquired),
            "renewTime": micro_time(now),
            "leaseTransitions": transitions,
        },
    }))?;
    if let Some(current) = current {
        lease.metadata.namespace = current.metadata.namespace.clone();
        lease.metadata.resource_version = current.resource_version();
        lease.metadata.labels = current.metadata.labels.clone();
    }
    Ok(lease)
}

pub struct LeaderElector {
    api: Api<Lease>,
    name: String,
    identity: String,
    duration: Duration,
}

impl LeaderElector {
    pub fn new(client: Client, config: &ControllerConfig, identity: impl Into<String>) -> Self {
        let namespace = config.lease_namespace.as_deref().unwrap_or("default");
        Self {
            api: Api::namespaced(client, namespace),
            name: config.lease_name.clone(),
            identity: identity.into(),
            duration: config.lease_duration(),
        }
    }

    /// `POD_NAME` when set, otherwise a random name.
    pub fn default_identity() -> String {
        std::env::var("POD_NAME")
            .ok()
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| format!("lambda-operator-{}", uuid::Uuid::new_v4()))
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    fn retry_period(&self) -> Duration {
        self.duration / 3
    }

    /// One election round. `Ok(true)` while we hold the Lease.
    pub async fn try_acquire_or_renew(&self) -> Result<bool, Error> {
        let current = self.api.get_opt(&self.name).await?;
        let record = current.as_ref().map(LeaseRecord::from_lease);
        let now = Utc::now();

        let decision = decide(record.as_ref(), &self.identity, now, self.duration);
        if let Decision::Follow { holder } = &decision {
            debug!(lease = %self.name, %holder, "lease held elsewhere");
            return Ok(false);
        }

        let lease = desired_lease(&self.name, &self.identity, current.as_ref(), &decision, now, self.duration)?;
        let written = match current {
            None => self.api.create(&PostParams::default(), &lease).await,
            Some(_) => self.api.replace(&self.name, &PostParams::default(), &lease).await,
        };
        match written {
            Ok(_) => {
                if decision != Decision::Renew {
                    info!(lease = %self.name, identity = %self.identity, "acquired leadership");
                }
                Ok(true)
            }
            Err(e) => {
                let err = Error::from(e);
                if err.is_conflict() || err.is_already_exists() {
                    debug!(lease = %self.name, "lost the election round");
                    Ok(false)
                } else {
                    Err(err)
                }
            }
        }
    }

    /// Blocks until this replica holds the Lease.
    pub async fn acquire(&self) {
        info!(lease = %self.name, identity = %self.identity, "waiting for leadership");
        loop {
            match self.try_acquire_or_renew().await {
                Ok(true) => return,
                Ok(false) => {}
                Err(e) => warn!(lease = %self.name, error = %e, "leader election round failed"),
            }
            tokio::time::sleep(self.retry_period()).await;
        }
    }

    /// Keeps renewing; resolves once the Lease could not be renewed within
    /// its duration.
    pub async fn hold(&self) {
        let mut last_renewal = tokio::time::Instant::now();
        loop {
            tokio::time::sleep(self.retry_period()).await;
            match self.try_acquire_or_renew().await {
                Ok(true) => last_renewal = tokio::time::Instant::now(),
                Ok(false) => {
                    warn!(lease = %self.name, "leadership taken over");
                    return;
                }
                Err(e) => warn!(lease = %self.name, error = %e, "renewing lease failed"),
            }
            if last_renewal.elapsed() >= self.duration {
                warn!(lease = %self.name, "lease expired before it could be renewed");
                return;
            }
        }
    }

    /// Clears the holder so another replica can take over at once.
    pub async fn release(&self) -> Result<(), Error> {
        let Some(current) = self.api.get_opt(&self.name).await? else {
            return Ok(());
        };
        if LeaseRecord::from_lease(&current).holder.as_deref() != Some(self.identity.as_str()) {
            return Ok(());
        }
        let patch = json!({
            "metadata": { "resourceVersion": current.resource_version() },
            "spec": { "holderIdentity": null },
        });
        self.api
            .patch(&self.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        info!(lease = %self.name, "released leadership");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DURATION: Duration = Duration::from_secs(15);

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn lease(holder: Option<&str>, renewed: &str) -> Lease {
        serde_json::from_value(json!({
            "metadata": { "name": "lambda-operator-leader", "namespace": "lambda-system", "resourceVersion": "41" },
            "spec": {
                "holderIdentity": holder,
                "leaseDurationSeconds": 15,
                "acquireTime": "2026-01-01T00:00:00.000000Z",
                "renewTime": renewed,
                "leaseTransitions": 2,
            },
        }))
        .unwrap()
    }

    #[test]
    fn record_reads_wire_fields() {
        let record = LeaseRecord::from_lease(&lease(Some("pod-a"), "2026-01-01T00:00:10.500000Z"));
        assert_eq!(record.holder.as_deref(), Some("pod-a"));
        assert_eq!(record.renew_time, Some(at("2026-01-01T00:00:10.5Z")));
        assert_eq!(record.duration_secs, Some(15));
        assert_eq!(record.transitions, 2);
    }

    #[test]
    fn decisions() {
        let now = at("2026-01-01T00:00:20Z");
        let live = LeaseRecord::from_lease(&lease(Some("pod-a"), "2026-01-01T00:00:10Z"));
        let stale = LeaseRecord::from_lease(&lease(Some("pod-a"), "2026-01-01T00:00:01Z"));
        let free = LeaseRecord::from_lease(&lease(None, "2026-01-01T00:00:10Z"));

        assert_eq!(decide(None, "pod-b", now, DURATION), Decision::Create);
        assert_eq!(decide(Some(&live), "pod-a", now, DURATION), Decision::Renew);
        assert_eq!(
            decide(Some(&live), "pod-b", now, DURATION),
            Decision::Follow { holder: "pod-a".into() }
        );
        assert_eq!(decide(Some(&stale), "pod-b", now, DURATION), Decision::TakeOver);
        assert_eq!(decide(Some(&free), "pod-b", now, DURATION), Decision::TakeOver);
        assert!(!decide(Some(&live), "pod-b", now, DURATION).is_leader_attempt());
    }

    #[test]
    fn takeover_bumps_transitions_and_keeps_resource_version() {
        let current = lease(Some("pod-a"), "2026-01-01T00:00:01Z");
        let now = at("2026-01-01T00:00:20Z");
        let next = desired_lease("lambda-operator-leader", "pod-b", Some(&current), &Decision::TakeOver, now, DURATION)
            .unwrap();

        assert_eq!(next.resource_version().as_deref(), Some("41"));
        assert_eq!(next.namespace().as_deref(), Some("lambda-system"));
        let record = LeaseRecord::from_lease(&next);
        assert_eq!(record.holder.as_deref(), Some("pod-b"));
        assert_eq!(record.transitions, 3);
        assert_eq!(record.acquire_time, Some(now));
        assert_eq!(record.renew_time, Some(now));
    }

    #[test]
    fn renewal_keeps_acquire_time() {
        let current = lease(Some("pod-a"), "2026-01-01T00:00:10Z");
        let now = at("2026-01-01T00:00:15Z");
        let next = desired_lease("lambda-operator-leader", "pod-a", Some(&current), &Decision::Renew, now, DURATION)
            .unwrap();

        let record = LeaseRecord::from_lease(&next);
        assert_eq!(record.acquire_time, Some(at("2026-01-01T00:00:00Z")));
        assert_eq!(record.renew_time, Some(now));
        assert_eq!(record.transitions, 2);

        let fresh = desired_lease("lambda-operator-leader", "pod-a", None, &Decision::Create, now, DURATION).unwrap();
        assert!(fresh.resource_version().is_none());
        assert_eq!(LeaseRecord::from_lease(&fresh).transitions, 0);
    }
}
