//! Lease based leader election.
//!
//! A [`LeaderElector`] moves through `NotLeading -> Leading -> Stopped`.
//! Entering `Leading` starts the caller's work with a child cancellation
//! token; leaving it cancels that token and waits for the work to return.
//! `Stopped` is terminal: a replica that lost its lease does not campaign
//! again in the same process.
//!
//! Acquire and renew use the Lease resourceVersion as a compare-and-swap
//! token, a 409 on write means another participant won the race.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, PostParams};
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{Error, Result};

pub const DEFAULT_LEASE_DURATION: Duration = Duration::from_secs(150);
pub const DEFAULT_RENEW_DEADLINE: Duration = Duration::from_secs(120);
pub const DEFAULT_RETRY_PERIOD: Duration = Duration::from_secs(60);

/// Lowercases `name`, replaces anything outside `[a-zA-Z0-9-]` with `-`
/// and keeps the result from ending in `-`.
pub fn sanitize_lock_name(name: &str) -> String {
    let mut sanitized: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    if sanitized.is_empty() || sanitized.ends_with('-') {
        sanitized.push('x');
    }
    sanitized
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaderState {
    NotLeading,
    Leading,
    Stopped,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LeaseRecord {
    pub holder: Option<String>,
    pub lease_duration: Duration,
    pub acquire_time: Option<DateTime<Utc>>,
    pub renew_time: Option<DateTime<Utc>>,
    pub transitions: i32,
}

impl LeaseRecord {
    fn expired(&self, now: DateTime<Utc>) -> bool {
        let Some(renew_time) = self.renew_time else {
            return true;
        };
        let duration = chrono::Duration::from_std(self.lease_duration)
            .unwrap_or_else(|_| chrono::Duration::zero());
        now > renew_time + duration
    }
}

/// Storage for the lease record.
#[async_trait]
pub trait LeaseLock: Send + Sync + 'static {
    /// Current record with its resourceVersion.
    async fn get(&self) -> Result<Option<(LeaseRecord, String)>>;

    /// Creates the record. `Ok(false)` when it already exists.
    async fn create(&self, record: &LeaseRecord) -> Result<bool>;

    /// Replaces the record if it still carries `resource_version`.
    /// `Ok(false)` on conflict.
    async fn update(&self, record: &LeaseRecord, resource_version: &str) -> Result<bool>;

    fn describe(&self) -> String;
}

/// [`LeaseLock`] backed by a coordination.k8s.io/v1 Lease.
pub struct KubeLeaseLock {
    api: Api<Lease>,
    namespace: String,
    name: String,
}

impl KubeLeaseLock {
    pub fn new(client: kube::Client, namespace: &str, name: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    fn to_lease(&self, record: &LeaseRecord, resource_version: Option<&str>) -> Lease {
        Lease {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                namespace: Some(self.namespace.clone()),
                resource_version: resource_version.map(str::to_string),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: record.holder.clone(),
                lease_duration_seconds: Some(record.lease_duration.as_secs() as i32),
                acquire_time: record.acquire_time.map(MicroTime),
                renew_time: record.renew_time.map(MicroTime),
                lease_transitions: Some(record.transitions),
                ..Default::default()
            }),
        }
    }
}

#[async_trait]
impl LeaseLock for KubeLeaseLock {
    async fn get(&self) -> Result<Option<(LeaseRecord, String)>> {
        let Some(lease) = self.api.get_opt(&self.name).await? else {
            return Ok(None);
        };
        let resource_version =
            lease
                .metadata
                .resource_version
                .clone()
                .ok_or_else(|| Error::LeaseMissingVersion {
                    name: self.name.clone(),
                })?;
        let spec = lease.spec.unwrap_or_default();
        let record = LeaseRecord {
            holder: spec.holder_identity.filter(|h| !h.is_empty()),
            lease_duration: Duration::from_secs(
                spec.lease_duration_seconds.unwrap_or_default().max(0) as u64,
            ),
            acquire_time: spec.acquire_time.map(|t| t.0),
            renew_time: spec.renew_time.map(|t| t.0),
            transitions: spec.lease_transitions.unwrap_or_default(),
        };
        Ok(Some((record, resource_version)))
    }

    async fn create(&self, record: &LeaseRecord) -> Result<bool> {
        match self
            .api
            .create(&PostParams::default(), &self.to_lease(record, None))
            .await
        {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(e)) if e.code == 409 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn update(&self, record: &LeaseRecord, resource_version: &str) -> Result<bool> {
        match self
            .api
            .replace(
                &self.name,
                &PostParams::default(),
                &self.to_lease(record, Some(resource_version)),
            )
            .await
        {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(e)) if e.code == 409 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn describe(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

#[derive(Debug, Clone)]
pub struct LeaderElectionConfig {
    pub identity: String,
    pub lease_duration: Duration,
    pub renew_deadline: Duration,
    pub retry_period: Duration,
}

impl LeaderElectionConfig {
    pub fn new(identity: &str) -> Self {
        Self {
            identity: sanitize_lock_name(identity),
            lease_duration: DEFAULT_LEASE_DURATION,
            renew_deadline: DEFAULT_RENEW_DEADLINE,
            retry_period: DEFAULT_RETRY_PERIOD,
        }
    }
}

enum LeadingExit {
    Shutdown,
    Lost,
    WorkExited,
}

pub struct LeaderElector<L> {
    lock: L,
    config: LeaderElectionConfig,
    state: watch::Sender<LeaderState>,
}

impl<L: LeaseLock> LeaderElector<L> {
    pub fn new(lock: L, config: LeaderElectionConfig) -> Self {
        let (state, _) = watch::channel(LeaderState::NotLeading);
        Self {
            lock,
            config,
            state,
        }
    }

    pub fn state(&self) -> LeaderState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<LeaderState> {
        self.state.subscribe()
    }

    fn transition(&self, next: LeaderState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            info!(lock = %self.lock.describe(), identity = %self.config.identity, from = ?previous, to = ?next, "leader election state changed");
        }
    }

    /// One acquire or renew attempt at `now`. Returns whether this
    /// participant holds the lease afterwards.
    pub async fn try_acquire_or_renew(&self, now: DateTime<Utc>) -> Result<bool> {
        let identity = &self.config.identity;
        let Some((current, resource_version)) = self.lock.get().await? else {
            return self
                .lock
                .create(&LeaseRecord {
                    holder: Some(identity.clone()),
                    lease_duration: self.config.lease_duration,
                    acquire_time: Some(now),
                    renew_time: Some(now),
                    transitions: 0,
                })
                .await;
        };

        let held_by_us = current.holder.as_ref() == Some(identity);
        if !held_by_us && current.holder.is_some() && !current.expired(now) {
            return Ok(false);
        }

        let record = if held_by_us {
            LeaseRecord {
                renew_time: Some(now),
                lease_duration: self.config.lease_duration,
                ..current
            }
        } else {
            if let Some(previous) = &current.holder {
                debug!(%previous, "taking over expired lease");
            }
            LeaseRecord {
                holder: Some(identity.clone()),
                lease_duration: self.config.lease_duration,
                acquire_time: Some(now),
                renew_time: Some(now),
                transitions: current.transitions + 1,
            }
        };
        self.lock.update(&record, &resource_version).await
    }

    /// Gives up the lease if this participant holds it.
    pub async fn release(&self) -> Result<bool> {
        let Some((current, resource_version)) = self.lock.get().await? else {
            return Ok(false);
        };
        if current.holder.as_ref() != Some(&self.config.identity) {
            return Ok(false);
        }
        let record = LeaseRecord {
            holder: None,
            lease_duration: Duration::from_secs(1),
            ..current
        };
        self.lock.update(&record, &resource_version).await
    }

    fn jittered_retry(&self) -> Duration {
        let jitter: f64 = rand::random::<f64>() * 0.2;
        self.config.retry_period.mul_f64(1.0 + jitter)
    }

    /// Campaigns for the lease and runs `on_started_leading` while it is held.
    ///
    /// Returns `Ok(())` when `cancel` fires or the work returns on its own,
    /// releasing the lease in both cases, and [`Error::LeadershipLost`] when
    /// the lease could not be renewed within the renew deadline.
    pub async fn run<F, Fut>(&self, cancel: CancellationToken, on_started_leading: F) -> Result<()>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        info!(lock = %self.lock.describe(), identity = %self.config.identity, "waiting for leadership");
        let mut observed_holder: Option<String> = None;
        loop {
            let attempt = tokio::select! {
                _ = cancel.cancelled() => {
                    self.transition(LeaderState::Stopped);
                    return Ok(());
                }
                attempt = self.try_acquire_or_renew(Utc::now()) => attempt,
            };
            match attempt {
                Ok(true) => break,
                Ok(false) => {
                    if let Ok(Some((record, _))) = self.lock.get().await
                        && record.holder != observed_holder
                    {
                        info!(leader = ?record.holder, "new leader observed");
                        observed_holder = record.holder;
                    }
                }
                Err(e) => warn!(error = %e, "failed to acquire lease"),
            }
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.transition(LeaderState::Stopped);
                    return Ok(());
                }
                _ = tokio::time::sleep(self.jittered_retry()) => {}
            }
        }

        self.transition(LeaderState::Leading);
        let leading = cancel.child_token();
        let mut work = tokio::spawn(on_started_leading(leading.clone()));
        let mut last_renew = Instant::now();

        // Every attempt, and the sleep before it, is bounded by what is left
        // of the renew deadline, so leadership ends before the lease expires.
        let exit = loop {
            let remaining = self
                .config
                .renew_deadline
                .saturating_sub(last_renew.elapsed());
            if remaining.is_zero() {
                warn!("lease not renewed within the renew deadline");
                break LeadingExit::Lost;
            }
            tokio::select! {
                _ = cancel.cancelled() => break LeadingExit::Shutdown,
                res = &mut work => {
                    if let Err(e) = res {
                        error!(error = %e, "leader work failed");
                    }
                    break LeadingExit::WorkExited;
                }
                _ = tokio::time::sleep(self.config.retry_period.min(remaining)) => {
                    let started = Instant::now();
                    let remaining = self
                        .config
                        .renew_deadline
                        .saturating_sub(last_renew.elapsed());
                    let renewed = tokio::select! {
                        _ = cancel.cancelled() => break LeadingExit::Shutdown,
                        renewed = tokio::time::timeout(
                            remaining,
                            self.try_acquire_or_renew(Utc::now()),
                        ) => renewed,
                    };
                    match renewed {
                        Ok(Ok(true)) => last_renew = started,
                        Ok(Ok(false)) => {
                            warn!("lease taken by another participant");
                            break LeadingExit::Lost;
                        }
                        Ok(Err(e)) => warn!(error = %e, "failed to renew lease"),
                        Err(_) => warn!("lease renewal timed out"),
                    }
                }
            }
        };

        leading.cancel();
        if !matches!(exit, LeadingExit::WorkExited)
            && let Err(e) = work.await
        {
            error!(error = %e, "leader work failed");
        }
        self.transition(LeaderState::Stopped);

        match exit {
            LeadingExit::Lost => Err(Error::LeadershipLost {
                lock: self.lock.describe(),
            }),
            LeadingExit::Shutdown | LeadingExit::WorkExited => {
                if let Err(e) = self.release().await {
                    warn!(error = %e, "failed to release lease");
                }
                Ok(())
            }
        }
    }
}
