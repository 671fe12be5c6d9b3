//! Reconciler: repairs drift between persisted records and live backends.
//!
//! Each tick reads every persisted record once, lists live resources once per
//! backend, and applies one action per record:
//!
//! | Persisted | Live | Action |
//! |---|---|---|
//! | no backend ID, `error` | - | soft-delete once the error grace period has passed |
//! | no backend ID, other | - | mark `error`, soft-delete |
//! | backend ID | absent | soft-delete, drop from the registry |
//! | backend ID | `starting`, or persisted `configuring`, past the stuck threshold | promote to `running` if live is running, else stop (force-remove on failure) and mark `stopped` |
//! | backend ID | canonical state differs | write the canonical state to the record and the registry |
//! | backend ID | matches | nothing |

use blueprint_sdk::{error, info, warn};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::config::ReconcilerConfig;
use crate::error::Result;
use crate::service::{ServiceHandle, spawn_periodic};
use crate::store::{PersistedRecord, RecordStore};
use crate::types::{SandboxStatus, canonical_state};

/// Upper bound for a single listing or store call inside a tick.
const BACKEND_CALL_TIMEOUT: Duration = Duration::from_secs(60);

/// Backend operations the reconciler drives.
#[async_trait::async_trait]
pub trait ReconcileTarget: Send + Sync {
    /// Provider name matched against [`PersistedRecord::provider`].
    fn provider(&self) -> &str;

    /// Raw backend state keyed by backend ID, from one listing.
    async fn live_states(&self) -> Result<HashMap<String, String>>;

    async fn graceful_stop(&self, id: &str, timeout: Duration) -> Result<()>;

    async fn force_remove(&self, id: &str) -> Result<()>;

    /// Drop from the in-memory registry without a backend call.
    fn forget(&self, id: &str) -> bool;

    fn set_status(&self, id: &str, status: SandboxStatus) -> bool;
}

/// Per-tick counts.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub checked: usize,
    /// Status writes caused by drift.
    pub updated: usize,
    /// Soft deletes.
    pub removed: usize,
    /// Stuck records converged to `running` or `stopped`.
    pub recovered: usize,
    /// Records whose provider has no registered target.
    pub skipped: usize,
    pub failed: usize,
}

impl ReconcileReport {
    pub fn changed(&self) -> bool {
        self.updated + self.removed + self.recovered > 0
    }
}

pub struct Reconciler {
    store: Arc<dyn RecordStore>,
    targets: HashMap<String, Arc<dyn ReconcileTarget>>,
    config: ReconcilerConfig,
}

fn older_than(ts: DateTime<Utc>, now: DateTime<Utc>, threshold: Duration) -> bool {
    (now - ts).to_std().is_ok_and(|age| age > threshold)
}

impl Reconciler {
    pub fn new(store: Arc<dyn RecordStore>, config: ReconcilerConfig) -> Self {
        Self {
            store,
            targets: HashMap::new(),
            config,
        }
    }

    pub fn with_target(mut self, target: Arc<dyn ReconcileTarget>) -> Self {
        self.targets.insert(target.provider().to_string(), target);
        self
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    /// Run once now, then every `config.interval` until shutdown.
    pub fn spawn(self: Arc<Self>) -> ServiceHandle {
        let period = self.config.interval;
        spawn_periodic("reconciler", period, true, move || {
            let reconciler = self.clone();
            async move {
                let report = reconciler.tick().await;
                if report.changed() || report.failed > 0 {
                    info!(
                        "reconciler: checked {} records, updated {}, removed {}, recovered {}, failed {}",
                        report.checked,
                        report.updated,
                        report.removed,
                        report.recovered,
                        report.failed
                    );
                }
            }
        })
    }

    /// One full reconcile pass.
    pub async fn tick(&self) -> ReconcileReport {
        let mut report = ReconcileReport::default();

        let records = match tokio::time::timeout(BACKEND_CALL_TIMEOUT, self.store.all_records())
            .await
        {
            Ok(Ok(records)) => records,
            Ok(Err(err)) => {
                error!("reconciler: failed to read records: {err}");
                return report;
            }
            Err(_) => {
                error!("reconciler: timed out reading records");
                return report;
            }
        };
        if records.is_empty() {
            return report;
        }

        let mut live: HashMap<String, HashMap<String, String>> = HashMap::new();
        for (provider, target) in &self.targets {
            if !records.iter().any(|r| &r.provider == provider) {
                continue;
            }
            match tokio::time::timeout(BACKEND_CALL_TIMEOUT, target.live_states()).await {
                Ok(Ok(states)) => {
                    live.insert(provider.clone(), states);
                }
                Ok(Err(err)) => error!("reconciler: failed to list {provider} resources: {err}"),
                Err(_) => error!("reconciler: timed out listing {provider} resources"),
            }
        }

        let now = Utc::now();
        for record in records {
            let Some(target) = self.targets.get(&record.provider) else {
                report.skipped += 1;
                continue;
            };
            // Without a listing, absence means nothing. Leave the record for the next tick.
            let Some(states) = live.get(&record.provider) else {
                report.skipped += 1;
                continue;
            };
            report.checked += 1;
            if let Err(err) = self
                .reconcile_record(&record, target.as_ref(), states, now, &mut report)
                .await
            {
                report.failed += 1;
                error!("reconciler: failed to reconcile record {}: {err}", record.id);
            }
        }

        report
    }

    async fn reconcile_record(
        &self,
        record: &PersistedRecord,
        target: &dyn ReconcileTarget,
        states: &HashMap<String, String>,
        now: DateTime<Utc>,
        report: &mut ReconcileReport,
    ) -> Result<()> {
        let Some(backend_id) = record.backend_id() else {
            return self.reconcile_unprovisioned(record, now, report).await;
        };

        let Some(raw) = states.get(backend_id) else {
            info!(
                "reconciler: backend resource {} for record {} is gone, soft-deleting",
                backend_id, record.id
            );
            self.store.soft_delete(&record.id).await?;
            target.forget(backend_id);
            report.removed += 1;
            return Ok(());
        };

        let live = canonical_state(raw);
        let stuck_candidate =
            live == SandboxStatus::Starting || record.status == SandboxStatus::Configuring;
        if stuck_candidate && older_than(record.updated_at, now, self.config.stuck_threshold) {
            return self
                .recover_stuck(record, backend_id, live, target, report)
                .await;
        }

        if live != record.status {
            self.store.update_status(&record.id, live).await?;
            target.set_status(backend_id, live);
            report.updated += 1;
        }
        Ok(())
    }

    async fn reconcile_unprovisioned(
        &self,
        record: &PersistedRecord,
        now: DateTime<Utc>,
        report: &mut ReconcileReport,
    ) -> Result<()> {
        match record.status {
            SandboxStatus::Deleted => Ok(()),
            SandboxStatus::Error => {
                if older_than(record.updated_at, now, self.config.error_grace) {
                    self.store.soft_delete(&record.id).await?;
                    report.removed += 1;
                }
                Ok(())
            }
            _ => {
                warn!(
                    "reconciler: record {} never got a backend resource, marking error",
                    record.id
                );
                self.store
                    .update_status(&record.id, SandboxStatus::Error)
                    .await?;
                self.store.soft_delete(&record.id).await?;
                report.removed += 1;
                Ok(())
            }
        }
    }

    async fn recover_stuck(
        &self,
        record: &PersistedRecord,
        backend_id: &str,
        live: SandboxStatus,
        target: &dyn ReconcileTarget,
        report: &mut ReconcileReport,
    ) -> Result<()> {
        if live == SandboxStatus::Running {
            info!("reconciler: stuck record {} is running, promoting", record.id);
            self.store
                .update_status(&record.id, SandboxStatus::Running)
                .await?;
            target.set_status(backend_id, SandboxStatus::Running);
            report.recovered += 1;
            return Ok(());
        }

        warn!(
            "reconciler: record {} stuck in {} ({} live), stopping",
            record.id, record.status, live
        );
        let stop_timeout = self.config.stop_timeout;
        let stopped = tokio::time::timeout(
            stop_timeout + Duration::from_secs(5),
            target.graceful_stop(backend_id, stop_timeout),
        )
        .await;
        match stopped {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                warn!("reconciler: graceful stop of {backend_id} failed, force-removing: {err}");
                self.force_remove(backend_id, target).await;
            }
            Err(_) => {
                warn!("reconciler: graceful stop of {backend_id} timed out, force-removing");
                self.force_remove(backend_id, target).await;
            }
        }

        self.store
            .update_status(&record.id, SandboxStatus::Stopped)
            .await?;
        target.set_status(backend_id, SandboxStatus::Stopped);
        report.recovered += 1;
        Ok(())
    }

    async fn force_remove(&self, backend_id: &str, target: &dyn ReconcileTarget) {
        match tokio::time::timeout(BACKEND_CALL_TIMEOUT, target.force_remove(backend_id)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => error!("reconciler: failed to force-remove {backend_id}: {err}"),
            Err(_) => error!("reconciler: timed out force-removing {backend_id}"),
        }
    }
}
