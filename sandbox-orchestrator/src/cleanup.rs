//! Idle and hard-expiry enforcement for guest sandboxes.
//!
//! Each tick first removes sandboxes whose session cap has elapsed, then stops
//! guest sandboxes idle beyond `CleanupConfig::idle_timeout`. Stopping keeps
//! the data volume so the sandbox can be resumed later.

use blueprint_sdk::{error, info, warn};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::config::CleanupConfig;
use crate::error::{Result, SandboxError};
use crate::service::{ServiceHandle, spawn_periodic};
use crate::types::{SandboxInfo, SandboxStatus};

const EXPIRY_STOP_TIMEOUT: Duration = Duration::from_secs(60);
const EXPIRY_REMOVE_TIMEOUT: Duration = Duration::from_secs(60);
const IDLE_STOP_TIMEOUT: Duration = Duration::from_secs(30);

/// Lifecycle operations the cleanup sweeps call back into.
#[async_trait::async_trait]
pub trait CleanupTarget: Send + Sync {
    /// Running guest sandboxes idle for longer than `threshold`.
    fn idle_sandboxes(&self, threshold: Duration) -> Vec<SandboxInfo>;

    fn expired_guest_sandboxes(&self) -> Vec<SandboxInfo>;

    async fn stop_sandbox(&self, id: &str) -> Result<()>;

    async fn remove_sandbox(&self, id: &str) -> Result<()>;
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub expired_removed: usize,
    pub idle_stopped: usize,
    pub failed: usize,
}

pub struct CleanupService {
    targets: Vec<Arc<dyn CleanupTarget>>,
    config: CleanupConfig,
}

async fn bounded<F>(limit: Duration, fut: F) -> Result<()>
where
    F: Future<Output = Result<()>>,
{
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| SandboxError::Unavailable(format!("operation exceeded {}s", limit.as_secs())))?
}

impl CleanupService {
    pub fn new(config: CleanupConfig) -> Self {
        Self {
            targets: Vec::new(),
            config,
        }
    }

    pub fn with_target(mut self, target: Arc<dyn CleanupTarget>) -> Self {
        self.targets.push(target);
        self
    }

    pub fn config(&self) -> &CleanupConfig {
        &self.config
    }

    /// Start the periodic loop. Returns `None` when cleanup is disabled.
    /// The first sweep runs one interval after spawning.
    pub fn spawn(self: Arc<Self>) -> Option<ServiceHandle> {
        if !self.config.enabled {
            info!("cleanup: disabled");
            return None;
        }
        let period = self.config.check_interval;
        Some(spawn_periodic("cleanup", period, false, move || {
            let service = self.clone();
            async move {
                let report = service.run_once().await;
                if report != CleanupReport::default() {
                    info!(
                        "cleanup: removed {} expired, stopped {} idle, {} failed",
                        report.expired_removed, report.idle_stopped, report.failed
                    );
                }
            }
        }))
    }

    /// One expiry sweep followed by one idle sweep across all targets.
    pub async fn run_once(&self) -> CleanupReport {
        let mut report = CleanupReport::default();
        for target in &self.targets {
            self.sweep_expired(target.as_ref(), &mut report).await;
        }
        for target in &self.targets {
            self.sweep_idle(target.as_ref(), &mut report).await;
        }
        report
    }

    async fn sweep_expired(&self, target: &dyn CleanupTarget, report: &mut CleanupReport) {
        for sandbox in target.expired_guest_sandboxes() {
            info!(
                "cleanup: session expired for sandbox {} ({}), tenant {}",
                sandbox.name, sandbox.id, sandbox.tenant_id
            );
            if sandbox.status == SandboxStatus::Running {
                if let Err(err) = bounded(EXPIRY_STOP_TIMEOUT, target.stop_sandbox(&sandbox.id)).await
                {
                    warn!("cleanup: failed to stop expired sandbox {}: {err}", sandbox.id);
                }
            }
            match bounded(EXPIRY_REMOVE_TIMEOUT, target.remove_sandbox(&sandbox.id)).await {
                Ok(()) => report.expired_removed += 1,
                Err(err) => {
                    report.failed += 1;
                    error!("cleanup: failed to remove expired sandbox {}: {err}", sandbox.id);
                }
            }
        }
    }

    async fn sweep_idle(&self, target: &dyn CleanupTarget, report: &mut CleanupReport) {
        for sandbox in target.idle_sandboxes(self.config.idle_timeout) {
            info!(
                "cleanup: stopping idle sandbox {} ({}), tenant {}",
                sandbox.name, sandbox.id, sandbox.tenant_id
            );
            match bounded(IDLE_STOP_TIMEOUT, target.stop_sandbox(&sandbox.id)).await {
                Ok(()) => report.idle_stopped += 1,
                Err(err) => {
                    report.failed += 1;
                    error!("cleanup: failed to stop idle sandbox {}: {err}", sandbox.id);
                }
            }
        }
    }
}
