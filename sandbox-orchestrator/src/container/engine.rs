//! Engine-agnostic container API consumed by [`ContainerManager`](super::ContainerManager).

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::types::{ResourceStats, TerminalConnection};

/// Everything needed to create one sandbox container.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub env: Vec<String>,
    pub labels: HashMap<String, String>,
    pub memory_bytes: i64,
    pub cpu_period: i64,
    pub cpu_quota: i64,
    pub pids_limit: i64,
    pub security_opt: Vec<String>,
    pub cap_drop: Vec<String>,
    pub cap_add: Vec<String>,
    /// `volume:path` binds.
    pub binds: Vec<String>,
    pub tmpfs: HashMap<String, String>,
    pub network: String,
    pub hostname: String,
    pub working_dir: String,
    pub cmd: Vec<String>,
}

/// Inspect/list view of one engine container.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EngineContainer {
    pub id: String,
    pub name: String,
    pub image: String,
    /// Raw engine state (`running`, `exited`, ...).
    pub state: String,
    pub labels: HashMap<String, String>,
    pub created_at: Option<DateTime<Utc>>,
    pub ip_address: String,
}

/// Captured result of a non-interactive command.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i64,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ExecOutput {
    /// Stdout followed by stderr.
    pub fn combined(&self) -> Vec<u8> {
        let mut out = self.stdout.clone();
        out.extend_from_slice(&self.stderr);
        out
    }
}

#[async_trait::async_trait]
pub trait ContainerEngine: Send + Sync {
    async fn ping(&self) -> Result<()>;

    async fn image_exists(&self, reference: &str) -> Result<bool>;

    async fn pull_image(&self, reference: &str) -> Result<()>;

    /// Create the named network if it does not already exist.
    async fn ensure_network(&self, name: &str) -> Result<()>;

    /// Container with exactly this name, if any.
    async fn find_by_name(&self, name: &str) -> Result<Option<EngineContainer>>;

    /// Returns the new container ID.
    async fn create(&self, spec: &ContainerSpec) -> Result<String>;

    async fn start(&self, id: &str) -> Result<()>;

    /// Graceful stop with `timeout` before the engine kills the process.
    async fn stop(&self, id: &str, timeout: Duration) -> Result<()>;

    /// Remove the container. Named volumes are always kept.
    async fn remove(&self, id: &str, force: bool) -> Result<()>;

    /// Change the memory and CPU limits of an existing container in place.
    async fn update_resources(
        &self,
        id: &str,
        memory_bytes: i64,
        cpu_period: i64,
        cpu_quota: i64,
    ) -> Result<()>;

    async fn inspect(&self, id: &str) -> Result<EngineContainer>;

    /// All containers, including stopped ones. `managed_only` filters on the
    /// managed-resource label.
    async fn list(&self, managed_only: bool) -> Result<Vec<EngineContainer>>;

    async fn exec(&self, id: &str, cmd: Vec<String>) -> Result<ExecOutput>;

    async fn open_shell(
        &self,
        id: &str,
        shell: &str,
        cols: u16,
        rows: u16,
    ) -> Result<TerminalConnection>;

    async fn stats(&self, id: &str) -> Result<ResourceStats>;

    async fn stream_stats(&self, id: &str) -> Result<mpsc::Receiver<ResourceStats>>;
}
