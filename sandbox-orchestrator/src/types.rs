//! Shared data model for every backend.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::Result;

/// Lifecycle status of a sandbox, shared by the registry and persisted records.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxStatus {
    Creating,
    Configuring,
    Starting,
    Running,
    Paused,
    Stopped,
    Error,
    Deleted,
    #[default]
    Unknown,
}

impl SandboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SandboxStatus::Creating => "creating",
            SandboxStatus::Configuring => "configuring",
            SandboxStatus::Starting => "starting",
            SandboxStatus::Running => "running",
            SandboxStatus::Paused => "paused",
            SandboxStatus::Stopped => "stopped",
            SandboxStatus::Error => "error",
            SandboxStatus::Deleted => "deleted",
            SandboxStatus::Unknown => "unknown",
        }
    }
}

impl fmt::Display for SandboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Map a raw engine state string onto the canonical status vocabulary.
///
/// Total over every input: states outside the documented engine vocabulary
/// map to `Unknown`.
pub fn canonical_state(raw: &str) -> SandboxStatus {
    match raw {
        "running" => SandboxStatus::Running,
        "paused" => SandboxStatus::Paused,
        "exited" | "dead" => SandboxStatus::Stopped,
        "created" | "restarting" => SandboxStatus::Starting,
        _ => SandboxStatus::Unknown,
    }
}

/// A live sandbox as tracked by a lifecycle manager.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SandboxInfo {
    /// Backend-assigned ID (engine container ID or VM ID).
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    /// Image identifier as requested (`ubuntu`, `custom:repo/img:tag`, rootfs name).
    pub image: String,
    pub provider: String,
    pub status: SandboxStatus,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    pub ip_address: String,
    pub labels: HashMap<String, String>,
}

/// Request to provision a new sandbox.
#[derive(Clone, Debug, Default)]
pub struct CreateConfig {
    pub tenant_id: String,
    pub name: String,
    /// Supported image identifier, or `custom` together with `custom_image`.
    pub image: String,
    pub custom_image: Option<String>,
    /// Memory limit in MiB. Zero selects the backend default.
    pub memory_mb: u64,
    /// CPU limit in millicores (1000 = one CPU). Zero selects the backend default.
    pub cpu_millicores: u64,
    pub disk_mb: u64,
    pub role: String,
    /// Caller labels. These win over system labels on key conflicts.
    pub labels: HashMap<String, String>,
}

/// Point-in-time resource usage of a sandbox.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceStats {
    pub cpu_percent: f64,
    pub memory: u64,
    pub memory_limit: u64,
    pub disk_read: u64,
    pub disk_write: u64,
    pub disk_usage: u64,
    pub disk_limit: u64,
    pub net_rx: u64,
    pub net_tx: u64,
}

/// Out-of-band controls for an open terminal session.
#[async_trait::async_trait]
pub trait TerminalControl: Send + Sync {
    async fn resize(&self, cols: u16, rows: u16) -> Result<()>;
    async fn close(&self) -> Result<()>;
}

/// Bidirectional byte stream attached to an interactive shell.
pub struct TerminalConnection {
    pub id: String,
    pub provider: String,
    pub reader: Pin<Box<dyn AsyncRead + Send>>,
    pub writer: Pin<Box<dyn AsyncWrite + Send>>,
    pub control: Box<dyn TerminalControl>,
}

impl fmt::Debug for TerminalConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TerminalConnection")
            .field("id", &self.id)
            .field("provider", &self.provider)
            .finish_non_exhaustive()
    }
}

/// Aggregate counts over a registry.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RegistrySummary {
    pub total: usize,
    pub running: usize,
    pub stopped: usize,
    pub other: usize,
    pub by_tenant: HashMap<String, usize>,
    pub by_image: HashMap<String, usize>,
}
