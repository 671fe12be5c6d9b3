//! Sandbox orchestration for per-tenant containers and microVMs.
//!
//! This crate provides the lifecycle managers for both backends, the provider
//! abstraction that unifies them, and the two background services that keep
//! runtime state honest: the cleanup sweep (idle and session limits) and the
//! reconciler (persisted records vs. live backend state).

pub mod cleanup;
pub mod config;
pub mod container;
pub mod error;
pub mod images;
pub mod labels;
pub mod microvm;
pub mod provider;
pub mod reconciler;
pub mod registry;
pub mod roles;
pub mod service;
pub mod store;
pub mod types;

pub use cleanup::{CleanupReport, CleanupService, CleanupTarget};
pub use config::{CleanupConfig, OrchestratorConfig, ReconcilerConfig};
pub use container::{ContainerManager, ContainerSettings};
pub use error::{Result, SandboxError};
pub use microvm::{MicroVmManager, MicroVmSettings};
pub use provider::{Provider, ProviderRegistry};
pub use reconciler::{ReconcileReport, ReconcileTarget, Reconciler};
pub use registry::SandboxRegistry;
pub use service::ServiceHandle;
pub use store::{LocalRecordStore, PersistedRecord, RecordStore};
pub use types::{
    CreateConfig, RegistrySummary, ResourceStats, SandboxInfo, SandboxStatus, TerminalConnection,
    TerminalControl, canonical_state,
};

pub const DEFAULT_NETWORK_NAME: &str = "sandbox-isolated";
pub const DEFAULT_BRIDGE_NAME: &str = "sandbox-br0";
pub const DEFAULT_GUEST_AGENT_PORT: u32 = 1234;
pub const DEFAULT_MEMORY_MB: u64 = 512;
pub const DEFAULT_CPU_MILLICORES: u64 = 500;
