//! Container lifecycle manager.
//!
//! Owns a [`SandboxRegistry`] for one container engine. Registry writes happen
//! in short critical sections before or after engine calls, never across them.

pub mod docker;
pub mod engine;
#[cfg(any(test, feature = "test-utils"))]
pub mod mock;

pub use docker::DockerEngine;
pub use engine::{ContainerEngine, ContainerSpec, EngineContainer, ExecOutput};

use blueprint_sdk::{info, warn};
use chrono::{Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::config::OrchestratorConfig;
use crate::error::{Result, SandboxError};
use crate::images;
use crate::labels;
use crate::registry::SandboxRegistry;
use crate::roles;
use crate::types::{
    CreateConfig, RegistrySummary, ResourceStats, SandboxInfo, SandboxStatus, TerminalConnection,
};
use crate::{DEFAULT_CPU_MILLICORES, DEFAULT_MEMORY_MB, DEFAULT_NETWORK_NAME};

pub const PROVIDER_NAME: &str = "docker";

/// In-container mount point of the per-sandbox volume.
pub const HOME_MOUNT: &str = "/home/user";

const CPU_PERIOD: i64 = 100_000;
const PIDS_LIMIT: i64 = 512;
const PING_TIMEOUT: Duration = Duration::from_secs(5);
const ROLE_SETUP_TIMEOUT: Duration = Duration::from_secs(120);
const MIB: u64 = 1024 * 1024;

const CAP_ADD: &[&str] = &[
    "CHOWN",
    "DAC_OVERRIDE",
    "FOWNER",
    "SETGID",
    "SETUID",
    "KILL",
    "NET_BIND_SERVICE",
    "SYS_PTRACE",
];

#[derive(Clone, Debug)]
pub struct ContainerSettings {
    /// Isolated engine network every sandbox joins.
    pub network: String,
    pub stop_timeout: Duration,
    /// Pull catalog images that are missing locally.
    pub pull_images: bool,
    /// Upper bound for a single sandbox's CPU request.
    pub max_cpu_millicores: u64,
}

impl Default for ContainerSettings {
    fn default() -> Self {
        Self {
            network: DEFAULT_NETWORK_NAME.to_string(),
            stop_timeout: Duration::from_secs(10),
            pull_images: true,
            max_cpu_millicores: host_cpu_millicores(),
        }
    }
}

impl ContainerSettings {
    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self {
            network: config.network_name.clone(),
            stop_timeout: config.stop_timeout,
            pull_images: config.pull_images,
            max_cpu_millicores: host_cpu_millicores(),
        }
    }
}

fn host_cpu_millicores() -> u64 {
    std::thread::available_parallelism()
        .map(|n| n.get() as u64 * 1000)
        .unwrap_or(1000)
}

/// Engine name for a tenant's sandbox. Also used as the volume name.
pub fn container_name(tenant_id: &str, name: &str) -> String {
    let sanitize = |s: &str| -> String {
        s.chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                    c
                } else {
                    '-'
                }
            })
            .collect()
    };
    format!("sandbox-{}-{}", sanitize(tenant_id), sanitize(name))
}

pub(crate) fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 63 {
        return Err(SandboxError::Validation(
            "sandbox name must be 1-63 characters".into(),
        ));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(SandboxError::Validation(format!(
            "sandbox name '{name}' may only contain letters, digits, '-', '_' and '.'"
        )));
    }
    Ok(())
}

/// Memory limit in bytes as the engine expects it.
pub(crate) fn memory_bytes(memory_mb: u64) -> Result<i64> {
    memory_mb
        .checked_mul(MIB)
        .and_then(|bytes| i64::try_from(bytes).ok())
        .ok_or_else(|| {
            SandboxError::Validation(format!("memory limit of {memory_mb} MiB is out of range"))
        })
}

fn cpu_quota(millicores: u64) -> i64 {
    i64::try_from(millicores).map_or(i64::MAX, |mc| mc.saturating_mul(CPU_PERIOD) / 1000)
}

/// Labels set by the manager itself. They are derived again on create.
const SYSTEM_LABELS: &[&str] = &[
    labels::MANAGED,
    labels::TENANT_ID,
    labels::NAME,
    labels::IMAGE,
    labels::MEMORY_MB,
    labels::CPU_MILLICORES,
    labels::SHELL,
    labels::ROLE,
    labels::DISK_MB,
];

fn recreate_config(info: &SandboxInfo, memory_mb: u64, cpu_millicores: u64) -> CreateConfig {
    let (image, custom_image) = match info.image.split_once(':') {
        Some((images::CUSTOM, reference)) => {
            (images::CUSTOM.to_string(), Some(reference.to_string()))
        }
        _ => (info.image.clone(), None),
    };
    let recorded = |key: &str| labels::parse_u64(&info.labels, key).unwrap_or(0);
    CreateConfig {
        tenant_id: info.tenant_id.clone(),
        name: info.name.clone(),
        image,
        custom_image,
        memory_mb: if memory_mb == 0 {
            recorded(labels::MEMORY_MB)
        } else {
            memory_mb
        },
        cpu_millicores: if cpu_millicores == 0 {
            recorded(labels::CPU_MILLICORES)
        } else {
            cpu_millicores
        },
        disk_mb: recorded(labels::DISK_MB),
        role: info.labels.get(labels::ROLE).cloned().unwrap_or_default(),
        labels: info
            .labels
            .iter()
            .filter(|(key, _)| !SYSTEM_LABELS.contains(&key.as_str()))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect(),
    }
}

pub struct ContainerManager {
    engine: Arc<dyn ContainerEngine>,
    registry: SandboxRegistry,
    settings: ContainerSettings,
}

impl ContainerManager {
    pub fn new(engine: Arc<dyn ContainerEngine>, settings: ContainerSettings) -> Self {
        Self {
            engine,
            registry: SandboxRegistry::new(),
            settings,
        }
    }

    pub fn engine(&self) -> &Arc<dyn ContainerEngine> {
        &self.engine
    }

    pub fn registry(&self) -> &SandboxRegistry {
        &self.registry
    }

    pub fn settings(&self) -> &ContainerSettings {
        &self.settings
    }

    /// Whether the engine answers a ping within five seconds.
    pub async fn ping(&self) -> Result<()> {
        tokio::time::timeout(PING_TIMEOUT, self.engine.ping())
            .await
            .map_err(|_| SandboxError::Unavailable("container engine ping timed out".into()))?
    }

    fn build_spec(
        &self,
        config: &CreateConfig,
        image: &images::ResolvedImage,
        container_name: &str,
    ) -> Result<ContainerSpec> {
        let memory_mb = if config.memory_mb == 0 {
            DEFAULT_MEMORY_MB
        } else {
            config.memory_mb
        };
        let millicores = self.cap_millicores(if config.cpu_millicores == 0 {
            DEFAULT_CPU_MILLICORES
        } else {
            config.cpu_millicores
        });

        let mut system = HashMap::from([
            (labels::MANAGED.to_string(), "true".to_string()),
            (labels::TENANT_ID.to_string(), config.tenant_id.clone()),
            (labels::NAME.to_string(), config.name.clone()),
            (labels::IMAGE.to_string(), image.id.clone()),
            (labels::MEMORY_MB.to_string(), memory_mb.to_string()),
            (labels::CPU_MILLICORES.to_string(), millicores.to_string()),
            (labels::SHELL.to_string(), image.shell.to_string()),
        ]);
        if !config.role.is_empty() {
            system.insert(labels::ROLE.to_string(), config.role.clone());
        }
        if config.disk_mb > 0 {
            system.insert(labels::DISK_MB.to_string(), config.disk_mb.to_string());
        }

        let memory_bytes = memory_bytes(memory_mb)?;
        Ok(ContainerSpec {
            name: container_name.to_string(),
            image: image.reference.clone(),
            env: vec![
                format!("HOME={HOME_MOUNT}"),
                "TERM=xterm-256color".to_string(),
                format!("SHELL={}", image.shell),
                format!("TENANT_ID={}", config.tenant_id),
                format!("SANDBOX_NAME={}", config.name),
            ],
            labels: labels::merge_labels(system, &config.labels),
            memory_bytes,
            cpu_period: CPU_PERIOD,
            cpu_quota: cpu_quota(millicores),
            pids_limit: PIDS_LIMIT,
            security_opt: vec!["no-new-privileges:true".to_string()],
            cap_drop: vec!["ALL".to_string()],
            cap_add: CAP_ADD.iter().map(|c| c.to_string()).collect(),
            binds: vec![format!("{container_name}:{HOME_MOUNT}")],
            tmpfs: HashMap::from([
                ("/tmp".to_string(), "rw,nosuid,size=256m".to_string()),
                ("/run".to_string(), "rw,nosuid,size=64m".to_string()),
            ]),
            network: self.settings.network.clone(),
            hostname: config.name.clone(),
            working_dir: HOME_MOUNT.to_string(),
            cmd: vec!["sleep".to_string(), "infinity".to_string()],
        })
    }

    fn cap_millicores(&self, millicores: u64) -> u64 {
        millicores.min(self.settings.max_cpu_millicores.max(1))
    }

    async fn ensure_image(&self, image: &images::ResolvedImage) -> Result<()> {
        if self.engine.image_exists(&image.reference).await? {
            return Ok(());
        }
        if !self.settings.pull_images && !image.custom {
            return Err(SandboxError::Provision(format!(
                "image {} is not present locally and pulls are disabled",
                image.reference
            )));
        }
        info!("container: pulling image {}", image.reference);
        self.engine.pull_image(&image.reference).await.map_err(|err| {
            SandboxError::Provision(format!("Failed to pull image {}: {err}", image.reference))
        })
    }

    /// Remove a leftover engine container occupying the target name.
    async fn clear_stale(&self, tenant_id: &str, container_name: &str) -> Result<()> {
        let Some(existing) = self.engine.find_by_name(container_name).await? else {
            return Ok(());
        };
        match existing.labels.get(labels::TENANT_ID) {
            Some(owner) if owner != tenant_id => Err(SandboxError::Validation(format!(
                "container name '{container_name}' is in use by another tenant"
            ))),
            _ => {
                warn!(
                    "container: removing stale container {} ({})",
                    container_name, existing.id
                );
                self.registry.remove(&existing.id);
                self.engine.remove(&existing.id, true).await
            }
        }
    }

    /// Provision and start a sandbox container.
    pub async fn create(&self, config: CreateConfig) -> Result<SandboxInfo> {
        if config.tenant_id.is_empty() {
            return Err(SandboxError::Validation("tenant_id is required".into()));
        }
        validate_name(&config.name)?;
        let image = images::resolve(&config.image, config.custom_image.as_deref())?;
        let role_setup = roles::setup_command(&config.role)?;

        if self
            .registry
            .list_tenant(&config.tenant_id)
            .iter()
            .any(|info| info.name == config.name)
        {
            return Err(SandboxError::Validation(format!(
                "sandbox '{}' already exists for tenant {}",
                config.name, config.tenant_id
            )));
        }
        if let Some(tier) = config.labels.get(labels::TIER) {
            let limit = labels::tenant_limit(tier);
            if self.registry.count_tenant(&config.tenant_id) >= limit {
                return Err(SandboxError::Validation(format!(
                    "tenant {} reached the {tier} limit of {limit} sandboxes",
                    config.tenant_id
                )));
            }
        }

        let name = container_name(&config.tenant_id, &config.name);
        let spec = self.build_spec(&config, &image, &name)?;

        self.ensure_image(&image).await?;
        self.engine.ensure_network(&self.settings.network).await?;
        self.clear_stale(&config.tenant_id, &name).await?;
        let id = self.engine.create(&spec).await.map_err(|err| {
            SandboxError::Provision(format!("Failed to create container {name}: {err}"))
        })?;

        if let Err(err) = self.engine.start(&id).await {
            self.rollback(&id).await;
            return Err(SandboxError::Provision(format!(
                "Failed to start container {name}: {err}"
            )));
        }

        let inspected = match self.engine.inspect(&id).await {
            Ok(inspected) => inspected,
            Err(err) => {
                self.rollback(&id).await;
                return Err(SandboxError::Provision(format!(
                    "Failed to inspect container {name}: {err}"
                )));
            }
        };

        let now = Utc::now();
        let info = SandboxInfo {
            id: id.clone(),
            tenant_id: config.tenant_id.clone(),
            name: config.name.clone(),
            image: image.id.clone(),
            provider: PROVIDER_NAME.to_string(),
            status: SandboxStatus::Running,
            created_at: now,
            last_used_at: now,
            ip_address: inspected.ip_address,
            labels: spec.labels,
        };
        let Some(cmd) = role_setup else {
            self.registry.insert(info.clone(), ());
            info!(
                "container: created sandbox {} ({}) for tenant {}",
                info.name, id, info.tenant_id
            );
            return Ok(info);
        };

        self.registry.insert(
            SandboxInfo {
                status: SandboxStatus::Configuring,
                ..info.clone()
            },
            (),
        );
        self.apply_role(&id, &config.role, cmd).await;
        if !self.registry.set_status(&id, SandboxStatus::Running) {
            return Err(SandboxError::Provision(format!(
                "container {name} was removed during role setup"
            )));
        }
        info!(
            "container: created sandbox {} ({}) for tenant {} with role {}",
            info.name, id, info.tenant_id, config.role
        );
        Ok(info)
    }

    /// Install a role's tools. Failures leave a usable sandbox behind and
    /// are only logged.
    async fn apply_role(&self, id: &str, role: &str, cmd: Vec<String>) {
        match tokio::time::timeout(ROLE_SETUP_TIMEOUT, self.engine.exec(id, cmd)).await {
            Ok(Ok(output)) if output.exit_code == 0 => {
                info!("container: role {role} set up in {id}");
            }
            Ok(Ok(output)) => warn!(
                "container: role {role} setup in {id} exited with {}: {}",
                output.exit_code,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
            Ok(Err(err)) => warn!("container: role {role} setup in {id} failed: {err}"),
            Err(_) => warn!("container: role {role} setup in {id} timed out"),
        }
    }

    /// Change memory and CPU limits of a live sandbox. Zero keeps the current
    /// value.
    pub async fn update_resources(
        &self,
        id: &str,
        memory_mb: u64,
        cpu_millicores: u64,
    ) -> Result<SandboxInfo> {
        let info = self.require(id)?;
        let memory_mb = match memory_mb {
            0 => labels::parse_u64(&info.labels, labels::MEMORY_MB).unwrap_or(DEFAULT_MEMORY_MB),
            mb => mb,
        };
        let millicores = self.cap_millicores(match cpu_millicores {
            0 => labels::parse_u64(&info.labels, labels::CPU_MILLICORES)
                .unwrap_or(DEFAULT_CPU_MILLICORES),
            mc => mc,
        });
        let bytes = memory_bytes(memory_mb)?;

        self.engine
            .update_resources(&info.id, bytes, CPU_PERIOD, cpu_quota(millicores))
            .await?;
        self.registry.update(&info.id, |info, _| {
            info.labels
                .insert(labels::MEMORY_MB.to_string(), memory_mb.to_string());
            info.labels
                .insert(labels::CPU_MILLICORES.to_string(), millicores.to_string());
        });
        info!(
            "container: {} now limited to {memory_mb} MiB and {millicores} millicores",
            info.id
        );
        self.require(&info.id)
    }

    /// Replace a sandbox's container with a fresh one built from its recorded
    /// configuration. The home volume carries over. Non-zero limits override
    /// the recorded ones.
    pub async fn recreate(
        &self,
        id: &str,
        memory_mb: u64,
        cpu_millicores: u64,
    ) -> Result<SandboxInfo> {
        let info = self.require(id)?;
        let config = recreate_config(&info, memory_mb, cpu_millicores);

        match self.engine.remove(&info.id, true).await {
            Ok(()) => {}
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err),
        }
        self.registry.remove(&info.id);
        info!("container: recreating sandbox {} ({})", info.name, info.id);
        self.create(config).await
    }

    async fn rollback(&self, id: &str) {
        if let Err(err) = self.engine.remove(id, true).await {
            warn!("container: rollback failed to remove {id}: {err}");
        }
    }

    /// Resolve an ID, short ID or engine container name. Bare sandbox names
    /// are only unique per tenant and go through [`get_for_tenant`](Self::get_for_tenant).
    fn require(&self, id: &str) -> Result<SandboxInfo> {
        self.registry
            .find(id)
            .or_else(|| {
                self.registry
                    .find_by_resource(id, |info| container_name(&info.tenant_id, &info.name))
            })
            .ok_or_else(|| SandboxError::NotFound(format!("Sandbox '{id}' not found")))
    }

    pub async fn start(&self, id: &str) -> Result<()> {
        let info = self.require(id)?;
        self.engine.start(&info.id).await?;
        let ip = self
            .engine
            .inspect(&info.id)
            .await
            .map(|c| c.ip_address)
            .ok()
            .filter(|ip| !ip.is_empty());
        let now = Utc::now();
        self.registry.update(&info.id, |info, _| {
            info.status = SandboxStatus::Running;
            info.last_used_at = now;
            if let Some(ip) = ip {
                info.ip_address = ip;
            }
        });
        Ok(())
    }

    pub async fn stop(&self, id: &str) -> Result<()> {
        let info = self.require(id)?;
        self.engine.stop(&info.id, self.settings.stop_timeout).await?;
        self.registry.set_status(&info.id, SandboxStatus::Stopped);
        Ok(())
    }

    /// Untrack, then force-remove the container. The volume is kept.
    pub async fn remove(&self, id: &str) -> Result<()> {
        let info = self.require(id)?;
        self.registry.remove(&info.id);
        match self.engine.remove(&info.id, true).await {
            Ok(()) => {}
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err),
        }
        info!("container: removed sandbox {} ({})", info.name, info.id);
        Ok(())
    }

    /// Record activity. Cheap: one short write lock, no engine call.
    pub fn touch(&self, id: &str) -> bool {
        self.registry.touch(id, Utc::now())
    }

    pub fn get(&self, id: &str) -> Result<SandboxInfo> {
        self.require(id)
    }

    /// A tenant's sandbox by ID or name.
    pub fn get_for_tenant(&self, tenant_id: &str, id_or_name: &str) -> Result<SandboxInfo> {
        self.registry
            .find_for_tenant(tenant_id, id_or_name)
            .ok_or_else(|| {
                SandboxError::NotFound(format!(
                    "Sandbox '{id_or_name}' not found for tenant {tenant_id}"
                ))
            })
    }

    pub fn list(&self, tenant_id: &str) -> Vec<SandboxInfo> {
        self.registry.list_tenant(tenant_id)
    }

    pub fn list_all(&self) -> Vec<SandboxInfo> {
        self.registry.list_all()
    }

    pub fn count_for_tenant(&self, tenant_id: &str) -> usize {
        self.registry.count_tenant(tenant_id)
    }

    /// Drop from tracking without touching the engine.
    pub fn forget(&self, id: &str) -> bool {
        self.registry.remove(id).is_some()
    }

    pub fn set_status(&self, id: &str, status: SandboxStatus) -> bool {
        self.registry.set_status(id, status)
    }

    pub fn idle_time(&self, id: &str) -> Option<ChronoDuration> {
        self.registry.idle_time(id, Utc::now())
    }

    pub fn is_guest(&self, id: &str) -> bool {
        self.registry
            .get(id)
            .is_some_and(|info| labels::is_guest(&info.labels))
    }

    pub fn guest_time_remaining(&self, id: &str) -> Option<ChronoDuration> {
        self.registry
            .get(id)
            .and_then(|info| labels::time_remaining(&info, Utc::now()))
    }

    pub fn summary(&self) -> RegistrySummary {
        self.registry.summary()
    }

    pub fn idle_sandboxes(&self, threshold: Duration) -> Vec<SandboxInfo> {
        let threshold = ChronoDuration::from_std(threshold).unwrap_or(ChronoDuration::MAX);
        self.registry.idle(threshold, Utc::now())
    }

    pub fn expired_guest_sandboxes(&self) -> Vec<SandboxInfo> {
        self.registry.expired(Utc::now())
    }

    /// Run a command and return its combined output.
    pub async fn exec(&self, id: &str, cmd: Vec<String>) -> Result<ExecOutput> {
        if cmd.is_empty() {
            return Err(SandboxError::Validation("command is empty".into()));
        }
        let info = self.require(id)?;
        let output = self.engine.exec(&info.id, cmd).await?;
        self.touch(&info.id);
        Ok(output)
    }

    pub async fn connect_terminal(
        &self,
        id: &str,
        cols: u16,
        rows: u16,
    ) -> Result<TerminalConnection> {
        let info = self.require(id)?;
        let shell = info
            .labels
            .get(labels::SHELL)
            .cloned()
            .unwrap_or_else(|| images::default_shell(&info.image).to_string());
        let conn = self.engine.open_shell(&info.id, &shell, cols, rows).await?;
        self.touch(&info.id);
        Ok(conn)
    }

    pub async fn stats(&self, id: &str) -> Result<ResourceStats> {
        let info = self.require(id)?;
        let mut stats = self.engine.stats(&info.id).await?;
        if stats.disk_limit == 0 {
            stats.disk_limit = labels::parse_u64(&info.labels, labels::DISK_MB)
                .map_or(0, |mb| mb.saturating_mul(MIB));
        }
        Ok(stats)
    }

    pub async fn stream_stats(&self, id: &str) -> Result<mpsc::Receiver<ResourceStats>> {
        let info = self.require(id)?;
        self.engine.stream_stats(&info.id).await
    }

    /// Rebuild the registry from managed engine containers. Returns the count.
    pub async fn rehydrate(&self) -> Result<usize> {
        let containers = self.engine.list(true).await?;
        let now = Utc::now();
        let entries: Vec<(SandboxInfo, ())> = containers
            .into_iter()
            .filter_map(|c| {
                let tenant_id = c.labels.get(labels::TENANT_ID)?.clone();
                let name = c.labels.get(labels::NAME)?.clone();
                let status = if c.state == "running" {
                    SandboxStatus::Running
                } else {
                    SandboxStatus::Stopped
                };
                let info = SandboxInfo {
                    id: c.id,
                    tenant_id,
                    name,
                    image: c.labels.get(labels::IMAGE).cloned().unwrap_or(c.image),
                    provider: PROVIDER_NAME.to_string(),
                    status,
                    created_at: c.created_at.unwrap_or(now),
                    last_used_at: now,
                    ip_address: c.ip_address,
                    labels: c.labels,
                };
                Some((info, ()))
            })
            .collect();
        let count = entries.len();
        self.registry.replace_all(entries);
        info!("container: rehydrated {count} sandboxes");
        Ok(count)
    }

    /// Raw engine state per container ID, from a single listing.
    pub async fn live_states(&self) -> Result<HashMap<String, String>> {
        Ok(self
            .engine
            .list(false)
            .await?
            .into_iter()
            .map(|c| (c.id, c.state))
            .collect())
    }
}

#[async_trait::async_trait]
impl crate::provider::Provider for ContainerManager {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    async fn is_available(&self) -> bool {
        self.ping().await.is_ok()
    }

    async fn create(&self, config: CreateConfig) -> Result<SandboxInfo> {
        ContainerManager::create(self, config).await
    }

    async fn start(&self, id: &str) -> Result<()> {
        ContainerManager::start(self, id).await
    }

    async fn stop(&self, id: &str) -> Result<()> {
        ContainerManager::stop(self, id).await
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.remove(id).await
    }

    async fn get(&self, id: &str) -> Result<SandboxInfo> {
        self.require(id)
    }

    async fn list(&self, tenant_id: &str) -> Result<Vec<SandboxInfo>> {
        Ok(self.registry.list_tenant(tenant_id))
    }

    fn touch(&self, id: &str) -> bool {
        ContainerManager::touch(self, id)
    }

    async fn connect_terminal(&self, id: &str, cols: u16, rows: u16) -> Result<TerminalConnection> {
        ContainerManager::connect_terminal(self, id, cols, rows).await
    }

    async fn exec(&self, id: &str, cmd: Vec<String>) -> Result<Vec<u8>> {
        Ok(ContainerManager::exec(self, id, cmd).await?.combined())
    }

    async fn get_stats(&self, id: &str) -> Result<ResourceStats> {
        self.stats(id).await
    }

    async fn stream_stats(&self, id: &str) -> Result<mpsc::Receiver<ResourceStats>> {
        ContainerManager::stream_stats(self, id).await
    }
}

#[async_trait::async_trait]
impl crate::cleanup::CleanupTarget for ContainerManager {
    fn idle_sandboxes(&self, threshold: Duration) -> Vec<SandboxInfo> {
        ContainerManager::idle_sandboxes(self, threshold)
    }

    fn expired_guest_sandboxes(&self) -> Vec<SandboxInfo> {
        ContainerManager::expired_guest_sandboxes(self)
    }

    async fn stop_sandbox(&self, id: &str) -> Result<()> {
        self.stop(id).await
    }

    async fn remove_sandbox(&self, id: &str) -> Result<()> {
        self.remove(id).await
    }
}

#[async_trait::async_trait]
impl crate::reconciler::ReconcileTarget for ContainerManager {
    fn provider(&self) -> &str {
        PROVIDER_NAME
    }

    async fn live_states(&self) -> Result<HashMap<String, String>> {
        ContainerManager::live_states(self).await
    }

    async fn graceful_stop(&self, id: &str, timeout: Duration) -> Result<()> {
        self.engine.stop(id, timeout).await?;
        self.registry.set_status(id, SandboxStatus::Stopped);
        Ok(())
    }

    async fn force_remove(&self, id: &str) -> Result<()> {
        self.registry.remove(id);
        self.engine.remove(id, true).await
    }

    fn forget(&self, id: &str) -> bool {
        ContainerManager::forget(self, id)
    }

    fn set_status(&self, id: &str, status: SandboxStatus) -> bool {
        ContainerManager::set_status(self, id, status)
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockEngine;
    use super::*;
    use std::sync::atomic::Ordering;

    fn manager() -> (Arc<MockEngine>, ContainerManager) {
        let engine = Arc::new(MockEngine::new());
        let settings = ContainerSettings {
            max_cpu_millicores: 4000,
            ..Default::default()
        };
        let manager = ContainerManager::new(engine.clone(), settings);
        (engine, manager)
    }

    fn request(tenant: &str, name: &str) -> CreateConfig {
        CreateConfig {
            tenant_id: tenant.into(),
            name: name.into(),
            image: "ubuntu".into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn create_builds_hardened_spec() {
        let (engine, manager) = manager();
        let mut config = request("t1", "dev");
        config.cpu_millicores = 8000;
        config.labels.insert(labels::TIER.into(), "guest".into());

        let info = manager.create(config).await.unwrap();
        assert_eq!(info.status, SandboxStatus::Running);
        assert_eq!(info.provider, PROVIDER_NAME);
        assert_eq!(info.ip_address, engine.ip_for(&info.id));

        let spec = engine.spec(&info.id).unwrap();
        assert_eq!(spec.name, "sandbox-t1-dev");
        assert_eq!(spec.image, "ubuntu:24.04");
        assert_eq!(spec.memory_bytes, 512 * 1024 * 1024);
        // 8000 millicores requested, capped at 4000.
        assert_eq!(spec.cpu_quota, 400_000);
        assert_eq!(spec.cpu_period, 100_000);
        assert_eq!(spec.pids_limit, 512);
        assert_eq!(spec.cap_drop, vec!["ALL".to_string()]);
        assert!(spec.security_opt.contains(&"no-new-privileges:true".to_string()));
        assert_eq!(spec.binds, vec!["sandbox-t1-dev:/home/user".to_string()]);
        assert!(spec.env.contains(&"TENANT_ID=t1".to_string()));
        assert_eq!(spec.labels.get(labels::MANAGED).map(String::as_str), Some("true"));
        assert_eq!(spec.labels.get(labels::TIER).map(String::as_str), Some("guest"));
        assert_eq!(spec.network, DEFAULT_NETWORK_NAME);
        assert!(engine.has_network(DEFAULT_NETWORK_NAME));
    }

    #[tokio::test]
    async fn start_failure_leaves_nothing_behind() {
        let (engine, manager) = manager();
        engine.fail_start.store(true, Ordering::Relaxed);

        let err = manager.create(request("t1", "dev")).await.unwrap_err();
        assert!(matches!(err, SandboxError::Provision(_)));
        assert!(manager.list_all().is_empty());
        assert!(engine.container_ids().is_empty());
        assert_eq!(engine.remove_count.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn stale_container_is_replaced_for_same_tenant() {
        let (engine, manager) = manager();
        let stale = engine.insert_container("sandbox-t1-dev", "exited", &[(labels::TENANT_ID, "t1")]);

        let info = manager.create(request("t1", "dev")).await.unwrap();
        assert_ne!(info.id, stale);
        assert!(!engine.container_ids().contains(&stale));
    }

    #[tokio::test]
    async fn stale_container_of_other_tenant_conflicts() {
        let (engine, manager) = manager();
        engine.insert_container("sandbox-t1-dev", "running", &[(labels::TENANT_ID, "t2")]);

        let err = manager.create(request("t1", "dev")).await.unwrap_err();
        assert!(matches!(err, SandboxError::Validation(_)));
        assert_eq!(engine.container_ids().len(), 1);
    }

    #[tokio::test]
    async fn duplicate_name_and_tier_limit_are_rejected() {
        let (_engine, manager) = manager();
        let mut guest = request("t1", "one");
        guest.labels.insert(labels::TIER.into(), "guest".into());
        manager.create(guest.clone()).await.unwrap();

        let err = manager.create(request("t1", "one")).await.unwrap_err();
        assert!(matches!(err, SandboxError::Validation(_)));

        guest.name = "two".into();
        let err = manager.create(guest).await.unwrap_err();
        assert!(err.to_string().contains("limit"));
    }

    #[tokio::test]
    async fn stop_start_remove_cycle() {
        let (engine, manager) = manager();
        let info = manager.create(request("t1", "dev")).await.unwrap();

        manager.stop(&info.id).await.unwrap();
        assert_eq!(manager.get(&info.id).unwrap().status, SandboxStatus::Stopped);

        let before = manager.get(&info.id).unwrap().last_used_at;
        manager.start(&info.id).await.unwrap();
        let after = manager.get(&info.id).unwrap();
        assert_eq!(after.status, SandboxStatus::Running);
        assert!(after.last_used_at >= before);

        manager.remove(&info.id).await.unwrap();
        assert!(manager.get(&info.id).unwrap_err().is_not_found());
        assert!(engine.container_ids().is_empty());
        assert!(engine.has_volume("sandbox-t1-dev"), "volume is retained");
        assert!(manager.stop(&info.id).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn lookups_never_cross_tenants() {
        let (engine, manager) = manager();
        let first = manager.create(request("t1", "dev")).await.unwrap();
        let second = manager.create(request("t2", "dev")).await.unwrap();

        assert!(manager.get("dev").unwrap_err().is_not_found());
        assert!(manager.stop("dev").await.unwrap_err().is_not_found());
        assert_eq!(manager.get_for_tenant("t1", "dev").unwrap().id, first.id);
        assert_eq!(manager.get_for_tenant("t2", "dev").unwrap().id, second.id);
        assert!(manager.get_for_tenant("t3", "dev").unwrap_err().is_not_found());
        assert_eq!(manager.get(&first.id[..16]).unwrap().id, first.id);

        manager.stop("sandbox-t2-dev").await.unwrap();
        assert_eq!(engine.state_of(&second.id).as_deref(), Some("exited"));
        assert_eq!(engine.state_of(&first.id).as_deref(), Some("running"));
        assert_eq!(manager.get(&first.id).unwrap().status, SandboxStatus::Running);
    }

    #[tokio::test]
    async fn oversized_memory_is_rejected_before_the_engine() {
        let (engine, manager) = manager();
        for memory_mb in [u64::MAX, u64::MAX / MIB + 1, i64::MAX as u64 / MIB + 1] {
            let mut config = request("t1", "dev");
            config.memory_mb = memory_mb;
            let err = manager.create(config).await.unwrap_err();
            assert!(matches!(err, SandboxError::Validation(_)), "{err}");
        }
        assert!(engine.container_ids().is_empty());
        assert_eq!(engine.create_count.load(Ordering::Relaxed), 0);

        assert_eq!(memory_bytes(512).unwrap(), 512 * 1024 * 1024);
        assert!(memory_bytes(i64::MAX as u64 / MIB).is_ok());
    }

    #[tokio::test]
    async fn tampered_disk_label_does_not_overflow_stats() {
        let (_engine, manager) = manager();
        let info = manager.create(request("t1", "dev")).await.unwrap();
        manager.registry().update(&info.id, |info, _| {
            info.labels.insert(labels::DISK_MB.into(), u64::MAX.to_string());
        });
        let stats = manager.stats(&info.id).await.unwrap();
        assert_eq!(stats.disk_limit, u64::MAX);
    }

    #[tokio::test]
    async fn rehydrate_rebuilds_from_labels() {
        let (engine, manager) = manager();
        engine.insert_container(
            "sandbox-t1-a",
            "running",
            &[
                (labels::MANAGED, "true"),
                (labels::TENANT_ID, "t1"),
                (labels::NAME, "a"),
            ],
        );
        engine.insert_container(
            "sandbox-t2-b",
            "exited",
            &[
                (labels::MANAGED, "true"),
                (labels::TENANT_ID, "t2"),
                (labels::NAME, "b"),
            ],
        );
        // Managed but missing tenant/name labels.
        engine.insert_container("junk", "running", &[(labels::MANAGED, "true")]);
        // Not managed.
        engine.insert_container("other", "running", &[]);

        assert_eq!(manager.rehydrate().await.unwrap(), 2);
        assert_eq!(manager.rehydrate().await.unwrap(), 2);
        assert_eq!(manager.count_for_tenant("t1"), 1);
        assert_eq!(manager.list("t2")[0].status, SandboxStatus::Stopped);
        manager.registry.assert_consistent();
    }

    #[tokio::test]
    async fn exec_touches_and_combines_output() {
        let (_engine, manager) = manager();
        let info = manager.create(request("t1", "dev")).await.unwrap();
        manager.registry.update(&info.id, |i, _| {
            i.last_used_at = Utc::now() - ChronoDuration::hours(1)
        });

        let out = manager
            .exec(&info.id, vec!["echo".into(), "hi".into()])
            .await
            .unwrap();
        assert_eq!(out.stdout, b"echo hi\n");
        assert!(manager.idle_time(&info.id).unwrap() < ChronoDuration::minutes(1));
        assert!(manager.exec(&info.id, vec![]).await.is_err());
    }

    #[tokio::test]
    async fn guest_helpers() {
        let (_engine, manager) = manager();
        let mut config = request("t1", "guest");
        config.labels.insert(labels::GUEST.into(), "true".into());
        let guest = manager.create(config).await.unwrap();
        let plain = manager.create(request("t1", "plain")).await.unwrap();

        assert!(manager.is_guest(&guest.id));
        assert!(!manager.is_guest(&plain.id));
        assert!(manager.guest_time_remaining(&guest.id).unwrap() > ChronoDuration::minutes(119));
        assert!(manager.guest_time_remaining(&plain.id).is_none());

        let summary = manager.summary();
        assert_eq!(summary.total, 2);
        assert_eq!(summary.running, 2);
        assert_eq!(summary.by_tenant.get("t1"), Some(&2));
    }

    #[tokio::test]
    async fn role_setup_runs_inside_the_new_container() {
        let (engine, manager) = manager();
        let mut config = request("t1", "dev");
        config.role = "python".into();
        let info = manager.create(config).await.unwrap();

        assert_eq!(info.status, SandboxStatus::Running);
        assert_eq!(manager.get(&info.id).unwrap().status, SandboxStatus::Running);
        assert_eq!(info.labels.get(labels::ROLE).map(String::as_str), Some("python"));
        let execs = engine.exec_log();
        assert_eq!(execs.len(), 1);
        assert_eq!(execs[0].0, info.id);
        assert_eq!(execs[0].1, roles::setup_command("python").unwrap().unwrap());

        let mut config = request("t1", "bare");
        config.role = roles::BAREBONE.into();
        manager.create(config).await.unwrap();
        assert_eq!(engine.exec_log().len(), 1);
    }

    #[tokio::test]
    async fn failed_role_setup_keeps_the_sandbox() {
        let (engine, manager) = manager();
        engine.exec_exit_code.store(100, Ordering::Relaxed);
        let mut config = request("t1", "dev");
        config.role = "node".into();
        let info = manager.create(config).await.unwrap();
        assert_eq!(manager.get(&info.id).unwrap().status, SandboxStatus::Running);

        engine.fail_exec.store(true, Ordering::Relaxed);
        let mut config = request("t1", "other");
        config.role = "go".into();
        assert!(manager.create(config).await.is_ok());
    }

    #[tokio::test]
    async fn unknown_role_is_rejected_before_the_engine() {
        let (engine, manager) = manager();
        let mut config = request("t1", "dev");
        config.role = "wizard".into();
        let err = manager.create(config).await.unwrap_err();
        assert!(matches!(err, SandboxError::Validation(_)));
        assert_eq!(engine.create_count.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn update_resources_changes_limits_in_place() {
        let (engine, manager) = manager();
        let info = manager.create(request("t1", "dev")).await.unwrap();

        let updated = manager.update_resources(&info.id, 1024, 0).await.unwrap();
        assert_eq!(updated.id, info.id);
        assert_eq!(
            updated.labels.get(labels::MEMORY_MB).map(String::as_str),
            Some("1024")
        );
        let spec = engine.spec(&info.id).unwrap();
        assert_eq!(spec.memory_bytes, 1024 * 1024 * 1024);
        assert_eq!(spec.cpu_quota, cpu_quota(DEFAULT_CPU_MILLICORES));

        manager.update_resources(&info.id, 0, 9000).await.unwrap();
        assert_eq!(engine.spec(&info.id).unwrap().cpu_quota, 400_000);
        assert_eq!(engine.update_count.load(Ordering::Relaxed), 2);

        let err = manager.update_resources(&info.id, u64::MAX, 0).await.unwrap_err();
        assert!(matches!(err, SandboxError::Validation(_)));
        assert_eq!(engine.update_count.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn recreate_keeps_identity_and_volume() {
        let (engine, manager) = manager();
        let mut config = request("t1", "dev");
        config.image = images::CUSTOM.into();
        config.custom_image = Some("ghcr.io/acme/dev:1".into());
        config.role = "standard".into();
        config.labels.insert(labels::TIER.into(), "pro".into());
        let old = manager.create(config).await.unwrap();
        engine.delete_external(&old.id);

        let new = manager.recreate(&old.id, 2048, 0).await.unwrap();
        assert_ne!(new.id, old.id);
        assert_eq!((new.tenant_id.as_str(), new.name.as_str()), ("t1", "dev"));
        assert_eq!(new.image, "custom:ghcr.io/acme/dev:1");
        assert_eq!(new.labels.get(labels::TIER).map(String::as_str), Some("pro"));
        assert_eq!(new.labels.get(labels::ROLE).map(String::as_str), Some("standard"));
        assert_eq!(
            new.labels.get(labels::MEMORY_MB).map(String::as_str),
            Some("2048")
        );
        assert!(manager.get(&old.id).unwrap_err().is_not_found());
        assert_eq!(manager.list("t1").len(), 1);
        assert!(engine.has_volume("sandbox-t1-dev"));
        assert_eq!(engine.exec_log().len(), 2);
    }

    #[test]
    fn container_names_are_sanitized() {
        assert_eq!(container_name("t1", "dev"), "sandbox-t1-dev");
        assert_eq!(container_name("0xAbC/1", "x"), "sandbox-0xAbC-1-x");
    }
}
