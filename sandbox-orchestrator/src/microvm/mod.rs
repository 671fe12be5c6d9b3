//! MicroVM lifecycle manager.
//!
//! Each sandbox is a Firecracker VM with its own supervisor process, control
//! socket and tap device on a shared bridge. Stop tears down the process but
//! keeps the tap and socket paths so a restart reuses them; delete removes
//! everything.
//!
//! Next to each VM's sockets sits `{id}.json`, its [`SandboxInfo`] at create
//! time. Those files are the host-side record of which VMs exist: the live
//! listing and [`MicroVmManager::rehydrate`] read them, so VMs survive an
//! orchestrator restart.

pub mod agent;
pub mod api;
#[cfg(any(test, feature = "test-utils"))]
pub mod mock;
pub mod network;
pub mod rootfs;
pub mod supervisor;

use blueprint_sdk::{debug, info, warn};
use chrono::{Duration as ChronoDuration, Utc};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::config::OrchestratorConfig;
use crate::container::{memory_bytes, validate_name};
use crate::error::{Result, SandboxError};
use crate::labels;
use crate::registry::SandboxRegistry;
use crate::roles;
use crate::types::{
    CreateConfig, RegistrySummary, ResourceStats, SandboxInfo, SandboxStatus, TerminalConnection,
    TerminalControl, canonical_state,
};
use crate::{DEFAULT_CPU_MILLICORES, DEFAULT_GUEST_AGENT_PORT, DEFAULT_MEMORY_MB};

use agent::GuestAgentClient;
use api::{BOOT_ARGS, VmConfig, vcpus_for};
use network::HostNetwork;
use rootfs::RootfsStore;
use supervisor::{VmHandle, VmSupervisor};

pub const PROVIDER_NAME: &str = "firecracker";

const DEFAULT_SHELL: &str = "/bin/bash";
const DEFAULT_IMAGE: &str = "ubuntu";
const IP_POLL_ATTEMPTS: usize = 5;
const EXEC_TIMEOUT: Duration = Duration::from_secs(30);
const AGENT_CALL_TIMEOUT: Duration = Duration::from_secs(10);
const ROLE_SETUP_TIMEOUT: Duration = Duration::from_secs(120);
const STATS_INTERVAL: Duration = Duration::from_secs(2);
const MIB: u64 = 1024 * 1024;

#[derive(Clone, Debug)]
pub struct MicroVmSettings {
    pub kernel_path: PathBuf,
    pub rootfs_dir: PathBuf,
    pub socket_dir: PathBuf,
    pub guest_agent_port: u32,
    /// Delay between ARP lookups while waiting for the guest's address.
    pub ip_poll_interval: Duration,
}

impl Default for MicroVmSettings {
    fn default() -> Self {
        Self {
            kernel_path: PathBuf::from("/opt/firecracker/vmlinux.bin"),
            rootfs_dir: PathBuf::from("/var/lib/sandbox/firecracker/rootfs"),
            socket_dir: PathBuf::from("/tmp/firecracker"),
            guest_agent_port: DEFAULT_GUEST_AGENT_PORT,
            ip_poll_interval: Duration::from_millis(500),
        }
    }
}

impl MicroVmSettings {
    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self {
            kernel_path: config.firecracker_kernel.clone(),
            rootfs_dir: config.firecracker_rootfs_dir.clone(),
            socket_dir: config.firecracker_socket_dir.clone(),
            guest_agent_port: config.guest_agent_port,
            ..Default::default()
        }
    }
}

/// VM ID for a tenant's sandbox: `vm-` plus 16 hex chars of a digest over
/// the pair. Path-safe for any tenant ID and distinct per (tenant, name).
pub fn vm_id(tenant_id: &str, name: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(tenant_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(name.as_bytes());
    format!("vm-{}", &hex::encode(hasher.finalize())[..16])
}

/// Host resources held for one VM.
#[derive(Clone)]
pub struct VmRuntime {
    pub tap: String,
    pub mac: String,
    pub socket_path: PathBuf,
    pub vsock_path: PathBuf,
    /// Present while a supervisor process is alive.
    pub handle: Option<Arc<dyn VmHandle>>,
}

pub struct MicroVmManager {
    supervisor: Arc<dyn VmSupervisor>,
    network: Arc<dyn HostNetwork>,
    rootfs: RootfsStore,
    registry: SandboxRegistry<VmRuntime>,
    settings: MicroVmSettings,
}

fn remove_file_quietly(path: &Path) {
    if let Err(err) = std::fs::remove_file(path) {
        if err.kind() != std::io::ErrorKind::NotFound {
            warn!("microvm: failed to remove {}: {err}", path.display());
        }
    }
}

/// Translate the supervisor's instance state into the engine vocabulary.
fn engine_state(instance: &serde_json::Value) -> &'static str {
    match instance.get("state").and_then(|s| s.as_str()) {
        Some("Running") => "running",
        Some("Paused") => "paused",
        Some("Not started") => "created",
        _ => "unknown",
    }
}

/// Limits from labels when the guest agent cannot be reached.
fn label_stats(vm_labels: &HashMap<String, String>) -> ResourceStats {
    ResourceStats {
        memory_limit: labels::parse_u64(vm_labels, labels::MEMORY_MB)
            .unwrap_or(0)
            .saturating_mul(MIB),
        disk_limit: labels::parse_u64(vm_labels, labels::DISK_MB)
            .unwrap_or(0)
            .saturating_mul(MIB),
        ..Default::default()
    }
}

async fn query_state(id: &str, handle: &dyn VmHandle) -> &'static str {
    match handle.instance_info().await {
        Ok(value) => engine_state(&value),
        Err(err) => {
            debug!("microvm: state query for {id} failed: {err}");
            "dead"
        }
    }
}

async fn sample_stats(
    vsock_path: &Path,
    port: u32,
    vm_labels: &HashMap<String, String>,
) -> ResourceStats {
    let metrics = tokio::time::timeout(AGENT_CALL_TIMEOUT, async {
        let mut client = GuestAgentClient::connect(vsock_path, port).await?;
        client.metrics().await
    })
    .await;
    match metrics {
        Ok(Ok(metrics)) => metrics.to_stats(),
        Ok(Err(err)) => {
            debug!("microvm: agent metrics unavailable, using label limits: {err}");
            label_stats(vm_labels)
        }
        Err(_) => label_stats(vm_labels),
    }
}

impl MicroVmManager {
    pub fn new(
        supervisor: Arc<dyn VmSupervisor>,
        network: Arc<dyn HostNetwork>,
        settings: MicroVmSettings,
    ) -> Self {
        Self {
            supervisor,
            network,
            rootfs: RootfsStore::new(settings.rootfs_dir.clone()),
            registry: SandboxRegistry::new(),
            settings,
        }
    }

    pub fn registry(&self) -> &SandboxRegistry<VmRuntime> {
        &self.registry
    }

    pub fn settings(&self) -> &MicroVmSettings {
        &self.settings
    }

    pub fn rootfs(&self) -> &RootfsStore {
        &self.rootfs
    }

    fn socket_paths(&self, id: &str) -> (PathBuf, PathBuf) {
        (
            self.settings.socket_dir.join(format!("{id}.socket")),
            self.settings.socket_dir.join(format!("{id}.vsock")),
        )
    }

    fn metadata_path(&self, id: &str) -> PathBuf {
        self.settings.socket_dir.join(format!("{id}.json"))
    }

    fn write_metadata(&self, info: &SandboxInfo) -> Result<()> {
        let encoded = serde_json::to_vec_pretty(info)
            .map_err(|e| SandboxError::Storage(format!("encode metadata for {}: {e}", info.id)))?;
        std::fs::create_dir_all(&self.settings.socket_dir)?;
        std::fs::write(self.metadata_path(&info.id), encoded)?;
        Ok(())
    }

    /// VMs recorded in the socket directory, whether or not this process created them.
    fn discover(&self) -> Result<Vec<SandboxInfo>> {
        let dir = match std::fs::read_dir(&self.settings.socket_dir) {
            Ok(dir) => dir,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut found = Vec::new();
        for entry in dir {
            let path = entry?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let parsed = std::fs::read(&path).map_err(SandboxError::from).and_then(|bytes| {
                serde_json::from_slice::<SandboxInfo>(&bytes)
                    .map_err(|e| SandboxError::Storage(e.to_string()))
            });
            match parsed {
                Ok(info)
                    if info.provider == PROVIDER_NAME
                        && path.file_stem().and_then(|stem| stem.to_str())
                            == Some(info.id.as_str()) =>
                {
                    found.push(info)
                }
                Ok(_) => debug!("microvm: ignoring foreign metadata {}", path.display()),
                Err(err) => warn!("microvm: skipping unreadable {}: {err}", path.display()),
            }
        }
        Ok(found)
    }

    fn require(&self, id: &str) -> Result<(SandboxInfo, VmRuntime)> {
        self.registry
            .find(id)
            .and_then(|info| self.registry.get_with(&info.id))
            .ok_or_else(|| SandboxError::NotFound(format!("VM '{id}' not found")))
    }

    fn vm_config(
        &self,
        id: &str,
        runtime: &VmRuntime,
        rootfs_path: PathBuf,
        vcpus: u32,
        memory_mb: u64,
    ) -> VmConfig {
        VmConfig {
            vm_id: id.to_string(),
            vcpus,
            memory_mb,
            kernel_path: self.settings.kernel_path.clone(),
            kernel_args: BOOT_ARGS.to_string(),
            rootfs_path,
            tap_device: runtime.tap.clone(),
            guest_mac: runtime.mac.clone(),
            vsock_path: runtime.vsock_path.clone(),
        }
    }

    /// Launch a supervisor, push the configuration and start the instance.
    async fn boot(&self, runtime: &VmRuntime, config: &VmConfig) -> Result<Arc<dyn VmHandle>> {
        let handle = self
            .supervisor
            .launch(&runtime.socket_path, config)
            .await?;
        if let Err(err) = handle.start().await {
            if let Err(kill_err) = handle.terminate().await {
                warn!("microvm: failed to terminate {}: {kill_err}", config.vm_id);
            }
            return Err(err);
        }
        Ok(handle)
    }

    async fn release_host_resources(&self, runtime: &VmRuntime) {
        if let Err(err) = self.network.delete_tap(&runtime.tap).await {
            warn!("microvm: failed to delete tap {}: {err}", runtime.tap);
        }
        remove_file_quietly(&runtime.socket_path);
        remove_file_quietly(&runtime.vsock_path);
        remove_file_quietly(&runtime.socket_path.with_extension("json"));
    }

    async fn wait_for_ip(&self, mac: &str) -> Option<String> {
        for _ in 0..IP_POLL_ATTEMPTS {
            tokio::time::sleep(self.settings.ip_poll_interval).await;
            if let Some(ip) = self.network.lookup_ip(mac).await {
                return Some(ip);
            }
        }
        None
    }

    /// Provision and boot a VM.
    pub async fn create(&self, config: CreateConfig) -> Result<SandboxInfo> {
        if config.tenant_id.is_empty() {
            return Err(SandboxError::Validation("tenant_id is required".into()));
        }
        validate_name(&config.name)?;
        let role_setup = roles::setup_command(&config.role)?;
        let id = vm_id(&config.tenant_id, &config.name);
        if self.registry.contains(&id) {
            return Err(SandboxError::Validation(format!(
                "sandbox '{}' already exists for tenant {}",
                config.name, config.tenant_id
            )));
        }
        if self.metadata_path(&id).exists() {
            return Err(SandboxError::Validation(format!(
                "VM {id} exists on this host but is not tracked; rehydrate first"
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
        let image = if config.image.is_empty() {
            DEFAULT_IMAGE.to_string()
        } else {
            config.image.clone()
        };
        let rootfs_path = self.rootfs.resolve(&image)?;

        let memory_mb = if config.memory_mb == 0 {
            DEFAULT_MEMORY_MB
        } else {
            config.memory_mb
        };
        memory_bytes(memory_mb)?;
        let millicores = if config.cpu_millicores == 0 {
            DEFAULT_CPU_MILLICORES
        } else {
            config.cpu_millicores
        };

        let mut system = HashMap::from([
            (labels::MANAGED.to_string(), "true".to_string()),
            (labels::TENANT_ID.to_string(), config.tenant_id.clone()),
            (labels::NAME.to_string(), config.name.clone()),
            (labels::IMAGE.to_string(), image.clone()),
            (labels::MEMORY_MB.to_string(), memory_mb.to_string()),
            (labels::CPU_MILLICORES.to_string(), millicores.to_string()),
            (labels::SHELL.to_string(), crate::images::default_shell(&image).to_string()),
        ]);
        if !config.role.is_empty() {
            system.insert(labels::ROLE.to_string(), config.role.clone());
        }
        if config.disk_mb > 0 {
            system.insert(labels::DISK_MB.to_string(), config.disk_mb.to_string());
        }

        let (socket_path, vsock_path) = self.socket_paths(&id);
        let runtime = VmRuntime {
            tap: network::tap_name(&id),
            mac: network::mac_address(&id),
            socket_path,
            vsock_path,
            handle: None,
        };
        let now = Utc::now();
        let mut info = SandboxInfo {
            id: id.clone(),
            tenant_id: config.tenant_id.clone(),
            name: config.name.clone(),
            image,
            provider: PROVIDER_NAME.to_string(),
            status: SandboxStatus::Creating,
            created_at: now,
            last_used_at: now,
            ip_address: String::new(),
            labels: labels::merge_labels(system, &config.labels),
        };
        // Reserve the ID so a concurrent create for the same name fails fast.
        self.registry.insert(info.clone(), runtime.clone());

        if let Err(err) = self.network.create_tap(&runtime.tap).await {
            self.registry.remove(&id);
            return Err(SandboxError::Provision(format!(
                "failed to create tap {} for {id}: {err}",
                runtime.tap
            )));
        }
        if let Err(err) = self.write_metadata(&info) {
            self.registry.remove(&id);
            self.release_host_resources(&runtime).await;
            return Err(SandboxError::Provision(format!(
                "failed to record VM {id}: {err}"
            )));
        }

        let vm_config = self.vm_config(&id, &runtime, rootfs_path, vcpus_for(millicores), memory_mb);
        let handle = match self.boot(&runtime, &vm_config).await {
            Ok(handle) => handle,
            Err(err) => {
                self.registry.remove(&id);
                self.release_host_resources(&runtime).await;
                return Err(SandboxError::Provision(format!(
                    "failed to boot VM {id}: {err}"
                )));
            }
        };

        let ip = self.wait_for_ip(&runtime.mac).await;
        if ip.is_none() {
            warn!("microvm: no address learned for {id} yet");
        }
        info.status = if role_setup.is_some() {
            SandboxStatus::Configuring
        } else {
            SandboxStatus::Running
        };
        info.ip_address = ip.unwrap_or_default();
        let committed = info.clone();
        let adopted = handle.clone();
        let tracked = self.registry.update(&id, move |entry, runtime| {
            *entry = committed;
            runtime.handle = Some(adopted);
        });
        if !tracked {
            // Deleted while booting.
            if let Err(err) = handle.terminate().await {
                warn!("microvm: failed to terminate {id}: {err}");
            }
            self.release_host_resources(&runtime).await;
            return Err(SandboxError::Provision(format!(
                "VM {id} was deleted while it was being created"
            )));
        }
        if let Some(cmd) = role_setup {
            self.apply_role(&id, &runtime.vsock_path, &config.role, cmd)
                .await;
            if !self.registry.set_status(&id, SandboxStatus::Running) {
                return Err(SandboxError::Provision(format!(
                    "VM {id} was deleted during role setup"
                )));
            }
            info.status = SandboxStatus::Running;
        }
        if let Err(err) = self.write_metadata(&info) {
            warn!("microvm: failed to update metadata for {id}: {err}");
        }

        info!(
            "microvm: created VM {} ({} vCPU, {} MiB) for tenant {}",
            id, vm_config.vcpus, memory_mb, info.tenant_id
        );
        Ok(info)
    }

    /// Install a role's tools through the guest agent. Failures are logged
    /// and the VM stays usable.
    async fn apply_role(&self, id: &str, vsock_path: &Path, role: &str, cmd: Vec<String>) {
        let port = self.settings.guest_agent_port;
        let setup = tokio::time::timeout(ROLE_SETUP_TIMEOUT + AGENT_CALL_TIMEOUT * 2, async {
            let mut client = GuestAgentClient::connect(vsock_path, port).await?;
            client.exec(&cmd, ROLE_SETUP_TIMEOUT.as_secs()).await
        })
        .await;
        match setup {
            Ok(Ok(result)) if result.exit_code == 0 => {
                info!("microvm: role {role} set up in {id}");
            }
            Ok(Ok(result)) => warn!(
                "microvm: role {role} setup in {id} exited with {}: {}",
                result.exit_code,
                result.stderr.trim()
            ),
            Ok(Err(err)) => warn!("microvm: role {role} setup in {id} failed: {err}"),
            Err(_) => warn!("microvm: role {role} setup in {id} timed out"),
        }
    }

    /// Boot a stopped VM, relaunching its supervisor when none is held.
    pub async fn start(&self, id: &str) -> Result<()> {
        let (info, runtime) = self.require(id)?;
        if info.status == SandboxStatus::Running {
            return Ok(());
        }

        let handle = match runtime.handle.clone() {
            Some(handle) => {
                handle.start().await?;
                handle
            }
            None => {
                let rootfs_path = self.rootfs.resolve(&info.image)?;
                let memory_mb =
                    labels::parse_u64(&info.labels, labels::MEMORY_MB).unwrap_or(DEFAULT_MEMORY_MB);
                let vcpus = labels::parse_u64(&info.labels, labels::CPU_MILLICORES)
                    .map(vcpus_for)
                    .unwrap_or(1);
                let config = self.vm_config(&info.id, &runtime, rootfs_path, vcpus, memory_mb);
                self.boot(&runtime, &config).await?
            }
        };

        let ip = if info.ip_address.is_empty() {
            self.network.lookup_ip(&runtime.mac).await
        } else {
            None
        };
        let now = Utc::now();
        self.registry.update(&info.id, move |info, runtime| {
            info.status = SandboxStatus::Running;
            info.last_used_at = now;
            if let Some(ip) = ip {
                info.ip_address = ip;
            }
            runtime.handle = Some(handle);
        });
        info!("microvm: started VM {}", info.id);
        Ok(())
    }

    /// Shut the guest down and end its supervisor. Tap and socket paths are kept.
    pub async fn stop(&self, id: &str) -> Result<()> {
        let (info, runtime) = self.require(id)?;
        if info.status == SandboxStatus::Stopped && runtime.handle.is_none() {
            return Ok(());
        }
        if let Some(handle) = runtime.handle {
            if let Err(err) = handle.shutdown().await {
                warn!("microvm: graceful shutdown of {} failed: {err}", info.id);
            }
            if let Err(err) = handle.terminate().await {
                warn!("microvm: failed to terminate {}: {err}", info.id);
            }
        }
        self.registry.update(&info.id, |info, runtime| {
            info.status = SandboxStatus::Stopped;
            runtime.handle = None;
        });
        info!("microvm: stopped VM {}", info.id);
        Ok(())
    }

    /// Stop if needed, then release the tap device and socket files.
    pub async fn delete(&self, id: &str) -> Result<()> {
        let (info, runtime) = self.require(id)?;
        self.registry.remove(&info.id);
        if let Some(handle) = &runtime.handle {
            if info.status == SandboxStatus::Running {
                if let Err(err) = handle.shutdown().await {
                    warn!("microvm: graceful shutdown of {} failed: {err}", info.id);
                }
            }
            if let Err(err) = handle.terminate().await {
                warn!("microvm: failed to terminate {}: {err}", info.id);
            }
        }
        self.release_host_resources(&runtime).await;
        info!("microvm: deleted VM {}", info.id);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<SandboxInfo> {
        self.require(id).map(|(info, _)| info)
    }

    /// A tenant's VM by ID or sandbox name.
    pub fn get_for_tenant(&self, tenant_id: &str, id_or_name: &str) -> Result<SandboxInfo> {
        self.registry
            .find_for_tenant(tenant_id, id_or_name)
            .ok_or_else(|| {
                SandboxError::NotFound(format!(
                    "VM '{id_or_name}' not found for tenant {tenant_id}"
                ))
            })
    }

    pub fn list(&self, tenant_id: &str) -> Vec<SandboxInfo> {
        self.registry.list_tenant(tenant_id)
    }

    pub fn list_all(&self) -> Vec<SandboxInfo> {
        self.registry.list_all()
    }

    pub fn touch(&self, id: &str) -> bool {
        self.registry.touch(id, Utc::now())
    }

    pub fn forget(&self, id: &str) -> bool {
        self.registry.remove(id).is_some()
    }

    pub fn set_status(&self, id: &str, status: SandboxStatus) -> bool {
        self.registry.set_status(id, status)
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

    fn require_running(&self, id: &str) -> Result<(SandboxInfo, VmRuntime)> {
        let (info, runtime) = self.require(id)?;
        if info.status != SandboxStatus::Running {
            return Err(SandboxError::Validation(format!(
                "VM {} is not running",
                info.id
            )));
        }
        Ok((info, runtime))
    }

    /// Run a command through the guest agent and return its stdout.
    pub async fn exec(&self, id: &str, cmd: Vec<String>) -> Result<Vec<u8>> {
        if cmd.is_empty() {
            return Err(SandboxError::Validation("command is empty".into()));
        }
        let (info, runtime) = self.require_running(id)?;
        let port = self.settings.guest_agent_port;
        let result = tokio::time::timeout(EXEC_TIMEOUT + AGENT_CALL_TIMEOUT * 2, async {
            let mut client = GuestAgentClient::connect(&runtime.vsock_path, port).await?;
            client.exec(&cmd, EXEC_TIMEOUT.as_secs()).await
        })
        .await
        .map_err(|_| SandboxError::Unavailable(format!("exec in {} timed out", info.id)))??;
        self.touch(&info.id);

        if result.exit_code != 0 {
            return Err(SandboxError::Backend(format!(
                "command exited with code {}: {}",
                result.exit_code,
                result.stderr.trim()
            )));
        }
        Ok(result.stdout.into_bytes())
    }

    /// Copy `source` on the host to `destination` inside the VM. Returns bytes copied.
    pub async fn copy_to(
        &self,
        id: &str,
        source: &str,
        destination: &str,
        recursive: bool,
    ) -> Result<u64> {
        let (info, runtime) = self.require_running(id)?;
        let mut client =
            GuestAgentClient::connect(&runtime.vsock_path, self.settings.guest_agent_port).await?;
        let result = client.copy_to(source, destination, recursive).await?;
        self.touch(&info.id);
        Ok(result.bytes)
    }

    /// Copy `source` inside the VM out to `destination` on the host.
    pub async fn copy_from(
        &self,
        id: &str,
        source: &str,
        destination: &str,
        recursive: bool,
    ) -> Result<u64> {
        let (info, runtime) = self.require_running(id)?;
        let mut client =
            GuestAgentClient::connect(&runtime.vsock_path, self.settings.guest_agent_port).await?;
        let result = client.copy_from(source, destination, recursive).await?;
        self.touch(&info.id);
        Ok(result.bytes)
    }

    pub async fn connect_terminal(
        &self,
        id: &str,
        cols: u16,
        rows: u16,
    ) -> Result<TerminalConnection> {
        let (info, runtime) = self.require_running(id)?;
        let port = self.settings.guest_agent_port;
        let shell = info
            .labels
            .get(labels::SHELL)
            .map(String::as_str)
            .unwrap_or(DEFAULT_SHELL);

        let client = GuestAgentClient::connect(&runtime.vsock_path, port).await?;
        let (session, stream) = client.shell(shell, cols, rows).await?;
        let (reader, writer) = tokio::io::split(stream);
        self.touch(&info.id);

        Ok(TerminalConnection {
            id: info.id,
            provider: PROVIDER_NAME.to_string(),
            reader: Box::pin(reader),
            writer: Box::pin(writer),
            control: Box::new(AgentTerminal {
                vsock_path: runtime.vsock_path,
                port,
                session: session.session,
            }),
        })
    }

    /// Agent metrics, or label limits when the agent is unreachable.
    pub async fn stats(&self, id: &str) -> Result<ResourceStats> {
        let (info, runtime) = self.require(id)?;
        if info.status != SandboxStatus::Running {
            return Ok(label_stats(&info.labels));
        }
        Ok(sample_stats(&runtime.vsock_path, self.settings.guest_agent_port, &info.labels).await)
    }

    /// Poll agent metrics every two seconds until the receiver is dropped.
    pub async fn stream_stats(&self, id: &str) -> Result<mpsc::Receiver<ResourceStats>> {
        let (info, runtime) = self.require_running(id)?;
        let port = self.settings.guest_agent_port;
        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(STATS_INTERVAL);
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = tx.closed() => break,
                }
                let stats = sample_stats(&runtime.vsock_path, port, &info.labels).await;
                if tx.send(stats).await.is_err() {
                    break;
                }
            }
            debug!("microvm: stats stream for {} ended", info.id);
        });
        Ok(rx)
    }

    /// Raw state per VM, queried through each supervisor. Covers the registry
    /// and every VM recorded on the host, so a fresh process still sees VMs
    /// an earlier one created.
    pub async fn live_states(&self) -> Result<HashMap<String, String>> {
        let mut states = HashMap::new();
        for (info, runtime) in self.registry.entries() {
            let state = match runtime.handle {
                None => "exited",
                Some(handle) => query_state(&info.id, handle.as_ref()).await,
            };
            states.insert(info.id, state.to_string());
        }
        for info in self.discover()? {
            if states.contains_key(&info.id) {
                continue;
            }
            let (socket_path, _) = self.socket_paths(&info.id);
            let state = match self.supervisor.attach(&socket_path, &info.id).await {
                Ok(Some(handle)) => query_state(&info.id, handle.as_ref()).await,
                Ok(None) => "exited",
                Err(err) => {
                    debug!("microvm: attach to {} failed: {err}", info.id);
                    "dead"
                }
            };
            states.insert(info.id, state.to_string());
        }
        Ok(states)
    }

    /// Rebuild the registry from the VMs recorded on the host, re-adopting
    /// supervisors that are still running. Returns the count. Meant for
    /// startup; entries created since are replaced.
    pub async fn rehydrate(&self) -> Result<usize> {
        let now = Utc::now();
        let mut entries = Vec::new();
        for mut info in self.discover()? {
            let (socket_path, vsock_path) = self.socket_paths(&info.id);
            let handle = match self.supervisor.attach(&socket_path, &info.id).await {
                Ok(handle) => handle,
                Err(err) => {
                    warn!("microvm: cannot adopt supervisor for {}: {err}", info.id);
                    None
                }
            };
            let live = match &handle {
                Some(handle) => canonical_state(query_state(&info.id, handle.as_ref()).await),
                None => SandboxStatus::Stopped,
            };
            info.status = match live {
                SandboxStatus::Running | SandboxStatus::Paused => live,
                _ => SandboxStatus::Stopped,
            };
            info.last_used_at = now;
            let runtime = VmRuntime {
                tap: network::tap_name(&info.id),
                mac: network::mac_address(&info.id),
                socket_path,
                vsock_path,
                handle,
            };
            entries.push((info, runtime));
        }
        let count = entries.len();
        self.registry.replace_all(entries);
        info!("microvm: rehydrated {count} VMs");
        Ok(count)
    }
}

/// Resize goes over a fresh agent connection; the shell stream carries raw bytes.
struct AgentTerminal {
    vsock_path: PathBuf,
    port: u32,
    session: Option<String>,
}

#[async_trait::async_trait]
impl TerminalControl for AgentTerminal {
    async fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        let mut client = GuestAgentClient::connect(&self.vsock_path, self.port).await?;
        client.resize(self.session.as_deref(), cols, rows).await
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait::async_trait]
impl crate::provider::Provider for MicroVmManager {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    async fn is_available(&self) -> bool {
        self.supervisor.is_available()
    }

    async fn create(&self, config: CreateConfig) -> Result<SandboxInfo> {
        MicroVmManager::create(self, config).await
    }

    async fn start(&self, id: &str) -> Result<()> {
        MicroVmManager::start(self, id).await
    }

    async fn stop(&self, id: &str) -> Result<()> {
        MicroVmManager::stop(self, id).await
    }

    async fn delete(&self, id: &str) -> Result<()> {
        MicroVmManager::delete(self, id).await
    }

    async fn get(&self, id: &str) -> Result<SandboxInfo> {
        MicroVmManager::get(self, id)
    }

    async fn list(&self, tenant_id: &str) -> Result<Vec<SandboxInfo>> {
        Ok(MicroVmManager::list(self, tenant_id))
    }

    fn touch(&self, id: &str) -> bool {
        MicroVmManager::touch(self, id)
    }

    async fn connect_terminal(&self, id: &str, cols: u16, rows: u16) -> Result<TerminalConnection> {
        MicroVmManager::connect_terminal(self, id, cols, rows).await
    }

    async fn exec(&self, id: &str, cmd: Vec<String>) -> Result<Vec<u8>> {
        MicroVmManager::exec(self, id, cmd).await
    }

    async fn get_stats(&self, id: &str) -> Result<ResourceStats> {
        self.stats(id).await
    }

    async fn stream_stats(&self, id: &str) -> Result<mpsc::Receiver<ResourceStats>> {
        MicroVmManager::stream_stats(self, id).await
    }
}

#[async_trait::async_trait]
impl crate::cleanup::CleanupTarget for MicroVmManager {
    fn idle_sandboxes(&self, threshold: Duration) -> Vec<SandboxInfo> {
        MicroVmManager::idle_sandboxes(self, threshold)
    }

    fn expired_guest_sandboxes(&self) -> Vec<SandboxInfo> {
        MicroVmManager::expired_guest_sandboxes(self)
    }

    async fn stop_sandbox(&self, id: &str) -> Result<()> {
        self.stop(id).await
    }

    async fn remove_sandbox(&self, id: &str) -> Result<()> {
        self.delete(id).await
    }
}

#[async_trait::async_trait]
impl crate::reconciler::ReconcileTarget for MicroVmManager {
    fn provider(&self) -> &str {
        PROVIDER_NAME
    }

    async fn live_states(&self) -> Result<HashMap<String, String>> {
        MicroVmManager::live_states(self).await
    }

    async fn graceful_stop(&self, id: &str, timeout: Duration) -> Result<()> {
        tokio::time::timeout(timeout, self.stop(id))
            .await
            .map_err(|_| SandboxError::Unavailable(format!("stopping VM {id} timed out")))?
    }

    async fn force_remove(&self, id: &str) -> Result<()> {
        self.delete(id).await
    }

    fn forget(&self, id: &str) -> bool {
        MicroVmManager::forget(self, id)
    }

    fn set_status(&self, id: &str, status: SandboxStatus) -> bool {
        MicroVmManager::set_status(self, id, status)
    }
}

#[cfg(test)]
mod tests {
    use super::mock::{
        ExecLog, MockNetwork, MockSupervisor, agent_path, spawn_agent, spawn_recording_agent,
    };
    use super::*;
    use std::sync::atomic::Ordering;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    struct Fixture {
        dir: tempfile::TempDir,
        network: Arc<MockNetwork>,
        supervisor: Arc<MockSupervisor>,
        manager: MicroVmManager,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let rootfs_dir = dir.path().join("rootfs");
        std::fs::create_dir_all(&rootfs_dir).unwrap();
        std::fs::write(rootfs_dir.join("ubuntu.ext4"), b"").unwrap();
        std::fs::write(rootfs_dir.join("alpine.ext4"), b"").unwrap();
        let settings = MicroVmSettings {
            kernel_path: dir.path().join("vmlinux.bin"),
            rootfs_dir,
            socket_dir: dir.path().to_path_buf(),
            guest_agent_port: 1234,
            ip_poll_interval: Duration::from_millis(1),
        };
        let network = Arc::new(MockNetwork::new());
        let supervisor = Arc::new(MockSupervisor::new());
        let manager = MicroVmManager::new(supervisor.clone(), network.clone(), settings);
        Fixture {
            dir,
            network,
            supervisor,
            manager,
        }
    }

    fn request(tenant: &str, name: &str) -> CreateConfig {
        CreateConfig {
            tenant_id: tenant.into(),
            name: name.into(),
            image: "ubuntu".into(),
            cpu_millicores: 1500,
            memory_mb: 1024,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn create_boots_with_derived_config() {
        let f = fixture();
        let dev = vm_id("t1", "dev");
        let info = f.manager.create(request("t1", "dev")).await.unwrap();

        assert_eq!(info.id, dev);
        assert_eq!(info.status, SandboxStatus::Running);
        assert_eq!(info.ip_address, "172.16.0.2");
        assert_eq!(info.provider, PROVIDER_NAME);

        let vm = f.supervisor.last().unwrap();
        let config = vm.config.clone().unwrap();
        assert_eq!(config.vcpus, 2);
        assert_eq!(config.memory_mb, 1024);
        assert_eq!(config.kernel_args, BOOT_ARGS);
        assert_eq!(config.tap_device, network::tap_name(&dev));
        assert_eq!(config.guest_mac, network::mac_address(&dev));
        assert_eq!(config.vsock_path, f.dir.path().join(format!("{dev}.vsock")));
        assert!(vm.running.load(Ordering::Relaxed));
        assert!(f.network.has_tap(&config.tap_device));
    }

    #[tokio::test]
    async fn create_rejects_duplicates_and_missing_rootfs() {
        let f = fixture();
        f.manager.create(request("t1", "dev")).await.unwrap();
        assert!(matches!(
            f.manager.create(request("t1", "dev")).await,
            Err(SandboxError::Validation(_))
        ));

        let mut missing = request("t1", "other");
        missing.image = "fedora".into();
        assert!(matches!(
            f.manager.create(missing).await,
            Err(SandboxError::Validation(_))
        ));
        assert_eq!(f.network.create_count.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn failed_boot_tears_down_the_tap() {
        let f = fixture();
        let dev = vm_id("t1", "dev");
        f.supervisor.fail_start.store(true, Ordering::Relaxed);

        let err = f.manager.create(request("t1", "dev")).await.unwrap_err();
        assert!(matches!(err, SandboxError::Provision(_)), "{err}");
        assert_eq!(f.network.tap_count(), 0);
        assert_eq!(f.network.delete_count.load(Ordering::Relaxed), 1);
        assert!(!f.dir.path().join(format!("{dev}.json")).exists());
        assert!(f.manager.get(&dev).unwrap_err().is_not_found());
        assert!(f.supervisor.last().unwrap().terminated.load(Ordering::Relaxed));
    }

    #[tokio::test]
    async fn failed_tap_leaves_nothing_behind() {
        let f = fixture();
        f.network.fail_create.store(true, Ordering::Relaxed);
        assert!(f.manager.create(request("t1", "dev")).await.is_err());
        assert_eq!(f.supervisor.launch_count.load(Ordering::Relaxed), 0);
        assert!(f.manager.list_all().is_empty());
    }

    #[tokio::test]
    async fn missing_ip_does_not_fail_create() {
        let f = fixture();
        *f.network.guest_ip.lock().unwrap() = None;
        let info = f.manager.create(request("t1", "dev")).await.unwrap();
        assert!(info.ip_address.is_empty());
        assert_eq!(f.network.lookup_count.load(Ordering::Relaxed), IP_POLL_ATTEMPTS);
    }

    #[tokio::test]
    async fn stop_keeps_tap_and_start_relaunches_from_labels() {
        let f = fixture();
        let dev = vm_id("t1", "dev");
        f.manager.create(request("t1", "dev")).await.unwrap();
        let first = f.supervisor.last().unwrap();

        f.manager.stop(&dev).await.unwrap();
        assert!(first.terminated.load(Ordering::Relaxed));
        assert_eq!(first.shutdown_count.load(Ordering::Relaxed), 1);
        assert_eq!(
            f.manager.get(&dev).unwrap().status,
            SandboxStatus::Stopped
        );
        assert_eq!(f.network.tap_count(), 1);
        assert!(f.manager.registry().get_with(&dev).unwrap().1.handle.is_none());

        // Stopping twice is a no-op.
        f.manager.stop(&dev).await.unwrap();
        assert_eq!(first.shutdown_count.load(Ordering::Relaxed), 1);

        f.manager.start(&dev).await.unwrap();
        assert_eq!(f.supervisor.launch_count.load(Ordering::Relaxed), 2);
        let second = f.supervisor.last().unwrap();
        let config = second.config.clone().unwrap();
        assert_eq!(config.vcpus, 2);
        assert_eq!(config.memory_mb, 1024);
        assert_eq!(config.tap_device, first.config.clone().unwrap().tap_device);
        assert_eq!(
            f.manager.get(&dev).unwrap().status,
            SandboxStatus::Running
        );
        assert_eq!(f.network.create_count.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn restart_without_resource_labels_uses_defaults() {
        let f = fixture();
        let dev = vm_id("t1", "dev");
        f.manager.create(request("t1", "dev")).await.unwrap();
        f.manager.stop(&dev).await.unwrap();
        f.manager.registry().update(&dev, |info, _| {
            info.labels.remove(labels::MEMORY_MB);
            info.labels.remove(labels::CPU_MILLICORES);
        });

        f.manager.start(&dev).await.unwrap();
        let config = f.supervisor.last().unwrap().config.clone().unwrap();
        assert_eq!(config.vcpus, 1);
        assert_eq!(config.memory_mb, DEFAULT_MEMORY_MB);
    }

    #[tokio::test]
    async fn delete_releases_everything() {
        let f = fixture();
        let dev = vm_id("t1", "dev");
        f.manager.create(request("t1", "dev")).await.unwrap();
        let socket = f.dir.path().join(format!("{dev}.socket"));
        std::fs::write(&socket, b"").unwrap();

        f.manager.delete(&dev).await.unwrap();
        assert_eq!(f.network.tap_count(), 0);
        assert!(!socket.exists());
        assert!(!f.dir.path().join(format!("{dev}.json")).exists());
        assert!(f.supervisor.last().unwrap().terminated.load(Ordering::Relaxed));
        assert!(f.manager.get(&dev).unwrap_err().is_not_found());
        assert!(f.manager.delete(&dev).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn exec_and_stats_go_through_the_agent() {
        let f = fixture();
        let dev = vm_id("t1", "dev");
        f.manager.create(request("t1", "dev")).await.unwrap();
        let _agent = spawn_agent(&agent_path(f.dir.path(), &dev)).unwrap();

        let out = f
            .manager
            .exec(&dev, vec!["echo".into(), "hi".into()])
            .await
            .unwrap();
        assert_eq!(out, b"echo hi\n");

        let err = f
            .manager
            .exec(&dev, vec!["false".into()])
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Backend(_)), "{err}");
        assert!(err.to_string().contains("command failed"));

        let stats = f.manager.stats(&dev).await.unwrap();
        assert_eq!(stats.memory_limit, 512 * MIB);
        assert_eq!(stats.net_tx, 20);
    }

    #[tokio::test]
    async fn copies_report_bytes_and_surface_failures() {
        let f = fixture();
        let dev = vm_id("t1", "dev");
        f.manager.create(request("t1", "dev")).await.unwrap();
        let _agent = spawn_agent(&agent_path(f.dir.path(), &dev)).unwrap();

        let bytes = f
            .manager
            .copy_to(&dev, "/etc/hosts", "/home/user/hosts", false)
            .await
            .unwrap();
        assert_eq!(bytes, 42);
        let err = f
            .manager
            .copy_from(&dev, "/missing", "/tmp/out", true)
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Backend(_)), "{err}");
    }

    #[tokio::test]
    async fn stats_fall_back_to_labels_without_agent() {
        let f = fixture();
        let dev = vm_id("t1", "dev");
        let mut config = request("t1", "dev");
        config.disk_mb = 2048;
        f.manager.create(config).await.unwrap();

        let stats = f.manager.stats(&dev).await.unwrap();
        assert_eq!(stats.memory_limit, 1024 * MIB);
        assert_eq!(stats.disk_limit, 2048 * MIB);
        assert_eq!(stats.cpu_percent, 0.0);
    }

    #[tokio::test]
    async fn terminal_streams_through_the_agent_shell() {
        let f = fixture();
        let dev = vm_id("t1", "dev");
        f.manager.create(request("t1", "dev")).await.unwrap();
        let _agent = spawn_agent(&agent_path(f.dir.path(), &dev)).unwrap();

        let mut terminal = f.manager.connect_terminal(&dev, 80, 24).await.unwrap();
        assert_eq!(terminal.provider, PROVIDER_NAME);
        terminal.writer.write_all(b"ls\n").await.unwrap();
        let mut echoed = [0u8; 3];
        terminal.reader.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"ls\n");
        terminal.control.resize(120, 40).await.unwrap();
    }

    #[tokio::test]
    async fn shell_label_follows_the_image() {
        let f = fixture();
        let mut config = request("t1", "small");
        config.image = "alpine".into();
        let info = f.manager.create(config).await.unwrap();
        assert_eq!(info.labels.get(labels::SHELL).map(String::as_str), Some("/bin/sh"));
        let info = f.manager.create(request("t1", "big")).await.unwrap();
        assert_eq!(info.labels.get(labels::SHELL).map(String::as_str), Some(DEFAULT_SHELL));
    }

    #[tokio::test]
    async fn exec_requires_a_running_vm() {
        let f = fixture();
        let dev = vm_id("t1", "dev");
        f.manager.create(request("t1", "dev")).await.unwrap();
        f.manager.stop(&dev).await.unwrap();
        assert!(matches!(
            f.manager.exec(&dev, vec!["ls".into()]).await,
            Err(SandboxError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn live_states_ask_each_supervisor() {
        let f = fixture();
        let a = vm_id("t1", "a");
        let b = vm_id("t1", "b");
        f.manager.create(request("t1", "a")).await.unwrap();
        f.manager.create(request("t1", "b")).await.unwrap();
        f.manager.stop(&b).await.unwrap();

        let states = f.manager.live_states().await.unwrap();
        assert_eq!(states.get(&a).map(String::as_str), Some("running"));
        assert_eq!(states.get(&b).map(String::as_str), Some("exited"));
    }

    #[test]
    fn vm_ids_are_path_safe_and_distinct() {
        assert_ne!(vm_id("a-b", "c"), vm_id("a", "b-c"));
        assert_ne!(vm_id("t1", "dev"), vm_id("t2", "dev"));
        assert_eq!(vm_id("t1", "dev"), vm_id("t1", "dev"));

        let id = vm_id("../../etc/x", "dev");
        assert_eq!(id.len(), 19);
        assert!(id.starts_with("vm-"));
        assert!(id[3..].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[tokio::test]
    async fn hostile_tenant_stays_inside_the_socket_dir() {
        let f = fixture();
        let info = f.manager.create(request("../../etc/x", "dev")).await.unwrap();
        let (_, runtime) = f.manager.registry().get_with(&info.id).unwrap();
        assert_eq!(runtime.socket_path.parent(), Some(f.dir.path()));
        assert_eq!(runtime.vsock_path.parent(), Some(f.dir.path()));
        assert!(f.dir.path().join(format!("{}.json", info.id)).exists());
        assert_eq!(info.tenant_id, "../../etc/x");
    }

    #[tokio::test]
    async fn tenants_sharing_a_name_stay_apart() {
        let f = fixture();
        let first = f.manager.create(request("a-b", "c")).await.unwrap();
        let second = f.manager.create(request("a", "b-c")).await.unwrap();
        assert_ne!(first.id, second.id);

        let t1 = f.manager.create(request("t1", "dev")).await.unwrap();
        let t2 = f.manager.create(request("t2", "dev")).await.unwrap();
        assert!(f.manager.get("dev").unwrap_err().is_not_found());
        assert_eq!(f.manager.get_for_tenant("t1", "dev").unwrap().id, t1.id);
        assert_eq!(f.manager.get_for_tenant("t2", "dev").unwrap().id, t2.id);

        f.manager.stop(&t2.id).await.unwrap();
        assert_eq!(f.manager.get(&t1.id).unwrap().status, SandboxStatus::Running);
        assert_eq!(f.manager.get(&t2.id).unwrap().status, SandboxStatus::Stopped);
        assert_eq!(f.network.tap_count(), 4);
    }

    #[tokio::test]
    async fn role_setup_runs_through_the_guest_agent() {
        let f = fixture();
        let dev = vm_id("t1", "dev");
        let log = ExecLog::default();
        let _agent = spawn_recording_agent(&agent_path(f.dir.path(), &dev), log.clone()).unwrap();

        let mut config = request("t1", "dev");
        config.role = "python".into();
        let info = f.manager.create(config).await.unwrap();
        assert_eq!(info.status, SandboxStatus::Running);
        assert_eq!(f.manager.get(&dev).unwrap().status, SandboxStatus::Running);
        assert_eq!(
            *log.lock().unwrap(),
            vec![roles::setup_command("python").unwrap().unwrap()]
        );
    }

    #[tokio::test]
    async fn unreachable_agent_does_not_fail_role_setup() {
        let f = fixture();
        let mut config = request("t1", "dev");
        config.role = "standard".into();
        let info = f.manager.create(config).await.unwrap();
        assert_eq!(f.manager.get(&info.id).unwrap().status, SandboxStatus::Running);

        let mut config = request("t1", "other");
        config.role = "wizard".into();
        let err = f.manager.create(config).await.unwrap_err();
        assert!(matches!(err, SandboxError::Validation(_)));
        assert_eq!(f.supervisor.launch_count.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn oversized_memory_never_reaches_the_host() {
        let f = fixture();
        let mut config = request("t1", "dev");
        config.memory_mb = u64::MAX;
        assert!(matches!(
            f.manager.create(config).await,
            Err(SandboxError::Validation(_))
        ));
        assert_eq!(f.network.create_count.load(Ordering::Relaxed), 0);
        assert_eq!(f.supervisor.launch_count.load(Ordering::Relaxed), 0);

        let info = f.manager.create(request("t1", "dev")).await.unwrap();
        f.manager.stop(&info.id).await.unwrap();
        f.manager.registry().update(&info.id, |info, _| {
            info.labels
                .insert(labels::MEMORY_MB.to_string(), u64::MAX.to_string());
        });
        let stats = f.manager.stats(&info.id).await.unwrap();
        assert_eq!(stats.memory_limit, u64::MAX);
    }

    #[tokio::test]
    async fn fresh_manager_finds_and_adopts_surviving_vms() {
        let f = fixture();
        let running = f.manager.create(request("t1", "a")).await.unwrap();
        let stopped = f.manager.create(request("t1", "b")).await.unwrap();
        f.manager.stop(&stopped.id).await.unwrap();

        // Same host, new orchestrator process.
        let restarted = MicroVmManager::new(
            f.supervisor.clone(),
            f.network.clone(),
            f.manager.settings().clone(),
        );
        assert!(restarted.list_all().is_empty());
        let states = restarted.live_states().await.unwrap();
        assert_eq!(states.get(&running.id).map(String::as_str), Some("running"));
        assert_eq!(states.get(&stopped.id).map(String::as_str), Some("exited"));

        // Untracked VMs on the host block a second create under the same name.
        assert!(matches!(
            restarted.create(request("t1", "b")).await,
            Err(SandboxError::Validation(_))
        ));

        assert_eq!(restarted.rehydrate().await.unwrap(), 2);
        let adopted = restarted.get(&running.id).unwrap();
        assert_eq!(adopted.status, SandboxStatus::Running);
        assert_eq!((adopted.tenant_id.as_str(), adopted.name.as_str()), ("t1", "a"));
        assert_eq!(restarted.get(&stopped.id).unwrap().status, SandboxStatus::Stopped);
        assert_eq!(f.supervisor.launch_count.load(Ordering::Relaxed), 2);

        restarted.delete(&running.id).await.unwrap();
        assert!(f.supervisor.launched()[0].terminated.load(Ordering::Relaxed));
        assert!(!f.network.has_tap(&network::tap_name(&running.id)));
        assert!(!restarted.live_states().await.unwrap().contains_key(&running.id));

        restarted.start(&stopped.id).await.unwrap();
        assert_eq!(f.supervisor.launch_count.load(Ordering::Relaxed), 3);
        assert_eq!(restarted.get(&stopped.id).unwrap().status, SandboxStatus::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn delete_during_boot_fails_the_create() {
        let f = fixture();
        *f.network.guest_ip.lock().unwrap() = None;
        let manager = Arc::new(MicroVmManager::new(
            f.supervisor.clone(),
            f.network.clone(),
            MicroVmSettings {
                ip_poll_interval: Duration::from_millis(100),
                ..f.manager.settings().clone()
            },
        ));
        let id = vm_id("t1", "dev");

        let create = tokio::spawn({
            let manager = manager.clone();
            async move { manager.create(request("t1", "dev")).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(manager.get(&id).unwrap().status, SandboxStatus::Creating);

        manager.delete(&id).await.unwrap();
        let err = create.await.unwrap().unwrap_err();
        assert!(matches!(err, SandboxError::Provision(_)), "{err}");
        assert!(f.supervisor.last().unwrap().terminated.load(Ordering::Relaxed));
        assert_eq!(f.network.tap_count(), 0);
        assert!(manager.get(&id).unwrap_err().is_not_found());
        assert!(!f.dir.path().join(format!("{id}.json")).exists());
    }
}
