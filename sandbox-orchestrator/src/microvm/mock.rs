//! Test doubles for the microVM host plumbing and the in-guest agent.

use serde_json::{Value, json};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinHandle;

use super::api::VmConfig;
use super::network::HostNetwork;
use super::supervisor::{VmHandle, VmSupervisor};
use crate::error::{Result, SandboxError};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|p| p.into_inner())
}

/// Host network that tracks taps in memory.
pub struct MockNetwork {
    taps: Mutex<HashSet<String>>,
    /// Address reported by `lookup_ip`. `None` simulates a guest without DHCP.
    pub guest_ip: Mutex<Option<String>>,
    pub bridge_count: AtomicUsize,
    pub create_count: AtomicUsize,
    pub delete_count: AtomicUsize,
    pub lookup_count: AtomicUsize,
    pub fail_create: AtomicBool,
}

impl Default for MockNetwork {
    fn default() -> Self {
        Self {
            taps: Mutex::new(HashSet::new()),
            guest_ip: Mutex::new(Some("172.16.0.2".to_string())),
            bridge_count: AtomicUsize::new(0),
            create_count: AtomicUsize::new(0),
            delete_count: AtomicUsize::new(0),
            lookup_count: AtomicUsize::new(0),
            fail_create: AtomicBool::new(false),
        }
    }
}

impl MockNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_tap(&self, name: &str) -> bool {
        lock(&self.taps).contains(name)
    }

    pub fn tap_count(&self) -> usize {
        lock(&self.taps).len()
    }
}

#[async_trait::async_trait]
impl HostNetwork for MockNetwork {
    async fn ensure_bridge(&self) -> Result<()> {
        self.bridge_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn create_tap(&self, name: &str) -> Result<()> {
        self.create_count.fetch_add(1, Ordering::Relaxed);
        if self.fail_create.load(Ordering::Relaxed) {
            return Err(SandboxError::Network(format!("mock tap {name} failure")));
        }
        self.ensure_bridge().await?;
        lock(&self.taps).insert(name.to_string());
        Ok(())
    }

    async fn delete_tap(&self, name: &str) -> Result<()> {
        self.delete_count.fetch_add(1, Ordering::Relaxed);
        if lock(&self.taps).remove(name) {
            Ok(())
        } else {
            Err(SandboxError::Network(format!("tap {name} does not exist")))
        }
    }

    async fn lookup_ip(&self, _mac: &str) -> Option<String> {
        self.lookup_count.fetch_add(1, Ordering::Relaxed);
        lock(&self.guest_ip).clone()
    }
}

/// A VM that only records what was asked of it.
#[derive(Default)]
pub struct MockVm {
    pub config: Option<VmConfig>,
    pub socket: PathBuf,
    pub running: AtomicBool,
    pub terminated: AtomicBool,
    pub start_count: AtomicUsize,
    pub shutdown_count: AtomicUsize,
    pub fail_start: AtomicBool,
}

#[async_trait::async_trait]
impl VmHandle for MockVm {
    async fn start(&self) -> Result<()> {
        self.start_count.fetch_add(1, Ordering::Relaxed);
        if self.fail_start.load(Ordering::Relaxed) {
            return Err(SandboxError::Backend("mock InstanceStart failure".into()));
        }
        self.running.store(true, Ordering::Relaxed);
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        self.shutdown_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn terminate(&self) -> Result<()> {
        self.running.store(false, Ordering::Relaxed);
        self.terminated.store(true, Ordering::Relaxed);
        Ok(())
    }

    async fn instance_info(&self) -> Result<Value> {
        let state = if self.running.load(Ordering::Relaxed) {
            "Running"
        } else {
            "Not started"
        };
        Ok(json!({ "state": state }))
    }
}

/// Supervisor that hands out [`MockVm`]s and keeps every one it launched.
pub struct MockSupervisor {
    vms: Mutex<Vec<Arc<MockVm>>>,
    pub launch_count: AtomicUsize,
    pub available: AtomicBool,
    pub fail_launch: AtomicBool,
    /// Newly launched VMs fail their start action.
    pub fail_start: AtomicBool,
    pub attach_count: AtomicUsize,
}

impl Default for MockSupervisor {
    fn default() -> Self {
        Self {
            vms: Mutex::new(Vec::new()),
            launch_count: AtomicUsize::new(0),
            available: AtomicBool::new(true),
            fail_launch: AtomicBool::new(false),
            fail_start: AtomicBool::new(false),
            attach_count: AtomicUsize::new(0),
        }
    }
}

impl MockSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn launched(&self) -> Vec<Arc<MockVm>> {
        lock(&self.vms).clone()
    }

    pub fn last(&self) -> Option<Arc<MockVm>> {
        lock(&self.vms).last().cloned()
    }
}

#[async_trait::async_trait]
impl VmSupervisor for MockSupervisor {
    fn is_available(&self) -> bool {
        self.available.load(Ordering::Relaxed)
    }

    async fn launch(&self, socket: &Path, config: &VmConfig) -> Result<Arc<dyn VmHandle>> {
        self.launch_count.fetch_add(1, Ordering::Relaxed);
        if self.fail_launch.load(Ordering::Relaxed) {
            return Err(SandboxError::Backend("mock supervisor failure".into()));
        }
        let vm = Arc::new(MockVm {
            config: Some(config.clone()),
            socket: socket.to_path_buf(),
            fail_start: AtomicBool::new(self.fail_start.load(Ordering::Relaxed)),
            ..Default::default()
        });
        lock(&self.vms).push(vm.clone());
        Ok(vm)
    }

    /// Hands back the latest launched VM on `socket` that was never terminated.
    async fn attach(&self, socket: &Path, _vm_id: &str) -> Result<Option<Arc<dyn VmHandle>>> {
        self.attach_count.fetch_add(1, Ordering::Relaxed);
        let found = lock(&self.vms)
            .iter()
            .rev()
            .find(|vm| vm.socket == socket && !vm.terminated.load(Ordering::Relaxed))
            .cloned();
        Ok(found.map(|vm| vm as Arc<dyn VmHandle>))
    }
}

/// Serve a fake guest agent on `uds_path`, speaking the vsock proxy handshake.
///
/// `exec` echoes its command on stdout (`false` exits 1), copies of
/// `/missing` fail, `metrics` returns fixed numbers, `shell` switches the
/// connection to echo mode.
pub fn spawn_agent(uds_path: &Path) -> std::io::Result<JoinHandle<()>> {
    spawn_recording_agent(uds_path, ExecLog::default())
}

/// Commands received by a fake agent's `exec`, in arrival order.
pub type ExecLog = Arc<Mutex<Vec<Vec<String>>>>;

/// [`spawn_agent`] that also appends every exec command to `log`.
pub fn spawn_recording_agent(uds_path: &Path, log: ExecLog) -> std::io::Result<JoinHandle<()>> {
    let listener = UnixListener::bind(uds_path)?;
    Ok(tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(serve_agent(stream, log.clone()));
        }
    }))
}

/// Path where [`spawn_agent`] should listen for a VM's vsock socket.
pub fn agent_path(socket_dir: &Path, vm_id: &str) -> PathBuf {
    socket_dir.join(format!("{vm_id}.vsock"))
}

async fn serve_agent(stream: UnixStream, log: ExecLog) {
    let mut stream = BufReader::new(stream);
    let mut line = String::new();
    if stream.read_line(&mut line).await.unwrap_or(0) == 0 || !line.starts_with("CONNECT ") {
        return;
    }
    if stream.get_mut().write_all(b"OK 1073741824\n").await.is_err() {
        return;
    }
    loop {
        line.clear();
        if stream.read_line(&mut line).await.unwrap_or(0) == 0 {
            return;
        }
        let Ok(request) = serde_json::from_str::<Value>(&line) else {
            return;
        };
        let method = request["method"].as_str().unwrap_or_default();
        let result = match method {
            "exec" => {
                let command: Vec<String> = request["params"]["command"]
                    .as_array()
                    .map(|parts| {
                        parts
                            .iter()
                            .filter_map(|p| p.as_str().map(str::to_string))
                            .collect()
                    })
                    .unwrap_or_default();
                log.lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .push(command.clone());
                if command.first().map(String::as_str) == Some("false") {
                    json!({"exit_code": 1, "stdout": "", "stderr": "command failed\n"})
                } else {
                    json!({"exit_code": 0, "stdout": format!("{}\n", command.join(" ")), "stderr": ""})
                }
            }
            "metrics" => json!({
                "cpu": {"percent": 5.0, "count": 1},
                "memory": {"used": 64 * 1024 * 1024, "total": 512 * 1024 * 1024},
                "disk": {"used": 1024, "total": 4096},
                "network": {"rx_bytes": 10, "tx_bytes": 20}
            }),
            "copy_to" | "copy_from" => {
                if request["params"]["source"].as_str() == Some("/missing") {
                    json!({"success": false, "message": "no such file"})
                } else {
                    json!({"success": true, "bytes": 42})
                }
            }
            "shell" => json!({"session": "shell-1"}),
            "resize" => Value::Null,
            other => {
                let reply = json!({
                    "jsonrpc": "2.0",
                    "id": request["id"],
                    "error": {"code": -32601, "message": format!("unknown method {other}")}
                });
                let _ = stream
                    .get_mut()
                    .write_all(format!("{reply}\n").as_bytes())
                    .await;
                continue;
            }
        };
        let reply = json!({"jsonrpc": "2.0", "id": request["id"], "result": result});
        if stream
            .get_mut()
            .write_all(format!("{reply}\n").as_bytes())
            .await
            .is_err()
        {
            return;
        }
        if method == "shell" {
            let (mut reader, mut writer) = tokio::io::split(stream);
            let _ = tokio::io::copy(&mut reader, &mut writer).await;
            return;
        }
    }
}
