//! Per-VM supervisor processes.

use blueprint_sdk::{debug, warn};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UnixStream;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

use super::api::{FirecrackerClient, VmConfig};
use crate::error::{Result, SandboxError};

const SOCKET_WAIT: Duration = Duration::from_secs(5);
const SOCKET_POLL: Duration = Duration::from_millis(50);
const EXIT_WAIT: Duration = Duration::from_secs(5);

/// A launched, configured VM.
#[async_trait::async_trait]
pub trait VmHandle: Send + Sync {
    /// Issue the start action.
    async fn start(&self) -> Result<()>;

    /// Ask the guest to shut down.
    async fn shutdown(&self) -> Result<()>;

    /// Kill the supervisor process. Idempotent.
    async fn terminate(&self) -> Result<()>;

    async fn instance_info(&self) -> Result<Value>;
}

/// Launches supervisor processes.
#[async_trait::async_trait]
pub trait VmSupervisor: Send + Sync {
    /// Whether this host can run VMs at all.
    fn is_available(&self) -> bool;

    /// Spawn a supervisor bound to `socket` and push `config`. The VM is not started.
    async fn launch(&self, socket: &Path, config: &VmConfig) -> Result<Arc<dyn VmHandle>>;

    /// Re-adopt a supervisor left running on `socket` by an earlier process.
    /// `None` when nothing answers there.
    async fn attach(&self, socket: &Path, vm_id: &str) -> Result<Option<Arc<dyn VmHandle>>>;
}

/// Resolve a binary name against `PATH`, or check an explicit path.
pub fn resolve_binary(binary: &Path) -> Option<PathBuf> {
    if binary.components().count() > 1 {
        return binary.is_file().then(|| binary.to_path_buf());
    }
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(binary))
        .find(|candidate| candidate.is_file())
}

fn remove_stale(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(SandboxError::Backend(format!(
            "failed to remove stale socket {}: {err}",
            path.display()
        ))),
    }
}

pub struct FirecrackerSupervisor {
    binary: PathBuf,
    kernel: PathBuf,
}

impl FirecrackerSupervisor {
    pub fn new(binary: impl Into<PathBuf>, kernel: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            kernel: kernel.into(),
        }
    }

    async fn wait_for_socket(socket: &Path, child: &mut Child) -> Result<()> {
        let deadline = tokio::time::Instant::now() + SOCKET_WAIT;
        while !socket.exists() {
            if let Ok(Some(status)) = child.try_wait() {
                return Err(SandboxError::Backend(format!(
                    "firecracker exited before opening its socket: {status}"
                )));
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(SandboxError::Unavailable(format!(
                    "firecracker socket {} did not appear",
                    socket.display()
                )));
            }
            tokio::time::sleep(SOCKET_POLL).await;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl VmSupervisor for FirecrackerSupervisor {
    fn is_available(&self) -> bool {
        resolve_binary(&self.binary).is_some()
            && self.kernel.is_file()
            && Path::new("/dev/kvm").exists()
    }

    async fn launch(&self, socket: &Path, config: &VmConfig) -> Result<Arc<dyn VmHandle>> {
        remove_stale(socket)?;
        remove_stale(&config.vsock_path)?;

        let mut child = Command::new(&self.binary)
            .arg("--api-sock")
            .arg(socket)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                SandboxError::Backend(format!(
                    "failed to spawn {}: {e}",
                    self.binary.display()
                ))
            })?;

        if let Err(err) = Self::wait_for_socket(socket, &mut child).await {
            let _ = child.kill().await;
            return Err(err);
        }

        let client = FirecrackerClient::new(socket);
        if let Err(err) = client.configure(config).await {
            let _ = child.kill().await;
            return Err(err);
        }
        debug!(
            "microvm: supervisor for {} listening on {}",
            config.vm_id,
            socket.display()
        );

        Ok(Arc::new(FirecrackerVm {
            vm_id: config.vm_id.clone(),
            client,
            process: Mutex::new(Some(Process::Spawned(child))),
        }))
    }

    async fn attach(&self, socket: &Path, vm_id: &str) -> Result<Option<Arc<dyn VmHandle>>> {
        let stream = match UnixStream::connect(socket).await {
            Ok(stream) => stream,
            Err(err) => {
                debug!("microvm: no supervisor on {}: {err}", socket.display());
                return Ok(None);
            }
        };
        let pid = stream.peer_cred().ok().and_then(|cred| cred.pid());
        drop(stream);

        let client = FirecrackerClient::new(socket);
        client.instance_info().await?;
        debug!("microvm: adopted supervisor for {vm_id} (pid {pid:?})");
        Ok(Some(Arc::new(FirecrackerVm {
            vm_id: vm_id.to_string(),
            client,
            process: Mutex::new(Some(Process::Adopted(pid))),
        })))
    }
}

/// The supervisor process behind a handle.
enum Process {
    /// Spawned by this orchestrator.
    Spawned(Child),
    /// Found running on its socket, identified by the peer PID when known.
    Adopted(Option<i32>),
}

struct FirecrackerVm {
    vm_id: String,
    client: FirecrackerClient,
    process: Mutex<Option<Process>>,
}

impl FirecrackerVm {
    async fn reap(&self, mut child: Child) -> Result<()> {
        if let Err(err) = child.start_kill() {
            // Already exited.
            debug!("microvm: kill {} returned {err}", self.vm_id);
        }
        match tokio::time::timeout(EXIT_WAIT, child.wait()).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(err)) => Err(SandboxError::Backend(format!(
                "failed to reap firecracker for {}: {err}",
                self.vm_id
            ))),
            Err(_) => {
                warn!("microvm: firecracker for {} did not exit", self.vm_id);
                Err(SandboxError::Unavailable(format!(
                    "firecracker for {} did not exit",
                    self.vm_id
                )))
            }
        }
    }

    async fn kill_adopted(&self, pid: Option<i32>) -> Result<()> {
        let Some(pid) = pid else {
            return Err(SandboxError::Backend(format!(
                "cannot terminate adopted firecracker for {}: pid unknown",
                self.vm_id
            )));
        };
        let status = Command::new("kill")
            .arg("-KILL")
            .arg(pid.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await?;
        if !status.success() {
            // Already gone.
            debug!("microvm: kill of pid {pid} for {} returned {status}", self.vm_id);
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl VmHandle for FirecrackerVm {
    async fn start(&self) -> Result<()> {
        self.client.instance_start().await
    }

    async fn shutdown(&self) -> Result<()> {
        self.client.send_ctrl_alt_del().await
    }

    async fn terminate(&self) -> Result<()> {
        let Some(process) = self.process.lock().await.take() else {
            return Ok(());
        };
        match process {
            Process::Spawned(child) => self.reap(child).await,
            Process::Adopted(pid) => self.kill_adopted(pid).await,
        }
    }

    async fn instance_info(&self) -> Result<Value> {
        self.client.instance_info().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_binary_checks_explicit_paths() {
        let dir = tempfile::tempdir().unwrap();
        let binary = dir.path().join("firecracker");
        assert!(resolve_binary(&binary).is_none());
        std::fs::write(&binary, b"").unwrap();
        assert_eq!(resolve_binary(&binary), Some(binary));
    }

    #[test]
    fn unavailable_without_kernel() {
        let dir = tempfile::tempdir().unwrap();
        let binary = dir.path().join("firecracker");
        std::fs::write(&binary, b"").unwrap();
        let supervisor = FirecrackerSupervisor::new(&binary, dir.path().join("vmlinux.bin"));
        assert!(!supervisor.is_available());
    }

    #[tokio::test]
    async fn launch_fails_when_binary_is_missing() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = FirecrackerSupervisor::new(
            dir.path().join("no-such-firecracker"),
            dir.path().join("vmlinux.bin"),
        );
        let config = VmConfig {
            vm_id: "vm-t1-a".into(),
            vcpus: 1,
            memory_mb: 512,
            kernel_path: dir.path().join("vmlinux.bin"),
            kernel_args: crate::microvm::api::BOOT_ARGS.into(),
            rootfs_path: dir.path().join("ubuntu.ext4"),
            tap_device: "tap-0000000000".into(),
            guest_mac: "02:00:00:00:00:01".into(),
            vsock_path: dir.path().join("vm-t1-a.vsock"),
        };
        let err = supervisor
            .launch(&dir.path().join("vm-t1-a.socket"), &config)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SandboxError::Backend(_)), "{err}");
    }

    #[tokio::test]
    async fn attach_without_listener_finds_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor =
            FirecrackerSupervisor::new(dir.path().join("firecracker"), dir.path().join("vmlinux.bin"));
        let socket = dir.path().join("vm-0.socket");
        assert!(supervisor.attach(&socket, "vm-0").await.unwrap().is_none());

        // A stale socket file with nobody listening.
        std::fs::write(&socket, b"").unwrap();
        assert!(supervisor.attach(&socket, "vm-0").await.unwrap().is_none());
    }
}
