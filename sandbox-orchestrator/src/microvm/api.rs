//! Firecracker control API client: HTTP/1.1 over the VM's Unix socket.

use blueprint_sdk::debug;
use http_body_util::{BodyExt, Full};
use hyper::{Method, Request, Uri, body::Bytes};
use hyper_util::client::legacy::Client;
use hyperlocal::{UnixClientExt, UnixConnector, Uri as UnixUri};
use serde_json::{Value, json};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, SandboxError};

pub const BOOT_ARGS: &str = "console=ttyS0 reboot=k panic=1 pci=off";
pub const GUEST_CID: u32 = 3;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Machine definition pushed to a freshly launched supervisor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VmConfig {
    pub vm_id: String,
    pub vcpus: u32,
    pub memory_mb: u64,
    pub kernel_path: PathBuf,
    pub kernel_args: String,
    pub rootfs_path: PathBuf,
    pub tap_device: String,
    pub guest_mac: String,
    pub vsock_path: PathBuf,
}

/// vCPU count for a millicore request, rounded up, at least one.
pub fn vcpus_for(millicores: u64) -> u32 {
    millicores.div_ceil(1000).clamp(1, u64::from(u32::MAX)) as u32
}

/// The configuration calls, in order, that precede `InstanceStart`.
pub fn boot_requests(config: &VmConfig) -> Vec<(&'static str, Value)> {
    vec![
        (
            "/machine-config",
            json!({
                "vcpu_count": config.vcpus,
                "mem_size_mib": config.memory_mb,
                "smt": false,
            }),
        ),
        (
            "/boot-source",
            json!({
                "kernel_image_path": config.kernel_path,
                "boot_args": config.kernel_args,
            }),
        ),
        (
            "/drives/rootfs",
            json!({
                "drive_id": "rootfs",
                "path_on_host": config.rootfs_path,
                "is_root_device": true,
                "is_read_only": false,
            }),
        ),
        (
            "/network-interfaces/eth0",
            json!({
                "iface_id": "eth0",
                "guest_mac": config.guest_mac,
                "host_dev_name": config.tap_device,
            }),
        ),
        (
            "/vsock",
            json!({
                "guest_cid": GUEST_CID,
                "uds_path": config.vsock_path,
            }),
        ),
    ]
}

pub struct FirecrackerClient {
    socket: PathBuf,
    client: Client<UnixConnector, Full<Bytes>>,
}

impl FirecrackerClient {
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        Self {
            socket: socket.into(),
            client: Client::unix(),
        }
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    async fn request(&self, method: Method, path: &str, body: Option<Value>) -> Result<Value> {
        let uri: Uri = UnixUri::new(&self.socket, path).into();
        let mut builder = Request::builder()
            .method(method.clone())
            .uri(uri)
            .header("accept", "application/json");
        let payload = match body {
            Some(body) => {
                builder = builder.header("content-type", "application/json");
                Full::new(Bytes::from(body.to_string()))
            }
            None => Full::new(Bytes::new()),
        };
        let request = builder
            .body(payload)
            .map_err(|e| SandboxError::Backend(format!("invalid firecracker request: {e}")))?;

        let response = tokio::time::timeout(REQUEST_TIMEOUT, self.client.request(request))
            .await
            .map_err(|_| {
                SandboxError::Unavailable(format!("firecracker {method} {path} timed out"))
            })?
            .map_err(|e| {
                SandboxError::Unavailable(format!(
                    "firecracker socket {}: {e}",
                    self.socket.display()
                ))
            })?;
        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .map_err(|e| SandboxError::Backend(format!("firecracker response body: {e}")))?
            .to_bytes();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes)
                .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
        };

        if !status.is_success() {
            let fault = body
                .get("fault_message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| body.to_string());
            return Err(SandboxError::Backend(format!(
                "firecracker {method} {path} returned {status}: {fault}"
            )));
        }
        debug!("microvm: {method} {path} -> {status}");
        Ok(body)
    }

    pub async fn put(&self, path: &str, body: Value) -> Result<()> {
        self.request(Method::PUT, path, Some(body)).await.map(|_| ())
    }

    pub async fn get(&self, path: &str) -> Result<Value> {
        self.request(Method::GET, path, None).await
    }

    /// Push machine, boot, drive, network and vsock configuration.
    pub async fn configure(&self, config: &VmConfig) -> Result<()> {
        for (path, body) in boot_requests(config) {
            self.put(path, body).await?;
        }
        Ok(())
    }

    pub async fn instance_start(&self) -> Result<()> {
        self.put("/actions", json!({ "action_type": "InstanceStart" }))
            .await
    }

    /// Ask the guest to shut down. The process has to be killed afterwards.
    pub async fn send_ctrl_alt_del(&self) -> Result<()> {
        self.put("/actions", json!({ "action_type": "SendCtrlAltDel" }))
            .await
    }

    pub async fn instance_info(&self) -> Result<Value> {
        self.get("/").await
    }
}
