//! Client for the in-guest agent.
//!
//! The agent speaks newline-delimited JSON-RPC 2.0. Each request carries a
//! monotonically increasing ID and the response must echo it. Any error
//! object in a response fails the call; nothing is retried.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

use crate::error::{Result, SandboxError};
use crate::types::ResourceStats;

const WRITE_TIMEOUT: Duration = Duration::from_secs(10);
const READ_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Slack on top of an exec's own timeout before the reply is given up on.
const EXEC_READ_MARGIN: Duration = Duration::from_secs(10);
/// Longest accepted response line.
const MAX_LINE_BYTES: u64 = 16 * 1024 * 1024;

#[derive(Serialize)]
struct Request<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<Value>,
}

#[derive(Deserialize)]
struct Response {
    id: u64,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
    #[serde(default)]
    data: Option<Value>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecResult {
    pub exit_code: i64,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub duration_ms: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopyResult {
    pub success: bool,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub bytes: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CpuMetrics {
    pub percent: f64,
    pub count: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageMetrics {
    pub used: u64,
    pub total: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkMetrics {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GuestMetrics {
    #[serde(default)]
    pub cpu: CpuMetrics,
    #[serde(default)]
    pub memory: UsageMetrics,
    #[serde(default)]
    pub disk: UsageMetrics,
    #[serde(default)]
    pub network: NetworkMetrics,
}

impl GuestMetrics {
    pub fn to_stats(&self) -> ResourceStats {
        ResourceStats {
            cpu_percent: self.cpu.percent,
            memory: self.memory.used,
            memory_limit: self.memory.total,
            disk_usage: self.disk.used,
            disk_limit: self.disk.total,
            net_rx: self.network.rx_bytes,
            net_tx: self.network.tx_bytes,
            ..Default::default()
        }
    }
}

/// Returned by `shell`. After it the connection carries raw terminal bytes.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct ShellSession {
    #[serde(default)]
    pub session: Option<String>,
}

/// Open a stream to the guest through Firecracker's host-side vsock proxy.
pub async fn connect_vsock(uds_path: &Path, port: u32) -> Result<BufReader<UnixStream>> {
    let stream = tokio::time::timeout(CONNECT_TIMEOUT, UnixStream::connect(uds_path))
        .await
        .map_err(|_| SandboxError::Unavailable("guest-agent: vsock connect timed out".into()))?
        .map_err(|e| {
            SandboxError::Unavailable(format!(
                "guest-agent: cannot reach {}: {e}",
                uds_path.display()
            ))
        })?;
    let mut stream = BufReader::new(stream);
    write_bounded(&mut stream, format!("CONNECT {port}\n").as_bytes()).await?;
    let line = read_line_bounded(&mut stream, CONNECT_TIMEOUT, MAX_LINE_BYTES).await?;
    if !line.starts_with("OK") {
        return Err(SandboxError::Unavailable(format!(
            "guest-agent: vsock handshake on port {port} rejected: {}",
            line.trim()
        )));
    }
    Ok(stream)
}

async fn write_bounded<S>(stream: &mut S, bytes: &[u8]) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let write = async {
        stream.write_all(bytes).await?;
        stream.flush().await
    };
    tokio::time::timeout(WRITE_TIMEOUT, write)
        .await
        .map_err(|_| SandboxError::Unavailable("guest-agent: write timed out".into()))?
        .map_err(|e| SandboxError::Backend(format!("guest-agent: write failed: {e}")))
}

async fn read_line_bounded<S>(
    stream: &mut BufReader<S>,
    limit: Duration,
    max_bytes: u64,
) -> Result<String>
where
    S: AsyncRead + Unpin,
{
    let mut line = String::new();
    let mut bounded = (&mut *stream).take(max_bytes);
    let read = tokio::time::timeout(limit, bounded.read_line(&mut line))
        .await
        .map_err(|_| SandboxError::Unavailable("guest-agent: read timed out".into()))?
        .map_err(|e| SandboxError::Backend(format!("guest-agent: read failed: {e}")))?;
    if read == 0 {
        return Err(SandboxError::Protocol(
            "guest-agent: connection closed".into(),
        ));
    }
    if !line.ends_with('\n') && read as u64 >= max_bytes {
        return Err(SandboxError::Protocol(format!(
            "guest-agent: response line exceeds {max_bytes} bytes"
        )));
    }
    Ok(line)
}

pub struct GuestAgentClient<S> {
    stream: BufReader<S>,
    next_id: u64,
}

impl GuestAgentClient<UnixStream> {
    pub async fn connect(uds_path: &Path, port: u32) -> Result<Self> {
        Ok(Self {
            stream: connect_vsock(uds_path, port).await?,
            next_id: 1,
        })
    }
}

impl<S> GuestAgentClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S) -> Self {
        Self::from_buffered(BufReader::new(stream))
    }

    pub fn from_buffered(stream: BufReader<S>) -> Self {
        Self { stream, next_id: 1 }
    }

    /// Give up the client and keep the stream, including any buffered bytes.
    pub fn into_stream(self) -> BufReader<S> {
        self.stream
    }

    pub async fn call<R>(&mut self, method: &str, params: Option<Value>) -> Result<R>
    where
        R: DeserializeOwned,
    {
        self.call_within(method, params, READ_TIMEOUT).await
    }

    /// Like [`call`](Self::call), waiting up to `deadline` for the reply.
    pub async fn call_within<R>(
        &mut self,
        method: &str,
        params: Option<Value>,
        deadline: Duration,
    ) -> Result<R>
    where
        R: DeserializeOwned,
    {
        let id = self.next_id;
        self.next_id += 1;

        let mut payload = serde_json::to_vec(&Request {
            jsonrpc: "2.0",
            id,
            method,
            params,
        })
        .map_err(|e| SandboxError::Protocol(format!("guest-agent: encode {method}: {e}")))?;
        payload.push(b'\n');
        write_bounded(&mut self.stream, &payload).await?;

        let line = read_line_bounded(&mut self.stream, deadline, MAX_LINE_BYTES).await?;
        let response: Response = serde_json::from_str(&line)
            .map_err(|e| SandboxError::Protocol(format!("guest-agent: bad response: {e}")))?;
        if response.id != id {
            return Err(SandboxError::Protocol(format!(
                "guest-agent: response ID mismatch: expected {id}, got {}",
                response.id
            )));
        }
        if let Some(err) = response.error {
            let data = err.data.map(|d| format!(" ({d})")).unwrap_or_default();
            return Err(SandboxError::Protocol(format!(
                "guest-agent: {method} failed with code {}: {}{data}",
                err.code, err.message
            )));
        }
        serde_json::from_value(response.result.unwrap_or(Value::Null)).map_err(|e| {
            SandboxError::Protocol(format!("guest-agent: unexpected {method} result: {e}"))
        })
    }

    /// The reply deadline covers the command's own timeout plus a margin.
    pub async fn exec(&mut self, command: &[String], timeout_secs: u64) -> Result<ExecResult> {
        self.call_within(
            "exec",
            Some(json!({ "command": command, "timeout": timeout_secs })),
            Duration::from_secs(timeout_secs) + EXEC_READ_MARGIN,
        )
        .await
    }

    /// Copy a host path into the guest.
    pub async fn copy_to(
        &mut self,
        source: &str,
        destination: &str,
        recursive: bool,
    ) -> Result<CopyResult> {
        self.copy("copy_to", source, destination, recursive).await
    }

    /// Copy a guest path out to the host.
    pub async fn copy_from(
        &mut self,
        source: &str,
        destination: &str,
        recursive: bool,
    ) -> Result<CopyResult> {
        self.copy("copy_from", source, destination, recursive).await
    }

    async fn copy(
        &mut self,
        method: &str,
        source: &str,
        destination: &str,
        recursive: bool,
    ) -> Result<CopyResult> {
        let result: CopyResult = self
            .call(
                method,
                Some(json!({
                    "source": source,
                    "destination": destination,
                    "recursive": recursive,
                })),
            )
            .await?;
        if !result.success {
            return Err(SandboxError::Backend(format!(
                "guest-agent: {method} {source} -> {destination} failed: {}",
                result.message
            )));
        }
        Ok(result)
    }

    pub async fn metrics(&mut self) -> Result<GuestMetrics> {
        self.call("metrics", None).await
    }

    /// Start an interactive shell. On success the stream switches to raw terminal I/O.
    pub async fn shell(
        mut self,
        shell: &str,
        cols: u16,
        rows: u16,
    ) -> Result<(ShellSession, BufReader<S>)> {
        let session: Option<ShellSession> = self
            .call(
                "shell",
                Some(json!({ "shell": shell, "cols": cols, "rows": rows })),
            )
            .await?;
        Ok((session.unwrap_or_default(), self.stream))
    }

    pub async fn resize(&mut self, session: Option<&str>, cols: u16, rows: u16) -> Result<()> {
        let _: Value = self
            .call(
                "resize",
                Some(json!({ "session": session, "cols": cols, "rows": rows })),
            )
            .await?;
        Ok(())
    }
}
