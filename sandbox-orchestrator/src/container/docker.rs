//! Docker implementation of [`ContainerEngine`] on `docktopus`/`bollard`.

use blueprint_sdk::{debug, info};
use chrono::{DateTime, Utc};
use docktopus::DockerBuilder;
use docktopus::bollard::Docker;
use docktopus::bollard::container::{
    Config as BollardConfig, CreateContainerOptions, InspectContainerOptions,
    ListContainersOptions, LogOutput, RemoveContainerOptions, StartContainerOptions, Stats,
    StatsOptions, StopContainerOptions, UpdateContainerOptions,
};
use docktopus::bollard::errors::Error as BollardError;
use docktopus::bollard::exec::{
    CreateExecOptions, ResizeExecOptions, StartExecOptions, StartExecResults,
};
use docktopus::bollard::models::{ContainerInspectResponse, ContainerSummary, HostConfig};
use docktopus::bollard::network::{CreateNetworkOptions, InspectNetworkOptions};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;

use super::engine::{ContainerEngine, ContainerSpec, EngineContainer, ExecOutput};
use crate::error::{Result, SandboxError};
use crate::labels;
use crate::types::{ResourceStats, TerminalConnection, TerminalControl};

const STATS_CHANNEL_CAPACITY: usize = 16;
const SHELL_BUFFER: usize = 64 * 1024;

fn engine_error(op: &str, err: BollardError) -> SandboxError {
    match err {
        BollardError::DockerResponseServerError {
            status_code: 404,
            message,
        } => SandboxError::NotFound(format!("{op}: {message}")),
        other => SandboxError::Backend(format!("Failed to {op}: {other}")),
    }
}

pub struct DockerEngine {
    builder: DockerBuilder,
    client: Arc<Docker>,
}

impl DockerEngine {
    /// Connect to `docker_host`, or the local daemon when `None`.
    pub async fn connect(docker_host: Option<&str>) -> Result<Self> {
        let builder = match docker_host {
            Some(host) => DockerBuilder::with_address(host).await.map_err(|err| {
                SandboxError::Unavailable(format!("Failed to connect to docker at {host}: {err}"))
            })?,
            None => DockerBuilder::new().await.map_err(|err| {
                SandboxError::Unavailable(format!("Failed to connect to docker: {err}"))
            })?,
        };
        let client = builder.client();
        Ok(Self { builder, client })
    }

    async fn list_filtered(
        &self,
        filters: HashMap<String, Vec<String>>,
    ) -> Result<Vec<EngineContainer>> {
        let summaries = self
            .client
            .list_containers(Some(ListContainersOptions::<String> {
                all: true,
                filters,
                ..Default::default()
            }))
            .await
            .map_err(|err| engine_error("list containers", err))?;
        Ok(summaries.into_iter().map(from_summary).collect())
    }
}

fn from_summary(summary: ContainerSummary) -> EngineContainer {
    let ip_address = summary
        .network_settings
        .and_then(|settings| settings.networks)
        .and_then(|networks| {
            networks
                .into_values()
                .filter_map(|endpoint| endpoint.ip_address)
                .find(|ip| !ip.is_empty())
        })
        .unwrap_or_default();
    EngineContainer {
        id: summary.id.unwrap_or_default(),
        name: summary
            .names
            .and_then(|names| names.into_iter().next())
            .map(|name| name.trim_start_matches('/').to_string())
            .unwrap_or_default(),
        image: summary.image.unwrap_or_default(),
        state: summary.state.unwrap_or_default(),
        labels: summary.labels.unwrap_or_default(),
        created_at: summary
            .created
            .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0)),
        ip_address,
    }
}

fn from_inspect(inspect: ContainerInspectResponse) -> EngineContainer {
    let settings = inspect.network_settings;
    let primary_ip = settings
        .as_ref()
        .and_then(|s| s.ip_address.clone())
        .filter(|ip| !ip.is_empty());
    let ip_address = primary_ip
        .or_else(|| {
            settings
                .and_then(|s| s.networks)
                .and_then(|networks| {
                    networks
                        .into_values()
                        .filter_map(|endpoint| endpoint.ip_address)
                        .find(|ip| !ip.is_empty())
                })
        })
        .unwrap_or_default();
    let config = inspect.config.unwrap_or_default();
    EngineContainer {
        id: inspect.id.unwrap_or_default(),
        name: inspect
            .name
            .map(|name| name.trim_start_matches('/').to_string())
            .unwrap_or_default(),
        image: config.image.unwrap_or_default(),
        state: inspect
            .state
            .and_then(|state| state.status)
            .map(|status| status.to_string())
            .unwrap_or_default(),
        labels: config.labels.unwrap_or_default(),
        created_at: inspect
            .created
            .and_then(|ts| DateTime::parse_from_rfc3339(&ts).ok())
            .map(|ts| ts.with_timezone(&Utc)),
        ip_address,
    }
}

/// Counters extracted from one engine stats sample.
#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) struct StatsSample {
    pub cpu_total: u64,
    pub precpu_total: u64,
    pub system: u64,
    pub presystem: u64,
    pub online_cpus: u64,
    pub memory: u64,
    pub memory_limit: u64,
    pub net_rx: u64,
    pub net_tx: u64,
    pub disk_read: u64,
    pub disk_write: u64,
}

impl StatsSample {
    fn from_engine(stats: &Stats) -> Self {
        let (net_rx, net_tx) = stats
            .networks
            .as_ref()
            .map(|networks| {
                networks
                    .values()
                    .fold((0, 0), |(rx, tx), n| (rx + n.rx_bytes, tx + n.tx_bytes))
            })
            .unwrap_or((0, 0));

        let (disk_read, disk_write) = stats
            .blkio_stats
            .io_service_bytes_recursive
            .as_ref()
            .map(|entries| {
                entries.iter().fold((0, 0), |(read, write), entry| {
                    match entry.op.to_ascii_lowercase().as_str() {
                        "read" => (read + entry.value, write),
                        "write" => (read, write + entry.value),
                        _ => (read, write),
                    }
                })
            })
            .unwrap_or((0, 0));

        Self {
            cpu_total: stats.cpu_stats.cpu_usage.total_usage,
            precpu_total: stats.precpu_stats.cpu_usage.total_usage,
            system: stats.cpu_stats.system_cpu_usage.unwrap_or(0),
            presystem: stats.precpu_stats.system_cpu_usage.unwrap_or(0),
            online_cpus: stats.cpu_stats.online_cpus.unwrap_or(1),
            memory: stats.memory_stats.usage.unwrap_or(0),
            memory_limit: stats.memory_stats.limit.unwrap_or(0),
            net_rx,
            net_tx,
            disk_read,
            disk_write,
        }
    }

    /// CPU percent is the delta against the previous sample the engine
    /// reports alongside the current one.
    pub(crate) fn to_stats(&self) -> ResourceStats {
        let cpu_delta = self.cpu_total.saturating_sub(self.precpu_total);
        let system_delta = self.system.saturating_sub(self.presystem);
        let cpu_percent = if system_delta > 0 && cpu_delta > 0 {
            cpu_delta as f64 / system_delta as f64 * self.online_cpus.max(1) as f64 * 100.0
        } else {
            0.0
        };
        ResourceStats {
            cpu_percent,
            memory: self.memory,
            memory_limit: self.memory_limit,
            disk_read: self.disk_read,
            disk_write: self.disk_write,
            disk_usage: 0,
            disk_limit: 0,
            net_rx: self.net_rx,
            net_tx: self.net_tx,
        }
    }
}

fn convert_stats(stats: &Stats) -> ResourceStats {
    StatsSample::from_engine(stats).to_stats()
}

#[async_trait::async_trait]
impl ContainerEngine for DockerEngine {
    async fn ping(&self) -> Result<()> {
        self.client
            .ping()
            .await
            .map(|_| ())
            .map_err(|err| SandboxError::Unavailable(format!("docker ping failed: {err}")))
    }

    async fn image_exists(&self, reference: &str) -> Result<bool> {
        match self.client.inspect_image(reference).await {
            Ok(_) => Ok(true),
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(err) => Err(engine_error("inspect image", err)),
        }
    }

    async fn pull_image(&self, reference: &str) -> Result<()> {
        self.builder
            .pull_image(reference, None)
            .await
            .map_err(|err| SandboxError::Backend(format!("Failed to pull image {reference}: {err}")))
    }

    async fn ensure_network(&self, name: &str) -> Result<()> {
        match self
            .client
            .inspect_network(name, None::<InspectNetworkOptions<String>>)
            .await
        {
            Ok(_) => return Ok(()),
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => {}
            Err(err) => return Err(engine_error("inspect network", err)),
        }

        info!("container: creating isolated network {name}");
        self.client
            .create_network(CreateNetworkOptions::<String> {
                name: name.to_string(),
                driver: "bridge".to_string(),
                options: HashMap::from([(
                    "com.docker.network.bridge.enable_icc".to_string(),
                    "false".to_string(),
                )]),
                labels: HashMap::from([(labels::MANAGED.to_string(), "true".to_string())]),
                ..Default::default()
            })
            .await
            .map(|_| ())
            .map_err(|err| SandboxError::Network(format!("Failed to create network {name}: {err}")))
    }

    async fn find_by_name(&self, name: &str) -> Result<Option<EngineContainer>> {
        let filters = HashMap::from([("name".to_string(), vec![format!("^/{name}$")])]);
        Ok(self
            .list_filtered(filters)
            .await?
            .into_iter()
            .find(|c| c.name == name))
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String> {
        let host_config = HostConfig {
            memory: Some(spec.memory_bytes),
            memory_swap: Some(spec.memory_bytes),
            cpu_period: Some(spec.cpu_period),
            cpu_quota: Some(spec.cpu_quota),
            pids_limit: Some(spec.pids_limit),
            security_opt: Some(spec.security_opt.clone()),
            cap_drop: Some(spec.cap_drop.clone()),
            cap_add: Some(spec.cap_add.clone()),
            binds: Some(spec.binds.clone()),
            tmpfs: Some(spec.tmpfs.clone()),
            network_mode: Some(spec.network.clone()),
            ..Default::default()
        };
        let config = BollardConfig::<String> {
            image: Some(spec.image.clone()),
            hostname: Some(spec.hostname.clone()),
            working_dir: Some(spec.working_dir.clone()),
            env: Some(spec.env.clone()),
            cmd: Some(spec.cmd.clone()),
            labels: Some(spec.labels.clone()),
            tty: Some(true),
            open_stdin: Some(true),
            host_config: Some(host_config),
            ..Default::default()
        };
        let response = self
            .client
            .create_container(
                Some(CreateContainerOptions {
                    name: spec.name.clone(),
                    platform: None,
                }),
                config,
            )
            .await
            .map_err(|err| engine_error("create container", err))?;
        debug!("container: created {} as {}", spec.name, response.id);
        Ok(response.id)
    }

    async fn update_resources(
        &self,
        id: &str,
        memory_bytes: i64,
        cpu_period: i64,
        cpu_quota: i64,
    ) -> Result<()> {
        let options = UpdateContainerOptions::<String> {
            memory: Some(memory_bytes),
            memory_swap: Some(memory_bytes),
            cpu_period: Some(cpu_period),
            cpu_quota: Some(cpu_quota),
            ..Default::default()
        };
        self.client
            .update_container(id, options)
            .await
            .map_err(|err| engine_error("update container", err))?;
        debug!("container: updated limits of {id} to {memory_bytes} bytes, quota {cpu_quota}");
        Ok(())
    }

    async fn start(&self, id: &str) -> Result<()> {
        self.client
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|err| engine_error("start container", err))
    }

    async fn stop(&self, id: &str, timeout: Duration) -> Result<()> {
        match self
            .client
            .stop_container(
                id,
                Some(StopContainerOptions {
                    t: timeout.as_secs() as i64,
                }),
            )
            .await
        {
            Ok(()) => Ok(()),
            // Already stopped.
            Err(BollardError::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(err) => Err(engine_error("stop container", err)),
        }
    }

    async fn remove(&self, id: &str, force: bool) -> Result<()> {
        self.client
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force,
                    v: false,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|err| engine_error("remove container", err))
    }

    async fn inspect(&self, id: &str) -> Result<EngineContainer> {
        self.client
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map(from_inspect)
            .map_err(|err| engine_error("inspect container", err))
    }

    async fn list(&self, managed_only: bool) -> Result<Vec<EngineContainer>> {
        let mut filters = HashMap::new();
        if managed_only {
            filters.insert("label".to_string(), vec![labels::MANAGED.to_string()]);
        }
        self.list_filtered(filters).await
    }

    async fn exec(&self, id: &str, cmd: Vec<String>) -> Result<ExecOutput> {
        let exec = self
            .client
            .create_exec(
                id,
                CreateExecOptions {
                    cmd: Some(cmd),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(|err| engine_error("create exec", err))?;

        let mut output = ExecOutput::default();
        if let StartExecResults::Attached { output: mut stream, .. } = self
            .client
            .start_exec(&exec.id, None)
            .await
            .map_err(|err| engine_error("start exec", err))?
        {
            while let Some(chunk) = stream.next().await {
                match chunk.map_err(|err| engine_error("read exec output", err))? {
                    LogOutput::StdErr { message } => output.stderr.extend_from_slice(&message),
                    LogOutput::StdOut { message } | LogOutput::Console { message } => {
                        output.stdout.extend_from_slice(&message)
                    }
                    LogOutput::StdIn { .. } => {}
                }
            }
        }

        let inspect = self
            .client
            .inspect_exec(&exec.id)
            .await
            .map_err(|err| engine_error("inspect exec", err))?;
        output.exit_code = inspect.exit_code.unwrap_or(0);
        Ok(output)
    }

    async fn open_shell(
        &self,
        id: &str,
        shell: &str,
        cols: u16,
        rows: u16,
    ) -> Result<TerminalConnection> {
        let exec = self
            .client
            .create_exec(
                id,
                CreateExecOptions {
                    cmd: Some(vec![shell.to_string(), "-l".to_string()]),
                    attach_stdin: Some(true),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    tty: Some(true),
                    env: Some(vec!["TERM=xterm-256color".to_string()]),
                    ..Default::default()
                },
            )
            .await
            .map_err(|err| engine_error("create shell exec", err))?;

        let started = self
            .client
            .start_exec(
                &exec.id,
                Some(StartExecOptions {
                    detach: false,
                    tty: true,
                    output_capacity: None,
                }),
            )
            .await
            .map_err(|err| engine_error("start shell exec", err))?;
        let StartExecResults::Attached { mut output, input } = started else {
            return Err(SandboxError::Backend("shell exec started detached".into()));
        };

        let (reader, mut sink) = tokio::io::duplex(SHELL_BUFFER);
        let exec_id = exec.id.clone();
        let pump = tokio::spawn(async move {
            while let Some(Ok(chunk)) = output.next().await {
                if sink.write_all(&chunk.into_bytes()).await.is_err() {
                    break;
                }
            }
            debug!("container: shell output for exec {exec_id} ended");
        });

        let control = DockerTerminal {
            client: self.client.clone(),
            exec_id: exec.id.clone(),
            pump,
        };
        control.resize(cols, rows).await.ok();

        Ok(TerminalConnection {
            id: exec.id,
            provider: super::PROVIDER_NAME.to_string(),
            reader: Box::pin(reader),
            writer: input,
            control: Box::new(control),
        })
    }

    async fn stats(&self, id: &str) -> Result<ResourceStats> {
        let stream = self.client.stats(
            id,
            Some(StatsOptions {
                stream: false,
                one_shot: false,
            }),
        );
        tokio::pin!(stream);
        match stream.next().await {
            Some(Ok(stats)) => Ok(convert_stats(&stats)),
            Some(Err(err)) => Err(engine_error("read stats", err)),
            None => Err(SandboxError::Backend(format!("no stats returned for {id}"))),
        }
    }

    async fn stream_stats(&self, id: &str) -> Result<mpsc::Receiver<ResourceStats>> {
        let (tx, rx) = mpsc::channel(STATS_CHANNEL_CAPACITY);
        let client = self.client.clone();
        let id = id.to_string();
        tokio::spawn(async move {
            let stream = client.stats(
                &id,
                Some(StatsOptions {
                    stream: true,
                    one_shot: false,
                }),
            );
            tokio::pin!(stream);
            while let Some(Ok(stats)) = stream.next().await {
                if tx.send(convert_stats(&stats)).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }
}

struct DockerTerminal {
    client: Arc<Docker>,
    exec_id: String,
    pump: tokio::task::JoinHandle<()>,
}

#[async_trait::async_trait]
impl TerminalControl for DockerTerminal {
    async fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        self.client
            .resize_exec(
                &self.exec_id,
                ResizeExecOptions {
                    height: rows,
                    width: cols,
                },
            )
            .await
            .map_err(|err| engine_error("resize shell", err))
    }

    async fn close(&self) -> Result<()> {
        self.pump.abort();
        Ok(())
    }
}
