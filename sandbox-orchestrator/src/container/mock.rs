//! In-memory container engine for tests.

use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;

use super::engine::{ContainerEngine, ContainerSpec, EngineContainer, ExecOutput};
use crate::error::{Result, SandboxError};
use crate::labels;
use crate::types::{ResourceStats, TerminalConnection, TerminalControl};

struct MockContainer {
    view: EngineContainer,
    spec: Option<ContainerSpec>,
}

#[derive(Default)]
struct MockState {
    containers: HashMap<String, MockContainer>,
    networks: HashSet<String>,
    images: HashSet<String>,
    volumes: HashSet<String>,
    next_id: u64,
}

impl MockState {
    fn allocate(&mut self) -> (String, String) {
        self.next_id += 1;
        let n = self.next_id;
        let id = format!("{:016x}{:048x}", n.wrapping_mul(0x9e37_79b9_7f4a_7c15), n);
        let ip = format!("172.30.{}.{}", (n / 250) % 250, n % 250 + 2);
        (id, ip)
    }

    fn get_mut(&mut self, id: &str) -> Result<&mut MockContainer> {
        self.containers
            .get_mut(id)
            .ok_or_else(|| SandboxError::NotFound(format!("No such container: {id}")))
    }
}

/// Mock engine. Every mutating call is counted; `fail_*` flags make the
/// corresponding call return a backend error.
#[derive(Default)]
pub struct MockEngine {
    state: Mutex<MockState>,
    pub create_count: AtomicUsize,
    pub start_count: AtomicUsize,
    pub stop_count: AtomicUsize,
    pub remove_count: AtomicUsize,
    pub pull_count: AtomicUsize,
    pub list_count: AtomicUsize,
    pub update_count: AtomicUsize,
    /// Every exec command, in call order.
    pub execs: Mutex<Vec<(String, Vec<String>)>>,
    /// Exit code reported by exec.
    pub exec_exit_code: AtomicI64,
    pub fail_start: AtomicBool,
    pub fail_stop: AtomicBool,
    pub fail_remove: AtomicBool,
    pub fail_list: AtomicBool,
    pub fail_exec: AtomicBool,
    pub should_fail: AtomicBool,
}

impl MockEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Engine that fails every call, including ping.
    pub fn failing() -> Self {
        let engine = Self::new();
        engine.should_fail.store(true, Ordering::Relaxed);
        engine
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn check(&self, flag: &AtomicBool, op: &str) -> Result<()> {
        if self.should_fail.load(Ordering::Relaxed) || flag.load(Ordering::Relaxed) {
            return Err(SandboxError::Backend(format!("mock {op} failure")));
        }
        Ok(())
    }

    fn check_up(&self, op: &str) -> Result<()> {
        if self.should_fail.load(Ordering::Relaxed) {
            return Err(SandboxError::Backend(format!("mock {op} failure")));
        }
        Ok(())
    }

    /// Seed a container directly, as if created outside the manager.
    pub fn insert_container(&self, name: &str, state: &str, labels: &[(&str, &str)]) -> String {
        let mut inner = self.lock();
        let (id, ip) = inner.allocate();
        inner.containers.insert(
            id.clone(),
            MockContainer {
                view: EngineContainer {
                    id: id.clone(),
                    name: name.to_string(),
                    image: "ubuntu:24.04".to_string(),
                    state: state.to_string(),
                    labels: labels
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                    created_at: Some(Utc::now()),
                    ip_address: ip,
                },
                spec: None,
            },
        );
        id
    }

    /// Change a container's raw state behind the manager's back.
    pub fn set_state(&self, id: &str, state: &str) {
        if let Some(c) = self.lock().containers.get_mut(id) {
            c.view.state = state.to_string();
        }
    }

    /// Delete a container behind the manager's back.
    pub fn delete_external(&self, id: &str) -> bool {
        self.lock().containers.remove(id).is_some()
    }

    pub fn spec(&self, id: &str) -> Option<ContainerSpec> {
        self.lock().containers.get(id).and_then(|c| c.spec.clone())
    }

    pub fn exec_log(&self) -> Vec<(String, Vec<String>)> {
        self.execs.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn state_of(&self, id: &str) -> Option<String> {
        self.lock().containers.get(id).map(|c| c.view.state.clone())
    }

    pub fn ip_for(&self, id: &str) -> String {
        self.lock()
            .containers
            .get(id)
            .map(|c| c.view.ip_address.clone())
            .unwrap_or_default()
    }

    pub fn container_ids(&self) -> Vec<String> {
        self.lock().containers.keys().cloned().collect()
    }

    pub fn has_network(&self, name: &str) -> bool {
        self.lock().networks.contains(name)
    }

    pub fn has_volume(&self, name: &str) -> bool {
        self.lock().volumes.contains(name)
    }
}

#[async_trait::async_trait]
impl ContainerEngine for MockEngine {
    async fn ping(&self) -> Result<()> {
        if self.should_fail.load(Ordering::Relaxed) {
            return Err(SandboxError::Unavailable("mock engine down".into()));
        }
        Ok(())
    }

    async fn image_exists(&self, reference: &str) -> Result<bool> {
        self.check_up("image_exists")?;
        Ok(self.lock().images.contains(reference))
    }

    async fn pull_image(&self, reference: &str) -> Result<()> {
        self.check_up("pull")?;
        self.pull_count.fetch_add(1, Ordering::Relaxed);
        self.lock().images.insert(reference.to_string());
        Ok(())
    }

    async fn ensure_network(&self, name: &str) -> Result<()> {
        self.check_up("network")?;
        self.lock().networks.insert(name.to_string());
        Ok(())
    }

    async fn find_by_name(&self, name: &str) -> Result<Option<EngineContainer>> {
        Ok(self
            .lock()
            .containers
            .values()
            .find(|c| c.view.name == name)
            .map(|c| c.view.clone()))
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String> {
        self.check_up("create")?;
        self.create_count.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.lock();
        if inner.containers.values().any(|c| c.view.name == spec.name) {
            return Err(SandboxError::Backend(format!(
                "Conflict: name {} already in use",
                spec.name
            )));
        }
        let (id, ip) = inner.allocate();
        for bind in &spec.binds {
            if let Some((volume, _)) = bind.split_once(':') {
                inner.volumes.insert(volume.to_string());
            }
        }
        inner.containers.insert(
            id.clone(),
            MockContainer {
                view: EngineContainer {
                    id: id.clone(),
                    name: spec.name.clone(),
                    image: spec.image.clone(),
                    state: "created".to_string(),
                    labels: spec.labels.clone(),
                    created_at: Some(Utc::now()),
                    ip_address: ip,
                },
                spec: Some(spec.clone()),
            },
        );
        Ok(id)
    }

    async fn start(&self, id: &str) -> Result<()> {
        self.start_count.fetch_add(1, Ordering::Relaxed);
        self.check(&self.fail_start, "start")?;
        self.lock().get_mut(id)?.view.state = "running".to_string();
        Ok(())
    }

    async fn stop(&self, id: &str, _timeout: Duration) -> Result<()> {
        self.stop_count.fetch_add(1, Ordering::Relaxed);
        self.check(&self.fail_stop, "stop")?;
        self.lock().get_mut(id)?.view.state = "exited".to_string();
        Ok(())
    }

    async fn remove(&self, id: &str, _force: bool) -> Result<()> {
        self.remove_count.fetch_add(1, Ordering::Relaxed);
        self.check(&self.fail_remove, "remove")?;
        self.lock()
            .containers
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| SandboxError::NotFound(format!("No such container: {id}")))
    }

    async fn update_resources(
        &self,
        id: &str,
        memory_bytes: i64,
        cpu_period: i64,
        cpu_quota: i64,
    ) -> Result<()> {
        self.check_up("update")?;
        self.update_count.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.lock();
        let container = inner.get_mut(id)?;
        if let Some(spec) = container.spec.as_mut() {
            spec.memory_bytes = memory_bytes;
            spec.cpu_period = cpu_period;
            spec.cpu_quota = cpu_quota;
        }
        Ok(())
    }

    async fn inspect(&self, id: &str) -> Result<EngineContainer> {
        self.check_up("inspect")?;
        Ok(self.lock().get_mut(id)?.view.clone())
    }

    async fn list(&self, managed_only: bool) -> Result<Vec<EngineContainer>> {
        self.list_count.fetch_add(1, Ordering::Relaxed);
        self.check(&self.fail_list, "list")?;
        Ok(self
            .lock()
            .containers
            .values()
            .filter(|c| !managed_only || c.view.labels.contains_key(labels::MANAGED))
            .map(|c| c.view.clone())
            .collect())
    }

    async fn exec(&self, id: &str, cmd: Vec<String>) -> Result<ExecOutput> {
        self.check(&self.fail_exec, "exec")?;
        self.lock().get_mut(id)?;
        self.execs
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push((id.to_string(), cmd.clone()));
        Ok(ExecOutput {
            exit_code: self.exec_exit_code.load(Ordering::Relaxed),
            stdout: format!("{}\n", cmd.join(" ")).into_bytes(),
            stderr: Vec::new(),
        })
    }

    async fn open_shell(
        &self,
        id: &str,
        _shell: &str,
        _cols: u16,
        _rows: u16,
    ) -> Result<TerminalConnection> {
        self.lock().get_mut(id)?;
        let (client, server) = tokio::io::duplex(4096);
        let echo = tokio::spawn(async move {
            let (mut rd, mut wr) = tokio::io::split(server);
            let _ = tokio::io::copy(&mut rd, &mut wr).await;
        });
        let (reader, writer) = tokio::io::split(client);
        Ok(TerminalConnection {
            id: id.to_string(),
            provider: super::PROVIDER_NAME.to_string(),
            reader: Box::pin(reader),
            writer: Box::pin(writer),
            control: Box::new(MockTerminal {
                resizes: Arc::new(AtomicUsize::new(0)),
                task: echo,
            }),
        })
    }

    async fn stats(&self, id: &str) -> Result<ResourceStats> {
        let mut inner = self.lock();
        let container = inner.get_mut(id)?;
        let memory_limit = container
            .spec
            .as_ref()
            .map_or(0, |spec| spec.memory_bytes.max(0) as u64);
        Ok(ResourceStats {
            cpu_percent: 1.5,
            memory: 64 * 1024 * 1024,
            memory_limit,
            ..Default::default()
        })
    }

    async fn stream_stats(&self, id: &str) -> Result<mpsc::Receiver<ResourceStats>> {
        let stats = self.stats(id).await?;
        let (tx, rx) = mpsc::channel(1);
        let _ = tx.try_send(stats);
        Ok(rx)
    }
}

/// Terminal control for the echo shell.
pub struct MockTerminal {
    pub resizes: Arc<AtomicUsize>,
    task: tokio::task::JoinHandle<()>,
}

#[async_trait::async_trait]
impl TerminalControl for MockTerminal {
    async fn resize(&self, _cols: u16, _rows: u16) -> Result<()> {
        self.resizes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.task.abort();
        Ok(())
    }
}
