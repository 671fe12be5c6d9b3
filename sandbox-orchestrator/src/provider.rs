//! Backend-neutral provider interface and the name-keyed provider registry.
//!
//! Each backend (container engine, microVM, externally registered agents)
//! implements [`Provider`]. Request handlers resolve a backend by name through
//! [`ProviderRegistry`] and never depend on a concrete manager type.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;

use crate::error::{Result, SandboxError};
use crate::types::{CreateConfig, ResourceStats, SandboxInfo, TerminalConnection};

#[async_trait::async_trait]
pub trait Provider: Send + Sync {
    /// Registry key, e.g. `docker` or `firecracker`.
    fn name(&self) -> &str;

    /// Whether the backend can serve requests on this host right now.
    async fn is_available(&self) -> bool;

    async fn create(&self, config: CreateConfig) -> Result<SandboxInfo>;

    async fn start(&self, id: &str) -> Result<()>;

    async fn stop(&self, id: &str) -> Result<()>;

    async fn delete(&self, id: &str) -> Result<()>;

    async fn get(&self, id: &str) -> Result<SandboxInfo>;

    async fn list(&self, tenant_id: &str) -> Result<Vec<SandboxInfo>>;

    /// Record terminal activity. Returns false for unknown IDs.
    fn touch(&self, id: &str) -> bool;

    async fn connect_terminal(&self, id: &str, cols: u16, rows: u16)
    -> Result<TerminalConnection>;

    /// Run a command and return its combined output.
    async fn exec(&self, id: &str, cmd: Vec<String>) -> Result<Vec<u8>>;

    async fn get_stats(&self, id: &str) -> Result<ResourceStats>;

    /// Stats samples until the backend stream ends or the receiver is dropped.
    async fn stream_stats(&self, id: &str) -> Result<mpsc::Receiver<ResourceStats>>;
}

impl std::fmt::Debug for dyn Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Provider").field("name", &self.name()).finish()
    }
}

/// Name-keyed set of providers.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: RwLock<BTreeMap<String, Arc<dyn Provider>>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register under `provider.name()`, replacing any previous provider of that name.
    pub fn register(&self, provider: Arc<dyn Provider>) -> Option<Arc<dyn Provider>> {
        let name = provider.name().to_string();
        self.providers
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(name, provider)
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Provider>> {
        self.providers
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(name)
            .cloned()
            .ok_or_else(|| SandboxError::NotFound(format!("Provider '{name}' is not registered")))
    }

    /// Registered names in sorted order.
    pub fn names(&self) -> Vec<String> {
        self.providers
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    /// Providers whose availability check passes.
    pub async fn available(&self) -> Vec<Arc<dyn Provider>> {
        let providers: Vec<Arc<dyn Provider>> = self
            .providers
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .cloned()
            .collect();
        let mut available = Vec::with_capacity(providers.len());
        for provider in providers {
            if provider.is_available().await {
                available.push(provider);
            }
        }
        available
    }
}

#[cfg(any(test, feature = "test-utils"))]
pub mod mock {
    use super::*;
    use crate::registry::SandboxRegistry;
    use crate::types::{SandboxStatus, TerminalControl};
    use chrono::Utc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// A configurable in-memory provider for tests.
    ///
    /// Tracks call counts via atomics. Use `failing()` for a provider whose
    /// mutating operations all return errors, or flip `available` to simulate
    /// an unreachable backend.
    pub struct MockProvider {
        name: String,
        sandboxes: SandboxRegistry,
        next_id: AtomicUsize,
        pub create_count: AtomicUsize,
        pub start_count: AtomicUsize,
        pub stop_count: AtomicUsize,
        pub delete_count: AtomicUsize,
        pub should_fail: AtomicBool,
        pub available: AtomicBool,
    }

    impl MockProvider {
        pub fn new(name: &str) -> Self {
            Self {
                name: name.to_string(),
                sandboxes: SandboxRegistry::new(),
                next_id: AtomicUsize::new(0),
                create_count: AtomicUsize::new(0),
                start_count: AtomicUsize::new(0),
                stop_count: AtomicUsize::new(0),
                delete_count: AtomicUsize::new(0),
                should_fail: AtomicBool::new(false),
                available: AtomicBool::new(true),
            }
        }

        pub fn failing(name: &str) -> Self {
            let mock = Self::new(name);
            mock.should_fail.store(true, Ordering::Relaxed);
            mock
        }

        fn check(&self) -> Result<()> {
            if self.should_fail.load(Ordering::Relaxed) {
                return Err(SandboxError::Backend(format!("Mock {} failure", self.name)));
            }
            Ok(())
        }

        fn require(&self, id: &str) -> Result<SandboxInfo> {
            self.sandboxes
                .get(id)
                .ok_or_else(|| SandboxError::NotFound(format!("Sandbox '{id}' not found")))
        }
    }

    struct NoopTerminal;

    #[async_trait::async_trait]
    impl TerminalControl for NoopTerminal {
        async fn resize(&self, _cols: u16, _rows: u16) -> Result<()> {
            Ok(())
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    #[async_trait::async_trait]
    impl Provider for MockProvider {
        fn name(&self) -> &str {
            &self.name
        }

        async fn is_available(&self) -> bool {
            self.available.load(Ordering::Relaxed)
        }

        async fn create(&self, config: CreateConfig) -> Result<SandboxInfo> {
            self.create_count.fetch_add(1, Ordering::Relaxed);
            self.check()?;
            let n = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
            let now = Utc::now();
            let info = SandboxInfo {
                id: format!("{}-{n}", self.name),
                tenant_id: config.tenant_id,
                name: config.name,
                image: config.image,
                provider: self.name.clone(),
                status: SandboxStatus::Running,
                created_at: now,
                last_used_at: now,
                ip_address: format!("10.0.0.{n}"),
                labels: config.labels,
            };
            self.sandboxes.insert(info.clone(), ());
            Ok(info)
        }

        async fn start(&self, id: &str) -> Result<()> {
            self.start_count.fetch_add(1, Ordering::Relaxed);
            self.check()?;
            self.require(id)?;
            self.sandboxes.set_status(id, SandboxStatus::Running);
            Ok(())
        }

        async fn stop(&self, id: &str) -> Result<()> {
            self.stop_count.fetch_add(1, Ordering::Relaxed);
            self.check()?;
            self.require(id)?;
            self.sandboxes.set_status(id, SandboxStatus::Stopped);
            Ok(())
        }

        async fn delete(&self, id: &str) -> Result<()> {
            self.delete_count.fetch_add(1, Ordering::Relaxed);
            self.check()?;
            self.sandboxes
                .remove(id)
                .map(|_| ())
                .ok_or_else(|| SandboxError::NotFound(format!("Sandbox '{id}' not found")))
        }

        async fn get(&self, id: &str) -> Result<SandboxInfo> {
            self.require(id)
        }

        async fn list(&self, tenant_id: &str) -> Result<Vec<SandboxInfo>> {
            Ok(self.sandboxes.list_tenant(tenant_id))
        }

        fn touch(&self, id: &str) -> bool {
            self.sandboxes.touch(id, Utc::now())
        }

        async fn connect_terminal(
            &self,
            id: &str,
            _cols: u16,
            _rows: u16,
        ) -> Result<TerminalConnection> {
            self.require(id)?;
            let (client, _server) = tokio::io::duplex(1024);
            let (reader, writer) = tokio::io::split(client);
            Ok(TerminalConnection {
                id: id.to_string(),
                provider: self.name.clone(),
                reader: Box::pin(reader),
                writer: Box::pin(writer),
                control: Box::new(NoopTerminal),
            })
        }

        async fn exec(&self, id: &str, cmd: Vec<String>) -> Result<Vec<u8>> {
            self.check()?;
            self.require(id)?;
            Ok(format!("{}\n", cmd.join(" ")).into_bytes())
        }

        async fn get_stats(&self, id: &str) -> Result<ResourceStats> {
            self.require(id)?;
            Ok(ResourceStats::default())
        }

        async fn stream_stats(&self, id: &str) -> Result<mpsc::Receiver<ResourceStats>> {
            self.require(id)?;
            let (tx, rx) = mpsc::channel(1);
            let _ = tx.try_send(ResourceStats::default());
            Ok(rx)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockProvider;
    use super::*;
    use std::sync::atomic::Ordering;

    #[tokio::test]
    async fn register_and_resolve_by_name() {
        let registry = ProviderRegistry::new();
        registry.register(Arc::new(MockProvider::new("docker")));
        registry.register(Arc::new(MockProvider::new("firecracker")));

        assert_eq!(registry.names(), vec!["docker", "firecracker"]);
        assert_eq!(registry.get("docker").unwrap().name(), "docker");
        assert!(registry.get("kubernetes").unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn register_replaces_same_name() {
        let registry = ProviderRegistry::new();
        assert!(registry.register(Arc::new(MockProvider::new("docker"))).is_none());
        assert!(registry.register(Arc::new(MockProvider::new("docker"))).is_some());
        assert_eq!(registry.names().len(), 1);
    }

    #[tokio::test]
    async fn available_filters_unreachable_backends() {
        let registry = ProviderRegistry::new();
        let down = Arc::new(MockProvider::new("firecracker"));
        down.available.store(false, Ordering::Relaxed);
        registry.register(Arc::new(MockProvider::new("docker")));
        registry.register(down);

        let available = registry.available().await;
        assert_eq!(available.len(), 1);
        assert_eq!(available[0].name(), "docker");
    }

    #[tokio::test]
    async fn providers_are_interchangeable_behind_the_trait() {
        let provider: Arc<dyn Provider> = Arc::new(MockProvider::new("agent"));
        let info = provider
            .create(CreateConfig {
                tenant_id: "t1".into(),
                name: "box".into(),
                image: "ubuntu".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(info.provider, "agent");
        provider.stop(&info.id).await.unwrap();
        assert_eq!(
            provider.get(&info.id).await.unwrap().status,
            crate::types::SandboxStatus::Stopped
        );
        assert_eq!(provider.exec(&info.id, vec!["ls".into()]).await.unwrap(), b"ls\n");
        provider.delete(&info.id).await.unwrap();
        assert!(provider.list("t1").await.unwrap().is_empty());
    }
}
