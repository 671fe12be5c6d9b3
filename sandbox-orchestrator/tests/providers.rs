//! Both backends driven through the provider registry only.

use sandbox_orchestrator::container::mock::MockEngine;
use sandbox_orchestrator::microvm::mock::{MockNetwork, MockSupervisor, agent_path, spawn_agent};
use sandbox_orchestrator::*;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

struct Host {
    dir: tempfile::TempDir,
    engine: Arc<MockEngine>,
    supervisor: Arc<MockSupervisor>,
    providers: ProviderRegistry,
}

fn host() -> Host {
    let dir = tempfile::tempdir().unwrap();
    let rootfs_dir = dir.path().join("rootfs");
    std::fs::create_dir_all(&rootfs_dir).unwrap();
    std::fs::write(rootfs_dir.join("ubuntu.ext4"), b"").unwrap();

    let engine = Arc::new(MockEngine::new());
    let supervisor = Arc::new(MockSupervisor::new());
    let containers = Arc::new(ContainerManager::new(
        engine.clone(),
        ContainerSettings::default(),
    ));
    let vms = Arc::new(MicroVmManager::new(
        supervisor.clone(),
        Arc::new(MockNetwork::new()),
        MicroVmSettings {
            kernel_path: dir.path().join("vmlinux.bin"),
            rootfs_dir,
            socket_dir: dir.path().to_path_buf(),
            guest_agent_port: DEFAULT_GUEST_AGENT_PORT,
            ip_poll_interval: Duration::from_millis(1),
        },
    ));

    let providers = ProviderRegistry::new();
    providers.register(containers);
    providers.register(vms);
    Host {
        dir,
        engine,
        supervisor,
        providers,
    }
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
async fn registry_lists_both_backends() {
    let host = host();
    assert_eq!(host.providers.names(), vec!["docker", "firecracker"]);
    assert_eq!(host.providers.available().await.len(), 2);

    host.supervisor.available.store(false, Ordering::Relaxed);
    let available = host.providers.available().await;
    assert_eq!(available.len(), 1);
    assert_eq!(available[0].name(), "docker");

    assert!(host.providers.get("kata").unwrap_err().is_not_found());
}

#[tokio::test]
async fn same_lifecycle_on_either_backend() {
    let host = host();
    for name in ["docker", "firecracker"] {
        let provider = host.providers.get(name).unwrap();
        let info = provider.create(request("t1", "dev")).await.unwrap();
        assert_eq!(info.provider, name);
        assert_eq!(info.status, SandboxStatus::Running);
        assert_eq!(provider.list("t1").await.unwrap().len(), 1);
        assert!(provider.list("t2").await.unwrap().is_empty());

        provider.stop(&info.id).await.unwrap();
        assert_eq!(
            provider.get(&info.id).await.unwrap().status,
            SandboxStatus::Stopped
        );
        provider.start(&info.id).await.unwrap();
        assert_eq!(
            provider.get(&info.id).await.unwrap().status,
            SandboxStatus::Running
        );
        assert!(provider.touch(&info.id));

        provider.delete(&info.id).await.unwrap();
        assert!(provider.get(&info.id).await.unwrap_err().is_not_found());
        assert!(!provider.touch(&info.id));
    }
    assert!(host.engine.container_ids().is_empty());
    assert_eq!(host.supervisor.launch_count.load(Ordering::Relaxed), 2);
}

#[tokio::test]
async fn exec_returns_output_from_either_backend() {
    let host = host();
    let cmd = vec!["echo".to_string(), "hello".to_string()];

    let docker = host.providers.get("docker").unwrap();
    let ctr = docker.create(request("t1", "a")).await.unwrap();
    assert_eq!(docker.exec(&ctr.id, cmd.clone()).await.unwrap(), b"echo hello\n");

    let firecracker = host.providers.get("firecracker").unwrap();
    let vm = firecracker.create(request("t1", "b")).await.unwrap();
    let _agent = spawn_agent(&agent_path(host.dir.path(), &vm.id)).unwrap();
    assert_eq!(firecracker.exec(&vm.id, cmd).await.unwrap(), b"echo hello\n");

    let stats = firecracker.get_stats(&vm.id).await.unwrap();
    assert_eq!(stats.memory, 64 * 1024 * 1024);
}

#[tokio::test]
async fn terminals_echo_on_either_backend() {
    let host = host();
    let docker = host.providers.get("docker").unwrap();
    let firecracker = host.providers.get("firecracker").unwrap();
    let ctr = docker.create(request("t1", "a")).await.unwrap();
    let vm = firecracker.create(request("t1", "b")).await.unwrap();
    let _agent = spawn_agent(&agent_path(host.dir.path(), &vm.id)).unwrap();

    for (provider, id) in [(docker, ctr.id), (firecracker, vm.id)] {
        let mut term = provider.connect_terminal(&id, 80, 24).await.unwrap();
        term.writer.write_all(b"pwd\n").await.unwrap();
        let mut buf = [0u8; 4];
        term.reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pwd\n");
        term.control.resize(100, 30).await.unwrap();
        term.control.close().await.unwrap();
    }
}

#[tokio::test]
async fn vm_stats_stream_until_receiver_drops() {
    let host = host();
    let firecracker = host.providers.get("firecracker").unwrap();
    let vm = firecracker.create(request("t1", "b")).await.unwrap();
    let _agent = spawn_agent(&agent_path(host.dir.path(), &vm.id)).unwrap();

    let mut rx = firecracker.stream_stats(&vm.id).await.unwrap();
    let first = rx.recv().await.unwrap();
    assert_eq!(first.net_rx, 10);
    drop(rx);
}
