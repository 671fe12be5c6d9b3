use once_cell::sync::OnceCell;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Idle and expiry enforcement settings for the cleanup service.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CleanupConfig {
    /// Guest sandboxes idle for longer than this are stopped.
    pub idle_timeout: Duration,
    pub check_interval: Duration,
    pub enabled: bool,
}

impl CleanupConfig {
    /// Conservative thresholds for production traffic.
    pub fn production() -> Self {
        Self {
            idle_timeout: Duration::from_secs(60 * 60),
            check_interval: Duration::from_secs(5 * 60),
            enabled: true,
        }
    }

    /// Short thresholds for local development.
    pub fn development() -> Self {
        Self {
            idle_timeout: Duration::from_secs(30 * 60),
            check_interval: Duration::from_secs(60),
            enabled: true,
        }
    }
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self::production()
    }
}

/// Tuning for the reconciler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReconcilerConfig {
    pub interval: Duration,
    /// How long a record in `error` without a backend ID is kept before soft deletion.
    pub error_grace: Duration,
    /// Age after which a `starting`/`configuring` record is treated as stuck.
    pub stuck_threshold: Duration,
    /// Graceful stop window used when recovering a stuck sandbox.
    pub stop_timeout: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            error_grace: Duration::from_secs(10 * 60),
            stuck_threshold: Duration::from_secs(5 * 60),
            stop_timeout: Duration::from_secs(30),
        }
    }
}

/// Process configuration loaded from environment variables.
#[derive(Clone, Debug)]
pub struct OrchestratorConfig {
    pub docker_host: Option<String>,
    pub state_dir: PathBuf,
    pub network_name: String,
    pub stop_timeout: Duration,
    pub pull_images: bool,
    pub reconciler: ReconcilerConfig,
    pub cleanup: CleanupConfig,
    pub firecracker_binary: PathBuf,
    pub firecracker_kernel: PathBuf,
    pub firecracker_rootfs_dir: PathBuf,
    pub firecracker_socket_dir: PathBuf,
    pub firecracker_bridge: String,
    pub guest_agent_port: u32,
}

static CONFIG: OnceCell<OrchestratorConfig> = OnceCell::new();

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.trim().parse::<T>().ok())
}

fn env_secs(key: &str, default: u64) -> Duration {
    Duration::from_secs(env_parse::<u64>(key).unwrap_or(default))
}

fn env_path(key: &str, default: &str) -> PathBuf {
    env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(default))
}

impl OrchestratorConfig {
    /// Load configuration from environment variables.
    /// Cached after the first call.
    pub fn load() -> &'static OrchestratorConfig {
        CONFIG.get_or_init(Self::from_env)
    }

    /// Read the environment without caching.
    pub fn from_env() -> Self {
        let defaults = ReconcilerConfig::default();

        let reconciler = ReconcilerConfig {
            interval: env_secs("RECONCILE_INTERVAL_SECS", defaults.interval.as_secs()),
            error_grace: env_secs("RECONCILE_ERROR_GRACE_SECS", defaults.error_grace.as_secs()),
            stuck_threshold: env_secs("RECONCILE_STUCK_SECS", defaults.stuck_threshold.as_secs()),
            stop_timeout: env_secs("RECONCILE_STOP_TIMEOUT_SECS", defaults.stop_timeout.as_secs()),
        };

        let mut cleanup = match env::var("CLEANUP_PROFILE").as_deref() {
            Ok("development") | Ok("dev") => CleanupConfig::development(),
            _ => CleanupConfig::production(),
        };
        if let Some(enabled) = env_parse::<bool>("CLEANUP_ENABLED") {
            cleanup.enabled = enabled;
        }

        Self {
            docker_host: env::var("DOCKER_HOST").ok().filter(|v| !v.trim().is_empty()),
            state_dir: env_path("SANDBOX_STATE_DIR", "sandbox-state"),
            network_name: env::var("SANDBOX_NETWORK")
                .unwrap_or_else(|_| crate::DEFAULT_NETWORK_NAME.to_string()),
            stop_timeout: env_secs("SANDBOX_STOP_TIMEOUT_SECS", 10),
            pull_images: env_parse::<bool>("SANDBOX_PULL_IMAGES").unwrap_or(true),
            reconciler,
            cleanup,
            firecracker_binary: env_path("FIRECRACKER_BINARY_PATH", "firecracker"),
            firecracker_kernel: env_path(
                "FIRECRACKER_KERNEL_PATH",
                "/opt/firecracker/vmlinux.bin",
            ),
            firecracker_rootfs_dir: env_path(
                "FIRECRACKER_ROOTFS_PATH",
                "/var/lib/sandbox/firecracker/rootfs",
            ),
            firecracker_socket_dir: env_path("FIRECRACKER_SOCKET_DIR", "/tmp/firecracker"),
            firecracker_bridge: env::var("FIRECRACKER_BRIDGE_NAME")
                .unwrap_or_else(|_| crate::DEFAULT_BRIDGE_NAME.to_string()),
            guest_agent_port: env_parse::<u32>("GUEST_AGENT_PORT")
                .unwrap_or(crate::DEFAULT_GUEST_AGENT_PORT),
        }
    }
}
