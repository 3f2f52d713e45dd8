/// Core configuration and error types for scorebox
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// How much isolation an environment must carry before it may run code
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SecurityMode {
    /// Root required; every control is mandatory, cgroups included
    Strict,
    /// Namespaces and chroot are mandatory; cgroups are best-effort.
    /// Runs rootless through a user namespace when not root.
    #[default]
    Permissive,
    /// No isolation at all. Only for functional tests on hosts without namespaces.
    Dev,
}

impl SecurityMode {
    pub fn is_isolated(self) -> bool {
        !matches!(self, SecurityMode::Dev)
    }

    pub fn strict_mode(self) -> bool {
        matches!(self, SecurityMode::Strict)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SecurityMode::Strict => "strict",
            SecurityMode::Permissive => "permissive",
            SecurityMode::Dev => "dev",
        }
    }
}

/// Whether a healthy instance goes back to the warm set after a request
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReusePolicy {
    /// Destroy after every request (one tenant per environment)
    #[default]
    SingleUse,
    /// Return to the warm set until max_uses or max_age is reached
    Recycle,
}

/// Host-enforced resource limits applied inside every environment
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SandboxLimits {
    /// Address space limit (RLIMIT_AS) and cgroup memory.max, in bytes
    pub memory_limit_bytes: u64,
    /// CPU seconds per guest process (RLIMIT_CPU)
    pub cpu_time_limit_secs: u64,
    /// cgroup pids.max
    pub process_limit: u32,
    /// Largest file the guest may write (RLIMIT_FSIZE)
    pub file_size_limit_bytes: u64,
    /// RLIMIT_NOFILE
    pub fd_limit: u64,
    /// Size of each tmpfs scratch mount (/work and /tmp)
    pub scratch_size_bytes: u64,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            memory_limit_bytes: 512 * 1024 * 1024,
            cpu_time_limit_secs: 30,
            process_limit: 32,
            file_size_limit_bytes: 16 * 1024 * 1024,
            fd_limit: 64,
            scratch_size_bytes: 64 * 1024 * 1024,
        }
    }
}

/// Settings for the process isolation backend
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct IsolationConfig {
    pub mode: SecurityMode,
    /// Path of the scorebox-runner binary on the host
    pub runner_path: PathBuf,
    /// Interpreter used for user code; must be reachable through runtime_mounts
    pub interpreter: PathBuf,
    /// Host paths exposed read-only inside the jail at the same location
    pub runtime_mounts: Vec<PathBuf>,
    /// Host directory holding per-instance scratch skeletons
    pub runtime_root: PathBuf,
    /// Parent cgroup v2 directory for per-instance cgroups
    pub cgroup_root: PathBuf,
    /// Credentials the runner drops to when started as root
    pub sandbox_uid: u32,
    pub sandbox_gid: u32,
    /// How long create() waits for the runner's ready frame
    pub boot_timeout_ms: u64,
    pub limits: SandboxLimits,
}

impl IsolationConfig {
    pub fn boot_timeout(&self) -> Duration {
        Duration::from_millis(self.boot_timeout_ms)
    }
}

impl Default for IsolationConfig {
    fn default() -> Self {
        Self {
            mode: SecurityMode::default(),
            runner_path: default_runner_path(),
            interpreter: PathBuf::from("/usr/bin/python3"),
            runtime_mounts: ["/usr", "/bin", "/lib", "/lib64", "/sbin"]
                .iter()
                .map(PathBuf::from)
                .collect(),
            runtime_root: std::env::temp_dir().join("scorebox"),
            cgroup_root: PathBuf::from("/sys/fs/cgroup/scorebox"),
            sandbox_uid: 65534,
            sandbox_gid: 65534,
            boot_timeout_ms: 10_000,
            limits: SandboxLimits::default(),
        }
    }
}

/// The runner binary ships next to the host binary
fn default_runner_path() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join("scorebox-runner")))
        .unwrap_or_else(|| PathBuf::from("scorebox-runner"))
}

/// Pool sizing and recycling policy
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PoolConfig {
    /// Target number of idle, ready instances
    pub min_warm: usize,
    /// Hard cap on instances in any state
    pub max_size: usize,
    /// When false the pool never pre-creates instances
    pub warmup: bool,
    pub reuse: ReusePolicy,
    /// Retire a recycled instance after this many requests
    pub max_uses: u32,
    /// Retire any instance older than this
    pub max_age_secs: u64,
    /// How long checkout waits for capacity before PoolExhausted (0 = fail at once)
    pub checkout_wait_ms: u64,
    pub maintenance_interval_ms: u64,
}

impl PoolConfig {
    /// min_warm as the pool should act on it
    pub fn effective_min_warm(&self) -> usize {
        if self.warmup {
            self.min_warm.min(self.max_size)
        } else {
            0
        }
    }

    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }

    pub fn checkout_wait(&self) -> Duration {
        Duration::from_millis(self.checkout_wait_ms)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_millis(self.maintenance_interval_ms.max(10))
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_warm: 2,
            max_size: 8,
            warmup: true,
            reuse: ReusePolicy::SingleUse,
            max_uses: 50,
            max_age_secs: 600,
            checkout_wait_ms: 5_000,
            maintenance_interval_ms: 1_000,
        }
    }
}

/// Top-level engine configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub pool: PoolConfig,
    pub isolation: IsolationConfig,
    /// Per-request wall-clock timeout used when the caller does not pass one
    pub default_timeout_ms: u64,
}

impl EngineConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default(),
            isolation: IsolationConfig::default(),
            default_timeout_ms: 30_000,
        }
    }
}

/// Custom error types for scorebox
#[derive(Error, Debug)]
pub enum ScoreboxError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Process error: {0}")]
    Process(String),

    #[error("Namespace isolation error: {0}")]
    Namespace(String),

    #[error("Cgroup error: {0}")]
    Cgroup(String),

    #[error("Filesystem error: {0}")]
    Filesystem(String),

    #[error("Privilege error: {0}")]
    Privilege(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Environment error: {0}")]
    Environment(String),
}

/// Errors surfaced by pool checkout
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("no sandbox became available within {waited:?} (max_size={max_size})")]
    Exhausted { waited: Duration, max_size: usize },

    #[error("pool is shutting down")]
    ShuttingDown,

    #[error("failed to create sandbox environment: {0}")]
    Create(ScoreboxError),
}

/// Result type alias for scorebox operations
pub type Result<T> = std::result::Result<T, ScoreboxError>;

impl From<nix::errno::Errno> for ScoreboxError {
    fn from(err: nix::errno::Errno) -> Self {
        ScoreboxError::Process(err.to_string())
    }
}

impl From<serde_json::Error> for ScoreboxError {
    fn from(err: serde_json::Error) -> Self {
        ScoreboxError::Protocol(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn warmup_disabled_means_no_warm_target() {
        let mut pool = PoolConfig {
            min_warm: 4,
            ..PoolConfig::default()
        };
        assert_eq!(pool.effective_min_warm(), 4);
        pool.warmup = false;
        assert_eq!(pool.effective_min_warm(), 0);
    }

    #[test]
    fn partial_config_file_keeps_defaults() {
        let cfg: EngineConfig =
            serde_json::from_str(r#"{"pool": {"max_size": 3}, "isolation": {"mode": "dev"}}"#)
                .unwrap();
        assert_eq!(cfg.pool.max_size, 3);
        assert_eq!(cfg.pool.min_warm, PoolConfig::default().min_warm);
        assert_eq!(cfg.isolation.mode, SecurityMode::Dev);
        assert_eq!(cfg.isolation.limits, SandboxLimits::default());
    }

    #[test]
    fn reuse_policy_wire_names() {
        let policy: ReusePolicy = serde_json::from_str("\"single_use\"").unwrap();
        assert_eq!(policy, ReusePolicy::SingleUse);
        let policy: ReusePolicy = serde_json::from_str("\"recycle\"").unwrap();
        assert_eq!(policy, ReusePolicy::Recycle);
    }
}
