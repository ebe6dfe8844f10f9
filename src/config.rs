//! Gateway side configuration

use crate::{errors::RuntimeError, factory};
use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

const START_MARGIN: Duration = Duration::from_secs(5);

/// Settings for the runtime sandbox controller
///
/// Every key is optional in the JSON form; missing keys take the defaults
/// below. Intervals and timeouts are in seconds.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct GatewayConfig {
    pub host_root: PathBuf,
    pub pipes_dir: Option<PathBuf>,
    pub storlets_dir: Option<PathBuf>,
    pub log_dir: Option<PathBuf>,
    pub cache_dir: Option<PathBuf>,
    pub sandbox_pipe_dir: PathBuf,
    pub sandbox_storlet_dir: PathBuf,
    pub sandbox_ping_interval: f64,
    pub restart_linux_container_timeout: f64,
    pub storlet_timeout: f64,
    pub storlet_daemon_thread_pool_size: usize,
    pub storlet_daemon_startup_wait: f64,
    pub storlet_daemon_ping_attempts: u32,
    pub storlet_daemon_ping_interval: f64,
    pub storlet_daemon_factory_debug_level: String,
    pub storlet_daemon_debug_level: String,
    pub default_container_image_name: String,
    pub factory_binary: Option<PathBuf>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        GatewayConfig {
            host_root: PathBuf::from("/var/lib/storlets"),
            pipes_dir: None,
            storlets_dir: None,
            log_dir: None,
            cache_dir: None,
            sandbox_pipe_dir: PathBuf::from("/mnt/channels"),
            sandbox_storlet_dir: PathBuf::from("/home/swift"),
            sandbox_ping_interval: 0.5,
            restart_linux_container_timeout: 10.0,
            storlet_timeout: 40.0,
            storlet_daemon_thread_pool_size: 5,
            storlet_daemon_startup_wait: factory::DEFAULT_STARTUP_WAIT.as_secs_f64(),
            storlet_daemon_ping_attempts: factory::DEFAULT_PING_ATTEMPTS,
            storlet_daemon_ping_interval: factory::DEFAULT_PING_INTERVAL.as_secs_f64(),
            storlet_daemon_factory_debug_level: "DEBUG".to_string(),
            storlet_daemon_debug_level: "DEBUG".to_string(),
            default_container_image_name: "storlet_engine_image".to_string(),
            factory_binary: None,
        }
    }
}

impl GatewayConfig {
    pub fn from_file(path: &Path) -> Result<Self, RuntimeError> {
        let text = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Put every host side directory under `dir`
    pub fn host_root(mut self, dir: &Path) -> Self {
        self.host_root = dir.to_path_buf();
        self
    }

    /// Where endpoints appear from inside the sandbox
    pub fn sandbox_pipe_dir(mut self, dir: &Path) -> Self {
        self.sandbox_pipe_dir = dir.to_path_buf();
        self
    }

    pub fn sandbox_storlet_dir(mut self, dir: &Path) -> Self {
        self.sandbox_storlet_dir = dir.to_path_buf();
        self
    }

    pub fn timeouts(mut self, ping_interval: Duration, sandbox_wait: Duration, storlet: Duration) -> Self {
        self.sandbox_ping_interval = ping_interval.as_secs_f64();
        self.restart_linux_container_timeout = sandbox_wait.as_secs_f64();
        self.storlet_timeout = storlet.as_secs_f64();
        self
    }

    pub fn ping_interval(&self) -> Duration {
        seconds(self.sandbox_ping_interval)
    }

    pub fn sandbox_wait_timeout(&self) -> Duration {
        seconds(self.restart_linux_container_timeout)
    }

    pub fn invocation_timeout(&self) -> Duration {
        seconds(self.storlet_timeout)
    }

    /// How the factory paces the pings to a starting daemon
    pub fn daemon_ping_schedule(&self) -> (Duration, u32, Duration) {
        (
            seconds(self.storlet_daemon_startup_wait),
            self.storlet_daemon_ping_attempts,
            seconds(self.storlet_daemon_ping_interval),
        )
    }

    /// Reply bound for START_DAEMON, long enough to outlast every ping the
    /// factory makes
    pub fn daemon_start_timeout(&self) -> Duration {
        let (startup_wait, attempts, interval) = self.daemon_ping_schedule();
        factory::start_budget(startup_wait, attempts, interval, factory::DEFAULT_HALT_TIMEOUT)
            + START_MARGIN
    }
}

fn seconds(value: f64) -> Duration {
    if value.is_finite() && value > 0.0 {
        Duration::from_secs_f64(value)
    } else {
        Duration::from_secs(0)
    }
}
