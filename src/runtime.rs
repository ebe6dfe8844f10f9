//! Per-account sandbox controller used by the gateway
//!
//! The controller keeps one account's factory reachable, makes sure the
//! storlet daemon a request needs is running and current, then hands the
//! request to the invocation protocol.

use crate::{
    client::{SBusClient, DEFAULT_TIMEOUT},
    config::GatewayConfig,
    errors::{ClientError, RuntimeError},
    invocation::{StorletInvocationProtocol, StorletRequest, StorletResponse},
};
use std::{
    collections::{HashMap, HashSet},
    fs,
    io,
    os::unix::fs::{DirBuilderExt, PermissionsExt},
    path::{Path, PathBuf},
    process::{Child, Command},
    sync::{Arc, Mutex},
    thread,
    time::{Duration, Instant},
};
use storlets_protocol::{ServiceResponse, StartDaemonParams};
use tokio::{task, time::sleep};

const FACTORY_PIPE_NAME: &str = "factory_pipe";

/// Bound on a factory's HALT, and on waiting for it to exit afterwards
const FACTORY_STOP_TIMEOUT: Duration = Duration::from_secs(30);

/// Where the engine's endpoints, storlets, logs and caches live
///
/// Every endpoint and storlet directory has two names: the host side path
/// used by the gateway and the sandbox side path seen from inside the
/// sandbox's mounts.
#[derive(Debug, Clone, PartialEq)]
pub struct RunTimePaths {
    scope: String,
    sandbox_pipe_dir: PathBuf,
    sandbox_storlet_base_dir: PathBuf,
    host_pipe_root_dir: PathBuf,
    host_storlet_root_dir: PathBuf,
    host_log_root_dir: PathBuf,
    host_cache_root_dir: PathBuf,
}

impl RunTimePaths {
    pub fn new<S: Into<String>>(scope: S, config: &GatewayConfig) -> Self {
        let root = &config.host_root;
        let or_under_root = |dir: &Option<PathBuf>, name: &str| {
            dir.clone()
                .unwrap_or_else(|| root.join(name).join("scopes"))
        };
        RunTimePaths {
            scope: scope.into(),
            sandbox_pipe_dir: config.sandbox_pipe_dir.clone(),
            sandbox_storlet_base_dir: config.sandbox_storlet_dir.clone(),
            host_pipe_root_dir: or_under_root(&config.pipes_dir, "pipes"),
            host_storlet_root_dir: or_under_root(&config.storlets_dir, "storlets"),
            host_log_root_dir: or_under_root(&config.log_dir, "logs"),
            host_cache_root_dir: or_under_root(&config.cache_dir, "cache"),
        }
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn host_pipe_dir(&self) -> PathBuf {
        self.host_pipe_root_dir.join(&self.scope)
    }

    /// Create the host pipe directory, open to everyone so sandboxed
    /// processes can bind in it
    pub fn create_host_pipe_dir(&self) -> Result<PathBuf, RuntimeError> {
        let path = self.host_pipe_dir();
        fs::create_dir_all(&path)?;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o777))?;
        Ok(path)
    }

    pub fn host_factory_pipe(&self) -> PathBuf {
        self.host_pipe_dir().join(FACTORY_PIPE_NAME)
    }

    pub fn sandbox_factory_pipe(&self) -> PathBuf {
        self.sandbox_pipe_dir.join(FACTORY_PIPE_NAME)
    }

    pub fn host_storlet_pipe(&self, storlet_id: &str) -> PathBuf {
        self.host_pipe_dir().join(storlet_id)
    }

    pub fn sandbox_storlet_pipe(&self, storlet_id: &str) -> PathBuf {
        self.sandbox_pipe_dir.join(storlet_id)
    }

    pub fn sandbox_storlet_dir(&self, storlet_id: &str) -> PathBuf {
        self.sandbox_storlet_base_dir.join(storlet_id)
    }

    pub fn host_storlet_base_dir(&self) -> PathBuf {
        self.host_storlet_root_dir.join(&self.scope)
    }

    pub fn host_storlet_dir(&self, storlet_id: &str) -> PathBuf {
        self.host_storlet_base_dir().join(storlet_id)
    }

    pub fn host_log_path(&self, storlet_id: &str) -> PathBuf {
        self.host_log_root_dir
            .join(&self.scope)
            .join(storlet_id)
            .join("storlet_invoke.log")
    }

    pub fn host_storlet_cache_dir(&self) -> PathBuf {
        self.host_cache_root_dir.join(&self.scope).join("storlet")
    }

    pub fn host_dependency_cache_dir(&self) -> PathBuf {
        self.host_cache_root_dir.join(&self.scope).join("dependency")
    }

    /// Copy a storlet and its dependencies from the host caches into the
    /// storlet directory of `storlet_main`. Returns true when anything was
    /// copied, meaning a daemon already running has stale code.
    pub fn update_from_cache(
        &self,
        storlet_main: &str,
        storlet_id: &str,
        dependencies: &[String],
    ) -> Result<bool, RuntimeError> {
        let storlet_dir = self.host_storlet_dir(storlet_main);
        fs::DirBuilder::new()
            .recursive(true)
            .mode(0o755)
            .create(&storlet_dir)?;

        let mut updated = copy_if_stale(&self.host_storlet_cache_dir(), &storlet_dir, storlet_id)?;
        let dependency_cache = self.host_dependency_cache_dir();
        for dependency in dependencies {
            updated |= copy_if_stale(&dependency_cache, &storlet_dir, dependency)?;
        }
        Ok(updated)
    }
}

/// Copy `name` when the copy in `target_dir` is missing, has another size,
/// or is older than the cached file
fn copy_if_stale(cache_dir: &Path, target_dir: &Path, name: &str) -> Result<bool, RuntimeError> {
    let cached = cache_dir.join(name);
    let cached_metadata = match fs::metadata(&cached) {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Err(RuntimeError::NotCached(name.to_string()))
        }
        Err(err) => return Err(err.into()),
    };

    let target = target_dir.join(name);
    let stale = match fs::metadata(&target) {
        Ok(metadata) => {
            metadata.len() != cached_metadata.len()
                || metadata.modified()? < cached_metadata.modified()?
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => true,
        Err(err) => return Err(err.into()),
    };
    if stale {
        log::debug!("copying {:?} to {:?}", cached, target);
        fs::copy(&cached, &target)?;
    }
    Ok(stale)
}

/// What the factory says about one storlet daemon
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonStatus {
    Running,
    NotRunning,
    /// the factory itself did not answer
    Unreachable,
}

/// Brings a scope's sandbox (and the factory inside it) back up
pub trait SandboxRestarter: Send + Sync {
    fn restart(&self, paths: &RunTimePaths, image: &str) -> Result<(), RuntimeError>;
}

/// Runs the factory as a plain local process, one per scope
///
/// There is no container here, so the sandbox side paths in the
/// configuration must point at the host side directories.
pub struct ProcessRestarter {
    factory_binary: PathBuf,
    log_level: String,
    daemon_binary: Option<PathBuf>,
    ping_schedule: Option<(Duration, u32, Duration)>,
    images: Option<HashSet<String>>,
    factories: Mutex<HashMap<String, FactoryProcess>>,
}

struct FactoryProcess {
    child: Child,
    pipe: PathBuf,
}

impl FactoryProcess {
    /// HALT the factory so it stops its daemons, then make sure it is gone
    fn stop(mut self) {
        let pid = self.child.id();
        let client = SBusClient::new(&self.pipe).with_timeout(FACTORY_STOP_TIMEOUT);
        match client.halt() {
            Ok(response) => log::debug!("factory pid {} halted: {}", pid, response.message),
            Err(err) => log::debug!("factory pid {} did not take halt: {}", pid, err),
        }

        let deadline = Instant::now() + FACTORY_STOP_TIMEOUT;
        loop {
            match self.child.try_wait() {
                Ok(Some(status)) => {
                    log::debug!("factory pid {} exited, {}", pid, status);
                    return;
                }
                Ok(None) if Instant::now() < deadline => thread::sleep(Duration::from_millis(10)),
                Ok(None) => break,
                Err(err) => {
                    log::warn!("unable to check factory pid {}: {}", pid, err);
                    break;
                }
            }
        }

        log::warn!("factory pid {} is still running, killing it", pid);
        if let Err(err) = self.child.kill() {
            log::debug!("kill pid {}: {}", pid, err);
        }
        if let Err(err) = self.child.wait() {
            log::warn!("failed to reap pid {}: {}", pid, err);
        }
    }
}

impl ProcessRestarter {
    pub fn new<P: AsRef<Path>, S: Into<String>>(factory_binary: P, log_level: S) -> Self {
        ProcessRestarter {
            factory_binary: factory_binary.as_ref().to_path_buf(),
            log_level: log_level.into(),
            daemon_binary: None,
            ping_schedule: None,
            images: None,
            factories: Mutex::new(HashMap::new()),
        }
    }

    /// Use the configured factory binary, or `storlets-factory` from `PATH`,
    /// with the configured daemon ping schedule
    pub fn from_config(config: &GatewayConfig) -> Self {
        let binary = config
            .factory_binary
            .clone()
            .unwrap_or_else(|| PathBuf::from("storlets-factory"));
        let (startup_wait, attempts, interval) = config.daemon_ping_schedule();
        ProcessRestarter::new(binary, config.storlet_daemon_factory_debug_level.clone())
            .ping_schedule(startup_wait, attempts, interval)
    }

    /// Binary the factory runs for native daemons
    pub fn daemon_binary<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.daemon_binary = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn ping_schedule(mut self, startup_wait: Duration, attempts: u32, interval: Duration) -> Self {
        self.ping_schedule = Some((startup_wait, attempts, interval));
        self
    }

    /// Only accept restarts with one of these image names
    pub fn available_images<I, S>(mut self, images: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.images = Some(images.into_iter().map(Into::into).collect());
        self
    }

    /// Number of factory processes this restarter has started and not yet
    /// stopped
    pub fn running(&self) -> usize {
        match self.factories.lock() {
            Ok(factories) => factories.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    fn command(&self, paths: &RunTimePaths) -> Command {
        let mut command = Command::new(&self.factory_binary);
        command
            .arg(paths.host_factory_pipe())
            .arg(&self.log_level)
            .arg(paths.scope());
        if let Some(path) = &self.daemon_binary {
            command.arg("--daemon-binary").arg(path);
        }
        if let Some((startup_wait, attempts, interval)) = self.ping_schedule {
            command
                .arg("--startup-wait")
                .arg(startup_wait.as_secs_f64().to_string())
                .arg("--ping-attempts")
                .arg(attempts.to_string())
                .arg("--ping-interval")
                .arg(interval.as_secs_f64().to_string());
        }
        command
    }
}

impl SandboxRestarter for ProcessRestarter {
    fn restart(&self, paths: &RunTimePaths, image: &str) -> Result<(), RuntimeError> {
        if let Some(images) = &self.images {
            if !images.contains(image) {
                return Err(RuntimeError::RestartFailed(format!(
                    "no such image: {}",
                    image
                )));
            }
        }
        let mut factories = self
            .factories
            .lock()
            .map_err(|_| RuntimeError::RestartFailed("restarter state poisoned".to_string()))?;
        if let Some(old) = factories.remove(paths.scope()) {
            log::debug!("stopping factory for {}, pid {}", paths.scope(), old.child.id());
            old.stop();
        }
        let child = self.command(paths).spawn().map_err(|err| {
            RuntimeError::RestartFailed(format!("{:?}: {}", self.factory_binary, err))
        })?;
        log::info!(
            "started factory for {} from {}, pid {}",
            paths.scope(),
            image,
            child.id()
        );
        factories.insert(
            paths.scope().to_string(),
            FactoryProcess {
                child,
                pipe: paths.host_factory_pipe(),
            },
        );
        Ok(())
    }
}

impl Drop for ProcessRestarter {
    fn drop(&mut self) {
        let factories = match self.factories.get_mut() {
            Ok(factories) => factories,
            Err(poisoned) => poisoned.into_inner(),
        };
        for (_, factory) in factories.drain() {
            factory.stop();
        }
    }
}

/// One account's reusable sandbox, seen from the gateway
pub struct RunTimeSandbox {
    paths: RunTimePaths,
    ping_interval: Duration,
    wait_timeout: Duration,
    storlet_timeout: Duration,
    start_timeout: Duration,
    pool_size: usize,
    daemon_log_level: String,
    default_image: String,
    restarter: Arc<dyn SandboxRestarter>,
}

impl RunTimeSandbox {
    pub fn new<S: Into<String>>(
        scope: S,
        config: &GatewayConfig,
        restarter: Arc<dyn SandboxRestarter>,
    ) -> Self {
        RunTimeSandbox {
            paths: RunTimePaths::new(scope, config),
            ping_interval: config.ping_interval(),
            wait_timeout: config.sandbox_wait_timeout(),
            storlet_timeout: config.invocation_timeout(),
            start_timeout: config.daemon_start_timeout(),
            pool_size: config.storlet_daemon_thread_pool_size,
            daemon_log_level: config.storlet_daemon_debug_level.clone(),
            default_image: config.default_container_image_name.clone(),
            restarter,
        }
    }

    pub fn paths(&self) -> &RunTimePaths {
        &self.paths
    }

    async fn factory_request<F>(
        &self,
        timeout: Duration,
        request: F,
    ) -> Result<ServiceResponse, RuntimeError>
    where
        F: FnOnce(&SBusClient) -> Result<ServiceResponse, ClientError> + Send + 'static,
    {
        let client = SBusClient::new(self.paths.host_factory_pipe()).with_timeout(timeout);
        Ok(task::spawn_blocking(move || request(&client)).await??)
    }

    /// True when the factory answers PING
    pub async fn ping(&self) -> bool {
        match self.factory_request(DEFAULT_TIMEOUT, |client| client.ping()).await {
            Ok(response) if response.status => true,
            Ok(response) => {
                log::error!("failed to ping the daemon factory: {}", response.message);
                false
            }
            Err(err) => {
                log::debug!("daemon factory for {} unreachable: {}", self.paths.scope(), err);
                false
            }
        }
    }

    /// Wait for the factory to answer, up to the sandbox wait timeout
    pub async fn wait(&self) -> Result<(), RuntimeError> {
        let deadline = Instant::now() + self.wait_timeout;
        loop {
            if self.ping().await {
                return Ok(());
            }
            if Instant::now() >= deadline {
                log::error!("wait for sandbox {} timed out", self.paths.scope());
                return Err(RuntimeError::Timeout(self.paths.scope().to_string()));
            }
            sleep(self.ping_interval).await;
        }
    }

    async fn restart_with(&self, image: &str) -> Result<(), RuntimeError> {
        let restarter = self.restarter.clone();
        let paths = self.paths.clone();
        let image = image.to_string();
        task::spawn_blocking(move || restarter.restart(&paths, &image)).await??;
        self.wait().await
    }

    /// Restart the sandbox from the account's own image, falling back to
    /// the default image
    pub async fn restart(&self) -> Result<(), RuntimeError> {
        self.paths.create_host_pipe_dir()?;
        let scope = self.paths.scope().to_string();
        match self.restart_with(&scope).await {
            Err(RuntimeError::RestartFailed(reason)) => {
                log::warn!(
                    "failed to start sandbox from image {}: {}, trying default image {}",
                    scope,
                    reason,
                    self.default_image
                );
                self.restart_with(&self.default_image).await
            }
            other => other,
        }
    }

    pub async fn start_storlet_daemon(
        &self,
        storlet_path: &str,
        storlet_id: &str,
        language: &str,
        language_version: Option<String>,
    ) -> Result<(), RuntimeError> {
        let params = StartDaemonParams {
            daemon_language: language.to_lowercase(),
            daemon_language_version: language_version,
            storlet_path: storlet_path.to_string(),
            storlet_name: storlet_id.to_string(),
            pool_size: self.pool_size.max(1),
            uds_path: self.paths.sandbox_storlet_pipe(storlet_id).display().to_string(),
            log_level: self.daemon_log_level.clone(),
        };
        let response = self
            .factory_request(self.start_timeout, move |client| client.start_daemon(&params))
            .await?;
        if response.status {
            Ok(())
        } else {
            log::error!("failed to start storlet daemon: {}", response.message);
            Err(RuntimeError::StorletUnavailable(storlet_id.to_string()))
        }
    }

    pub async fn stop_storlet_daemon(&self, storlet_id: &str) -> Result<(), RuntimeError> {
        let name = storlet_id.to_string();
        let response = self
            .factory_request(DEFAULT_TIMEOUT, move |client| client.stop_daemon(&name))
            .await?;
        if response.status {
            Ok(())
        } else {
            log::error!("failed to stop storlet daemon: {}", response.message);
            Err(RuntimeError::StopFailed(storlet_id.to_string()))
        }
    }

    pub async fn get_storlet_daemon_status(
        &self,
        storlet_id: &str,
    ) -> Result<DaemonStatus, RuntimeError> {
        let name = storlet_id.to_string();
        match self
            .factory_request(DEFAULT_TIMEOUT, move |client| client.daemon_status(&name))
            .await
        {
            Ok(response) if response.status => Ok(DaemonStatus::Running),
            Ok(response) => {
                log::debug!("storlet daemon {}: {}", storlet_id, response.message);
                Ok(DaemonStatus::NotRunning)
            }
            Err(RuntimeError::Client(err)) => {
                log::debug!("daemon status for {} failed: {}", storlet_id, err);
                Ok(DaemonStatus::Unreachable)
            }
            Err(err) => Err(err),
        }
    }

    /// The search path a daemon needs for `storlet_id` and its dependencies,
    /// all inside the sandbox directory of `storlet_main`
    pub fn storlet_classpath(
        &self,
        storlet_main: &str,
        storlet_id: &str,
        dependencies: &[String],
    ) -> String {
        let dir = self.paths.sandbox_storlet_dir(storlet_main);
        let mut entries = vec![dir.join(storlet_id).display().to_string()];
        entries.extend(
            dependencies
                .iter()
                .map(|dep| dir.join(dep).display().to_string()),
        );
        entries.join(":")
    }

    /// Make sure the daemon for `request` is running and runs the current
    /// code. `cache_updated` means the storlet or its dependencies were
    /// refreshed on disk since the daemon started.
    pub async fn activate_storlet_daemon(
        &self,
        request: &StorletRequest,
        cache_updated: bool,
    ) -> Result<(), RuntimeError> {
        let main = request.storlet_main.as_str();
        let mut status = self.get_storlet_daemon_status(main).await?;
        if status == DaemonStatus::Unreachable {
            log::debug!("failed to check storlet daemon status, restarting sandbox");
            self.restart().await?;
            status = DaemonStatus::NotRunning;
        }

        if cache_updated && status == DaemonStatus::Running {
            log::debug!("cache was updated while {} is running, stopping daemon", main);
            match self.stop_storlet_daemon(main).await {
                Ok(()) => log::debug!("daemon stopped"),
                Err(err) => {
                    log::warn!("{}, restarting sandbox", err);
                    self.restart().await?;
                }
            }
            status = DaemonStatus::NotRunning;
        }

        if status == DaemonStatus::NotRunning {
            log::debug!("starting storlet daemon {}", main);
            let classpath =
                self.storlet_classpath(main, &request.storlet_id, &request.dependencies);
            match self
                .start_storlet_daemon(
                    &classpath,
                    main,
                    &request.language,
                    request.language_version.clone(),
                )
                .await
            {
                Ok(()) => log::debug!("daemon started"),
                Err(err) => {
                    log::error!("daemon start failed: {}", err);
                    return Err(RuntimeError::StorletUnavailable(main.to_string()));
                }
            }
        }
        Ok(())
    }

    /// Bring the request's storlet and dependencies into the sandbox. True
    /// when any of them changed.
    pub async fn update_from_cache(&self, request: &StorletRequest) -> Result<bool, RuntimeError> {
        let paths = self.paths.clone();
        let storlet_main = request.storlet_main.clone();
        let storlet_id = request.storlet_id.clone();
        let dependencies = request.dependencies.clone();
        task::spawn_blocking(move || {
            paths.update_from_cache(&storlet_main, &storlet_id, &dependencies)
        })
        .await?
    }

    /// Refresh the storlet from the host cache, then make sure its daemon is
    /// running the refreshed code
    pub async fn activate(&self, request: &StorletRequest) -> Result<(), RuntimeError> {
        let updated = self.update_from_cache(request).await?;
        self.activate_storlet_daemon(request, updated).await
    }

    /// Run `request` on its daemon. The daemon must already be active.
    pub async fn invoke(&self, request: StorletRequest) -> Result<StorletResponse, RuntimeError> {
        let pipe = self.paths.host_storlet_pipe(&request.storlet_main);
        let log_path = self.paths.host_log_path(&request.storlet_main);
        let protocol =
            StorletInvocationProtocol::new(request, pipe, log_path, self.storlet_timeout);
        Ok(protocol.communicate().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NeverRestarts;

    impl SandboxRestarter for NeverRestarts {
        fn restart(&self, _paths: &RunTimePaths, image: &str) -> Result<(), RuntimeError> {
            Err(RuntimeError::RestartFailed(image.to_string()))
        }
    }

    fn config() -> GatewayConfig {
        GatewayConfig::default().host_root(Path::new("/srv/storlets"))
    }

    #[test]
    fn host_and_sandbox_paths() {
        let paths = RunTimePaths::new("AUTH_a", &config());
        assert_eq!(
            paths.host_factory_pipe(),
            PathBuf::from("/srv/storlets/pipes/scopes/AUTH_a/factory_pipe")
        );
        assert_eq!(
            paths.sandbox_factory_pipe(),
            PathBuf::from("/mnt/channels/factory_pipe")
        );
        assert_eq!(
            paths.host_storlet_pipe("identity"),
            PathBuf::from("/srv/storlets/pipes/scopes/AUTH_a/identity")
        );
        assert_eq!(
            paths.sandbox_storlet_pipe("identity"),
            PathBuf::from("/mnt/channels/identity")
        );
        assert_eq!(
            paths.host_storlet_dir("identity"),
            PathBuf::from("/srv/storlets/storlets/scopes/AUTH_a/identity")
        );
        assert_eq!(
            paths.sandbox_storlet_dir("identity"),
            PathBuf::from("/home/swift/identity")
        );
        assert_eq!(
            paths.host_log_path("identity"),
            PathBuf::from("/srv/storlets/logs/scopes/AUTH_a/identity/storlet_invoke.log")
        );
        assert_eq!(
            paths.host_storlet_cache_dir(),
            PathBuf::from("/srv/storlets/cache/scopes/AUTH_a/storlet")
        );
        assert_eq!(
            paths.host_dependency_cache_dir(),
            PathBuf::from("/srv/storlets/cache/scopes/AUTH_a/dependency")
        );
    }

    #[test]
    fn configured_roots() {
        let mut config = config();
        config.pipes_dir = Some(PathBuf::from("/run/storlets"));
        let paths = RunTimePaths::new("AUTH_b", &config);
        assert_eq!(paths.host_pipe_dir(), PathBuf::from("/run/storlets/AUTH_b"));
    }

    #[test]
    fn create_pipe_dir() {
        let dir = tempfile::tempdir().unwrap();
        let paths = RunTimePaths::new("AUTH_c", &GatewayConfig::default().host_root(dir.path()));
        let created = paths.create_host_pipe_dir().unwrap();
        let mode = fs::metadata(&created).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o777);
    }

    #[test]
    fn update_from_cache() {
        let dir = tempfile::tempdir().unwrap();
        let paths = RunTimePaths::new("AUTH_e", &GatewayConfig::default().host_root(dir.path()));
        fs::create_dir_all(paths.host_storlet_cache_dir()).unwrap();
        fs::create_dir_all(paths.host_dependency_cache_dir()).unwrap();
        fs::write(paths.host_storlet_cache_dir().join("main-1.0.jar"), b"storlet").unwrap();
        let dependency = paths.host_dependency_cache_dir().join("helper.sh");
        fs::write(&dependency, b"#!/bin/sh\n").unwrap();
        fs::set_permissions(&dependency, fs::Permissions::from_mode(0o755)).unwrap();
        let dependencies = vec!["helper.sh".to_string()];

        assert!(paths.update_from_cache("Main", "main-1.0.jar", &dependencies).unwrap());
        let storlet_dir = paths.host_storlet_dir("Main");
        assert_eq!(fs::read(storlet_dir.join("main-1.0.jar")).unwrap(), b"storlet");
        let mode = fs::metadata(storlet_dir.join("helper.sh")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);

        assert!(!paths.update_from_cache("Main", "main-1.0.jar", &dependencies).unwrap());

        fs::write(paths.host_storlet_cache_dir().join("main-1.0.jar"), b"storlet v2").unwrap();
        assert!(paths.update_from_cache("Main", "main-1.0.jar", &dependencies).unwrap());
        assert_eq!(fs::read(storlet_dir.join("main-1.0.jar")).unwrap(), b"storlet v2");

        let missing = vec!["missing.so".to_string()];
        assert!(matches!(
            paths.update_from_cache("Main", "main-1.0.jar", &missing),
            Err(RuntimeError::NotCached(name)) if name == "missing.so"
        ));
        assert!(matches!(
            paths.update_from_cache("Main", "gone.jar", &[]),
            Err(RuntimeError::NotCached(_))
        ));
    }

    #[test]
    fn classpath() {
        let sandbox = RunTimeSandbox::new("AUTH_a", &config(), Arc::new(NeverRestarts));
        assert_eq!(
            sandbox.storlet_classpath("Main", "main-1.0.jar", &[]),
            "/home/swift/Main/main-1.0.jar"
        );
        assert_eq!(
            sandbox.storlet_classpath(
                "Main",
                "main-1.0.jar",
                &["dep.jar".to_string(), "other.so".to_string()]
            ),
            "/home/swift/Main/main-1.0.jar:/home/swift/Main/dep.jar:/home/swift/Main/other.so"
        );
    }

    #[test]
    fn unreachable_factory() {
        let dir = tempfile::tempdir().unwrap();
        let config = GatewayConfig::default().host_root(dir.path()).timeouts(
            Duration::from_millis(10),
            Duration::from_millis(50),
            Duration::from_secs(1),
        );
        let sandbox = RunTimeSandbox::new("AUTH_d", &config, Arc::new(NeverRestarts));
        tokio::runtime::Runtime::new().unwrap().block_on(async {
            assert!(!sandbox.ping().await);
            assert_eq!(
                sandbox.get_storlet_daemon_status("identity").await.unwrap(),
                DaemonStatus::Unreachable
            );
            assert!(matches!(sandbox.wait().await, Err(RuntimeError::Timeout(_))));
            assert!(matches!(
                sandbox.restart().await,
                Err(RuntimeError::RestartFailed(_))
            ));
        });
    }
}
