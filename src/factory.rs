//! Per-account supervisor for storlet daemons
//!
//! The factory owns one worker process per storlet name. It is driven by a
//! single command loop, so the worker table needs no locking.

use crate::{
    client::SBusClient,
    errors::FactoryError,
    launcher::DaemonLauncher,
    server::{CommandHandler, CommandResponse, Request},
};
use std::{
    collections::HashMap,
    io,
    os::unix::process::ExitStatusExt,
    path::PathBuf,
    process::{Child, ExitStatus},
    thread,
    time::{Duration, Instant},
};
use storlets_protocol::{Command, Params, StartDaemonParams};

/// Lifecycle of a tracked worker. Absence from the table means not running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Starting,
    Running,
    Stopping,
}

#[derive(Debug)]
struct WorkerRecord {
    name: String,
    uds_path: PathBuf,
    child: Child,
    state: WorkerState,
}

impl WorkerRecord {
    fn is_alive(&mut self) -> bool {
        match self.child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                log::info!("storlet daemon {} has exited, {}", self.name, status);
                false
            }
            Err(err) => {
                log::warn!("unable to check storlet daemon {}: {}", self.name, err);
                false
            }
        }
    }

    fn kill(&mut self) {
        if let Err(err) = self.child.kill() {
            // already exited is fine
            if err.kind() != io::ErrorKind::InvalidInput {
                log::warn!("failed to kill storlet daemon {}: {}", self.name, err);
            }
        }
    }

    /// Wait up to `timeout` for the process to exit, without blocking past it
    fn reap(&mut self, timeout: Duration) -> Result<Option<ExitStatus>, FactoryError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(status) = self.child.try_wait()? {
                return Ok(Some(status));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            thread::sleep(Duration::from_millis(10));
        }
    }

    /// Kill the process and collect its exit status
    fn terminate(&mut self, timeout: Duration) -> Result<ExitStatus, FactoryError> {
        self.state = WorkerState::Stopping;
        self.kill();
        self.reap(timeout)?
            .ok_or_else(|| FactoryError::ReapTimeout(self.name.clone()))
    }
}

/// Time a new daemon gets before the first ping
pub const DEFAULT_STARTUP_WAIT: Duration = Duration::from_secs(1);

/// Pings a starting daemon gets before it is given up on
pub const DEFAULT_PING_ATTEMPTS: u32 = 10;

/// Pause between pings, also the bound on each ping
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(1);

/// Bound on waiting for one daemon to exit
pub const DEFAULT_HALT_TIMEOUT: Duration = Duration::from_secs(5);

/// Longest a START_DAEMON can take with the given schedule, including
/// killing a daemon that never answered
pub fn start_budget(
    startup_wait: Duration,
    ping_attempts: u32,
    ping_interval: Duration,
    halt_timeout: Duration,
) -> Duration {
    startup_wait + ping_interval * 2 * ping_attempts + halt_timeout
}

/// Supervisor for the storlet daemons of one account
pub struct DaemonFactory {
    launcher: DaemonLauncher,
    workers: HashMap<String, WorkerRecord>,
    startup_wait: Duration,
    ping_attempts: u32,
    ping_interval: Duration,
    halt_timeout: Duration,
}

impl DaemonFactory {
    pub fn new(launcher: DaemonLauncher) -> Self {
        DaemonFactory {
            launcher,
            workers: HashMap::new(),
            startup_wait: DEFAULT_STARTUP_WAIT,
            ping_attempts: DEFAULT_PING_ATTEMPTS,
            ping_interval: DEFAULT_PING_INTERVAL,
            halt_timeout: DEFAULT_HALT_TIMEOUT,
        }
    }

    /// Time to let a new daemon settle before the first liveness check
    pub fn startup_wait(mut self, wait: Duration) -> Self {
        self.startup_wait = wait;
        self
    }

    /// How many pings a starting daemon gets, and how far apart they are
    pub fn ping_schedule(mut self, attempts: u32, interval: Duration) -> Self {
        self.ping_attempts = attempts;
        self.ping_interval = interval;
        self
    }

    /// Bound on waiting for one daemon to exit after HALT or a kill
    pub fn halt_timeout(mut self, timeout: Duration) -> Self {
        self.halt_timeout = timeout;
        self
    }

    pub fn state(&self, storlet_name: &str) -> Option<WorkerState> {
        self.workers.get(storlet_name).map(|record| record.state)
    }

    pub fn pid(&self, storlet_name: &str) -> Option<u32> {
        self.workers.get(storlet_name).map(|record| record.child.id())
    }

    /// Number of tracked daemons, dead or alive
    pub fn daemon_count(&self) -> usize {
        self.workers.len()
    }

    pub fn start_daemon(&mut self, params: &Params) -> Result<String, FactoryError> {
        let params = StartDaemonParams::from_params(params)?;
        let name = params.storlet_name.clone();

        if let Some(record) = self.workers.get_mut(&name) {
            if record.state == WorkerState::Stopping {
                log::warn!("storlet daemon {} is still stopping, killing it again", name);
                record.terminate(self.halt_timeout)?;
            } else if record.is_alive() {
                log::info!("{} is already running", name);
                return Ok(format!("{} is already running", name));
            } else {
                log::warn!("discarding dead record for storlet daemon {}", name);
            }
            self.workers.remove(&name);
        }

        let mut command = self.launcher.command(&params)?;
        log::info!("starting storlet daemon {}: {:?}", name, command);
        let child = command.spawn().map_err(|source| FactoryError::Spawn {
            name: name.clone(),
            source,
        })?;
        let mut record = WorkerRecord {
            name: name.clone(),
            uds_path: PathBuf::from(&params.uds_path),
            child,
            state: WorkerState::Starting,
        };

        match self.wait_for_daemon(&mut record) {
            Ok(()) => {
                log::info!("storlet daemon {} is running, pid {}", name, record.child.id());
                record.state = WorkerState::Running;
                self.workers.insert(name, record);
                Ok("OK".to_string())
            }
            Err(err) => {
                if let Err(kill_err) = record.terminate(self.halt_timeout) {
                    log::error!("{}", kill_err);
                }
                Err(err)
            }
        }
    }

    fn wait_for_daemon(&self, record: &mut WorkerRecord) -> Result<(), FactoryError> {
        thread::sleep(self.startup_wait);
        let client = SBusClient::new(&record.uds_path).with_timeout(self.ping_interval);
        for attempt in 1..=self.ping_attempts {
            if let Some(status) = record.child.try_wait()? {
                return Err(FactoryError::DaemonExited {
                    name: record.name.clone(),
                    status,
                });
            }
            match client.ping() {
                Ok(response) if response.status => return Ok(()),
                Ok(response) => log::debug!(
                    "ping {} of {} to {}: {}",
                    attempt,
                    self.ping_attempts,
                    record.name,
                    response.message
                ),
                Err(err) => log::debug!(
                    "ping {} of {} to {}: {}",
                    attempt,
                    self.ping_attempts,
                    record.name,
                    err
                ),
            }
            if attempt < self.ping_attempts {
                thread::sleep(self.ping_interval);
            }
        }
        Err(FactoryError::PingTimeout {
            name: record.name.clone(),
            attempts: self.ping_attempts,
        })
    }

    /// Kill a daemon and forget it once it has been reaped. A daemon that
    /// outlives the halt timeout stays tracked in the `Stopping` state.
    pub fn stop_daemon(&mut self, storlet_name: &str) -> Result<String, FactoryError> {
        let record = self
            .workers
            .get_mut(storlet_name)
            .ok_or_else(|| FactoryError::NotFound(storlet_name.to_string()))?;
        let pid = record.child.id();
        let status = record.terminate(self.halt_timeout)?;
        self.workers.remove(storlet_name);
        log::info!("storlet daemon {} stopped, {}", storlet_name, status);
        Ok(format!(
            "Storlet {}, PID = {}, ErrCode = {}",
            storlet_name,
            pid,
            exit_code(status)
        ))
    }

    pub fn daemon_status(&mut self, storlet_name: &str) -> Result<String, FactoryError> {
        let alive = match self.workers.get_mut(storlet_name) {
            Some(record) => record.is_alive(),
            None => return Err(FactoryError::NotRunning(storlet_name.to_string())),
        };
        if alive {
            Ok(format!("The storlet daemon {} seems to be OK", storlet_name))
        } else {
            self.workers.remove(storlet_name);
            Err(FactoryError::NotRunning(storlet_name.to_string()))
        }
    }

    /// Kill every tracked daemon. Failures are logged and reported in the
    /// message, never as an error.
    pub fn stop_all(&mut self) -> String {
        let mut failed = Vec::new();
        for (name, mut record) in self.workers.drain() {
            match record.terminate(self.halt_timeout) {
                Ok(status) => log::info!("storlet daemon {} stopped, {}", name, status),
                Err(err) => {
                    log::error!("{}", err);
                    failed.push(name);
                }
            }
        }
        if failed.is_empty() {
            "OK".to_string()
        } else {
            failed.sort();
            format!("OK, failed to stop: {}", failed.join(", "))
        }
    }

    /// Ask every daemon to halt, wait for each to go away, kill stragglers
    pub fn halt(&mut self) -> String {
        let mut names: Vec<String> = self.workers.keys().cloned().collect();
        names.sort();
        let mut report = Vec::new();
        for name in names {
            let mut record = match self.workers.remove(&name) {
                Some(record) => record,
                None => continue,
            };
            record.state = WorkerState::Stopping;
            let client = SBusClient::new(&record.uds_path).with_timeout(self.halt_timeout);
            if let Err(err) = client.halt() {
                log::warn!("failed to send halt to storlet daemon {}: {}", name, err);
            }
            let outcome = match record.reap(self.halt_timeout) {
                Ok(Some(_)) => "terminated",
                Ok(None) | Err(_) => match record.terminate(self.halt_timeout) {
                    Ok(_) => "killed",
                    Err(err) => {
                        log::error!("{}", err);
                        "still running"
                    }
                },
            };
            report.push(format!("{}: {}", name, outcome));
        }
        if report.is_empty() {
            "OK".to_string()
        } else {
            report.join("; ")
        }
    }
}

impl CommandHandler for DaemonFactory {
    fn handle(&mut self, request: Request) -> CommandResponse {
        match request.command {
            Command::Ping => CommandResponse::success("OK"),
            Command::StartDaemon => self.start_daemon(&request.params).into(),
            Command::StopDaemon => match request.require("storlet_name") {
                Ok(name) => self.stop_daemon(name).into(),
                Err(err) => CommandResponse::failure(err.to_string()),
            },
            Command::DaemonStatus => match request.require("storlet_name") {
                Ok(name) => self.daemon_status(name).into(),
                Err(err) => CommandResponse::failure(err.to_string()),
            },
            Command::StopDaemons => CommandResponse::success(self.stop_all()).and_stop(),
            Command::Halt => CommandResponse::success(self.halt()).and_stop(),
            other => CommandResponse::failure(format!(
                "Command {} is not allowed for this server",
                other
            )),
        }
    }
}

impl Drop for DaemonFactory {
    fn drop(&mut self) {
        if !self.workers.is_empty() {
            log::warn!("factory shutting down with {} daemons left", self.workers.len());
            self.stop_all();
        }
    }
}

fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
        .unwrap_or(-1)
}
