//! Blocking client for service commands

use crate::{errors::ClientError, fdio, sbus};
use std::{
    path::{Path, PathBuf},
    time::Duration,
};
use storlets_protocol::{Command, Datagram, Params, ServiceResponse, StartDaemonParams};

/// Default bound on one request, covering both send and reply
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

const MAX_REPLY_LEN: usize = 64 * 1024;

/// Sends service commands to one endpoint and reads back the reply line
///
/// Each request opens a fresh pipe, passes its write end as SERVICE_OUT,
/// drops our copy of the write end and reads until the server closes it.
#[derive(Debug, Clone)]
pub struct SBusClient {
    socket_path: PathBuf,
    timeout: Duration,
}

impl SBusClient {
    pub fn new<P: AsRef<Path>>(socket_path: P) -> Self {
        SBusClient {
            socket_path: socket_path.as_ref().to_path_buf(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    fn request(
        &self,
        command: Command,
        params: Option<Params>,
        task_id: Option<String>,
    ) -> Result<ServiceResponse, ClientError> {
        let (read_end, write_end) = fdio::pipe()?;
        let datagram = Datagram::service(command, write_end, params, task_id)?;
        sbus::send_with_timeout(&self.socket_path, &datagram, self.timeout)?;
        drop(datagram);

        let reply = fdio::read_to_end_timeout(read_end, self.timeout, MAX_REPLY_LEN)?
            .ok_or(ClientError::Timeout)?;
        let response: ServiceResponse = String::from_utf8(reply)?.parse()?;
        log::debug!(">{} {:?}", command, response);
        Ok(response)
    }

    pub fn ping(&self) -> Result<ServiceResponse, ClientError> {
        self.request(Command::Ping, None, None)
    }

    pub fn halt(&self) -> Result<ServiceResponse, ClientError> {
        self.request(Command::Halt, None, None)
    }

    pub fn start_daemon(&self, params: &StartDaemonParams) -> Result<ServiceResponse, ClientError> {
        self.request(Command::StartDaemon, Some(params.to_params()), None)
    }

    pub fn stop_daemon(&self, storlet_name: &str) -> Result<ServiceResponse, ClientError> {
        self.request(Command::StopDaemon, Some(storlet_name_param(storlet_name)), None)
    }

    pub fn stop_daemons(&self) -> Result<ServiceResponse, ClientError> {
        self.request(Command::StopDaemons, None, None)
    }

    pub fn daemon_status(&self, storlet_name: &str) -> Result<ServiceResponse, ClientError> {
        self.request(Command::DaemonStatus, Some(storlet_name_param(storlet_name)), None)
    }

    pub fn cancel(&self, task_id: &str) -> Result<ServiceResponse, ClientError> {
        self.request(Command::Cancel, None, Some(task_id.to_string()))
    }
}

fn storlet_name_param(storlet_name: &str) -> Params {
    let mut params = Params::new();
    params.insert("storlet_name".to_string(), storlet_name.to_string());
    params
}
