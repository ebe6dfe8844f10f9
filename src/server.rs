//! The command loop shared by the daemon factory and worker daemons

use crate::{errors::TransportError, fdio, sbus::SBus};
use std::{fmt, os::unix::io::OwnedFd};
use storlets_protocol::{Command, Params, ProtocolError, SBusFile, ServiceResponse};

/// Result of handling one command
///
/// `continue_loop` is false for the commands that shut an endpoint down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResponse {
    pub status: bool,
    pub message: String,
    pub continue_loop: bool,
}

impl CommandResponse {
    pub fn success<S: Into<String>>(message: S) -> Self {
        CommandResponse {
            status: true,
            message: message.into(),
            continue_loop: true,
        }
    }

    pub fn failure<S: Into<String>>(message: S) -> Self {
        CommandResponse {
            status: false,
            message: message.into(),
            continue_loop: true,
        }
    }

    /// Stop the loop once this response has been delivered
    pub fn and_stop(mut self) -> Self {
        self.continue_loop = false;
        self
    }
}

impl<E: fmt::Display> From<Result<String, E>> for CommandResponse {
    fn from(result: Result<String, E>) -> Self {
        match result {
            Ok(message) => CommandResponse::success(message),
            Err(err) => {
                log::warn!("{}", err);
                CommandResponse::failure(err.to_string())
            }
        }
    }
}

/// A received command, minus its SERVICE_OUT descriptor
#[derive(Debug)]
pub struct Request {
    pub command: Command,
    pub params: Params,
    pub task_id: Option<String>,
    pub files: Vec<SBusFile<OwnedFd>>,
}

impl Request {
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    pub fn require(&self, key: &'static str) -> Result<&str, ProtocolError> {
        self.param(key).ok_or(ProtocolError::MissingParam(key))
    }
}

/// Something that answers commands on a bus endpoint
pub trait CommandHandler {
    fn handle(&mut self, request: Request) -> CommandResponse;
}

/// Serve `handler` until a response asks to stop
///
/// Malformed or undeliverable messages are logged and skipped. An error is
/// only returned when the endpoint itself stops working.
pub fn main_loop<H: CommandHandler>(bus: &SBus, handler: &mut H) -> Result<(), TransportError> {
    loop {
        if !bus.listen(None)? {
            continue;
        }
        let datagram = match bus.receive() {
            Ok(datagram) => datagram,
            Err(err) => {
                log::warn!("failed to receive message on {:?}: {}", bus.path(), err);
                continue;
            }
        };

        let (command, mut files, params, task_id) = datagram.into_parts();
        log::debug!(">{} {:?} task_id={:?}", command, params, task_id);
        let service_out = if command.is_service() && !files.is_empty() {
            Some(files.remove(0).fd)
        } else {
            None
        };

        let response = handler.handle(Request {
            command,
            params: params.unwrap_or_default(),
            task_id,
            files,
        });
        log::debug!("<{} {} {:?}", command, response.status, response.message);

        if let Some(fd) = service_out {
            let line = ServiceResponse {
                status: response.status,
                message: response.message.clone(),
            }
            .to_string();
            if let Err(err) = fdio::write_and_close(fd, line.as_bytes()) {
                log::warn!("failed to reply to {}: {}", command, err);
            }
        }

        if !response.continue_loop {
            log::info!("{} received, leaving command loop", command);
            return Ok(());
        }
    }
}
