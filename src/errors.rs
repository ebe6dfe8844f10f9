//! Error types you might see while talking to a bus endpoint or running a storlet

use std::{path::PathBuf, process::ExitStatus};
use storlets_protocol::ProtocolError;
use thiserror::Error;

/// Errors moving one datagram across a bus endpoint
#[derive(Error, Debug)]
pub enum TransportError {
    /// nothing is listening at the endpoint path
    #[error("bus endpoint not found: {0:?}")]
    EndpointNotFound(PathBuf),

    /// endpoint exists but we may not connect to it
    #[error("permission denied on bus endpoint {0:?}")]
    PermissionDenied(PathBuf),

    /// received bytes are not a valid datagram
    #[error("malformed payload: {0}")]
    MalformedPayload(#[from] ProtocolError),

    /// peer stopped accepting bytes partway through a message
    #[error("partial write")]
    PartialWrite,

    /// peer did not finish the exchange in time
    #[error("timed out")]
    Timeout,

    /// file queue full error
    #[error("file queue full error")]
    FileQueueFull(#[from] fd_queue::QueueFullError),

    /// io error
    #[error("io error: {0}")]
    IOError(#[from] std::io::Error),
}

/// Errors from a service request made by [crate::client::SBusClient]
#[derive(Error, Debug)]
pub enum ClientError {
    /// transport error
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// protocol error
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// no reply arrived in time
    #[error("timed out waiting for a service reply")]
    Timeout,

    /// reply line was not valid utf8
    #[error("service reply is not valid utf8")]
    Utf8Error(#[from] std::string::FromUtf8Error),

    /// io error
    #[error("io error: {0}")]
    IOError(#[from] std::io::Error),
}

/// Errors while supervising storlet daemons
#[derive(Error, Debug)]
pub enum FactoryError {
    /// bad request parameters
    #[error("{0}")]
    Protocol(#[from] ProtocolError),

    /// no launcher for the requested daemon language
    #[error("unsupported daemon language: {0:?}")]
    UnsupportedLanguage(String),

    /// the daemon process could not be started
    #[error("failed to start storlet daemon {name}: {source}")]
    Spawn {
        name: String,
        source: std::io::Error,
    },

    /// the daemon exited while starting up
    #[error("storlet daemon {name} terminated during startup, {status}")]
    DaemonExited { name: String, status: ExitStatus },

    /// the daemon never answered a ping
    #[error("storlet daemon {name} did not answer after {attempts} pings")]
    PingTimeout { name: String, attempts: u32 },

    /// no record for this daemon
    #[error("{0} is not found")]
    NotFound(String),

    /// daemon is recorded but its process is gone
    #[error("No running storlet daemons for {0}")]
    NotRunning(String),

    /// the daemon process outlived its kill
    #[error("storlet daemon {0} did not exit after being killed")]
    ReapTimeout(String),

    /// io error
    #[error("io error: {0}")]
    IOError(#[from] std::io::Error),
}

/// Errors raised by storlet code running inside a worker daemon
#[derive(Error, Debug)]
pub enum StorletError {
    /// the task was cancelled by its caller
    #[error("task cancelled")]
    Cancelled,

    /// output body was written before its metadata
    #[error("output metadata must be set before writing data")]
    MetadataNotSet,

    /// output metadata may only be set once
    #[error("output metadata is already set")]
    MetadataAlreadySet,

    /// storlet reported a failure of its own
    #[error("storlet failed: {0}")]
    Failed(String),

    /// json error
    #[error("json error: {0}")]
    JSON(#[from] serde_json::Error),

    /// io error
    #[error("io error: {0}")]
    IOError(#[from] std::io::Error),
}

/// Errors while driving one invocation against a worker daemon
#[derive(Error, Debug)]
pub enum InvocationError {
    /// a bounded wait expired
    #[error("timed out waiting on the storlet daemon")]
    Timeout,

    /// EXECUTE could not be delivered
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// a service request failed
    #[error("client error: {0}")]
    Client(#[from] ClientError),

    /// datagram could not be built
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// daemon closed the task id channel without sending an id
    #[error("storlet daemon did not assign a task id")]
    NoTaskId,

    /// output metadata is over the size limit
    #[error("output metadata exceeds {0} bytes")]
    MetadataTooLarge(usize),

    /// output metadata is not a json string map
    #[error("invalid output metadata: {0}")]
    InvalidMetadata(#[from] serde_json::Error),

    /// asynchronous task failed during the invocation
    #[error("task join error: {0}")]
    TaskJoinError(#[from] tokio::task::JoinError),

    /// io error
    #[error("io error: {0}")]
    IOError(#[from] std::io::Error),
}

/// Errors from the runtime sandbox controller
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// sandbox did not answer pings in time
    #[error("sandbox for scope {0} is not ready")]
    Timeout(String),

    /// restarting the sandbox failed
    #[error("failed to restart sandbox: {0}")]
    RestartFailed(String),

    /// the storlet daemon could not be brought up
    #[error("storlet {0} is not available")]
    StorletUnavailable(String),

    /// a storlet file the request needs is missing from the host cache
    #[error("{0} is not in the storlet cache")]
    NotCached(String),

    /// the factory refused or failed to stop a daemon
    #[error("failed to stop storlet daemon {0}")]
    StopFailed(String),

    /// client error
    #[error("client error: {0}")]
    Client(#[from] ClientError),

    /// invocation error
    #[error("invocation error: {0}")]
    Invocation(#[from] InvocationError),

    /// configuration error
    #[error("configuration error: {0}")]
    Config(#[from] serde_json::Error),

    /// task join error
    #[error("task join error: {0}")]
    TaskJoinError(#[from] tokio::task::JoinError),

    /// io error
    #[error("io error: {0}")]
    IOError(#[from] std::io::Error),
}
