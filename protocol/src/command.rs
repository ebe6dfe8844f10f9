use crate::ProtocolError;
use std::{fmt, str::FromStr};

/// Commands understood by the factory and worker endpoints
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Halt,
    Execute,
    StartDaemon,
    StopDaemon,
    DaemonStatus,
    StopDaemons,
    Ping,
    Cancel,
    Nop,
}

const ALL: [Command; 9] = [
    Command::Halt,
    Command::Execute,
    Command::StartDaemon,
    Command::StopDaemon,
    Command::DaemonStatus,
    Command::StopDaemons,
    Command::Ping,
    Command::Cancel,
    Command::Nop,
];

impl Command {
    /// Name of the command on the wire
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Halt => "SBUS_CMD_HALT",
            Command::Execute => "SBUS_CMD_EXECUTE",
            Command::StartDaemon => "SBUS_CMD_START_DAEMON",
            Command::StopDaemon => "SBUS_CMD_STOP_DAEMON",
            Command::DaemonStatus => "SBUS_CMD_DAEMON_STATUS",
            Command::StopDaemons => "SBUS_CMD_STOP_DAEMONS",
            Command::Ping => "SBUS_CMD_PING",
            Command::Cancel => "SBUS_CMD_CANCEL",
            Command::Nop => "SBUS_CMD_NOP",
        }
    }

    /// Service commands carry a SERVICE_OUT descriptor first and get a
    /// one-line reply written to it
    pub fn is_service(&self) -> bool {
        !matches!(self, Command::Execute | Command::Nop)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Command {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ALL.iter()
            .find(|command| command.as_str() == s)
            .copied()
            .ok_or_else(|| ProtocolError::UnknownCommand(s.to_string()))
    }
}
