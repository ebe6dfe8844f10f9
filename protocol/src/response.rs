use crate::ProtocolError;
use std::{fmt, str::FromStr};

/// The one-line reply a service command writes to its SERVICE_OUT descriptor
///
/// On the wire this is `ok: <message>` or `fail: <message>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceResponse {
    pub status: bool,
    pub message: String,
}

impl ServiceResponse {
    pub fn ok<S: Into<String>>(message: S) -> Self {
        ServiceResponse {
            status: true,
            message: message.into(),
        }
    }

    pub fn fail<S: Into<String>>(message: S) -> Self {
        ServiceResponse {
            status: false,
            message: message.into(),
        }
    }
}

impl fmt::Display for ServiceResponse {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let status = if self.status { "ok" } else { "fail" };
        write!(f, "{}: {}", status, self.message)
    }
}

impl FromStr for ServiceResponse {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let line = s.trim_end_matches(|c| c == '\n' || c == '\r');
        let malformed = || ProtocolError::MalformedResponse(line.to_string());
        let (status, message) = match line.find(':') {
            Some(index) => (&line[..index], &line[index + 1..]),
            None => return Err(malformed()),
        };
        let status = match status {
            "ok" => true,
            "fail" => false,
            _ => return Err(malformed()),
        };
        let message = message.strip_prefix(' ').unwrap_or(message);
        Ok(ServiceResponse {
            status,
            message: message.to_string(),
        })
    }
}
