use std::fmt;
use std::io;

use buscap_link::LinkError;
use buscap_transport::TransportError;

// Exit code constants aligned with rsfulmen/DDR-0002 semantics.
pub const SUCCESS: i32 = 0;
pub const FAILURE: i32 = 1;
pub const TRANSPORT_ERROR: i32 = 3;
pub const PERMISSION_DENIED: i32 = 50;
pub const DATA_INVALID: i32 = 60;
pub const USAGE: i32 = 64;
pub const TIMEOUT: i32 = 124;
pub const INTERNAL: i32 = 125;
pub const INTERRUPTED: i32 = 130;

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug)]
pub struct CliError {
    pub code: i32,
    pub message: String,
}

impl CliError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

pub fn io_error(context: &str, err: io::Error) -> CliError {
    let code = match err.kind() {
        io::ErrorKind::PermissionDenied => PERMISSION_DENIED,
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TIMEOUT,
        io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused => TRANSPORT_ERROR,
        _ => INTERNAL,
    };
    CliError::new(code, format!("{context}: {err}"))
}

pub fn transport_error(context: &str, err: TransportError) -> CliError {
    match err {
        TransportError::Bind { source, .. }
        | TransportError::Open { source, .. }
        | TransportError::Accept(source)
        | TransportError::Io(source) => io_error(context, source),
        TransportError::PathTooLong { .. } => CliError::new(USAGE, format!("{context}: {err}")),
        TransportError::Poisoned(_) => CliError::new(INTERNAL, format!("{context}: {err}")),
        other => CliError::new(TRANSPORT_ERROR, format!("{context}: {other}")),
    }
}

pub fn link_error(context: &str, err: LinkError) -> CliError {
    match err {
        LinkError::TransportFault(err) => transport_error(context, err),
        LinkError::Artifact { source, .. } => io_error(context, source),
        LinkError::InvalidSelection(_) | LinkError::InvalidConfig(_) => {
            CliError::new(USAGE, format!("{context}: {err}"))
        }
        LinkError::NoTrigger(_) => CliError::new(TIMEOUT, format!("{context}: {err}")),
        LinkError::Cancelled => CliError::new(INTERRUPTED, format!("{context}: {err}")),
        LinkError::CorruptPacket { .. } | LinkError::Frame(_) => {
            CliError::new(DATA_INVALID, format!("{context}: {err}"))
        }
        other => CliError::new(FAILURE, format!("{context}: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_errors_map_to_exit_codes() {
        assert_eq!(
            link_error("x", LinkError::InvalidSelection("none".into())).code,
            USAGE
        );
        assert_eq!(
            link_error("x", LinkError::InvalidConfig("chunk".into())).code,
            USAGE
        );
        assert_eq!(link_error("x", LinkError::Cancelled).code, INTERRUPTED);
        assert_eq!(
            link_error("x", LinkError::NoData { device: 1, attempts: 5 }).code,
            FAILURE
        );
        assert_eq!(
            link_error("x", LinkError::TransportFault(TransportError::Shutdown)).code,
            TRANSPORT_ERROR
        );
    }

    #[test]
    fn missing_socket_is_a_transport_error() {
        let err = io::Error::new(io::ErrorKind::NotFound, "no socket");
        assert_eq!(io_error("connect", err).code, TRANSPORT_ERROR);
    }
}
