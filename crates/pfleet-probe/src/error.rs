//! Probe errors and their classification

use std::io;

/// How a probe failure should be treated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProbeErrorKind {
    /// Timeout, reset, unreachable: may be retried
    Transient,
    /// Malformed or unexpected reply: definitive
    Protocol,
    /// Call rejected: definitive, never retried
    Credential,
}

impl std::fmt::Display for ProbeErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ProbeErrorKind::Transient => "transient",
            ProbeErrorKind::Protocol => "protocol",
            ProbeErrorKind::Credential => "credential",
        };
        f.write_str(s)
    }
}

/// Probe errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProbeError {
    #[error("Timed out during {0}")]
    Timeout(&'static str),

    #[error("Connection reset by peer")]
    ConnectionReset,

    #[error("Connection refused")]
    ConnectionRefused,

    #[error("Host unreachable: {0}")]
    Unreachable(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Bad magic cookie {0:#010x}")]
    BadMagicCookie(u32),

    #[error("Wrong control message type: expected {expected}, got {found}")]
    WrongMessageType { expected: u16, found: u16 },

    #[error("Short response: expected {expected} bytes, got {got}")]
    ShortResponse { expected: usize, got: usize },

    #[error("Malformed response: {0}")]
    Malformed(String),

    #[error("Call rejected with result code {0}")]
    CallRejected(u8),
}

impl ProbeError {
    /// Classification of this failure
    pub fn kind(&self) -> ProbeErrorKind {
        match self {
            ProbeError::Timeout(_)
            | ProbeError::ConnectionReset
            | ProbeError::ConnectionRefused
            | ProbeError::Unreachable(_)
            | ProbeError::Io(_) => ProbeErrorKind::Transient,
            ProbeError::BadMagicCookie(_)
            | ProbeError::WrongMessageType { .. }
            | ProbeError::ShortResponse { .. }
            | ProbeError::Malformed(_) => ProbeErrorKind::Protocol,
            ProbeError::CallRejected(_) => ProbeErrorKind::Credential,
        }
    }

    /// Only timeouts and resets are retried
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProbeError::Timeout(_) | ProbeError::ConnectionReset)
    }

    /// Map an IO error raised while reading a reply
    pub fn from_read(e: io::Error, expected: usize) -> Self {
        match e.kind() {
            io::ErrorKind::UnexpectedEof => ProbeError::ShortResponse { expected, got: 0 },
            _ => e.into(),
        }
    }
}

impl From<io::Error> for ProbeError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::TimedOut => ProbeError::Timeout("io"),
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => ProbeError::ConnectionReset,
            io::ErrorKind::ConnectionRefused => ProbeError::ConnectionRefused,
            io::ErrorKind::HostUnreachable | io::ErrorKind::NetworkUnreachable => {
                ProbeError::Unreachable(e.to_string())
            }
            io::ErrorKind::UnexpectedEof => ProbeError::ShortResponse {
                expected: 0,
                got: 0,
            },
            _ => ProbeError::Io(e.to_string()),
        }
    }
}
