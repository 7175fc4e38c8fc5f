//! The two error kinds the request pipeline can raise, plus the catch-all
//! "uncaught" kind. See spec §7 for the HTTP status / propagation rules.

use thiserror::Error;

/// Every fallible operation in the pipeline core returns one of these three
/// kinds. `User` and `Fatal` carry their own HTTP status; `Uncaught` always
/// maps to 503.
#[derive(Debug, Error)]
pub enum DirpyError {
    /// Malformed query, out-of-range option, forbidden feature, decode
    /// failure, or a path that would escape the configured root. The
    /// client sees `status` and `message` verbatim.
    #[error("{message}")]
    User { message: String, status: u16 },

    /// Local I/O, codec crash, upstream fetch failure, or serialization
    /// failure. The client only ever sees the generic "Fatal Dirpy Error"
    /// body; `message` is for the log line.
    #[error("{message}")]
    Fatal { message: String, status: u16 },

    /// Anything that doesn't fit the two kinds above.
    #[error("{0}")]
    Uncaught(String),
}

impl DirpyError {
    pub fn user(message: impl Into<String>) -> Self {
        DirpyError::User { message: message.into(), status: 400 }
    }

    pub fn user_status(message: impl Into<String>, status: u16) -> Self {
        DirpyError::User { message: message.into(), status }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        DirpyError::Fatal { message: message.into(), status: 500 }
    }

    pub fn fatal_status(message: impl Into<String>, status: u16) -> Self {
        DirpyError::Fatal { message: message.into(), status }
    }

    pub fn uncaught(message: impl Into<String>) -> Self {
        DirpyError::Uncaught(message.into())
    }

    /// HTTP status code to send to the client.
    pub fn status(&self) -> u16 {
        match self {
            DirpyError::User { status, .. } => *status,
            DirpyError::Fatal { status, .. } => *status,
            DirpyError::Uncaught(_) => 503,
        }
    }

    /// Body text to send to the client. Fatal and uncaught errors never
    /// leak their internal message to the caller.
    pub fn client_message(&self) -> String {
        match self {
            DirpyError::User { message, .. } => message.clone(),
            DirpyError::Fatal { .. } => "Fatal Dirpy Error".to_string(),
            DirpyError::Uncaught(_) => "Uncaught Dirpy Error".to_string(),
        }
    }

    /// Message to write to the log, at the level spec §7 assigns each kind.
    pub fn log_message(&self) -> String {
        match self {
            DirpyError::User { message, .. } => message.clone(),
            DirpyError::Fatal { message, .. } => message.clone(),
            DirpyError::Uncaught(message) => message.clone(),
        }
    }
}

pub type Result<T> = std::result::Result<T, DirpyError>;
