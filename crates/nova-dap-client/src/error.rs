use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, DapError>;

#[derive(Debug, Error)]
pub enum DapError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("dap protocol error: {0}")]
    Protocol(String),

    #[error("request `{command}` timed out")]
    Timeout { command: String },

    #[error("request cancelled")]
    Cancelled,

    #[error("debug adapter connection closed")]
    ConnectionClosed,

    #[error("adapter rejected `{command}`: {message}")]
    Adapter { command: String, message: String },
}

impl DapError {
    /// Timeouts and cancellations mean "no result"; they never end a session.
    pub fn is_no_result(&self) -> bool {
        matches!(self, DapError::Timeout { .. } | DapError::Cancelled)
    }
}

/// Failures surfaced by [`crate::DebugSession`] operations.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session has already been started")]
    AlreadyStarted,

    #[error("session is not connected to a debug adapter")]
    NotConnected,

    #[error("session has terminated")]
    Terminated,

    #[error("stack frame belongs to an earlier stop")]
    StaleFrame,

    #[error("failed to connect to debug adapter: {0}")]
    Connect(#[source] DapError),

    #[error("`{command}` failed: {source}")]
    Request {
        command: &'static str,
        #[source]
        source: DapError,
    },
}

impl SessionError {
    pub(crate) fn request(command: &'static str) -> impl FnOnce(DapError) -> SessionError {
        move |source| SessionError::Request { command, source }
    }
}
