use crate::imap::parser::DecodeError;
use crate::tasks::TaskError;
use std::io;
use thiserror::Error;

pub type ImapResult<T> = Result<T, ImapError>;

/// Engine-level errors
#[derive(Error, Debug)]
pub enum ImapError {
    /// IO error (network, file system, etc.)
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Connection error
    #[error("Connection error: {0}")]
    Connection(String),

    /// TLS/SSL error
    #[error("TLS error: {0}")]
    Tls(String),

    /// Timeout error
    #[error("Operation timed out")]
    Timeout,

    /// Malformed server data
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Invalid state for operation
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Argument cannot be expressed on the wire
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Mailbox path not present in the tree
    #[error("Unknown mailbox: {0}")]
    UnknownMailbox(String),

    /// A task finished in the failed state
    #[error("Task failed: {0}")]
    Task(#[from] TaskError),

    /// The engine actor is gone
    #[error("Engine has shut down")]
    EngineClosed,
}

impl ImapError {
    /// Create a new connection error
    pub fn connection<S: Into<String>>(msg: S) -> Self {
        ImapError::Connection(msg.into())
    }

    /// Create a new TLS error
    pub fn tls<S: Into<String>>(msg: S) -> Self {
        ImapError::Tls(msg.into())
    }

    /// Create a new invalid configuration error
    pub fn invalid_config<S: Into<String>>(msg: S) -> Self {
        ImapError::InvalidConfig(msg.into())
    }

    /// Create a new invalid state error
    pub fn invalid_state<S: Into<String>>(msg: S) -> Self {
        ImapError::InvalidState(msg.into())
    }

    /// Create a new invalid argument error
    pub fn invalid_argument<S: Into<String>>(msg: S) -> Self {
        ImapError::InvalidArgument(msg.into())
    }

    /// Create a new unknown mailbox error
    pub fn unknown_mailbox<S: Into<String>>(path: S) -> Self {
        ImapError::UnknownMailbox(path.into())
    }

    /// Check if this is a recoverable error
    pub fn is_recoverable(&self) -> bool {
        match self {
            ImapError::Io(_) => true,
            ImapError::Connection(_) => true,
            ImapError::Timeout => true,
            ImapError::Tls(_) => false,
            ImapError::Decode(_) => true,
            ImapError::InvalidConfig(_) => false,
            ImapError::InvalidState(_) => false,
            ImapError::InvalidArgument(_) => false,
            ImapError::UnknownMailbox(_) => false,
            ImapError::Task(e) => e.is_transient(),
            ImapError::EngineClosed => false,
        }
    }
}
