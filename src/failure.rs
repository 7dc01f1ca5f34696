//! Structured description of a transfer failure.
//!
//! The engine hands one of these to `update_error` / `update_retry`; the ledger
//! stores its rendered form in the task's `error_message`.

use serde::{Deserialize, Serialize};
use std::error::Error as StdError;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    Network,
    Http(u16),
    Io,
    Timeout,
    Checksum,
    Other,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Network => write!(f, "Network"),
            FailureKind::Http(code) => write!(f, "Http({})", code),
            FailureKind::Io => write!(f, "Io"),
            FailureKind::Timeout => write!(f, "Timeout"),
            FailureKind::Checksum => write!(f, "Checksum"),
            FailureKind::Other => write!(f, "Other"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDescription {
    pub kind: FailureKind,
    pub message: String,
    pub causes: Vec<String>,
}

impl ErrorDescription {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            causes: Vec::new(),
        }
    }

    pub fn with_cause(mut self, cause: impl Into<String>) -> Self {
        self.causes.push(cause.into());
        self
    }

    /// 从任意错误构造，沿 `source()` 收集原因链
    pub fn from_error(kind: FailureKind, err: &(dyn StdError + 'static)) -> Self {
        let mut description = Self::new(kind, err.to_string());
        let mut source = err.source();
        while let Some(cause) = source {
            description.causes.push(cause.to_string());
            source = cause.source();
        }
        description
    }
}

impl fmt::Display for ErrorDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;
        if !self.causes.is_empty() {
            write!(f, " (caused by: {})", self.causes.join("; "))?;
        }
        Ok(())
    }
}

impl From<&std::io::Error> for ErrorDescription {
    fn from(err: &std::io::Error) -> Self {
        let kind = match err.kind() {
            std::io::ErrorKind::TimedOut => FailureKind::Timeout,
            std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::NotConnected => FailureKind::Network,
            _ => FailureKind::Io,
        };
        Self::from_error(kind, err)
    }
}
