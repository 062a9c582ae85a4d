//! Error markers that callers downcast to from `anyhow::Error`.
//!
//! Most failures are plain `anyhow` chains with call-site context. These types
//! exist where a caller must classify a failure: configuration problems abort
//! before any remote side effect, commit failures must never be retried, and
//! exhausted retry loops carry the last command output for diagnosis.

use std::fmt;

/// Configuration-class failure: bad profile values or a provider response
/// missing fields we depend on. Never retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError {
    pub message: String,
}

impl ConfigError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "configuration error: {}", self.message)
    }
}

impl std::error::Error for ConfigError {}

/// The temporary transfer directory could not be renamed into the dated tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitError {
    pub from: String,
    pub to: String,
    pub reason: String,
}

impl fmt::Display for CommitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cannot rename temp folder {} to {}: {}",
            self.from, self.to, self.reason
        )
    }
}

impl std::error::Error for CommitError {}

/// A bounded retry loop ran out of attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryExhausted {
    pub label: String,
    pub attempts: u32,
    /// Full diagnostic output of the last attempt (command line and output).
    pub last_output: String,
}

impl fmt::Display for RetryExhausted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} failed after {} attempts\n{}",
            self.label, self.attempts, self.last_output
        )
    }
}

impl std::error::Error for RetryExhausted {}

/// True when `err` (or anything in its chain) is a [`ConfigError`].
pub fn is_config_error(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| cause.is::<ConfigError>())
}

/// True when `err` (or anything in its chain) is a [`CommitError`].
pub fn is_commit_error(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| cause.is::<CommitError>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn config_error_is_found_through_context() {
        let err = Err::<(), _>(ConfigError::new("password is not set"))
            .context("load profile")
            .unwrap_err();
        assert!(is_config_error(&err));
        assert!(!is_commit_error(&err));
        assert!(format!("{err:#}").contains("password is not set"));
    }

    #[test]
    fn retry_exhausted_message_includes_last_output() {
        let err = RetryExhausted {
            label: "mount".to_string(),
            attempts: 3,
            last_output: "sshfs: connection reset".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("after 3 attempts"));
        assert!(msg.contains("connection reset"));
    }
}
