// Wizard error taxonomy
//
// Every failure the wizard can surface maps to exactly one of these variants.
// Messages must never carry secret material (runner token, wifi passphrase).

use std::path::PathBuf;

/// Exit codes reported by the `setup-tool` binary.
pub mod exit_code {
    pub const OK: i32 = 0;
    pub const FAILED: i32 = 1;
    pub const FATAL: i32 = 2;
    pub const INVALID_INPUT: i32 = 3;
    pub const ENVIRONMENT: i32 = 4;
}

#[derive(Debug, thiserror::Error)]
pub enum WizardError {
    /// Malformed operator input; the same step is prompted again.
    #[error("{0}")]
    Validation(String),

    /// Key endpoint unreachable, timed out or returned an error status.
    #[error("network error: {0}")]
    Network(String),

    /// The fetch succeeded but produced no usable key.
    #[error("no valid SSH keys found for account '{account}'")]
    EmptyResult { account: String },

    /// Atomic commit of a file failed; nothing partial was persisted.
    #[error("failed to write {path:?}: {reason}")]
    Write { path: PathBuf, reason: String },

    /// The rebuild command returned a failure; the previous generation stays active.
    #[error("system rebuild failed (exit_code={exit_code:?})")]
    Apply {
        exit_code: Option<i32>,
        diagnostics: String,
    },

    /// The secret file could not be restricted to its owner.
    #[error("cannot restrict access to {path:?}: {reason}")]
    Permission { path: PathBuf, reason: String },

    /// The requested operation is not allowed in the current wizard state.
    #[error("operation not allowed: {0}")]
    InvalidState(String),
}

impl WizardError {
    pub fn validation(msg: impl Into<String>) -> Self {
        WizardError::Validation(msg.into())
    }

    pub fn write(path: impl Into<PathBuf>, reason: impl std::fmt::Display) -> Self {
        WizardError::Write {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub fn permission(path: impl Into<PathBuf>, reason: impl std::fmt::Display) -> Self {
        WizardError::Permission {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// Fatal errors end the session; everything else can be retried by the operator.
    pub fn is_fatal(&self) -> bool {
        matches!(self, WizardError::Write { .. } | WizardError::Permission { .. })
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            WizardError::Validation(_)
            | WizardError::Network(_)
            | WizardError::EmptyResult { .. } => exit_code::INVALID_INPUT,
            WizardError::Write { .. } | WizardError::Permission { .. } => exit_code::FATAL,
            WizardError::Apply { .. } => exit_code::FAILED,
            WizardError::InvalidState(_) => exit_code::ENVIRONMENT,
        }
    }
}
