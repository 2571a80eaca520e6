//! Error taxonomy for the update engine.
//!
//! Every failure surfaced to the operator carries a stable [`ErrorKind`];
//! the bootstrap maps terminal outcomes to process exit codes.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable failure classification, persisted in job records and shown in the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Checksum mismatch in the package before staging is consumed.
    Integrity,
    /// Bootstrap version check failed and no bundled engine was present.
    EngineTooOld,
    /// YAML or schema error in the manifest.
    ManifestParse,
    /// A pre-check returned false; nothing was mutated.
    PrecheckFailed,
    /// An action handler failed.
    ActionFailed,
    /// A post-check returned false after all actions ran.
    PostcheckFailed,
    /// An error occurred while rolling back; host may be inconsistent.
    RollbackFailed,
    /// A non-terminal job was found at startup.
    Interrupted,
    /// Another job is already running in this or another process.
    Busy,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Integrity => "integrity",
            ErrorKind::EngineTooOld => "engine_too_old",
            ErrorKind::ManifestParse => "manifest_parse",
            ErrorKind::PrecheckFailed => "precheck_failed",
            ErrorKind::ActionFailed => "action_failed",
            ErrorKind::PostcheckFailed => "postcheck_failed",
            ErrorKind::RollbackFailed => "rollback_failed",
            ErrorKind::Interrupted => "interrupted",
            ErrorKind::Busy => "busy",
        }
    }
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("package integrity failure: {0}")]
    Integrity(String),

    #[error("engine too old: required {required}, installed {installed}")]
    EngineTooOld { required: String, installed: String },

    #[error("manifest parse error: {0}")]
    ManifestParse(String),

    #[error("pre-check failed: {0}")]
    PrecheckFailed(String),

    #[error("action {index} ({name}) failed: {message}")]
    ActionFailed {
        index: usize,
        name: String,
        message: String,
    },

    #[error("post-check failed: {0}")]
    PostcheckFailed(String),

    #[error("rollback failed: {0}")]
    RollbackFailed(String),

    #[error("interrupted job found: {0}")]
    Interrupted(String),

    #[error("another update job is already running")]
    Busy,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Integrity(_) => ErrorKind::Integrity,
            EngineError::EngineTooOld { .. } => ErrorKind::EngineTooOld,
            EngineError::ManifestParse(_) => ErrorKind::ManifestParse,
            EngineError::PrecheckFailed(_) => ErrorKind::PrecheckFailed,
            EngineError::ActionFailed { .. } => ErrorKind::ActionFailed,
            EngineError::PostcheckFailed(_) => ErrorKind::PostcheckFailed,
            EngineError::RollbackFailed(_) => ErrorKind::RollbackFailed,
            EngineError::Interrupted(_) => ErrorKind::Interrupted,
            EngineError::Busy => ErrorKind::Busy,
            // Raw I/O errors only escape from action execution paths.
            EngineError::Io(_) => ErrorKind::ActionFailed,
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// Process exit codes of the `update-bootstrap` CLI.
pub mod exit {
    pub const SUCCESS: i32 = 0;
    pub const USAGE: i32 = 2;
    pub const ENGINE_TOO_OLD: i32 = 3;
    pub const INTEGRITY: i32 = 4;
    pub const JOB_FAILED: i32 = 5;
    pub const ROLLBACK_FAILED: i32 = 6;
    pub const BUSY: i32 = 7;
}
