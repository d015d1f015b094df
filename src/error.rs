//! Error taxonomy for provisioning and sandboxed execution.

use cibox_common::error::CommonError;
use thiserror::Error;

/// Process exit codes for each failure class.
pub mod exit_code {
    pub const CONFIGURATION: i32 = 64;
    pub const UNSUPPORTED_EMULATION: i32 = 65;
    pub const BOOTSTRAP: i32 = 66;
    pub const PACKAGE_INSTALL: i32 = 67;
    pub const EXECUTABLE_NOT_FOUND: i32 = 127;
    /// Added to the signal number of a signal-terminated child.
    pub const SIGNAL_BASE: i32 = 128;
}

#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("cannot run {requested} containers on a {host} host: {reason}")]
    UnsupportedEmulation {
        requested: String,
        host: String,
        reason: String,
    },

    #[error("download of {url} failed after {attempts} attempt(s): {details}")]
    Download {
        url: String,
        attempts: u32,
        details: String,
    },

    #[error("integrity check failed for {file}: expected {expected}, got {actual}")]
    Integrity {
        file: String,
        expected: String,
        actual: String,
    },

    #[error("bootstrap failed: {0}")]
    Bootstrap(String),

    #[error("package installation failed during {step} ({status})")]
    PackageInstall { step: String, status: String },

    #[error("executable '{program}' not found inside {root}")]
    ExecutableNotFound { program: String, root: String },

    #[error("sandboxed process terminated by signal {signal} ({name})")]
    AbnormalTermination { signal: i32, name: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Archive(CommonError),
}

impl From<CommonError> for ContainerError {
    fn from(err: CommonError) -> Self {
        match err {
            CommonError::ChecksumMismatch {
                file,
                expected,
                actual,
            } => ContainerError::Integrity {
                file,
                expected,
                actual,
            },
            CommonError::ChecksumMissing { file } => ContainerError::Integrity {
                file,
                expected: "a listed checksum".to_string(),
                actual: "no entry".to_string(),
            },
            other => ContainerError::Archive(other),
        }
    }
}

impl ContainerError {
    pub fn exit_code(&self) -> i32 {
        match self {
            ContainerError::Configuration(_) => exit_code::CONFIGURATION,
            ContainerError::UnsupportedEmulation { .. } => exit_code::UNSUPPORTED_EMULATION,
            ContainerError::Download { .. }
            | ContainerError::Integrity { .. }
            | ContainerError::Bootstrap(_)
            | ContainerError::Io(_)
            | ContainerError::Archive(_) => exit_code::BOOTSTRAP,
            ContainerError::PackageInstall { .. } => exit_code::PACKAGE_INSTALL,
            ContainerError::ExecutableNotFound { .. } => exit_code::EXECUTABLE_NOT_FOUND,
            ContainerError::AbnormalTermination { signal, .. } => exit_code::SIGNAL_BASE + signal,
        }
    }

    /// Caller mistakes are never worth retrying.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            ContainerError::Configuration(_) | ContainerError::ExecutableNotFound { .. }
        )
    }
}
