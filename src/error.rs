//! Error types for the sandbox manager.
//!
//! Uses thiserror for deriving std::error::Error and miette for rich diagnostics.
//!
//! A missing *file* is never an error in this crate: sandbox reads return `None`
//! and listings return an empty page. Missing processes and sandboxes are errors
//! that carry the id that could not be resolved.

use miette::Diagnostic;
use thiserror::Error;

/// Top-level error type for the application.
#[derive(Error, Debug, Diagnostic)]
pub enum Error {
    /// Environment checks failed
    #[error("System requirements check failed")]
    #[diagnostic(code(sbx::system::requirements))]
    SystemRequirements(#[from] SystemRequirementsError),

    /// Sandbox or driver operation failed
    #[error(transparent)]
    #[diagnostic(transparent)]
    Sandbox(#[from] SandboxError),

    /// Manager operation failed
    #[error(transparent)]
    #[diagnostic(transparent)]
    Manager(#[from] ManagerError),

    /// Persisted index failed
    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),

    /// I/O error
    #[error("I/O error: {0}")]
    #[diagnostic(code(sbx::io))]
    Io(#[from] std::io::Error),
}

/// Errors raised by `Sandbox` and `Driver` implementations.
#[derive(Error, Debug, Diagnostic)]
pub enum SandboxError {
    /// No process record exists for the id
    #[error("Process {id} not found")]
    #[diagnostic(code(sbx::sandbox::process_not_found))]
    ProcessNotFound { id: String },

    /// The sandbox has no driver configuration on record
    #[error("Sandbox {id} not created yet")]
    #[diagnostic(
        code(sbx::sandbox::not_created),
        help("Create the sandbox through the manager before loading it")
    )]
    SandboxNotCreated { id: String },

    /// The driver configuration blob could not be interpreted
    #[error("Invalid driver configuration for sandbox {id}: {reason}")]
    #[diagnostic(code(sbx::sandbox::driver_config))]
    InvalidDriverConfig { id: String, reason: String },

    /// Caller supplied an argument the backend cannot use
    #[error("Invalid argument: {reason}")]
    #[diagnostic(code(sbx::sandbox::invalid_argument))]
    InvalidArgument { reason: String },

    /// Host I/O failed
    #[error("Failed to {operation} {target}: {source}")]
    #[diagnostic(code(sbx::sandbox::io))]
    Io {
        operation: &'static str,
        target: String,
        #[source]
        source: std::io::Error,
    },

    /// Backend (helper process or container engine) failed
    #[error("Failed to {operation} {target}: {reason}")]
    #[diagnostic(code(sbx::sandbox::backend))]
    Backend {
        operation: &'static str,
        target: String,
        reason: String,
    },

    /// Waiting for a process exceeded its ceiling
    #[error("Process {id} timed out after {timeout_ms}ms")]
    #[diagnostic(code(sbx::sandbox::timeout))]
    Timeout { id: String, timeout_ms: u64 },

    /// Waiting for a process was cancelled by the caller
    #[error("Wait for process {id} was cancelled")]
    #[diagnostic(code(sbx::sandbox::cancelled))]
    Cancelled { id: String },
}

impl SandboxError {
    /// Wraps an I/O error with the operation and target that failed.
    pub fn io(operation: &'static str, target: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            operation,
            target: target.into(),
            source,
        }
    }

    /// Builds a backend failure with the operation and target that failed.
    pub fn backend(
        operation: &'static str,
        target: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::Backend {
            operation,
            target: target.into(),
            reason: reason.into(),
        }
    }

    /// Builds an invalid-argument error.
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            reason: reason.into(),
        }
    }

    /// Returns true if this is a "process not found" error.
    #[must_use]
    pub fn is_process_not_found(&self) -> bool {
        matches!(self, Self::ProcessNotFound { .. })
    }
}

/// Errors raised by the `Manager`.
#[derive(Error, Debug, Diagnostic)]
pub enum ManagerError {
    /// No persisted record for the id
    #[error("Sandbox {id} not found")]
    #[diagnostic(code(sbx::manager::not_found))]
    NotFound { id: String },

    /// A record with this id already exists
    #[error("Sandbox {id} already exists")]
    #[diagnostic(code(sbx::manager::already_exists))]
    AlreadyExists { id: String },

    /// The record names a driver that is not registered
    #[error("Unknown sandbox driver: {name}")]
    #[diagnostic(
        code(sbx::manager::unknown_driver),
        help("Register the driver with Manager::with_driver or fix the driver name")
    )]
    UnknownDriver { name: String },

    /// No driver was named and no default is configured
    #[error("No sandbox driver specified and no default driver configured")]
    #[diagnostic(code(sbx::manager::no_driver))]
    NoDriver,

    /// The sandbox id cannot be used as an index key
    #[error("Invalid sandbox id {id:?}: {reason}")]
    #[diagnostic(code(sbx::manager::invalid_id))]
    InvalidId { id: String, reason: String },

    /// A driver operation failed for this sandbox
    #[error("Sandbox {id}: {source}")]
    #[diagnostic(code(sbx::manager::driver))]
    Driver {
        id: String,
        #[source]
        source: SandboxError,
    },

    /// The persisted index failed
    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),
}

/// Errors raised by a `SandboxStore`.
#[derive(Error, Debug, Diagnostic)]
pub enum StoreError {
    /// Store I/O failed
    #[error("Sandbox index I/O error: {context}")]
    #[diagnostic(code(sbx::store::io))]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// A stored record could not be decoded or encoded
    #[error("Sandbox index record {key} is corrupt: {reason}")]
    #[diagnostic(code(sbx::store::corrupt))]
    Corrupt { key: String, reason: String },
}

/// Errors related to environment validation at startup.
#[derive(Error, Debug, Diagnostic)]
pub enum SystemRequirementsError {
    /// The helper executable used by the local driver is missing
    #[error("Helper executable not found: {path}")]
    #[diagnostic(
        code(sbx::system::helper_missing),
        help("Pass --helper with the path to the sbx binary")
    )]
    HelperMissing { path: String },

    /// The data directory cannot be written
    #[error("Data directory {path} is not writable")]
    #[diagnostic(code(sbx::system::data_dir))]
    DataDirNotWritable {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The container engine CLI is missing or cannot reach its daemon
    #[error("Container engine {engine} is unavailable: {reason}")]
    #[diagnostic(
        code(sbx::system::engine),
        help("Install the engine CLI and make sure its daemon is running")
    )]
    EngineUnavailable { engine: String, reason: String },
}

/// Result type alias for this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Result type for sandbox and driver operations.
pub type SandboxResult<T> = std::result::Result<T, SandboxError>;

/// Result type for manager operations.
pub type ManagerResult<T> = std::result::Result<T, ManagerError>;

/// Result type for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_process_not_found_names_id() {
        let err = SandboxError::ProcessNotFound {
            id: "proc-1-abc".to_string(),
        };
        assert!(err.to_string().contains("proc-1-abc"));
        assert!(err.is_process_not_found());
    }

    #[test]
    fn test_io_error_names_target_and_cause() {
        let err = SandboxError::io(
            "write file",
            "/tmp/x.txt",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        let msg = err.to_string();
        assert!(msg.contains("write file"));
        assert!(msg.contains("/tmp/x.txt"));
        assert!(msg.contains("denied"));
    }

    #[test]
    fn test_driver_error_attaches_sandbox_id() {
        let err = ManagerError::Driver {
            id: "sb-1".to_string(),
            source: SandboxError::backend("start container", "sandbox-sb-1", "engine down"),
        };
        let msg = err.to_string();
        assert!(msg.contains("sb-1"));
        assert!(msg.contains("engine down"));
    }
}
