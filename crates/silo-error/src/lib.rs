use std::path::PathBuf;

use silo_types::ErrorDesc;
use thiserror::Error;

/// Primary error type for silo operations.
///
/// Structured variants for the common cases, a syscall wrapper for
/// `errno`-class failures, and a compound variant for the liveness-recovery
/// sweep which accumulates sub-errors without aborting.
#[derive(Error, Debug)]
pub enum SiloError {
    // === Shared-memory region errors ===
    /// The main region does not start with the expected magic bytes.
    #[error("shared-memory region has invalid magic")]
    ShmBadMagic,

    /// The main region was created by an incompatible layout version.
    #[error("shared-memory layout version mismatch: found {found}")]
    ShmVersionMismatch { found: u32 },

    /// The main-region header checksum does not match its fields.
    #[error("shared-memory header checksum mismatch")]
    ShmChecksumMismatch,

    /// A region is smaller than its mandatory prefix.
    #[error("shared-memory region too small: {size} bytes")]
    ShmTooSmall { size: usize },

    /// A stored arena offset points outside the current mapping.
    #[error("arena offset {offset} out of bounds (arena size {size})")]
    OffsetOutOfBounds { offset: u64, size: usize },

    // === I/O and system errors ===
    /// File I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An `errno`-class failure from a named syscall.
    #[error("{call} failed: {source}")]
    Sys {
        call: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// Memory or mapping exhaustion.
    #[error("out of memory")]
    NoMemory,

    // === Lookup misses ===
    /// No module with the given name exists in the registry.
    #[error("module not found: {name}")]
    ModuleNotFound { name: String },

    /// No RPC with the given operation path exists.
    #[error("RPC not found: {path}")]
    RpcNotFound { path: String },

    /// No session with the given id exists.
    #[error("session not found: {id}")]
    SessionNotFound { id: u64 },

    /// No connection registered for the given file descriptor.
    #[error("connection not found for fd {fd}")]
    ConnectionNotFound { fd: i32 },

    /// The connection-state record for this process is missing
    /// (perhaps `fork()` was used and the PID has changed).
    #[error("connection state not found (pid {pid})")]
    StaleConnection { pid: u32 },

    /// No event pipe with the given id is registered on the connection.
    #[error("event pipe {id} not found")]
    EvpipeNotFound { id: u32 },

    /// No item exists at the given path.
    #[error("item not found: {path}")]
    ItemNotFound { path: String },

    /// No subscription matching the given key exists.
    #[error("subscription not found: {key}")]
    SubscriptionNotFound { key: String },

    // === Locking ===
    /// A shared lock could not be acquired within the bounded timeout.
    #[error("timeout waiting for {what} lock")]
    LockTimeout { what: &'static str },

    // === Consistency ===
    /// An internal invariant failed; the current operation is aborted.
    #[error("internal error: {0}")]
    Internal(String),

    /// Compound report from the liveness-recovery sweep.
    #[error("recovery completed with {} sub-error(s)", reports.len())]
    Recovery { reports: Vec<String> },

    /// Data failed validation; per-error descriptors attached.
    #[error("validation failed with {} error(s)", errors.len())]
    Validation { errors: Vec<ErrorDesc> },

    // === Lifecycle ===
    /// Repository or region initialization failed.
    #[error("initialization failed: {reason}")]
    InitFailed { reason: String },

    /// Repository directory could not be prepared.
    #[error("cannot prepare repository directory: '{path}'")]
    RepoUnavailable { path: PathBuf },

    /// The requested operation is not supported.
    #[error("unsupported operation")]
    Unsupported,
}

/// Numeric result codes exposed on the response surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ErrorCode {
    /// Successful result.
    Ok = 0,
    /// Memory or mapping exhaustion.
    NoMem = 1,
    /// Lookup miss.
    NotFound = 2,
    /// Operation not supported.
    Unsupported = 3,
    /// Lock acquisition timed out.
    Timeout = 4,
    /// Internal consistency violation.
    Internal = 5,
    /// `errno`-class system failure.
    Sys = 6,
    /// Initialization failed.
    InitFailed = 7,
}

impl SiloError {
    /// Map this error to its numeric result code.
    #[must_use]
    pub const fn error_code(&self) -> ErrorCode {
        match self {
            Self::NoMemory => ErrorCode::NoMem,
            Self::ModuleNotFound { .. }
            | Self::RpcNotFound { .. }
            | Self::SessionNotFound { .. }
            | Self::ConnectionNotFound { .. }
            | Self::StaleConnection { .. }
            | Self::EvpipeNotFound { .. }
            | Self::ItemNotFound { .. }
            | Self::SubscriptionNotFound { .. } => ErrorCode::NotFound,
            Self::Unsupported => ErrorCode::Unsupported,
            Self::LockTimeout { .. } => ErrorCode::Timeout,
            Self::Internal(_)
            | Self::Recovery { .. }
            | Self::Validation { .. }
            | Self::OffsetOutOfBounds { .. } => ErrorCode::Internal,
            Self::Io(_) | Self::Sys { .. } => ErrorCode::Sys,
            Self::ShmBadMagic
            | Self::ShmVersionMismatch { .. }
            | Self::ShmChecksumMismatch
            | Self::ShmTooSmall { .. }
            | Self::InitFailed { .. }
            | Self::RepoUnavailable { .. } => ErrorCode::InitFailed,
        }
    }

    /// Whether this is a transient error that may succeed on retry.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::LockTimeout { .. })
    }

    /// Create an internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Wrap an `errno`-class failure with its syscall name.
    #[must_use]
    pub fn sys(call: &'static str, source: std::io::Error) -> Self {
        Self::Sys { call, source }
    }

    /// Create an initialization failure.
    pub fn init_failed(reason: impl Into<String>) -> Self {
        Self::InitFailed {
            reason: reason.into(),
        }
    }

    /// Create a module-lookup miss.
    pub fn module_not_found(name: impl Into<String>) -> Self {
        Self::ModuleNotFound { name: name.into() }
    }

    /// Create an item-lookup miss.
    pub fn item_not_found(path: impl Into<String>) -> Self {
        Self::ItemNotFound { path: path.into() }
    }
}

/// Result type alias using [`SiloError`].
pub type Result<T> = std::result::Result<T, SiloError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = SiloError::module_not_found("ietf-interfaces");
        assert_eq!(err.to_string(), "module not found: ietf-interfaces");
    }

    #[test]
    fn error_display_sys() {
        let err = SiloError::sys(
            "ftruncate",
            std::io::Error::new(std::io::ErrorKind::Other, "no space"),
        );
        assert_eq!(err.to_string(), "ftruncate failed: no space");
    }

    #[test]
    fn error_code_mapping() {
        assert_eq!(SiloError::NoMemory.error_code(), ErrorCode::NoMem);
        assert_eq!(
            SiloError::module_not_found("m").error_code(),
            ErrorCode::NotFound
        );
        assert_eq!(SiloError::Unsupported.error_code(), ErrorCode::Unsupported);
        assert_eq!(
            SiloError::LockTimeout { what: "main" }.error_code(),
            ErrorCode::Timeout
        );
        assert_eq!(SiloError::internal("bug").error_code(), ErrorCode::Internal);
        assert_eq!(SiloError::ShmBadMagic.error_code(), ErrorCode::InitFailed);
    }

    #[test]
    fn error_code_values() {
        assert_eq!(ErrorCode::Ok as u32, 0);
        assert_eq!(ErrorCode::NoMem as u32, 1);
        assert_eq!(ErrorCode::NotFound as u32, 2);
        assert_eq!(ErrorCode::Unsupported as u32, 3);
        assert_eq!(ErrorCode::Timeout as u32, 4);
        assert_eq!(ErrorCode::Internal as u32, 5);
        assert_eq!(ErrorCode::Sys as u32, 6);
        assert_eq!(ErrorCode::InitFailed as u32, 7);
    }

    #[test]
    fn is_transient() {
        assert!(SiloError::LockTimeout { what: "main" }.is_transient());
        assert!(!SiloError::internal("x").is_transient());
        assert!(!SiloError::Unsupported.is_transient());
    }

    #[test]
    fn io_error_from() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file missing");
        let err: SiloError = io_err.into();
        assert!(matches!(err, SiloError::Io(_)));
        assert_eq!(err.error_code(), ErrorCode::Sys);
    }

    #[test]
    fn recovery_report_display() {
        let err = SiloError::Recovery {
            reports: vec!["a".into(), "b".into()],
        };
        assert_eq!(err.to_string(), "recovery completed with 2 sub-error(s)");
        assert_eq!(err.error_code(), ErrorCode::Internal);
    }

    #[test]
    fn validation_errors_attached() {
        let err = SiloError::Validation {
            errors: vec![ErrorDesc {
                xpath: Some("/m:c/leaf".into()),
                message: "missing mandatory leaf".into(),
            }],
        };
        assert_eq!(err.error_code(), ErrorCode::Internal);
        assert_eq!(err.to_string(), "validation failed with 1 error(s)");
    }
}
