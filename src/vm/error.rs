//! Error taxonomy shared by every backend driver and the coordination layer.
//!
//! Driver errors always carry the driver identity and, where a tool was run,
//! its exit code and captured stderr. The selector folds per-driver failures
//! into [`VmError::Exhausted`] once every candidate has been tried.

use serde::Serialize;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, VmError>;

/// Coarse classification used for exit codes and structured results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    Unavailable,
    OperationFailed,
    Conflict,
    PreconditionFailed,
    Timeout,
    ConnectionRefused,
    AuthFailed,
    VmNotRunning,
    PermissionDenied,
    InvalidInput,
    Cancelled,
    Unknown,
}

impl ErrorKind {
    /// Process exit code reported by the CLI for this kind of failure.
    pub fn exit_code(self) -> i32 {
        match self {
            ErrorKind::NotFound => 2,
            ErrorKind::Unavailable => 3,
            ErrorKind::Conflict => 4,
            ErrorKind::PreconditionFailed | ErrorKind::VmNotRunning => 5,
            ErrorKind::Timeout => 6,
            ErrorKind::PermissionDenied => 7,
            ErrorKind::ConnectionRefused | ErrorKind::AuthFailed => 8,
            ErrorKind::Cancelled => 130,
            ErrorKind::InvalidInput => 64,
            ErrorKind::OperationFailed | ErrorKind::Unknown => 1,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::NotFound => "not found",
            ErrorKind::Unavailable => "no backend available",
            ErrorKind::OperationFailed => "operation failed",
            ErrorKind::Conflict => "conflict",
            ErrorKind::PreconditionFailed => "precondition failed",
            ErrorKind::Timeout => "timeout",
            ErrorKind::ConnectionRefused => "connection refused",
            ErrorKind::AuthFailed => "authentication failed",
            ErrorKind::VmNotRunning => "vm not running",
            ErrorKind::PermissionDenied => "permission denied",
            ErrorKind::InvalidInput => "invalid input",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// One failed candidate recorded by the selector.
#[derive(Debug, Clone, Serialize)]
pub struct Attempt {
    pub backend: String,
    pub kind: ErrorKind,
    pub reason: String,
}

impl fmt::Display for Attempt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.backend, self.reason)
    }
}

#[derive(Error, Debug)]
pub enum VmError {
    #[error("[{backend}] vm not found: {name}")]
    NotFound { backend: String, name: String },

    #[error("[{backend}] backend not available: {reason}")]
    Unavailable { backend: String, reason: String },

    #[error("[{backend}] {operation} failed (exit {}): {}", fmt_exit(.exit_code), .stderr.trim())]
    OperationFailed {
        backend: String,
        operation: String,
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("[{backend}] snapshot '{snapshot}' not found on vm '{vm}'")]
    SnapshotNotFound {
        backend: String,
        vm: String,
        snapshot: String,
    },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("snapshot '{snapshot}' of vm '{vm}' has dependent snapshots: {}", .children.join(", "))]
    Dependency {
        vm: String,
        snapshot: String,
        children: Vec<String>,
    },

    #[error("timed out after {}s waiting for {what}", .after.as_secs())]
    Timeout { what: String, after: Duration },

    #[error("ssh connection to {endpoint} refused")]
    ConnectionRefused { endpoint: String },

    #[error("ssh authentication to {endpoint} failed: {detail}")]
    AuthFailed { endpoint: String, detail: String },

    #[error("vm '{0}' is not running")]
    VmNotRunning(String),

    #[error("permission denied: '{action}' requires {required} permissions, current level is {current}")]
    PermissionDenied {
        action: String,
        required: String,
        current: String,
    },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("[{backend}] unrecognised output: {detail}")]
    Unknown { backend: String, detail: String },

    #[error("{operation} '{vm}' failed on every backend: {}", fmt_attempts(.attempts))]
    Exhausted {
        operation: String,
        vm: String,
        attempts: Vec<Attempt>,
    },

    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),
}

fn fmt_exit(code: &Option<i32>) -> String {
    code.map(|c| c.to_string())
        .unwrap_or_else(|| "signal".to_string())
}

fn fmt_attempts(attempts: &[Attempt]) -> String {
    if attempts.is_empty() {
        return "no backend registered".to_string();
    }
    attempts
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl VmError {
    pub fn not_found(backend: &str, name: &str) -> Self {
        VmError::NotFound {
            backend: backend.to_string(),
            name: name.to_string(),
        }
    }

    pub fn unavailable(backend: &str, reason: impl Into<String>) -> Self {
        VmError::Unavailable {
            backend: backend.to_string(),
            reason: reason.into(),
        }
    }

    pub fn failed(backend: &str, operation: &str, exit_code: Option<i32>, stderr: impl Into<String>) -> Self {
        VmError::OperationFailed {
            backend: backend.to_string(),
            operation: operation.to_string(),
            exit_code,
            stderr: stderr.into(),
        }
    }

    pub fn snapshot_not_found(backend: &str, vm: &str, snapshot: &str) -> Self {
        VmError::SnapshotNotFound {
            backend: backend.to_string(),
            vm: vm.to_string(),
            snapshot: snapshot.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            VmError::NotFound { .. } | VmError::SnapshotNotFound { .. } => ErrorKind::NotFound,
            VmError::Unavailable { .. } => ErrorKind::Unavailable,
            VmError::OperationFailed { .. } | VmError::Io(_) => ErrorKind::OperationFailed,
            VmError::Conflict(_) => ErrorKind::Conflict,
            VmError::PreconditionFailed(_) | VmError::Dependency { .. } => {
                ErrorKind::PreconditionFailed
            }
            VmError::Timeout { .. } => ErrorKind::Timeout,
            VmError::ConnectionRefused { .. } => ErrorKind::ConnectionRefused,
            VmError::AuthFailed { .. } => ErrorKind::AuthFailed,
            VmError::VmNotRunning(_) => ErrorKind::VmNotRunning,
            VmError::PermissionDenied { .. } => ErrorKind::PermissionDenied,
            VmError::InvalidInput(_) => ErrorKind::InvalidInput,
            VmError::Cancelled => ErrorKind::Cancelled,
            VmError::Unknown { .. } => ErrorKind::Unknown,
            VmError::Exhausted { attempts, .. } => exhausted_kind(attempts),
        }
    }

    /// Whether the selector may move on to the next candidate driver.
    ///
    /// Only "this backend is absent" and "this VM is not mine" qualify. Every
    /// other failure comes from a driver that recognised the VM and is final.
    pub fn allows_fallback(&self) -> bool {
        matches!(self, VmError::NotFound { .. } | VmError::Unavailable { .. })
    }

    /// Per-driver failures, empty unless this is an aggregate.
    pub fn attempts(&self) -> &[Attempt] {
        match self {
            VmError::Exhausted { attempts, .. } => attempts,
            _ => &[],
        }
    }
}

/// An aggregate is "not found" when at least one live driver said so, and
/// "unavailable" when no driver could even be asked.
fn exhausted_kind(attempts: &[Attempt]) -> ErrorKind {
    if attempts.iter().any(|a| a.kind == ErrorKind::NotFound) {
        ErrorKind::NotFound
    } else if attempts.iter().all(|a| a.kind == ErrorKind::Unavailable) {
        ErrorKind::Unavailable
    } else {
        ErrorKind::OperationFailed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attempt(kind: ErrorKind) -> Attempt {
        Attempt {
            backend: "qemu".into(),
            kind,
            reason: "x".into(),
        }
    }

    #[test]
    fn only_absence_errors_fall_through() {
        assert!(VmError::not_found("libvirt", "a").allows_fallback());
        assert!(VmError::unavailable("libvirt", "no virsh").allows_fallback());
        assert!(!VmError::failed("libvirt", "start", Some(1), "boom").allows_fallback());
        assert!(!VmError::Conflict("dup".into()).allows_fallback());
        assert!(!VmError::PreconditionFailed("running".into()).allows_fallback());
        assert!(!VmError::snapshot_not_found("qemu", "a", "s1").allows_fallback());
    }

    #[test]
    fn exhausted_kind_prefers_not_found() {
        let all_unavailable = vec![attempt(ErrorKind::Unavailable), attempt(ErrorKind::Unavailable)];
        assert_eq!(exhausted_kind(&all_unavailable), ErrorKind::Unavailable);

        let mixed = vec![attempt(ErrorKind::Unavailable), attempt(ErrorKind::NotFound)];
        assert_eq!(exhausted_kind(&mixed), ErrorKind::NotFound);

        assert_eq!(exhausted_kind(&[]), ErrorKind::Unavailable);
    }

    #[test]
    fn operation_failed_message_carries_stderr() {
        let err = VmError::failed("libvirt", "virsh start", Some(1), "error: domain is locked\n");
        let msg = err.to_string();
        assert!(msg.contains("[libvirt]"));
        assert!(msg.contains("exit 1"));
        assert!(msg.ends_with("domain is locked"));
    }

    #[test]
    fn exit_codes_distinguish_failure_classes() {
        assert_ne!(ErrorKind::NotFound.exit_code(), ErrorKind::OperationFailed.exit_code());
        assert_ne!(ErrorKind::NotFound.exit_code(), ErrorKind::Unavailable.exit_code());
        assert_ne!(ErrorKind::Unavailable.exit_code(), ErrorKind::OperationFailed.exit_code());
    }
}
