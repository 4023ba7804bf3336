//! Sandbox error taxonomy (§7: `SandboxError`).

use thiserror::Error;

/// Errors the sandbox contract can raise.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// `I ∩ O` was non-empty at construction time.
    #[error("declared inputs and outputs overlap: {0}")]
    InputOutputOverlap(String),

    /// Creating or entering a namespace failed.
    #[error("failed to create namespace: {0}")]
    NamespaceError(String),

    /// A mount operation (overlay, bind) failed.
    #[error("failed to mount: {0}")]
    MountError(String),

    /// The sandboxed command could not be spawned or exited abnormally.
    #[error("failed to execute command: {0}")]
    ExecutionError(String),

    /// A declared output is missing after the action ran.
    #[error("declared output missing: {0}")]
    MissingOutput(String),

    /// The action wrote outside its declared output set; recorded as a warning unless the
    /// policy treats it as fatal.
    #[error("undeclared output written: {0}")]
    UndeclaredOutputWritten(String),

    /// The action read a path outside its declared input set and the allow-list.
    #[error("undeclared input accessed: {0}")]
    UndeclaredInputAccess(String),

    /// A resource limit (CPU, wall time, memory, FDs) was exceeded; retryable by policy.
    #[error("resource limit exceeded: {0}")]
    LimitExceeded(String),

    /// Re-running a hermetic action produced different output digests.
    #[error("determinism violation: {0}")]
    DeterminismWarning(String),

    /// No OverlayFS (or equivalent layering facility) is available on this kernel.
    #[error("overlay filesystem support unavailable")]
    NoOverlaySupport,

    /// Underlying I/O failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Underlying OS/namespace syscall failure (Linux only).
    #[cfg(target_os = "linux")]
    #[error("nix error: {0}")]
    Nix(#[from] nix::Error),
}

/// Result type for sandbox operations.
pub type Result<T> = std::result::Result<T, SandboxError>;
