//! Runner error taxonomy (§7).

use thiserror::Error;

/// Errors the action runner can raise outside the ordinary "action exited non-zero" path.
#[derive(Debug, Error)]
pub enum RunnerError {
    /// No `LanguageHandler` is registered for the target's language tag.
    #[error("no language handler registered for language {0:?}")]
    MissingHandler(String),

    /// A handler's `build_spec` returned no action for a node that needed one.
    #[error("handler produced no action spec for target {0}")]
    EmptyActionSpec(String),

    #[error(transparent)]
    Sandbox(#[from] builder_sandbox::SandboxError),

    #[error(transparent)]
    Cache(#[from] builder_cache::CacheError),

    #[error(transparent)]
    Hash(#[from] builder_hash::HashError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for runner operations.
pub type Result<T> = std::result::Result<T, RunnerError>;
