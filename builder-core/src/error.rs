//! Error taxonomy for the execution core, per the §7 error handling design.

use thiserror::Error;

/// Errors surfaced while loading or validating workspace configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The workspace root does not exist or is not a directory.
    #[error("workspace root {0} does not exist or is not a directory")]
    InvalidWorkspaceRoot(String),

    /// Two targets declared overlapping output paths; the scheduler cannot guarantee
    /// exclusive writes in that case.
    #[error("targets {0} and {1} declare overlapping output path {2}")]
    OverlappingOutputs(String, String, String),

    /// A target names a language tag with no registered handler.
    #[error("no language handler registered for tag {0}")]
    UnknownLanguageHandler(String),

    /// The target provider returned two targets with the same id.
    #[error("duplicate target id {0}")]
    DuplicateTargetId(String),

    /// `builder.toml` exists but failed to parse.
    #[error("failed to parse {path}: {source}")]
    TomlParse {
        /// Path to the offending config file.
        path: String,
        /// Underlying parse error.
        #[source]
        source: toml::de::Error,
    },

    /// An environment variable carried a value of the wrong shape (e.g. non-integer count).
    #[error("environment variable {0} has invalid value {1}")]
    InvalidEnvValue(String, String),

    /// Generic I/O failure while reading configuration.
    #[error("io error reading configuration: {0}")]
    Io(#[from] std::io::Error),
}

/// Top-level error type for failures that abort an entire build invocation.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Configuration was invalid; fatal, exit code 2 per the CLI contract.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A cycle was found in the static or dynamically extended graph.
    #[error("cycle detected involving targets: {0:?}")]
    Cycle(Vec<String>),

    /// A core invariant was violated (e.g. a node reached `Ready` with an unsatisfied
    /// dependency). Indicates a bug in the scheduler or graph, not a user error.
    #[error("internal invariant violated: {0}")]
    InvariantViolated(String),
}
