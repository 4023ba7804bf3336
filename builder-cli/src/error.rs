//! The CLI's own error type: wraps every collaborator error and maps it to an exit code
//! (§6 "exit-code discipline").

use thiserror::Error;

/// Top-level CLI error.
#[derive(Debug, Error)]
pub enum CliError {
    /// Workspace configuration failed to load or validate.
    #[error(transparent)]
    Config(#[from] builder_core::error::ConfigError),

    /// A target declared a dependency on an id no provider produced.
    #[error("target {0} depends on unknown target {1}")]
    UnknownDependency(String, String),

    /// Two targets declared overlapping output paths.
    #[error(transparent)]
    OverlappingOutputs(#[from] OverlapError),

    /// The static graph (before any dynamic extension) contains a cycle.
    #[error(transparent)]
    Graph(#[from] builder_graph::GraphError),

    /// The action cache could not be opened.
    #[error(transparent)]
    Cache(#[from] builder_cache::CacheError),

    /// The scheduler encountered an internal error while draining the graph.
    #[error(transparent)]
    Scheduler(#[from] builder_scheduler::SchedulerError),

    /// A query referenced a target id not present in the graph.
    #[error("target {0} not found in the build graph")]
    UnknownTarget(String),
}

/// Two targets declared the same output path; surfaced separately from `ConfigError` so the
/// CLI can report both offending target ids and the shared path in one message.
#[derive(Debug, Error)]
#[error("targets {a} and {b} declare overlapping output path {path}")]
pub struct OverlapError {
    /// First offending target id.
    pub a: String,
    /// Second offending target id.
    pub b: String,
    /// The output path both declare.
    pub path: String,
}

impl CliError {
    /// Maps this error to the process exit code it should produce (§6).
    pub fn exit_code(&self) -> i32 {
        match self {
            CliError::Config(_)
            | CliError::UnknownDependency(..)
            | CliError::OverlappingOutputs(_)
            | CliError::Graph(_)
            | CliError::UnknownTarget(_) => 2,
            CliError::Cache(_) | CliError::Scheduler(_) => 3,
        }
    }
}
