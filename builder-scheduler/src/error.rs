//! Scheduler error taxonomy (§7).

use builder_graph::GraphError;
use thiserror::Error;

/// Errors the scheduler can raise. Most graph inconsistencies here indicate a bug in the
/// scheduler's own bookkeeping rather than a build-time condition, since every id it touches
/// came from the graph itself moments earlier.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The graph rejected an operation the scheduler issued against its own tracked state.
    #[error(transparent)]
    Graph(#[from] GraphError),
}

/// Result type for scheduler operations.
pub type Result<T> = std::result::Result<T, SchedulerError>;
