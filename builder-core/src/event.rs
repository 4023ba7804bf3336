//! Structured event sink contract (§6 external interfaces).
//!
//! The core never formats for humans; it pushes structured events through an `EventSink`
//! and leaves rendering, telemetry, and log shipping to the consumer (the CLI driver, in
//! this repository).

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::model::{ActionKey, NodeId, TargetId};

/// Whether a completed action was served from cache or actually executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheStatus {
    /// The action ran in a sandbox.
    Executed,
    /// The action was materialized from the local or remote cache.
    Hit,
}

/// Terminal outcome of a completed action, for event-stream consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionOutcome {
    /// The action succeeded.
    Success,
    /// The action failed after exhausting retries.
    Failure,
    /// The action was never dispatched because an upstream dependency failed.
    Skipped,
}

/// A single structured event produced by the execution core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum BuildEvent {
    /// A node's action began executing (or began a cache probe, on the first attempt).
    ActionStarted {
        /// Node whose action started.
        node: NodeId,
        /// Target the node builds.
        target: TargetId,
        /// Which attempt this is, starting at 1.
        attempt: u32,
    },
    /// A node's action reached a terminal outcome for this attempt.
    ActionCompleted {
        /// Node whose action completed.
        node: NodeId,
        /// Target the node builds.
        target: TargetId,
        /// Outcome of this attempt.
        status: ActionOutcome,
        /// Wall-clock duration of the attempt.
        duration: Duration,
        /// Whether this attempt was a cache hit or a real execution.
        cache_status: CacheStatus,
    },
    /// An action cache probe succeeded.
    CacheHit {
        /// Node that hit.
        node: NodeId,
        /// The action key that hit.
        key: ActionKey,
    },
    /// An action cache probe found nothing (or a corrupted entry).
    CacheMiss {
        /// Node that missed.
        node: NodeId,
        /// The action key that missed.
        key: ActionKey,
    },
    /// A sandboxed action attempted something outside its declared I/O contract.
    SandboxViolation {
        /// Node whose sandbox reported the violation.
        node: NodeId,
        /// Human-readable description of what was attempted.
        description: String,
    },
    /// The build graph was dynamically extended by a running action.
    GraphExtended {
        /// Node whose action performed the discovery.
        discovering_node: NodeId,
        /// Newly added node ids.
        new_nodes: Vec<NodeId>,
        /// Graph generation after the extension was applied.
        generation: u64,
    },
    /// Emitted once, at the end of the build.
    BuildSummary(BuildSummary),
}

/// End-of-build report: counts by terminal status, timing, and failure attribution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildSummary {
    /// Nodes that succeeded by actually executing.
    pub succeeded: usize,
    /// Nodes served from cache.
    pub cached: usize,
    /// Nodes that failed.
    pub failed: usize,
    /// Nodes skipped due to an upstream failure.
    pub skipped: usize,
    /// Total wall-clock duration of the build.
    pub wall_time: Duration,
    /// Cache hit rate across all probes, in `[0.0, 1.0]`.
    pub cache_hit_rate: f64,
    /// For each failed chain, the first (root-cause) target that failed.
    pub root_cause_failures: Vec<TargetId>,
}

impl BuildSummary {
    /// Total number of terminal nodes recorded in this summary.
    pub fn total(&self) -> usize {
        self.succeeded + self.cached + self.failed + self.skipped
    }

    /// Whether the build should be reported as an overall success.
    pub fn is_success(&self) -> bool {
        self.failed == 0
    }
}

/// Consumes structured build events. Implementations render, ship telemetry, or export
/// JSON; the core only ever calls `emit`.
pub trait EventSink: Send + Sync {
    /// Receives one event. Must not block the caller for long; implementations that need
    /// to do expensive work should buffer and process asynchronously.
    fn emit(&self, event: BuildEvent);
}

/// An `EventSink` that discards every event; useful as a default/no-op collaborator.
#[derive(Debug, Default)]
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn emit(&self, _event: BuildEvent) {}
}
