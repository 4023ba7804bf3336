//! The execution core's data model: targets, actions, cache entries, and graph nodes.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// A 256-bit content digest, rendered as lowercase hex.
///
/// Produced by `builder-hash`, but defined here so every crate in the workspace can name
/// `ActionKey`/output hashes without depending on the hashing implementation.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Digest(pub [u8; 32]);

impl Digest {
    /// Digest of the empty byte string; used as a stable zero-value in key derivation.
    pub const ZERO: Digest = Digest([0u8; 32]);

    /// Parses a 64-character lowercase hex string into a digest.
    pub fn from_hex(s: &str) -> Option<Digest> {
        if s.len() != 64 {
            return None;
        }
        let mut bytes = [0u8; 32];
        for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
            let byte = std::str::from_utf8(chunk).ok()?;
            bytes[i] = u8::from_str_radix(byte, 16).ok()?;
        }
        Some(Digest(bytes))
    }

    /// Renders the digest as a 64-character lowercase hex string.
    pub fn to_hex(&self) -> String {
        let mut s = String::with_capacity(64);
        for byte in &self.0 {
            s.push_str(&format!("{:02x}", byte));
        }
        s
    }

    /// First two hex characters, used as the on-disk shard prefix for blob storage.
    pub fn shard_prefix(&self) -> String {
        format!("{:02x}", self.0[0])
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", &self.to_hex()[..12])
    }
}

/// A workspace-unique target label, e.g. `//path/to/pkg:name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TargetId(pub String);

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TargetId {
    fn from(s: &str) -> Self {
        TargetId(s.to_string())
    }
}

/// What kind of build output a target produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    /// A linked, runnable binary.
    Executable,
    /// A library consumable by other targets.
    Library,
    /// A target whose successful execution is the build artifact.
    Test,
    /// A target whose declared outputs are themselves inputs to later targets (codegen, etc).
    Generator,
    /// A plain data/resource target with no compilation step.
    Data,
}

/// A target as produced by the DSL layer: static, immutable after analysis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    /// Workspace-unique label.
    pub id: TargetId,
    /// Output kind.
    pub kind: TargetKind,
    /// Tag selecting the language handler plug-in.
    pub language: String,
    /// Ordered, repo-relative source file paths.
    pub sources: Vec<PathBuf>,
    /// Target ids this target depends on.
    pub deps: BTreeSet<TargetId>,
    /// Language-specific configuration: scalar or list values only.
    pub config: BTreeMap<String, ConfigValue>,
}

/// A scalar or list configuration value attached to a target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigValue {
    /// A single string scalar.
    Scalar(String),
    /// An ordered list of string scalars.
    List(Vec<String>),
}

/// The kind of action a handler derives from a target.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    /// Compiles one or more sources into an intermediate artifact.
    Compile,
    /// Links intermediate artifacts into a final executable or library.
    Link,
    /// Runs a test binary or test harness.
    Test,
    /// Generates source or data consumed by later actions.
    Codegen,
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ActionType::Compile => "compile",
            ActionType::Link => "link",
            ActionType::Test => "test",
            ActionType::Codegen => "codegen",
        };
        write!(f, "{}", s)
    }
}

/// A single command execution derived from a `Target` by its language handler.
///
/// Immutable once built. The core never mutates an `ActionSpec`; a changed input always
/// produces a new one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionSpec {
    /// The target this action was derived from.
    pub target_id: TargetId,
    /// What kind of action this is.
    pub action_type: ActionType,
    /// Disambiguates multiple actions of the same type from one target (e.g. per-file compile).
    pub sub_id: Option<String>,
    /// Argv vector; `argv[0]` is the program.
    pub command: Vec<String>,
    /// Repo-relative working directory the command runs in.
    pub workdir: PathBuf,
    /// Fully enumerated environment; no ambient inheritance beyond the sandbox's allow-list.
    pub env: BTreeMap<String, String>,
    /// Input file paths the action may read.
    pub inputs: BTreeSet<PathBuf>,
    /// File paths the action is expected to produce.
    pub declared_outputs: BTreeSet<PathBuf>,
    /// Tool name to version string, folded into the action key.
    pub tool_versions: BTreeMap<String, String>,
}

/// Content-hash identity of an action: two actions with the same key are interchangeable.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ActionKey(pub Digest);

impl fmt::Display for ActionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for ActionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ActionKey({:?})", self.0)
    }
}

/// Recorded output of a successful action: where it landed, and its content identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputRecord {
    /// Path relative to the action's workdir.
    pub relative_path: PathBuf,
    /// Content digest of the file.
    pub content_hash: Digest,
    /// File size in bytes.
    pub size: u64,
    /// Whether the executable bit was set when recorded.
    pub executable: bool,
}

/// Bounded execution metadata recorded alongside a cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionMetadata {
    /// Wall-clock duration of the action, in milliseconds.
    pub wall_time_ms: u64,
    /// Process exit code.
    pub exit_code: i32,
    /// Captured stdout, truncated to a bounded size.
    pub stdout: String,
    /// Captured stderr, truncated to a bounded size.
    pub stderr: String,
    /// Peak resident memory in bytes, when available.
    pub peak_memory_bytes: Option<u64>,
}

/// The schema version of the current `CacheEntry` layout.
pub const CACHE_ENTRY_SCHEMA_VERSION: u32 = 1;

/// What the cache stores per `ActionKey`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Declared outputs this action produced.
    pub outputs: Vec<OutputRecord>,
    /// Execution metadata for the run that produced this entry.
    pub execution_metadata: ExecutionMetadata,
    /// Whether the action that produced this entry exited successfully.
    ///
    /// Failed actions are never stored in the positive cache; this field exists for
    /// entries surfaced via `verify`/diagnostics tooling, not for fresh inserts.
    pub success: bool,
    /// Schema version this entry was written under.
    pub schema_version: u32,
    /// Unix timestamp (seconds) of last access, used by the eviction score.
    pub last_access_unix: i64,
    /// Number of times this entry has been served from a probe hit.
    pub hit_count: u64,
}

/// Opaque identifier for a node in the build graph; a stable index into the graph's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub usize);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// Lifecycle state of a `BuildNode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    /// Created, dependencies not yet all satisfied.
    Pending,
    /// All dependencies terminal-success; eligible for dispatch.
    Ready,
    /// Currently executing on a worker.
    Running,
    /// Executed and produced valid outputs.
    Success,
    /// Served entirely from cache, no sandbox invocation required.
    Cached,
    /// Exhausted retries or hit a terminal error.
    Failed,
    /// Never ran because an upstream dependency failed and keep-going was off.
    Skipped,
}

impl NodeStatus {
    /// Whether this status is terminal (the node will never transition again).
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            NodeStatus::Success | NodeStatus::Cached | NodeStatus::Failed | NodeStatus::Skipped
        )
    }

    /// Whether this status counts as "satisfied" for a dependent's readiness check.
    pub fn satisfies_dependents(self) -> bool {
        matches!(self, NodeStatus::Success | NodeStatus::Cached | NodeStatus::Skipped)
    }
}

/// Outcome of a terminal node, carried for `BuildSummary` reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeResult {
    /// Key the node built under, once an `ActionSpec` was derived.
    pub action_key: Option<ActionKey>,
    /// Whether the result came from the cache.
    pub from_cache: bool,
    /// Exit code of the final attempt, if the node ever ran.
    pub exit_code: Option<i32>,
    /// Human-readable error message, set only for `Failed` nodes.
    pub error: Option<String>,
}

/// The graph's stateful entity: a target plus its execution state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildNode {
    /// Identity within the graph's arena.
    pub id: NodeId,
    /// The target this node builds.
    pub target: Target,
    /// Derived action spec, filled in lazily by the language handler.
    pub action_spec: Option<ActionSpec>,
    /// Current lifecycle state.
    pub status: NodeStatus,
    /// Number of execution attempts made so far.
    pub attempt: u32,
    /// Dependency node ids (edges pointing to nodes this one requires).
    pub dependencies: BTreeSet<NodeId>,
    /// Dependent node ids (edges from nodes that require this one).
    pub dependents: BTreeSet<NodeId>,
    /// Populated once the node reaches a terminal status.
    pub result: Option<NodeResult>,
    /// Graph generation this node was last touched at.
    pub generation: u64,
}

impl BuildNode {
    /// Builds a fresh, `Pending` node for the given id/target with no edges yet.
    pub fn new(id: NodeId, target: Target, generation: u64) -> Self {
        BuildNode {
            id,
            target,
            action_spec: None,
            status: NodeStatus::Pending,
            attempt: 0,
            dependencies: BTreeSet::new(),
            dependents: BTreeSet::new(),
            result: None,
            generation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_hex_roundtrip() {
        let mut bytes = [0u8; 32];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = i as u8;
        }
        let d = Digest(bytes);
        let hex = d.to_hex();
        let back = Digest::from_hex(&hex).unwrap();
        assert_eq!(d, back);
    }

    #[test]
    fn digest_from_hex_rejects_wrong_length() {
        assert!(Digest::from_hex("abcd").is_none());
    }

    #[test]
    fn node_status_terminality() {
        assert!(NodeStatus::Success.is_terminal());
        assert!(NodeStatus::Skipped.is_terminal());
        assert!(!NodeStatus::Pending.is_terminal());
        assert!(!NodeStatus::Running.is_terminal());
    }

    #[test]
    fn node_status_satisfies_dependents() {
        assert!(NodeStatus::Cached.satisfies_dependents());
        assert!(!NodeStatus::Failed.satisfies_dependents());
    }
}
