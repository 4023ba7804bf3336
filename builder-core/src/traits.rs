//! Trait boundaries to collaborators outside the execution core (§6, §9 "dynamic dispatch
//! on language handler").
//!
//! The core holds a registry of `Box<dyn LanguageHandler>` keyed by language tag; it never
//! matches on concrete handler types.

use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::error::ConfigError;
use crate::model::{ActionSpec, NodeId, Target, TargetId};

/// Consumed boundary: returns the full, normalized target list for a workspace.
///
/// Errors here are DSL parse or semantic problems and are terminal for the build.
pub trait TargetProvider {
    /// Loads every target declared in the workspace rooted at `workspace_root`.
    fn load_targets(&self, workspace_root: &std::path::Path) -> Result<Vec<Target>, ConfigError>;
}

/// A newly discovered set of targets/actions and their edges, emitted by a dynamic
/// action during execution (§4.5).
#[derive(Debug, Clone, Default)]
pub struct DiscoveryMetadata {
    /// Newly discovered targets.
    pub new_targets: Vec<Target>,
    /// `(child, parent)` edges: `child` depends on `parent`. `parent` may be the
    /// discovering node's own target id, or any non-terminal node.
    pub edges: Vec<(TargetId, TargetId)>,
}

/// Per-language build-spec derivation, invoked by the action runner (§4.7 step 2).
///
/// One implementation is registered per language tag; `build_spec` must be a pure
/// function of its inputs so the resulting `ActionSpec` is deterministic.
pub trait LanguageHandler: Send + Sync {
    /// Derives one or more actions from a target. Most targets produce exactly one
    /// action; targets that fan out per-source-file (e.g. a library with N translation
    /// units) may return several.
    fn build_spec(&self, target: &Target, context: &HandlerContext) -> Vec<ActionSpec>;

    /// Tool name to version string, folded into every action key this handler produces.
    fn tool_versions(&self, context: &HandlerContext) -> BTreeMap<String, String>;

    /// Optional dynamic-discovery hook; handlers whose targets never extend the graph
    /// can use the default no-op.
    fn discover(&self, _target: &Target, _discovering_node: NodeId) -> Option<DiscoveryMetadata> {
        None
    }
}

/// Read-only context passed to a `LanguageHandler`, generalized from the ambient
/// environment a handler needs without exposing core internals.
#[derive(Debug, Clone)]
pub struct HandlerContext {
    /// Absolute path to the workspace root.
    pub workspace_root: PathBuf,
    /// Allow-listed environment variables forwarded into every sandbox for this build.
    pub env_allowlist: BTreeMap<String, String>,
}
