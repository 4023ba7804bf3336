//! The action runner (§4.7): the component that turns a ready `BuildNode` into a terminal
//! result. Ties together the content hasher, action cache, target cache, sandbox, and a
//! target's language handler, and emits the structured events the rest of the build observes.
//!
//! The scheduler owns the graph and dispatch; this crate owns none of it. `ActionRunner::run`
//! takes a node's identity and target, does everything needed to reach a terminal attempt
//! (including internal retry with backoff), and hands back a [`RunOutcome`] the caller applies
//! to its own graph.

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![warn(unused_results)]

pub mod error;
pub mod key;
pub mod retry;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use builder_cache::ActionCache;
use builder_cache::TargetCache;
use builder_core::event::{ActionOutcome, BuildEvent, CacheStatus, EventSink};
use builder_core::model::{
    ActionKey, ActionSpec, CacheEntry, ExecutionMetadata, NodeId, NodeResult, NodeStatus,
    OutputRecord, Target, CACHE_ENTRY_SCHEMA_VERSION,
};
use builder_core::traits::{DiscoveryMetadata, HandlerContext, LanguageHandler};
use builder_hash::ContentHasher;
use builder_sandbox::{Sandbox, SandboxBackend, SandboxSpec};

pub use error::{Result, RunnerError};
pub use key::compute_action_key;
pub use retry::{FailureKind, RetryPolicy};

/// What the runner decided for one node, terminal for this dispatch.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    /// Terminal status: one of `Success`, `Cached`, or `Failed`.
    pub status: NodeStatus,
    /// Result payload for `BuildSummary` reporting.
    pub result: NodeResult,
    /// The action spec this node ran under, for the caller to store back onto the node.
    pub action_spec: Option<ActionSpec>,
    /// Discovery metadata surfaced by the target's handler, if any, for the caller to apply
    /// via `BuildGraph::extend`.
    pub discovery: Option<DiscoveryMetadata>,
}

struct AttemptSuccess {
    status: NodeStatus,
    result: NodeResult,
    cache_status: CacheStatus,
}

struct AttemptFailure {
    kind: FailureKind,
    exit_code: Option<i32>,
    message: String,
    action_key: Option<ActionKey>,
}

/// Ties the content hasher, action cache, target cache, and sandbox together to execute one
/// node's action, including cache short-circuits and bounded retry.
pub struct ActionRunner {
    hasher: Arc<ContentHasher>,
    cache: Arc<ActionCache>,
    target_cache: Mutex<TargetCache>,
    handlers: HashMap<String, Box<dyn LanguageHandler>>,
    context: HandlerContext,
    workspace_root: PathBuf,
    sandbox_base: PathBuf,
    retry: RetryPolicy,
    sink: Arc<dyn EventSink>,
    backend_override: Option<SandboxBackend>,
}

impl ActionRunner {
    /// Builds a runner with no language handlers registered; call [`ActionRunner::register_handler`]
    /// for each language tag the workspace uses before dispatching any node.
    pub fn new(
        hasher: Arc<ContentHasher>,
        cache: Arc<ActionCache>,
        context: HandlerContext,
        workspace_root: PathBuf,
        sandbox_base: PathBuf,
        retry: RetryPolicy,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        ActionRunner {
            hasher,
            cache,
            target_cache: Mutex::new(TargetCache::new()),
            handlers: HashMap::new(),
            context,
            workspace_root,
            sandbox_base,
            retry,
            sink,
            backend_override: None,
        }
    }

    /// Registers a handler for `language`, replacing any previous registration for that tag.
    pub fn register_handler(&mut self, language: impl Into<String>, handler: Box<dyn LanguageHandler>) {
        let _ = self.handlers.insert(language.into(), handler);
    }

    /// Pins every sandbox this runner prepares to `backend`, bypassing auto-detection. Used by
    /// tests and by environments (e.g. CI containers without namespace privileges) that need a
    /// portable backend.
    pub fn with_backend_override(mut self, backend: SandboxBackend) -> Self {
        self.backend_override = Some(backend);
        self
    }

    /// Runs `node_id`'s action to a terminal outcome, retrying internally per policy.
    ///
    /// `existing_spec` is `Some` when the node already carries an `ActionSpec` (a prior attempt,
    /// or a spec assigned ahead of time for a target that fans out into several actions);
    /// otherwise the target's handler derives one. A target whose handler yields more than one
    /// action is expected to already have one `BuildNode` per action with its spec pre-assigned
    /// — this runner only calls `build_spec` for the common one-action-per-target case.
    pub fn run(
        &self,
        node_id: NodeId,
        target: &Target,
        existing_spec: Option<&ActionSpec>,
    ) -> RunOutcome {
        let handler = match self.handlers.get(&target.language) {
            Some(h) => h,
            None => {
                return RunOutcome {
                    status: NodeStatus::Failed,
                    result: NodeResult {
                        action_key: None,
                        from_cache: false,
                        exit_code: None,
                        error: Some(RunnerError::MissingHandler(target.language.clone()).to_string()),
                    },
                    action_spec: None,
                    discovery: None,
                };
            }
        };

        let spec = match existing_spec {
            Some(s) => s.clone(),
            None => match handler.build_spec(target, &self.context).into_iter().next() {
                Some(s) => s,
                None => {
                    return RunOutcome {
                        status: NodeStatus::Failed,
                        result: NodeResult {
                            action_key: None,
                            from_cache: false,
                            exit_code: None,
                            error: Some(RunnerError::EmptyActionSpec(target.id.to_string()).to_string()),
                        },
                        action_spec: None,
                        discovery: None,
                    };
                }
            },
        };

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            self.sink.emit(BuildEvent::ActionStarted {
                node: node_id,
                target: target.id.clone(),
                attempt,
            });
            let start = Instant::now();

            match self.try_once(node_id, &spec) {
                Ok(success) => {
                    self.sink.emit(BuildEvent::ActionCompleted {
                        node: node_id,
                        target: target.id.clone(),
                        status: ActionOutcome::Success,
                        duration: start.elapsed(),
                        cache_status: success.cache_status,
                    });
                    let discovery = if success.status == NodeStatus::Success {
                        handler.discover(target, node_id)
                    } else {
                        None
                    };
                    return RunOutcome {
                        status: success.status,
                        result: success.result,
                        action_spec: Some(spec),
                        discovery,
                    };
                }
                Err(failure) => {
                    self.sink.emit(BuildEvent::ActionCompleted {
                        node: node_id,
                        target: target.id.clone(),
                        status: ActionOutcome::Failure,
                        duration: start.elapsed(),
                        cache_status: CacheStatus::Executed,
                    });

                    if attempt < self.retry.max_attempts && self.retry.should_retry(failure.kind) {
                        let backoff = self.retry.backoff_duration(attempt);
                        tracing::warn!(
                            node = %node_id,
                            attempt,
                            ?backoff,
                            "retrying action after transient failure"
                        );
                        std::thread::sleep(backoff);
                        continue;
                    }

                    return RunOutcome {
                        status: NodeStatus::Failed,
                        result: NodeResult {
                            action_key: failure.action_key,
                            from_cache: false,
                            exit_code: failure.exit_code,
                            error: Some(failure.message),
                        },
                        action_spec: Some(spec),
                        discovery: None,
                    };
                }
            }
        }
    }

    fn try_once(
        &self,
        node_id: NodeId,
        spec: &ActionSpec,
    ) -> std::result::Result<AttemptSuccess, AttemptFailure> {
        let key = compute_action_key(&self.hasher, &self.workspace_root, spec).map_err(|e| {
            AttemptFailure {
                kind: FailureKind::CacheOrIo,
                exit_code: None,
                message: e.to_string(),
                action_key: None,
            }
        })?;

        // Per-node fast path over the target cache: skips the action cache entirely when this
        // exact action was known-good last time and its outputs are still on disk. This keys
        // the target-cache's null-build optimization per action-node rather than aggregating
        // every sibling action-node of a target (see `builder-cache::target`'s `target_key`
        // doc comment) — the graph models one `BuildNode` per action, so a per-node key is the
        // natural granularity here, and any staleness just falls through to `ActionCache::probe`.
        if self.target_cache.lock().is_known_good(key.0) && self.declared_outputs_present(spec) {
            return Ok(AttemptSuccess {
                status: NodeStatus::Cached,
                result: NodeResult {
                    action_key: Some(key),
                    from_cache: true,
                    exit_code: Some(0),
                    error: None,
                },
                cache_status: CacheStatus::Hit,
            });
        }

        match self.cache.probe(key) {
            Ok(Some(entry)) => {
                self.sink.emit(BuildEvent::CacheHit { node: node_id, key });
                match self.cache.materialize(&entry, &self.workspace_root) {
                    Ok(()) => {
                        self.target_cache.lock().mark_known_good(key.0);
                        return Ok(AttemptSuccess {
                            status: NodeStatus::Cached,
                            result: NodeResult {
                                action_key: Some(key),
                                from_cache: true,
                                exit_code: Some(entry.execution_metadata.exit_code),
                                error: None,
                            },
                            cache_status: CacheStatus::Hit,
                        });
                    }
                    Err(err) => {
                        tracing::warn!(%err, node = %node_id, "cache materialize failed, falling through to execution");
                    }
                }
            }
            Ok(None) => {
                self.sink.emit(BuildEvent::CacheMiss { node: node_id, key });
            }
            Err(err) => {
                tracing::warn!(%err, node = %node_id, "cache probe failed, treating as miss");
                self.sink.emit(BuildEvent::CacheMiss { node: node_id, key });
            }
        }

        self.execute_in_sandbox(node_id, spec, key)
    }

    fn declared_outputs_present(&self, spec: &ActionSpec) -> bool {
        spec.declared_outputs
            .iter()
            .all(|p| self.workspace_root.join(p).is_file())
    }

    fn execute_in_sandbox(
        &self,
        node_id: NodeId,
        spec: &ActionSpec,
        key: ActionKey,
    ) -> std::result::Result<AttemptSuccess, AttemptFailure> {
        let sandbox_root = self.sandbox_base.join(format!("{node_id}-{}", key.0.shard_prefix()));
        let sandbox_spec = build_sandbox_spec(spec);

        let sandbox = match self.backend_override {
            Some(backend) => {
                Sandbox::prepare_with_backend(sandbox_spec, sandbox_root.clone(), backend)
            }
            None => Sandbox::prepare(sandbox_spec, sandbox_root.clone()),
        }
        .map_err(|e| AttemptFailure {
            kind: FailureKind::SandboxFatal,
            exit_code: None,
            message: e.to_string(),
            action_key: Some(key),
        })?;

        let exec = sandbox.run().map_err(|e| AttemptFailure {
            kind: classify_sandbox_error(&e),
            exit_code: None,
            message: e.to_string(),
            action_key: Some(key),
        })?;

        if !exec.success() {
            return Err(AttemptFailure {
                kind: FailureKind::ActionFailed(exec.exit_code),
                exit_code: Some(exec.exit_code),
                message: format!(
                    "action exited {}: {}",
                    exec.exit_code,
                    String::from_utf8_lossy(&exec.stderr)
                ),
                action_key: Some(key),
            });
        }

        let (outputs, undeclared) = sandbox.collect_outputs(&self.hasher).map_err(|e| AttemptFailure {
            kind: FailureKind::SandboxFatal,
            exit_code: Some(exec.exit_code),
            message: e.to_string(),
            action_key: Some(key),
        })?;

        if !undeclared.is_empty() {
            self.sink.emit(BuildEvent::SandboxViolation {
                node: node_id,
                description: format!("undeclared outputs written: {:?}", undeclared),
            });
        }

        let work_dir = sandbox_root.join("work");
        let mut output_records = Vec::with_capacity(outputs.len());
        for (relative, (digest, size)) in &outputs {
            output_records.push(OutputRecord {
                relative_path: relative.clone(),
                content_hash: *digest,
                size: *size,
                executable: is_executable(&work_dir.join(relative)),
            });
        }

        let entry = CacheEntry {
            outputs: output_records,
            execution_metadata: ExecutionMetadata {
                wall_time_ms: exec.duration.as_millis() as u64,
                exit_code: exec.exit_code,
                stdout: truncate(&String::from_utf8_lossy(&exec.stdout), 4096),
                stderr: truncate(&String::from_utf8_lossy(&exec.stderr), 4096),
                peak_memory_bytes: exec.peak_memory_bytes,
            },
            success: true,
            schema_version: CACHE_ENTRY_SCHEMA_VERSION,
            last_access_unix: 0,
            hit_count: 0,
        };

        if let Err(err) = self.cache.insert(key, entry, &work_dir) {
            tracing::warn!(%err, node = %node_id, "cache insert failed; build result still succeeds");
        } else {
            self.target_cache.lock().mark_known_good(key.0);
        }

        for (relative, _) in &outputs {
            let dest = self.workspace_root.join(relative);
            if let Some(parent) = dest.parent() {
                let _ = std::fs::create_dir_all(parent);
            }
            let _ = std::fs::copy(work_dir.join(relative), &dest);
        }

        Ok(AttemptSuccess {
            status: NodeStatus::Success,
            result: NodeResult {
                action_key: Some(key),
                from_cache: false,
                exit_code: Some(exec.exit_code),
                error: None,
            },
            cache_status: CacheStatus::Executed,
        })
    }
}

fn build_sandbox_spec(spec: &ActionSpec) -> SandboxSpec {
    let mut sandbox_spec = SandboxSpec::new(spec.command.clone());
    sandbox_spec.ro_inputs = spec.inputs.iter().cloned().collect();
    sandbox_spec.declared_outputs = spec.declared_outputs.iter().cloned().collect();
    sandbox_spec.env = spec.env.clone();
    sandbox_spec.cwd = spec.workdir.clone();
    sandbox_spec
}

fn classify_sandbox_error(err: &builder_sandbox::SandboxError) -> FailureKind {
    match err {
        builder_sandbox::SandboxError::LimitExceeded(_) => FailureKind::SandboxLimitExceeded,
        builder_sandbox::SandboxError::Io(_) => FailureKind::CacheOrIo,
        _ => FailureKind::SandboxFatal,
    }
}

#[cfg(unix)]
fn is_executable(path: &std::path::Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(_path: &std::path::Path) -> bool {
    false
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let mut out: String = s.chars().take(max_chars).collect();
        out.push_str("... [truncated]");
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use builder_core::event::NullEventSink;
    use builder_core::model::{ActionType, TargetId, TargetKind};
    use std::collections::{BTreeMap, BTreeSet};

    struct ShellHandler;

    impl LanguageHandler for ShellHandler {
        fn build_spec(&self, target: &Target, _context: &HandlerContext) -> Vec<ActionSpec> {
            let command = target
                .config
                .get("command")
                .map(|v| match v {
                    builder_core::model::ConfigValue::Scalar(s) => s.clone(),
                    builder_core::model::ConfigValue::List(items) => items.join(" && "),
                })
                .unwrap_or_else(|| "true".to_string());
            vec![ActionSpec {
                target_id: target.id.clone(),
                action_type: ActionType::Codegen,
                sub_id: None,
                command: vec![command],
                workdir: PathBuf::from("."),
                env: BTreeMap::new(),
                inputs: BTreeSet::new(),
                declared_outputs: BTreeSet::from([PathBuf::from("out.txt")]),
                tool_versions: BTreeMap::new(),
            }]
        }

        fn tool_versions(&self, _context: &HandlerContext) -> BTreeMap<String, String> {
            BTreeMap::new()
        }
    }

    fn target(command: &str) -> Target {
        let mut config = BTreeMap::new();
        let _ = config.insert(
            "command".to_string(),
            builder_core::model::ConfigValue::Scalar(format!("echo hi > out.txt && {command}")),
        );
        Target {
            id: TargetId::from("//a:b"),
            kind: TargetKind::Generator,
            language: "shell".to_string(),
            sources: vec![],
            deps: BTreeSet::new(),
            config,
        }
    }

    fn runner(workspace: PathBuf, sandbox_base: PathBuf) -> ActionRunner {
        let cache = Arc::new(ActionCache::open(workspace.join(".cache")).unwrap());
        let mut runner = ActionRunner::new(
            Arc::new(ContentHasher::default()),
            cache,
            HandlerContext {
                workspace_root: workspace.clone(),
                env_allowlist: BTreeMap::new(),
            },
            workspace,
            sandbox_base,
            RetryPolicy::no_retry(),
            Arc::new(NullEventSink),
        )
        .with_backend_override(SandboxBackend::BestEffort);
        runner.register_handler("shell", Box::new(ShellHandler));
        runner
    }

    #[test]
    fn cache_miss_then_cache_hit_on_second_run() {
        let workspace = tempfile::tempdir().unwrap();
        let sandbox_base = tempfile::tempdir().unwrap();
        let r = runner(workspace.path().to_path_buf(), sandbox_base.path().to_path_buf());
        let t = target("true");

        let first = r.run(NodeId(0), &t, None);
        assert_eq!(first.status, NodeStatus::Success);
        assert!(!first.result.from_cache);

        let second = r.run(NodeId(0), &t, first.action_spec.as_ref());
        assert_eq!(second.status, NodeStatus::Cached);
        assert!(second.result.from_cache);
    }

    #[test]
    fn missing_handler_fails_without_executing() {
        let workspace = tempfile::tempdir().unwrap();
        let sandbox_base = tempfile::tempdir().unwrap();
        let r = runner(workspace.path().to_path_buf(), sandbox_base.path().to_path_buf());
        let mut t = target("true");
        t.language = "rust".to_string();

        let outcome = r.run(NodeId(0), &t, None);
        assert_eq!(outcome.status, NodeStatus::Failed);
        assert!(outcome.result.error.unwrap().contains("no language handler"));
    }

    #[test]
    fn nonzero_exit_fails_the_node() {
        let workspace = tempfile::tempdir().unwrap();
        let sandbox_base = tempfile::tempdir().unwrap();
        let r = runner(workspace.path().to_path_buf(), sandbox_base.path().to_path_buf());
        let t = target("exit 1");

        let outcome = r.run(NodeId(0), &t, None);
        assert_eq!(outcome.status, NodeStatus::Failed);
        assert_eq!(outcome.result.exit_code, Some(1));
    }
}
