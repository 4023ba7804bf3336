//! End-to-end scenarios wiring the content hasher, action cache, build graph, action
//! runner, and scheduler together the way `builder-cli` does for one real invocation —
//! complementing the per-crate unit tests with the multi-component scenarios a single
//! crate's tests can't exercise on their own (S1, S2, S4, S6).

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;

use builder_cache::ActionCache;
use builder_core::event::NullEventSink;
use builder_core::model::{ActionSpec, ActionType, ConfigValue, NodeId, Target, TargetId, TargetKind};
use builder_core::traits::{DiscoveryMetadata, HandlerContext, LanguageHandler};
use builder_graph::BuildGraph;
use builder_hash::ContentHasher;
use builder_runner::{ActionRunner, RetryPolicy};
use builder_sandbox::SandboxBackend;
use builder_scheduler::{Scheduler, SchedulerConfig};

/// A handler whose action is a plain shell command, reading `command`/`outputs` out of the
/// target's config map the way `builder-cli`'s own `ShellLanguageHandler` does.
struct ShellHandler;

impl LanguageHandler for ShellHandler {
    fn build_spec(&self, target: &Target, context: &HandlerContext) -> Vec<ActionSpec> {
        let command = match target.config.get("command") {
            Some(ConfigValue::Scalar(s)) => s.clone(),
            _ => "true".to_string(),
        };
        let declared_outputs = match target.config.get("outputs") {
            Some(ConfigValue::List(items)) => items.iter().map(PathBuf::from).collect(),
            _ => BTreeSet::new(),
        };
        vec![ActionSpec {
            target_id: target.id.clone(),
            action_type: ActionType::Codegen,
            sub_id: None,
            command: vec![command],
            workdir: context.workspace_root.clone(),
            env: BTreeMap::new(),
            inputs: target.sources.iter().cloned().collect(),
            declared_outputs,
            tool_versions: BTreeMap::new(),
        }]
    }

    fn tool_versions(&self, _context: &HandlerContext) -> BTreeMap<String, String> {
        BTreeMap::new()
    }
}

/// A handler that, once its target succeeds, discovers exactly one child target depending
/// on it — `DiscoveryMetadata` is re-emitted unconditionally, relying on the graph's own
/// `(discovering_node, child)` idempotence (§4.5 rule 2) rather than any state in the
/// handler itself.
struct DiscoveringHandler {
    child: Target,
}

impl LanguageHandler for DiscoveringHandler {
    fn build_spec(&self, target: &Target, context: &HandlerContext) -> Vec<ActionSpec> {
        ShellHandler.build_spec(target, context)
    }

    fn tool_versions(&self, context: &HandlerContext) -> BTreeMap<String, String> {
        ShellHandler.tool_versions(context)
    }

    fn discover(&self, target: &Target, _discovering_node: NodeId) -> Option<DiscoveryMetadata> {
        Some(DiscoveryMetadata {
            new_targets: vec![self.child.clone()],
            edges: vec![(self.child.id.clone(), target.id.clone())],
        })
    }
}

fn shell_target(id: &str, command: &str, outputs: &[&str]) -> Target {
    let mut config = BTreeMap::new();
    let _ = config.insert("command".to_string(), ConfigValue::Scalar(command.to_string()));
    if !outputs.is_empty() {
        let _ = config.insert(
            "outputs".to_string(),
            ConfigValue::List(outputs.iter().map(|s| s.to_string()).collect()),
        );
    }
    Target {
        id: TargetId::from(id),
        kind: TargetKind::Generator,
        language: "shell".to_string(),
        sources: vec![],
        deps: BTreeSet::new(),
        config,
    }
}

/// Builds a fresh scheduler wired against `cache_dir` (which may already hold persisted
/// entries from a prior call, simulating a second build invocation) and `graph`.
fn build_scheduler(
    workspace_root: &std::path::Path,
    cache_dir: &std::path::Path,
    sandbox_root: &std::path::Path,
    graph: BuildGraph,
    handlers: Vec<(&str, Box<dyn LanguageHandler>)>,
) -> Scheduler {
    let cache = Arc::new(ActionCache::open(cache_dir.to_path_buf()).unwrap());
    let mut runner = ActionRunner::new(
        Arc::new(ContentHasher::default()),
        cache,
        HandlerContext {
            workspace_root: workspace_root.to_path_buf(),
            env_allowlist: BTreeMap::new(),
        },
        workspace_root.to_path_buf(),
        sandbox_root.to_path_buf(),
        RetryPolicy::no_retry(),
        Arc::new(NullEventSink),
    )
    .with_backend_override(SandboxBackend::BestEffort);
    for (tag, handler) in handlers {
        runner.register_handler(tag, handler);
    }

    Scheduler::new(
        Arc::new(Mutex::new(graph)),
        Arc::new(runner),
        Arc::new(NullEventSink),
        SchedulerConfig {
            worker_count: 2,
            keep_going: false,
        },
    )
}

/// S1 — null build: an unchanged target rebuilt against the same cache directory is served
/// entirely from cache on the second invocation; the action never re-executes.
#[test]
fn s1_null_build_serves_second_invocation_from_cache() {
    let workspace = tempfile::tempdir().unwrap();
    let cache_dir = workspace.path().join(".cache");
    let counter = workspace.path().join("counter.txt");

    let command = format!(
        "c=$(cat {0} 2>/dev/null || echo 0); echo $((c+1)) > {0}; echo built > out.txt",
        counter.display()
    );

    // First build: cold cache, the action must actually execute.
    let mut graph = BuildGraph::new();
    let _ = graph.add_node(shell_target("//:a", &command, &["out.txt"]));
    let sandbox1 = tempfile::tempdir().unwrap();
    let scheduler = build_scheduler(
        workspace.path(),
        &cache_dir,
        sandbox1.path(),
        graph,
        vec![("shell", Box::new(ShellHandler))],
    );
    let summary1 = scheduler.run().unwrap();
    assert_eq!(summary1.succeeded, 1);
    assert_eq!(summary1.cached, 0);
    assert_eq!(std::fs::read_to_string(&counter).unwrap().trim(), "1");

    // Second build: identical target, same cache directory, nothing changed. The runner's
    // cache probe must hit, and the counter file must NOT be touched again.
    let mut graph2 = BuildGraph::new();
    let _ = graph2.add_node(shell_target("//:a", &command, &["out.txt"]));
    let sandbox2 = tempfile::tempdir().unwrap();
    let scheduler2 = build_scheduler(
        workspace.path(),
        &cache_dir,
        sandbox2.path(),
        graph2,
        vec![("shell", Box::new(ShellHandler))],
    );
    let summary2 = scheduler2.run().unwrap();
    assert_eq!(summary2.succeeded, 0);
    assert_eq!(summary2.cached, 1);
    assert_eq!(summary2.cache_hit_rate, 1.0);
    assert_eq!(std::fs::read_to_string(&counter).unwrap().trim(), "1");
}

/// S2 — incremental change: modifying a declared input invalidates the action key, so the
/// next build re-executes and produces a fresh cache entry rather than reusing the stale one.
#[test]
fn s2_changed_input_invalidates_the_cache_entry() {
    let workspace = tempfile::tempdir().unwrap();
    let cache_dir = workspace.path().join(".cache");
    let source = workspace.path().join("src.txt");
    std::fs::write(&source, "v1").unwrap();

    let mut target = shell_target("//:a", "cp src.txt out.txt", &["out.txt"]);
    target.sources = vec![PathBuf::from("src.txt")];

    let mut graph = BuildGraph::new();
    let _ = graph.add_node(target.clone());
    let sandbox1 = tempfile::tempdir().unwrap();
    let scheduler = build_scheduler(
        workspace.path(),
        &cache_dir,
        sandbox1.path(),
        graph,
        vec![("shell", Box::new(ShellHandler))],
    );
    let summary1 = scheduler.run().unwrap();
    assert_eq!(summary1.succeeded, 1);

    // Unchanged rebuild: cache hit.
    let mut graph2 = BuildGraph::new();
    let _ = graph2.add_node(target.clone());
    let sandbox2 = tempfile::tempdir().unwrap();
    let scheduler2 = build_scheduler(
        workspace.path(),
        &cache_dir,
        sandbox2.path(),
        graph2,
        vec![("shell", Box::new(ShellHandler))],
    );
    assert_eq!(scheduler2.run().unwrap().cached, 1);

    // Modify the declared input: the action key changes, so the next build must re-execute.
    std::fs::write(&source, "v2").unwrap();
    let mut graph3 = BuildGraph::new();
    let _ = graph3.add_node(target);
    let sandbox3 = tempfile::tempdir().unwrap();
    let scheduler3 = build_scheduler(
        workspace.path(),
        &cache_dir,
        sandbox3.path(),
        graph3,
        vec![("shell", Box::new(ShellHandler))],
    );
    let summary3 = scheduler3.run().unwrap();
    assert_eq!(summary3.succeeded, 1);
    assert_eq!(summary3.cached, 0);
}

/// S4 — dynamic extension: an action for `P` discovers a child `Q` depending on `P` during
/// the same build. The scheduler must dispatch `Q` once `P` completes, and the whole build
/// succeeds.
#[test]
fn s4_dynamic_discovery_schedules_child_in_same_build() {
    let workspace = tempfile::tempdir().unwrap();
    let cache_dir = workspace.path().join(".cache");
    let child = shell_target("//:q", "true", &[]);

    let mut graph = BuildGraph::new();
    let mut p = shell_target("//:p", "true", &[]);
    p.language = "discover".to_string();
    let _ = graph.add_node(p);

    let sandbox = tempfile::tempdir().unwrap();
    let scheduler = build_scheduler(
        workspace.path(),
        &cache_dir,
        sandbox.path(),
        graph,
        vec![
            ("shell", Box::new(ShellHandler)),
            ("discover", Box::new(DiscoveringHandler { child })),
        ],
    );
    let summary = scheduler.run().unwrap();

    assert!(summary.is_success());
    assert_eq!(summary.succeeded, 2);
}

/// S6 — cache corruption recovery: tampering a blob's bytes in place (filename, and
/// therefore presence, unchanged) is invisible to the cheap existence-only probe path but
/// is caught by an explicit `sweep()`, which drops the corrupt entry so the next build
/// re-executes and repopulates a good one.
#[test]
fn s6_sweep_recovers_from_tampered_blob() {
    let workspace = tempfile::tempdir().unwrap();
    let cache_dir = workspace.path().join(".cache");

    let target = shell_target("//:a", "echo hi > out.txt", &["out.txt"]);

    let mut graph = BuildGraph::new();
    let _ = graph.add_node(target.clone());
    let sandbox1 = tempfile::tempdir().unwrap();
    let scheduler = build_scheduler(
        workspace.path(),
        &cache_dir,
        sandbox1.path(),
        graph,
        vec![("shell", Box::new(ShellHandler))],
    );
    assert_eq!(scheduler.run().unwrap().succeeded, 1);

    // Tamper every blob file in place without changing its name.
    for entry in walkdir::WalkDir::new(cache_dir.join("blobs"))
        .into_iter()
        .filter_map(|e| e.ok())
    {
        if entry.file_type().is_file() {
            std::fs::write(entry.path(), b"corrupted").unwrap();
        }
    }

    let cache = ActionCache::open(cache_dir.clone()).unwrap();
    let hasher = ContentHasher::default();
    let report = cache.sweep(&hasher).unwrap();
    assert_eq!(report.entries_dropped, 1);
    drop(cache);

    // Next build: the corrupt entry is gone, so the action re-executes and produces a good
    // cache entry again.
    let mut graph2 = BuildGraph::new();
    let _ = graph2.add_node(target);
    let sandbox2 = tempfile::tempdir().unwrap();
    let scheduler2 = build_scheduler(
        workspace.path(),
        &cache_dir,
        sandbox2.path(),
        graph2,
        vec![("shell", Box::new(ShellHandler))],
    );
    let summary2 = scheduler2.run().unwrap();
    assert_eq!(summary2.succeeded, 1);
    assert_eq!(summary2.cached, 0);
}
