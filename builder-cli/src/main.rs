//! `builder`: the CLI driver wiring the content hasher, action cache, build graph, scheduler,
//! and action runner together for one invocation (§4.8).

mod cli;
mod error;
mod graph;
mod handlers;
mod manifest;
mod query;
mod sink;

use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use parking_lot::Mutex;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use builder_cache::ActionCache;
use builder_core::config::WorkspaceConfig;
use builder_core::event::{BuildSummary, EventSink};
use builder_core::model::NodeId;
use builder_core::traits::{HandlerContext, TargetProvider};
use builder_graph::BuildGraph;
use builder_hash::ContentHasher;
use builder_runner::{ActionRunner, RetryPolicy};
use builder_scheduler::{Scheduler, SchedulerConfig};

use cli::{Cli, Command};
use error::CliError;
use handlers::{ShellLanguageHandler, LANGUAGE_TAG};
use manifest::ManifestTargetProvider;
use sink::CliEventSink;

fn init_tracing(directive: &str) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| directive.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.log_filter.as_deref().unwrap_or("builder=info"));

    match run(&cli) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(err.exit_code());
        }
    }
}

fn run(cli: &Cli) -> Result<i32, CliError> {
    let workspace_root = cli
        .workspace
        .canonicalize()
        .unwrap_or_else(|_| cli.workspace.clone());

    let mut config = WorkspaceConfig::load(&workspace_root)?;
    config.keep_going = config.keep_going || cli.keep_going;
    if let Some(filter) = &cli.log_filter {
        config.log_filter = filter.clone();
    }

    let targets = ManifestTargetProvider.load_targets(&workspace_root)?;
    let mut build_graph = graph::build_graph(targets)?;

    match &cli.command {
        Command::Build { targets: selected } => {
            if !selected.is_empty() {
                skip_unselected(&mut build_graph, selected)?;
            }
            let summary = dispatch_build(&workspace_root, &config, build_graph, cli.quiet)?;
            Ok(if summary.is_success() { 0 } else { 1 })
        }
        Command::Query { query, format } => {
            let nodes = query::run(&build_graph, query)?;
            query::render(&build_graph, &nodes, *format);
            Ok(0)
        }
    }
}

/// Marks every node outside the transitive-dependency closure of `selected` as `Skipped`, so
/// the scheduler's `ready_nodes` scan never dispatches them. `BuildGraph` has no node-removal
/// API (by design — nodes only ever gain edges, never lose them, per §4.5's dynamic-discovery
/// model), so selection is expressed as a pre-seeded terminal status rather than a subgraph.
fn skip_unselected(graph: &mut BuildGraph, selected: &[String]) -> Result<(), CliError> {
    let mut keep = HashSet::new();
    let mut queue = VecDeque::new();
    for target in selected {
        let id = graph
            .node_for_target(&builder_core::model::TargetId::from(target.as_str()))
            .ok_or_else(|| CliError::UnknownTarget(target.clone()))?;
        if keep.insert(id) {
            queue.push_back(id);
        }
    }
    while let Some(id) = queue.pop_front() {
        for dep in graph.dependencies(id)? {
            if keep.insert(dep) {
                queue.push_back(dep);
            }
        }
    }

    let all_ids: Vec<NodeId> = graph.nodes().map(|n| n.id).collect();
    for id in all_ids {
        if !keep.contains(&id) {
            graph.mark(id, builder_core::model::NodeStatus::Skipped)?;
        }
    }
    Ok(())
}

fn dispatch_build(
    workspace_root: &Path,
    config: &WorkspaceConfig,
    build_graph: BuildGraph,
    quiet: bool,
) -> Result<BuildSummary, CliError> {
    let cache_dir = resolve_relative(workspace_root, &config.cache_dir);
    let sandbox_base = resolve_relative(workspace_root, &PathBuf::from(".builder-sandbox"));

    let hasher = Arc::new(ContentHasher::default());
    let mut cache = ActionCache::open(cache_dir)?;
    if let Some(url) = &config.remote_cache_url {
        cache = cache.with_remote(Box::new(builder_cache::HttpRemoteCache::new(
            builder_cache::HttpRemoteConfig {
                base_url: url.clone(),
                ..Default::default()
            },
        )));
    }
    let cache = Arc::new(cache);
    let sink: Arc<dyn EventSink> = Arc::new(CliEventSink::new(quiet));

    let context = HandlerContext {
        workspace_root: workspace_root.to_path_buf(),
        env_allowlist: Default::default(),
    };

    let mut runner = ActionRunner::new(
        Arc::clone(&hasher),
        Arc::clone(&cache),
        context,
        workspace_root.to_path_buf(),
        sandbox_base,
        RetryPolicy::from(&config.retry),
        Arc::clone(&sink),
    );
    runner.register_handler(LANGUAGE_TAG, Box::new(ShellLanguageHandler));

    let scheduler = Scheduler::new(
        Arc::new(Mutex::new(build_graph)),
        Arc::new(runner),
        sink,
        SchedulerConfig {
            worker_count: config.worker_count,
            keep_going: config.keep_going,
        },
    );

    Ok(scheduler.run()?)
}

fn resolve_relative(workspace_root: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        workspace_root.join(path)
    }
}
