//! The `query` subcommand: read-only graph introspection, generalizing
//! `convenient_bitbake::query`'s task-query engine into `dependencies`/`reverse-dependencies`/
//! `shortest-path`/kind-filter operations over a `BuildGraph` (§4.8).

use clap::{Subcommand, ValueEnum};

use builder_core::model::{NodeId, TargetId, TargetKind};
use builder_graph::BuildGraph;

use crate::error::CliError;

/// The graph query to run.
#[derive(Debug, Subcommand)]
pub enum QueryCommand {
    /// Direct dependencies of a target.
    Dependencies {
        /// Target id to query, e.g. `//app:main`.
        target: String,
    },
    /// Direct dependents of a target.
    ReverseDependencies {
        /// Target id to query.
        target: String,
    },
    /// The shortest dependency chain from one target to another, if one exists.
    ShortestPath {
        /// Starting target id (the dependency).
        from: String,
        /// Ending target id (the dependent).
        to: String,
    },
    /// Every target of a given kind (`executable`, `library`, `test`, `generator`, `data`).
    Kind {
        /// Target kind to filter on.
        kind: String,
    },
}

/// Rendering for query results.
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
pub enum OutputFormat {
    /// One target id per line.
    #[default]
    Text,
    /// A JSON array of target ids.
    Json,
    /// A GraphViz `digraph` of the result set and the edges between its members.
    Dot,
    /// Bare target ids, no decoration — convenient for piping into another command.
    Label,
}

fn target_kind_from_str(s: &str) -> Result<TargetKind, CliError> {
    match s {
        "executable" => Ok(TargetKind::Executable),
        "library" => Ok(TargetKind::Library),
        "test" => Ok(TargetKind::Test),
        "generator" => Ok(TargetKind::Generator),
        "data" => Ok(TargetKind::Data),
        other => Err(CliError::UnknownTarget(format!("kind '{other}'"))),
    }
}

fn resolve(graph: &BuildGraph, target: &str) -> Result<NodeId, CliError> {
    graph
        .node_for_target(&TargetId::from(target))
        .ok_or_else(|| CliError::UnknownTarget(target.to_string()))
}

/// Runs `command` against `graph`, returning the matching node ids in an unspecified but
/// deterministic order (callers needing a particular order should sort the rendered labels).
pub fn run(graph: &BuildGraph, command: &QueryCommand) -> Result<Vec<NodeId>, CliError> {
    match command {
        QueryCommand::Dependencies { target } => {
            let id = resolve(graph, target)?;
            Ok(graph.dependencies(id)?)
        }
        QueryCommand::ReverseDependencies { target } => {
            let id = resolve(graph, target)?;
            Ok(graph.reverse_dependencies(id)?)
        }
        QueryCommand::ShortestPath { from, to } => {
            let from_id = resolve(graph, from)?;
            let to_id = resolve(graph, to)?;
            Ok(graph.shortest_path(from_id, to_id)?.unwrap_or_default())
        }
        QueryCommand::Kind { kind } => {
            let wanted = target_kind_from_str(kind)?;
            Ok(graph
                .nodes()
                .filter(|n| n.target.kind == wanted)
                .map(|n| n.id)
                .collect())
        }
    }
}

/// Renders `nodes` (as resolved by [`run`]) in `format`.
pub fn render(graph: &BuildGraph, nodes: &[NodeId], format: OutputFormat) {
    let labels: Vec<String> = nodes
        .iter()
        .filter_map(|id| graph.node(*id).ok())
        .map(|n| n.target.id.0.clone())
        .collect();

    match format {
        OutputFormat::Text => {
            if labels.is_empty() {
                println!("(no matching targets)");
            }
            for label in &labels {
                println!("  {label}");
            }
            println!();
            println!("{} target(s)", labels.len());
        }
        OutputFormat::Label => {
            for label in &labels {
                println!("{label}");
            }
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(&labels).unwrap_or_else(|_| "[]".to_string());
            println!("{json}");
        }
        OutputFormat::Dot => {
            println!("digraph targets {{");
            println!("  rankdir=LR;");
            for label in &labels {
                println!("  \"{label}\";");
            }
            for id in nodes {
                let Ok(node) = graph.node(*id) else { continue };
                for dep_id in &node.dependencies {
                    let Ok(dep) = graph.node(*dep_id) else { continue };
                    if nodes.contains(dep_id) {
                        println!("  \"{}\" -> \"{}\";", dep.target.id.0, node.target.id.0);
                    }
                }
            }
            println!("}}");
        }
    }
}
