//! Turns a flat `Vec<Target>` from a `TargetProvider` into a `BuildGraph`, including the
//! output-overlap validation SPEC_FULL's concurrency-model notes place at graph-construction
//! time: two targets that declare the same output path can never run safely in parallel, so
//! it is rejected before a single node is scheduled rather than detected at sandbox-collect
//! time.

use std::collections::HashMap;

use builder_core::model::{ConfigValue, Target, TargetId};
use builder_graph::BuildGraph;

use crate::error::{CliError, OverlapError};
use crate::manifest::OUTPUTS_KEY;

/// Builds a `BuildGraph` from `targets`, adding one node per target and one edge per declared
/// dependency, after checking that no two targets claim the same output path.
pub fn build_graph(targets: Vec<Target>) -> Result<BuildGraph, CliError> {
    check_no_overlapping_outputs(&targets)?;

    let mut graph = BuildGraph::new();
    let mut nodes = HashMap::new();
    let deps: Vec<(TargetId, Vec<TargetId>)> = targets
        .iter()
        .map(|t| (t.id.clone(), t.deps.iter().cloned().collect()))
        .collect();

    for target in targets {
        let id = target.id.clone();
        let node_id = graph.add_node(target);
        let _ = nodes.insert(id, node_id);
    }

    for (target_id, target_deps) in deps {
        let to = nodes[&target_id];
        for dep in target_deps {
            let from = *nodes
                .get(&dep)
                .ok_or_else(|| CliError::UnknownDependency(target_id.0.clone(), dep.0.clone()))?;
            graph.add_edge(from, to)?;
        }
    }

    Ok(graph)
}

fn check_no_overlapping_outputs(targets: &[Target]) -> Result<(), CliError> {
    let mut claimed: HashMap<String, String> = HashMap::new();
    for target in targets {
        let outputs = match target.config.get(OUTPUTS_KEY) {
            Some(ConfigValue::List(items)) => items.clone(),
            Some(ConfigValue::Scalar(s)) => vec![s.clone()],
            None => continue,
        };
        for output in outputs {
            if let Some(owner) = claimed.get(&output) {
                return Err(CliError::OverlappingOutputs(OverlapError {
                    a: owner.clone(),
                    b: target.id.0.clone(),
                    path: output,
                }));
            }
            let _ = claimed.insert(output, target.id.0.clone());
        }
    }
    Ok(())
}
