//! The CLI's `EventSink`: renders structured build events for a human, styled after the
//! teacher's emoji-headed stage output (`bitzel::main`, `hitzeleiter::commands::build`), while
//! every event also goes through `tracing` for anyone piping output through a log collector.

use builder_core::event::{ActionOutcome, BuildEvent, CacheStatus, EventSink};

/// Prints each event to stdout as it arrives and forwards it to `tracing`.
#[derive(Debug, Default)]
pub struct CliEventSink {
    quiet: bool,
}

impl CliEventSink {
    /// Builds a sink; `quiet` suppresses per-action lines, keeping only the final summary.
    pub fn new(quiet: bool) -> Self {
        CliEventSink { quiet }
    }
}

impl EventSink for CliEventSink {
    fn emit(&self, event: BuildEvent) {
        match event {
            BuildEvent::ActionStarted { node, target, attempt } => {
                tracing::debug!(%node, %target, attempt, "action started");
                if !self.quiet {
                    println!("  \u{1F528} building {target} (attempt {attempt})");
                }
            }
            BuildEvent::ActionCompleted {
                node,
                target,
                status,
                duration,
                cache_status,
            } => {
                tracing::info!(%node, %target, ?status, ?duration, ?cache_status, "action completed");
                if self.quiet {
                    return;
                }
                let icon = match status {
                    ActionOutcome::Success => "\u{2705}",
                    ActionOutcome::Failure => "\u{274C}",
                    ActionOutcome::Skipped => "\u{23ED}\u{FE0F}",
                };
                let source = match cache_status {
                    CacheStatus::Hit => " (cached)",
                    CacheStatus::Executed => "",
                };
                println!("  {icon} {target}{source} [{:.2?}]", duration);
            }
            BuildEvent::CacheHit { node, key } => {
                tracing::debug!(%node, %key, "cache hit");
            }
            BuildEvent::CacheMiss { node, key } => {
                tracing::debug!(%node, %key, "cache miss");
            }
            BuildEvent::SandboxViolation { node, description } => {
                tracing::warn!(%node, %description, "sandbox violation");
                println!("  \u{26A0}\u{FE0F}  sandbox violation on {node}: {description}");
            }
            BuildEvent::GraphExtended {
                discovering_node,
                new_nodes,
                generation,
            } => {
                tracing::info!(%discovering_node, count = new_nodes.len(), generation, "graph extended");
                if !self.quiet {
                    println!(
                        "  \u{1F50D} {discovering_node} discovered {} new node(s) (generation {generation})",
                        new_nodes.len()
                    );
                }
            }
            BuildEvent::BuildSummary(summary) => {
                tracing::info!(?summary, "build summary");
                print_summary(&summary);
            }
        }
    }
}

fn print_summary(summary: &builder_core::event::BuildSummary) {
    println!();
    println!("\u{2554}{}\u{2557}", "\u{2550}".repeat(58));
    println!(
        "\u{2551} {:<56} \u{2551}",
        if summary.is_success() {
            "BUILD SUCCEEDED"
        } else {
            "BUILD FAILED"
        }
    );
    println!("\u{255A}{}\u{255D}", "\u{2550}".repeat(58));
    println!("  succeeded: {}", summary.succeeded);
    println!("  cached:    {}", summary.cached);
    println!("  failed:    {}", summary.failed);
    println!("  skipped:   {}", summary.skipped);
    println!("  wall time: {:.2?}", summary.wall_time);
    println!("  cache hit rate: {:.1}%", summary.cache_hit_rate * 100.0);
    if !summary.root_cause_failures.is_empty() {
        println!("  root-cause failures:");
        for target in &summary.root_cause_failures {
            println!("    - {target}");
        }
    }
    println!();
}
