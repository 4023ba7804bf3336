//! Command-line parsing (§4.8), generalizing `bitzel`/`hitzeleiter`'s `clap`-derive CLIs into
//! the execution core's two entry points: `build` and `query`.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::query::{OutputFormat, QueryCommand};

/// Builder: the polyglot monorepo build system's execution core.
#[derive(Debug, Parser)]
#[command(name = "builder", version, about, long_about = None)]
pub struct Cli {
    /// Root of the workspace to build or query.
    #[arg(short, long, global = true, default_value = ".")]
    pub workspace: PathBuf,

    /// Keep building independent branches after a failure instead of stopping at the first one.
    #[arg(long, global = true)]
    pub keep_going: bool,

    /// Suppress per-action progress lines; print only the final summary.
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// `tracing_subscriber::EnvFilter` directive, overriding `builder.toml`/`BUILDER_LOG`.
    #[arg(long, global = true)]
    pub log_filter: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

/// Top-level subcommands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Builds one or more targets, or the whole workspace if none are given.
    Build {
        /// Target ids to build, e.g. `//app:main`. Builds every target if omitted.
        targets: Vec<String>,
    },
    /// Inspects the build graph without running any actions.
    Query {
        #[command(subcommand)]
        query: QueryCommand,

        /// Output rendering.
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
}
