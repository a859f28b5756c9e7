//! Command-line interface module.
//!
//! This module defines the CLI structure using Clap, including
//! all commands, arguments, and options.
//!
//! # Commands
//!
//! - `plan`: Diff a description against the current state
//! - `apply`: Apply a description, or a plan saved with `plan --out`
//! - `refresh`: Read every managed instance back from its provider
//! - `graph`: Export the dependency graph
//! - `validate`: Check every instance configuration with its provider
//! - `init`: Create an example configuration file
//!
//! # Example Usage
//!
//! ```bash
//! # Show what would change
//! graphform plan infra.yaml --var region=eu-west-1
//!
//! # Save the plan and apply exactly that plan later
//! graphform plan infra.yaml --out infra.plan.json
//! graphform apply --plan infra.plan.json
//!
//! # Export the graph as Mermaid
//! graphform graph infra.yaml --format mermaid --output graph.md
//! ```

use crate::types::{GraphFormat, ReportFormat};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Graphform - plan and apply resource graphs.
#[derive(Parser, Debug)]
#[command(
    name = "graphform",
    author,
    version,
    about = "Plan and apply declarative resource graphs",
    long_about = "Graphform builds a dependency graph from a resource description, diffs it \
                  against the last known state, and applies the resulting plan with bounded \
                  concurrency."
)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, env = "GRAPHFORM_CONFIG")]
    pub config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Subcommand to run
    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Show the changes needed to reach the description
    #[command(visible_alias = "p")]
    Plan(PlanArgs),

    /// Apply a description or a saved plan
    #[command(visible_alias = "a")]
    Apply(ApplyArgs),

    /// Update the state from the providers
    Refresh(RefreshArgs),

    /// Export the dependency graph
    #[command(visible_alias = "g")]
    Graph(GraphArgs),

    /// Validate a description
    Validate(ValidateArgs),

    /// Create an example configuration file
    Init,
}

/// Options shared by the commands that walk the graph.
#[derive(Args, Debug, Default, Clone)]
pub struct RunArgs {
    /// State file (overrides `state.path`)
    #[arg(short, long, value_name = "FILE")]
    pub state: Option<PathBuf>,

    /// Maximum number of vertices evaluated at once
    #[arg(long, value_name = "N")]
    pub parallelism: Option<usize>,

    /// Do not keep a `.backup` copy of the previous state file
    #[arg(long)]
    pub no_backup: bool,

    /// Write a debug archive of every hook event
    #[arg(long)]
    pub debug: bool,
}

/// Arguments for the plan command.
#[derive(Args, Debug)]
pub struct PlanArgs {
    /// Resource description (YAML)
    #[arg(value_name = "DESCRIPTION")]
    pub description: PathBuf,

    #[command(flatten)]
    pub run: RunArgs,

    /// Variable assignment, repeatable
    #[arg(long = "var", value_name = "KEY=VALUE")]
    pub vars: Vec<String>,

    /// Save the plan for a later `apply --plan`
    #[arg(long, value_name = "FILE")]
    pub out: Option<PathBuf>,

    /// Output format
    #[arg(short, long, default_value = "text", value_enum)]
    pub format: ReportFormat,

    /// Report file path (stdout if not specified)
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Exit with code 2 when the plan has changes
    #[arg(long)]
    pub detailed_exitcode: bool,
}

/// Arguments for the apply command.
#[derive(Args, Debug)]
pub struct ApplyArgs {
    /// Resource description (YAML)
    #[arg(value_name = "DESCRIPTION", required_unless_present = "plan", conflicts_with = "plan")]
    pub description: Option<PathBuf>,

    /// Apply a plan saved with `plan --out`
    #[arg(long, value_name = "FILE")]
    pub plan: Option<PathBuf>,

    #[command(flatten)]
    pub run: RunArgs,

    /// Variable assignment, repeatable
    #[arg(long = "var", value_name = "KEY=VALUE", conflicts_with = "plan")]
    pub vars: Vec<String>,

    /// Output format
    #[arg(short, long, default_value = "text", value_enum)]
    pub format: ReportFormat,

    /// Report file path (stdout if not specified)
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,
}

/// Arguments for the refresh command.
#[derive(Args, Debug)]
pub struct RefreshArgs {
    /// Resource description (YAML)
    #[arg(value_name = "DESCRIPTION")]
    pub description: PathBuf,

    #[command(flatten)]
    pub run: RunArgs,

    /// Variable assignment, repeatable
    #[arg(long = "var", value_name = "KEY=VALUE")]
    pub vars: Vec<String>,
}

/// Arguments for the graph command.
#[derive(Args, Debug)]
pub struct GraphArgs {
    /// Resource description (YAML)
    #[arg(value_name = "DESCRIPTION")]
    pub description: PathBuf,

    /// Build against this state file instead of an empty state
    #[arg(short, long, value_name = "FILE")]
    pub state: Option<PathBuf>,

    /// Variable assignment, repeatable
    #[arg(long = "var", value_name = "KEY=VALUE")]
    pub vars: Vec<String>,

    /// Output format for the graph
    #[arg(short, long, default_value = "dot", value_enum)]
    pub format: GraphFormat,

    /// Output file path (stdout if not specified)
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,
}

/// Arguments for the validate command.
#[derive(Args, Debug)]
pub struct ValidateArgs {
    /// Resource description (YAML)
    #[arg(value_name = "DESCRIPTION")]
    pub description: PathBuf,

    /// Variable assignment, repeatable
    #[arg(long = "var", value_name = "KEY=VALUE")]
    pub vars: Vec<String>,
}
