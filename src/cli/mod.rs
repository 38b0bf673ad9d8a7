//! # Command Line Interface
//!
//! `relay run workspace.json` executes a collection (or one of its folders)
//! and prints a text or JSON report. Exit codes: 0 when the run completed
//! with no failures, 1 when anything failed or the run was stopped or
//! cancelled, 2 on setup errors.

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::runner::{MAX_ITERATIONS, MIN_ITERATIONS};

#[derive(Debug, Parser)]
#[command(
    name = "relay",
    version,
    about = "Collection runner for API workspaces: layered variables, request scripts, and data-driven iterations."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Enable debug logging (RELAY_LOG / RUST_LOG still override)
    #[arg(long, short, global = true)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run a collection and report the results
    Run(RunArgs),
}

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Path to the workspace JSON document
    pub workspace: String,

    /// Environment to activate for variable resolution
    #[arg(long = "env", short = 'e')]
    pub environment: Option<String>,

    /// Run only the named folder instead of the whole collection
    #[arg(long)]
    pub folder: Option<String>,

    /// Number of iterations over the request list
    #[arg(long, short = 'n', default_value_t = 1, value_parser = clap::value_parser!(u32).range(MIN_ITERATIONS as i64..=MAX_ITERATIONS as i64))]
    pub iterations: u32,

    /// Delay between consecutive requests, in milliseconds
    #[arg(long, default_value_t = 0)]
    pub delay: u64,

    /// Stop the run at the first failed request
    #[arg(long = "stop-on-error")]
    pub stop_on_error: bool,

    /// Data file (JSON array of flat string maps) for data-driven runs
    #[arg(long)]
    pub data: Option<String>,

    /// Write the report to this file in addition to stdout
    #[arg(long)]
    pub report: Option<String>,

    /// Report format
    #[arg(long, value_enum, default_value_t = ReportFormat::Text)]
    pub format: ReportFormat,

    /// Per-request timeout, in milliseconds
    #[arg(long = "request-timeout", default_value_t = 30_000)]
    pub request_timeout: u64,

    /// Per-script timeout, in milliseconds
    #[arg(long = "script-timeout", default_value_t = 5_000)]
    pub script_timeout: u64,

    /// Path of the request history database
    #[arg(long = "history-db", env = "RELAY_HISTORY_DB", default_value = "relay-history.db")]
    pub history_db: String,

    /// Do not record request history
    #[arg(long = "no-history")]
    pub no_history: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ReportFormat {
    Text,
    Json,
}
