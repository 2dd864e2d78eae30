use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// Top-level CLI definition for the `cyris` tool.
#[derive(Debug, Parser)]
#[command(
    name = "cyris",
    author = "Cyris Project",
    version,
    about = "Cyber range orchestration over KVM and cloud hosts.",
    long_about = "Cyris materializes declarative training ranges: virtual machines \n\
                  cloned from base images, virtual networks, and post-boot \n\
                  configuration delivered over SSH, tracked in a durable registry."
)]
pub struct Cli {
    /// Durable state root. Defaults to $CYRIS_STATE_ROOT, then ~/.cyris.
    #[arg(
        global = true,
        long = "state-root",
        value_name = "PATH",
        help = "Keep registry, journal, and plans under PATH"
    )]
    pub state_root: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Materialize a range from a description file.
    Create(CreateArgs),
    /// Tear down a range and everything it owns.
    Destroy(DestroyArgs),
    /// Show the recorded state of one range.
    Status(StatusArgs),
    /// List all recorded ranges.
    List(ListArgs),
    /// Sweep orphaned domains and stale residue.
    Cleanup(CleanupArgs),
}

#[derive(Debug, Args)]
pub struct CreateArgs {
    /// Path to the range description (TOML).
    #[arg(short = 'f', long = "file", value_name = "PATH")]
    pub spec: PathBuf,

    /// Render the plan without creating anything.
    #[arg(long)]
    pub plan: bool,

    /// Continue past controller preflight failures.
    #[arg(long)]
    pub force: bool,
}

#[derive(Debug, Args)]
pub struct DestroyArgs {
    /// Identifier of the range to destroy.
    #[arg(value_name = "RANGE_ID")]
    pub range_id: String,

    /// Remove the registry row and range directory after destruction.
    #[arg(long)]
    pub purge: bool,
}

#[derive(Debug, Args)]
pub struct StatusArgs {
    /// Identifier of the range to inspect.
    #[arg(value_name = "RANGE_ID")]
    pub range_id: String,
}

#[derive(Debug, Args)]
pub struct ListArgs {}

#[derive(Debug, Args)]
pub struct CleanupArgs {
    /// Report orphans without destroying them.
    #[arg(long)]
    pub grace: bool,

    /// Walk everything, touch nothing.
    #[arg(long = "dry-run")]
    pub dry_run: bool,
}
