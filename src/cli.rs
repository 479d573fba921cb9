use clap::{Parser, Subcommand};
use clap_complete::Shell;

#[derive(Parser)]
#[command(name = "deckhand")]
#[command(version)]
#[command(about = "Declarative single-host provisioning", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Manifest path (default: ./deckhand.toml, then /etc/deckhand/manifest.toml)
    #[arg(short, long, global = true, env = crate::paths::ENV_MANIFEST)]
    pub manifest: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Show what an apply would change, without changing anything
    Plan(PlanArgs),

    /// Converge the host toward the manifest
    Apply(ApplyArgs),

    /// Report per-step convergence state
    Status(StatusArgs),

    /// Show gathered host facts
    Facts(FactsArgs),

    /// Validate or scaffold manifests
    #[command(subcommand)]
    Manifest(ManifestCommand),

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Parser)]
pub struct PlanArgs {
    /// Only plan steps matching "type" or "type.name"
    #[arg(short, long)]
    pub target: Option<String>,

    /// Show unified content diffs for drifted files
    #[arg(short, long)]
    pub diff: bool,
}

#[derive(Parser)]
pub struct ApplyArgs {
    /// Only apply steps matching "type" or "type.name"
    #[arg(short, long)]
    pub target: Option<String>,

    /// Show changes without applying them
    #[arg(short = 'n', long)]
    pub dry_run: bool,

    /// Skip the confirmation prompt
    #[arg(short, long)]
    pub yes: bool,

    /// Parallel jobs for parallel-safe unprivileged steps
    #[arg(short, long, default_value = "4")]
    pub jobs: usize,

    /// Rollback policy on failure: none, stage, or full
    /// (default comes from the manifest [rollback] section)
    #[arg(long)]
    pub rollback: Option<String>,

    /// Shorthand for --rollback none
    #[arg(long, conflicts_with = "rollback")]
    pub no_rollback: bool,
}

#[derive(Parser)]
pub struct StatusArgs {
    /// Only report steps matching "type" or "type.name"
    #[arg(short, long)]
    pub target: Option<String>,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Parser)]
pub struct FactsArgs {
    /// Output as JSON
    #[arg(long)]
    pub json: bool,

    /// Skip the instance metadata service
    #[arg(long)]
    pub local: bool,
}

#[derive(Subcommand)]
pub enum ManifestCommand {
    /// Parse and validate the manifest
    Validate,

    /// Write a starter manifest
    Init {
        /// Application name used throughout the starter
        #[arg(long, default_value = "app")]
        app_name: String,

        /// Where to write the manifest
        #[arg(long, default_value = "deckhand.toml")]
        path: String,

        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },
}
