use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "droidvisor",
    about = "Supervised control loop for flaky Android devices",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Task definition file (overrides `[task] path` in the config)
    #[arg(long, global = true)]
    pub task: Option<PathBuf>,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Show project configuration
    Config {
        /// Emit machine-readable JSON
        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// Evaluate the task's expected app screen once
    Check,

    /// Run the task's setup steps once and print interpreter stats
    Setup,

    /// Drive the device through episodes of no-op steps
    Run {
        /// Steps per episode
        #[arg(long, default_value = "100")]
        steps: u32,

        /// Number of episodes
        #[arg(long, default_value = "1")]
        episodes: u32,

        /// Append lifecycle events to this JSONL file
        #[arg(long)]
        log: Option<PathBuf>,
    },
}
