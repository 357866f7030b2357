use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "scanforge")]
#[command(about = "Batch runner for security CLI tools", long_about = None)]
#[command(version)]
pub struct Cli {
    #[arg(short, long, global = true, help = "Path to the engine config file")]
    pub config: Option<PathBuf>,

    #[arg(
        short,
        long,
        global = true,
        action = clap::ArgAction::Count,
        help = "Increase log verbosity (-v, -vv)"
    )]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create a job and run it to completion
    Run {
        #[arg(short, long = "target", required = true, help = "Target host, domain or URL (repeatable)")]
        targets: Vec<String>,

        #[arg(
            long = "tool",
            required_unless_present = "profile",
            help = "Catalog tool id (repeatable)"
        )]
        tools: Vec<String>,

        #[arg(
            short,
            long,
            help = "Named profile from the catalog, expanded into tool selections"
        )]
        profile: Option<String>,

        #[arg(
            long = "set",
            value_name = "TOOL.PARAM=VALUE",
            help = "Override a tool parameter, e.g. --set nmap_quick.min_rate=2000"
        )]
        params: Vec<String>,

        #[arg(
            long = "extra",
            value_name = "TOOL=ARGS",
            help = "Append extra arguments to one tool's command line"
        )]
        extra: Vec<String>,

        #[arg(short, long, default_value = "scan", help = "Job name")]
        name: String,

        #[arg(long, help = "Timeout in seconds applied to every selected tool")]
        timeout: Option<u64>,
    },

    /// Show a job's progress and per-tool results
    Status { job_id: String },

    /// Request cancellation of a queued or running job
    Cancel { job_id: String },

    /// List known jobs
    Jobs,

    /// List the tools in the catalog
    Tools,

    /// List the scan profiles in the catalog
    Profiles,
}
