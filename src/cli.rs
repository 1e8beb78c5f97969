use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// crawlspace cli
#[derive(Parser)]
#[command(name = "crawlspace")]
#[command(about = "Distributed, polite web crawler")]
#[command(version)]
pub struct Cli {
    /// Path to the YAML config file
    #[arg(short, long, default_value = "crawlspace.yaml", global = true)]
    pub config: PathBuf,

    /// Directory holding the link store
    #[arg(short, long, default_value = "./data", global = true)]
    pub data_dir: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run fetchers and the dispatcher together until interrupted
    Crawl {
        /// Run fetchers only, without the dispatcher
        #[arg(long, help = "Skip the dispatcher; claim work planned elsewhere")]
        no_dispatcher: bool,
    },

    /// Run only the dispatcher (plan segments, mark domains dispatched)
    Dispatch {
        /// Plan one cycle and exit instead of looping
        #[arg(long)]
        once: bool,
    },

    /// Insert a seed URL (and its domain) into the link store
    Seed {
        /// Absolute URL to seed, e.g. http://example.com/
        url: String,

        /// Force the link into the next segment
        #[arg(long)]
        getnow: bool,
    },

    /// Clear every claim token left behind by crashed processes
    Unclaim,
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
