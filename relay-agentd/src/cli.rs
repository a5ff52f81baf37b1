//! Thin CLI surface on top of [`crate::settings::Settings`], mirroring
//! `multichain-api-gateway/src/cli.rs`'s `clap::Parser` struct of optional
//! overrides layered on a config file.

use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about = "Runs the message exchange agent.")]
pub struct Args {
    /// Path to a TOML config file; falls back to built-in defaults and
    /// environment variables (`RELAY_AGENT__*`) if omitted.
    #[arg(long)]
    pub config_path: Option<PathBuf>,

    /// Directory holding the pending-message queue and persisted cursors.
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// URL the agent exchanges messages against.
    #[arg(long)]
    pub server_url: Option<String>,

    /// URL the agent pings to ask whether a full exchange is warranted.
    #[arg(long)]
    pub ping_url: Option<String>,

    /// Perform a single exchange and exit, instead of running the
    /// scheduler loop.
    #[arg(long)]
    pub once: bool,

    /// Increase log verbosity; repeatable (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress all but warning/error logs.
    #[arg(short, long)]
    pub quiet: bool,
}
