//! Command-line argument definitions.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Playlist session tracker.
///
/// Polls a media server for active streams and reports how users move through
/// their generated playlists as JSON-lines events.
#[derive(Debug, Parser)]
#[command(name = "pt", version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to config file.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available subcommands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Poll the media server and track sessions until interrupted.
    Run,

    /// Feed recorded stream snapshots through the tracker.
    Replay {
        /// JSON-lines file with one `{"at": ..., "streams": [...]}` tick per line.
        file: PathBuf,
    },

    /// Show stored playlists, sessions and listening totals.
    Status {
        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },
}
