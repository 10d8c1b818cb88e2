//! Playlist tracker CLI library.
//!
//! This crate provides the CLI interface for the playlist tracker.

mod cli;
pub mod commands;
mod config;
pub mod output;

pub use cli::{Cli, Commands};
pub use config::Config;
