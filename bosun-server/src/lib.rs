//! # Bosun Server
//!
//! Daemon hosting the bosun runtime: it loads configuration, installs
//! logging, runs the job workers and shuts supervised processes down
//! gracefully on SIGINT or SIGTERM.

pub mod cli;
pub mod daemon;

pub use cli::Cli;
