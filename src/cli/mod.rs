//! CLI command definitions for task-broker
//!
//! This module defines the CLI structure using clap's derive macros.
//! The main entry point is the `Cli` struct which contains subcommands.

use clap::{Parser, Subcommand};

/// Task broker maintenance daemon and admin commands
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// Path to database file (overrides config)
    #[arg(short, long, global = true)]
    pub database: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Logging output: 0/off, 1/stdout, 2/stderr (default), or filename
    #[arg(short, long, default_value = "2", global = true)]
    pub log: String,

    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Command {
    /// Run the maintenance scheduler until Ctrl-C (default if no subcommand given)
    Serve,

    /// Free every assigned task whose deadline has passed
    Reclaim,

    /// Record one monitoring snapshot per project
    Snapshot,

    /// Put the failed tasks of a project back to new
    ResetFailed {
        /// Project ID
        project: i64,
    },

    /// Delete every task of a project
    HardReset {
        /// Project ID
        project: i64,
    },

    /// Print task counters for a project
    Stats {
        /// Project ID
        project: i64,
    },
}
