//! CLI command definitions using clap.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Enactor - observer core
#[derive(Parser, Debug)]
#[command(name = "enactor")]
#[command(version)]
#[command(about = "Keeps a declarative record store enacted against an infrastructure backend")]
#[command(
    long_about = "Enactor watches a record store for pending changes, drives the backend until each record is enacted, and dispatches deletion events to registered deleters."
)]
pub struct Cli {
    /// Configuration file (TOML, or JSON by extension)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the observer, policy runner and event listener until interrupted
    Run {
        /// JSON array of records to load before starting
        #[arg(long)]
        seed: Option<PathBuf>,

        /// Do not run model policies
        #[arg(long, default_value_t = false)]
        no_policies: bool,

        /// Deleter manifest directory
        #[arg(long)]
        deleters_dir: Option<PathBuf>,
    },

    /// Print this process's client identity, creating it if needed
    Identity,

    /// List the deleters registered from a manifest directory
    Deleters {
        /// Deleter manifest directory
        #[arg(long)]
        dir: Option<PathBuf>,
    },
}
