//! CLI argument definitions for voxos.
//!
//! All `clap` structures live here so that `main.rs` stays focused on
//! dispatching subcommands.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// voxos -- application runtime of a voice-interaction device.
#[derive(Parser)]
#[command(
    name = "voxos",
    version,
    about = "voxos -- voice application runtime",
    long_about = "Launches voice applications on demand, keeps the foreground stack \
                  and bridges capability calls between the host and each app process."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the runtime and dispatch NLU results read from stdin, one JSON
    /// object per line.
    Run {
        /// Path to the runtime configuration file.
        #[arg(long, short, default_value = "voxos.toml")]
        config: PathBuf,
    },

    /// List installed applications.
    Apps {
        #[arg(long, short, default_value = "voxos.toml")]
        config: PathBuf,
    },

    /// Validate a configuration file.
    Check {
        #[arg(long, short, default_value = "voxos.toml")]
        config: PathBuf,
    },
}
