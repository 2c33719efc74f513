//! Command-line argument definitions
//!
//! This module defines all CLI arguments and subcommands using clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Copy files off removable volumes as soon as they are mounted
#[derive(Parser, Debug)]
#[command(name = "grabby")]
#[command(version)]
#[command(about = "Watches for removable volumes and grabs their files into a local archive", long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Configuration file, or a directory containing grabby.toml
    #[arg(short, long, global = true, env = "GRABBY_CONFIG_PATH")]
    pub config: Option<PathBuf>,

    /// Log level: error, warn, info, debug, trace (overrides config)
    #[arg(short, long, global = true, env = "GRABBY_LOG_LEVEL")]
    pub log_level: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Watch for volumes and grab them until Ctrl+C (the default)
    Run,

    /// Grab an already-mounted path once
    Grab {
        /// Mount path of the volume
        mount: PathBuf,

        /// Volume label (defaults to the directory name)
        #[arg(long)]
        label: Option<String>,

        /// Filesystem UUID
        #[arg(long)]
        uuid: Option<String>,

        /// Use this profile instead of matching one
        #[arg(short, long)]
        profile: Option<String>,
    },

    /// List currently mounted volumes and the profile each one matches
    Volumes,

    /// List configured profiles
    Profiles,

    /// Inspect or edit the grab state
    State {
        #[command(subcommand)]
        command: StateCommands,
    },

    /// Show current configuration
    ShowConfig,

    /// Generate a configuration file
    GenerateConfig {
        /// Output path for the config file (defaults to standard location)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Subcommand, Debug)]
pub enum StateCommands {
    /// List known devices with their completed files and last session
    List,

    /// Forget everything grabbed from a device so it is copied again
    Forget {
        /// Identity key, as shown by `state list` (e.g. `uuid:1234-abcd`)
        identity: String,
    },
}
