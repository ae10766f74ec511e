//! Clap CLI definitions for NodeLink.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub const AFTER_HELP: &str = "\
\x1b[1;36mExamples:\x1b[0m
  nodelink init                      Write ~/.nodelink/config.toml
  nodelink run                       Sign in and serve until Ctrl+C
  nodelink run --subject telemetry   Override the advertised subjects
  nodelink invoke <uuid> echo '{}'   Run a command on a peer and print the result
  nodelink config show               Print the effective configuration";

/// NodeLink: peer-to-peer endpoints over local IPC and TCP.
#[derive(Parser)]
#[command(name = "nodelink", version, about, after_help = AFTER_HELP)]
pub struct Cli {
    /// Path to config file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create ~/.nodelink/ and a default config.
    Init {
        /// Overwrite an existing config (the old one is backed up).
        #[arg(long)]
        force: bool,
    },
    /// Inspect the configuration.
    #[command(subcommand)]
    Config(ConfigCommands),
    /// Sign in, answer peers and log what happens until Ctrl+C.
    Run {
        /// Subjects to advertise instead of the configured ones.
        #[arg(long = "subject")]
        subjects: Vec<String>,
    },
    /// Sign in, wait for a peer, run one of its commands and sign out.
    Invoke {
        /// UUID of the target endpoint.
        peer: uuid::Uuid,
        /// Command name.
        command: String,
        /// JSON arguments.
        #[arg(default_value = "null")]
        arguments: String,
        /// Seconds to wait for the peer to be approved.
        #[arg(long, default_value_t = 10)]
        wait: u64,
    },
    /// Generate shell completion scripts.
    Completion {
        /// Shell to generate completions for.
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Print the effective configuration as TOML.
    Show,
    /// Print the config file location.
    Path,
}
