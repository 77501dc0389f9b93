use clap::{Parser, Subcommand};

use crate::config::BackendKind;

/// CLI surface definition.
#[derive(Parser, Debug)]
#[command(
    name = "securekv",
    about = "Encrypted-at-rest key-value store backed by the OS credential store",
    version,
    propagate_version = true
)]
pub struct Cli {
    /// Storage namespace; overrides the config file.
    #[arg(long, global = true)]
    pub namespace: Option<String>,

    /// Backend to use; overrides the config file.
    #[arg(long, value_enum, global = true)]
    pub backend: Option<BackendKind>,

    /// Optional subcommand; defaults to serving calls on stdin when absent.
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Print version and exit.
    Version,
    /// Print the platform name and OS version.
    Platform,
    /// Store a value, replacing any existing one.
    Write { key: String, value: String },
    /// Print the stored value for a key.
    Read { key: String },
    /// Remove a key (succeeds when absent).
    Delete { key: String },
    /// Send a raw method call and print the JSON outcome.
    Call {
        method: String,
        /// Argument mapping as a JSON object.
        #[arg(long)]
        args: Option<String>,
    },
    /// Answer JSON-line method calls from stdin on stdout.
    Serve,
    /// Run a write/read/delete round-trip against the configured store.
    Health,
    /// Manage CLI configuration.
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum ConfigCommand {
    /// Create a default config file if one does not exist.
    Init,
}
