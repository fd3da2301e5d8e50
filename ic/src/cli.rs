//! CLI command definitions and subcommands

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::debug;

/// instancectl - application-server instance supervisor
#[derive(Parser)]
#[command(
    name = "ic",
    about = "Create, start, stop and inspect named application-server instances",
    version = env!("GIT_DESCRIBE"),
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[arg(
        short = 'l',
        long = "log-level",
        global = true,
        help = "Log level (TRACE, DEBUG, INFO, WARN, ERROR)"
    )]
    pub log_level: Option<String>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Provision a new instance and add it to the configuration
    Add {
        /// Instance name
        name: String,
    },

    /// Delete a stopped instance and its directory
    Remove {
        /// Instance name
        name: String,
    },

    /// List configured instances
    List {
        /// Output format
        #[arg(short, long, default_value = "table")]
        format: OutputFormat,
    },

    /// Start an instance
    Start {
        /// Instance name
        name: String,

        /// Detach and record the server worker instead of running in the foreground
        #[arg(short, long)]
        background: bool,
    },

    /// Stop an instance gracefully, killing it after the timeout
    Stop {
        /// Instance name
        name: String,
    },

    /// Stop then start an instance in the background
    Restart {
        /// Instance name
        name: String,
    },

    /// Show the state of an instance
    Status {
        /// Instance name
        name: String,

        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Kill an instance without a graceful phase
    Kill {
        /// Instance name
        name: String,
    },

    /// Run the management CLI against an instance
    Cli {
        /// Instance name
        name: String,

        /// Inline command, run before --file
        #[arg(long)]
        command: Option<String>,

        /// File of commands
        #[arg(long)]
        file: Option<PathBuf>,
    },
}

/// Get the log file path
pub fn get_log_path() -> PathBuf {
    debug!("get_log_path: called");
    let path = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("instancectl")
        .join("logs")
        .join("instancectl.log");
    debug!(?path, "get_log_path: returning path");
    path
}

/// Output format for list/status commands
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Text,
    Table,
    Json,
    Yaml,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        debug!(%s, "OutputFormat::from_str: called");
        match s.to_lowercase().as_str() {
            "text" | "plain" => Ok(Self::Text),
            "table" => Ok(Self::Table),
            "json" => Ok(Self::Json),
            "yaml" | "yml" => Ok(Self::Yaml),
            _ => {
                debug!(%s, "OutputFormat::from_str: unknown format");
                Err(format!("Unknown format: {}. Use: text, table, json, or yaml", s))
            }
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::Table => write!(f, "table"),
            Self::Json => write!(f, "json"),
            Self::Yaml => write!(f, "yaml"),
        }
    }
}
