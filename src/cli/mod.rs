//! CLI command definitions for hiera-audit.
//!
//! The main entry point is the `Cli` struct; without a subcommand the HTTP
//! API is served.

use crate::format::OutputFormat;
use clap::{Parser, Subcommand};

/// Find dead, missing and duplicated Hiera keys
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// Hierarchy data directory (overrides config)
    #[arg(long, global = true)]
    pub data_dir: Option<String>,

    /// Path to database file (overrides config)
    #[arg(short, long, global = true)]
    pub database: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Logging output: 0/off, 1/stdout, 2/stderr (default), or filename
    #[arg(short, long, default_value = "2", global = true)]
    pub log: String,

    /// Output format of command results
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Text, global = true)]
    pub format: OutputFormat,

    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the HTTP API (default if no subcommand given)
    Serve {
        /// Listen address (overrides config)
        #[arg(long)]
        host: Option<String>,

        /// Listen port (overrides config)
        #[arg(long)]
        port: Option<u16>,
    },

    /// Show the hierarchy, resolved for a node when one is given
    Hierarchy {
        /// Node certname
        certname: Option<String>,
    },

    /// Reconcile one node's lookup log against its hierarchy
    Clean {
        /// Node certname
        certname: String,
    },

    /// Audit every node with a lookup log and store the estate report
    CleanAll,

    /// Record a key lookup for a node
    Record {
        /// Node certname
        certname: String,
        /// Looked-up key
        key: String,
    },

    /// Show a node's lookup log, or every node's when none is given
    Log {
        /// Node certname
        certname: Option<String>,
    },

    /// Show the value a node gets for a key
    Lookup {
        /// Node certname
        certname: String,
        /// Key to look up
        key: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_subcommands() {
        let cli = Cli::parse_from(["hiera-audit", "--format", "json", "clean", "web01"]);
        assert_eq!(cli.format, OutputFormat::Json);
        assert!(matches!(cli.command, Some(Command::Clean { ref certname }) if certname == "web01"));

        let cli = Cli::parse_from(["hiera-audit", "record", "web01", "ntp::servers", "-v"]);
        assert!(cli.verbose);
        assert!(matches!(cli.command, Some(Command::Record { .. })));

        let cli = Cli::parse_from(["hiera-audit", "log"]);
        assert!(matches!(cli.command, Some(Command::Log { certname: None })));

        let cli = Cli::parse_from(["hiera-audit"]);
        assert!(cli.command.is_none());
        assert_eq!(cli.log, "2");
    }

    #[test]
    fn test_serve_overrides() {
        let cli = Cli::parse_from(["hiera-audit", "serve", "--port", "9000"]);
        assert!(matches!(cli.command, Some(Command::Serve { port: Some(9000), host: None })));
    }
}
