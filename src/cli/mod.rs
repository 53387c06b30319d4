use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(name = "vibedom-proxy")]
#[command(about = "Default-deny egress proxy with DLP scrubbing for sandboxed coding agents")]
#[command(version)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "vibedom.toml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the proxy server
    Start {
        /// Watch the whitelist and rule file and reload on change
        #[arg(long)]
        watch: bool,
    },
    /// Check whether a host is allowed by the whitelist
    Check {
        /// Hostname, optionally with port
        host: String,
    },
    /// Scrub a file with the configured rules and print the result
    Scrub {
        /// File to scrub
        file: PathBuf,
        /// Content type to classify the file as (sniffed when omitted)
        #[arg(long)]
        content_type: Option<String>,
        /// Print only the findings, not the scrubbed content
        #[arg(long)]
        findings_only: bool,
    },
    /// List the loaded detection rules
    Rules,
    /// View audit log entries
    Logs {
        /// Show last N entries
        #[arg(long, default_value = "50")]
        tail: usize,
        /// Output format
        #[arg(long, value_enum, default_value_t = LogFormat::Table)]
        format: LogFormat,
    },
    /// Summarize the audit log
    Status,
    /// Write a default config and whitelist next to the config path
    Init,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Table,
    Json,
    Csv,
}
