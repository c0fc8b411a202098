//! Command-line interface definitions for hmac-proxy.
//!
//! Uses clap's derive API for type-safe argument parsing.

use clap::Parser;
use std::path::PathBuf;

/// Signing forward proxy and verifying reverse proxy for HMAC-authenticated
/// service-to-service HTTP.
///
/// Every `[[proxy]]` entry in the configuration file becomes one proxy
/// instance. The process runs until interrupted or until an instance fails
/// to start.
#[derive(Parser, Debug)]
#[command(name = "hmac-proxy")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to the configuration file.
    ///
    /// `$VAR` and `${VAR}` are expanded from the environment.
    #[arg(short = 'c', long = "config", value_name = "PATH")]
    pub config: PathBuf,

    /// Increase log verbosity.
    ///
    /// Can be specified multiple times:
    /// -v    = info level
    /// -vv   = debug level
    /// -vvv  = trace level
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}
