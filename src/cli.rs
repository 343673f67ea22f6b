//! Command-line interface.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// OpenBotAuth - signature verifier, identity registry, and agent CA.
#[derive(Parser, Debug)]
#[command(name = "openbotauth")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, global = true, env = "OBA_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info", env = "OBA_LOG_LEVEL")]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, global = true, env = "OBA_LOG_FORMAT")]
    pub log_format: Option<String>,

    /// What to run
    #[command(subcommand)]
    pub command: Command,
}

/// Top-level commands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the signature verifier service
    Verifier {
        /// Port to listen on
        #[arg(short, long, env = "OBA_VERIFIER_PORT")]
        port: Option<u16>,

        /// Host to bind to
        #[arg(long, env = "OBA_VERIFIER_HOST")]
        host: Option<String>,
    },

    /// Run the identity registry service
    Registry {
        /// Port to listen on
        #[arg(short, long, env = "OBA_REGISTRY_PORT")]
        port: Option<u16>,

        /// Host to bind to
        #[arg(long, env = "OBA_REGISTRY_HOST")]
        host: Option<String>,
    },

    /// Certificate authority management
    Ca {
        /// CA subcommand
        #[command(subcommand)]
        command: CaCommand,
    },
}

/// CA management subcommands.
#[derive(Subcommand, Debug)]
pub enum CaCommand {
    /// Generate a self-signed Ed25519 CA certificate and key
    Init {
        /// Common Name for the CA certificate
        #[arg(long, default_value = "OpenBotAuth Root CA")]
        cn: String,

        /// Output directory for ca.pem and ca-key.pem
        #[arg(long, default_value = "./ca")]
        out_dir: PathBuf,

        /// Validity period in days
        #[arg(long, default_value_t = 3650)]
        validity_days: i64,
    },
}
