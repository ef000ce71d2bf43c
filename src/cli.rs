//! Command-line interface: `serve` (default), `test-config`, `completion`.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Authenticating reverse proxy — OAuth2/OIDC and passwordless email login
/// in front of an upstream HTTP app.
#[derive(Parser, Debug)]
#[command(name = "chatbotgate")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Path to configuration file (YAML or JSON)
    #[arg(short, long, global = true, env = "CHATBOTGATE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Host to bind to (overrides config)
    #[arg(long, global = true, env = "CHATBOTGATE_HOST")]
    pub host: Option<String>,

    /// Port to listen on (overrides config)
    #[arg(short, long, global = true, env = "CHATBOTGATE_PORT")]
    pub port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true, env = "CHATBOTGATE_LOG_LEVEL")]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, global = true, env = "CHATBOTGATE_LOG_FORMAT")]
    pub log_format: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the gateway (default when no subcommand is given)
    Serve,
    /// Load and validate the configuration, then exit
    TestConfig,
    /// Print a shell completion script to stdout
    Completion {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

impl Cli {
    /// The effective subcommand: explicit, or `Serve` by default.
    #[must_use]
    pub fn command(&self) -> &Command {
        self.command.as_ref().unwrap_or(&Command::Serve)
    }
}
