//! chatbotgate — authenticating reverse proxy.
//!
//! Entry point: parses the CLI, dispatches to `serve`, `test-config`, or
//! `completion`, and maps failures to process exit codes.

use std::io;
use std::process::ExitCode;

use clap::{CommandFactory, Parser};
use tracing::{error, info};

use chatbotgate::cli::{Cli, Command};
use chatbotgate::config::Config;
use chatbotgate::gateway::Gateway;
use chatbotgate::setup_tracing;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("failed to set up logging: {e}");
        return ExitCode::FAILURE;
    }

    match cli.command() {
        Command::Completion { shell } => {
            let mut app = <Cli as CommandFactory>::command();
            clap_complete::generate(*shell, &mut app, "chatbotgate", &mut io::stdout());
            ExitCode::SUCCESS
        }
        Command::TestConfig => match load_config(&cli) {
            Ok(config) => {
                info!(service = %config.service.name, "configuration is valid");
                println!("configuration OK");
                ExitCode::SUCCESS
            }
            Err(e) => {
                error!("configuration invalid: {e}");
                eprintln!("configuration invalid: {e}");
                ExitCode::FAILURE
            }
        },
        Command::Serve => serve(cli).await,
    }
}

async fn serve(cli: Cli) -> ExitCode {
    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            error!("failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        host = %config.server.host,
        port = config.server.port,
        service = %config.service.name,
        "starting chatbotgate"
    );

    let gateway = match Gateway::new(config).await {
        Ok(g) => g.with_config_path(cli.config.clone()),
        Err(e) => {
            error!("failed to initialize gateway: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = gateway.run().await {
        error!("gateway error: {e}");
        return ExitCode::FAILURE;
    }

    info!("shutdown complete");
    ExitCode::SUCCESS
}

/// Load configuration from `cli.config` (or the default search path) and
/// apply the `--host`/`--port` overrides.
fn load_config(cli: &Cli) -> chatbotgate::Result<Config> {
    let mut config = Config::load(cli.config.as_deref())?;

    if let Some(ref host) = cli.host {
        config.server.host = host.clone();
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }

    config.validate()?;
    Ok(config)
}
