//! Serial TLS gateway binary

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use serial_tls_gateway::config::GatewayConfig;
use serial_tls_gateway::error::Result;
use serial_tls_gateway::service::Gateway;
use serial_tls_gateway::utils::logging;

/// Relay operator commands from TLS clients to a serial controller
#[derive(Parser, Debug)]
#[command(name = "serial-tls-gateway", version, about)]
struct Cli {
    /// Configuration file path (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the listen address (e.g. 0.0.0.0:5001)
    #[arg(long)]
    address: Option<String>,

    /// Override the serial device
    #[arg(long)]
    serial_port: Option<String>,

    /// Print an example configuration and exit
    #[arg(long)]
    print_config: bool,
}

fn load_config(cli: &Cli) -> Result<GatewayConfig> {
    let mut config = match &cli.config {
        Some(path) => GatewayConfig::from_file(path)?,
        None => GatewayConfig::default(),
    };
    config.apply_env()?;

    if let Some(address) = &cli.address {
        config.server.address = address.clone();
    }
    if let Some(port) = &cli.serial_port {
        config.serial.port = port.clone();
    }

    config.validate_strict()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if cli.print_config {
        println!("{}", GatewayConfig::example_config());
        return ExitCode::SUCCESS;
    }

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = logging::init(&config.logging) {
        eprintln!("{e}");
        return ExitCode::FAILURE;
    }
    info!(app = %config.logging.app_name, version = env!("CARGO_PKG_VERSION"), "Starting");

    match Gateway::new(config).run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Gateway failed");
            ExitCode::FAILURE
        }
    }
}
