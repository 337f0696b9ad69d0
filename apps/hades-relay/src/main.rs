use clap::Parser;
use tracing::{error, info};

use hades_relay::{
    app,
    cli::{self, Cli, Commands, ProbeArgs},
    config::RelayConfig,
    telemetry,
};
use tokio::time::Duration;

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let config = match RelayConfig::try_from(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("invalid configuration: {}", e);
            std::process::exit(2);
        }
    };
    telemetry::init_tracing(&config.log_filter);

    if let Some(Commands::Probe {
        topic,
        message,
        listen,
        wait,
    }) = cli.command
    {
        let args = ProbeArgs {
            topic,
            message,
            listen,
            wait: Duration::from_secs(wait),
        };
        if let Err(e) = cli::run_probe(&config, args).await {
            error!("Probe error: {:#}", e);
            std::process::exit(1);
        }
        return;
    }

    info!(
        target = "relay.app",
        version = env!("CARGO_PKG_VERSION"),
        "starting hades-relay"
    );
    if let Err(e) = app::run(config).await {
        error!("Relay error: {:#}", e);
        std::process::exit(1);
    }
}
