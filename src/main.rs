use anyhow::{Context, Result};
use log::{error, info};
use std::sync::Arc;

use fins_bridge::cli::{build_cli, handle_subcommands, load_config};
use fins_bridge::{BridgeOptions, BridgeService, Config, SerialLink, UdpLink, VERSION};

#[tokio::main]
async fn main() -> Result<()> {
    let matches = build_cli().get_matches();

    let default_level = if matches.get_flag("verbose") { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level)).init();

    info!("🖥️  FINS bridge v{}", VERSION);

    if handle_subcommands(&matches)? {
        return Ok(());
    }

    if let Some(run_matches) = matches.subcommand_matches("run") {
        let config = load_config(run_matches)?;
        run_bridge(config).await?;
    }

    Ok(())
}

async fn run_bridge(config: Config) -> Result<()> {
    config.log_summary();

    let serial = SerialLink::open(&config.serial)
        .with_context(|| format!("cannot open serial port {}", config.serial.port))?;
    let network = UdpLink::bind(config.bind_socket_addr())
        .await
        .with_context(|| format!("cannot listen on {}", config.bind_socket_addr()))?;

    let service = BridgeService::new(Arc::new(serial), Arc::new(network), BridgeOptions::from_config(&config));
    let runner = service.clone();
    let mut bridge = tokio::spawn(async move { runner.run().await });

    info!("🛑 Press Ctrl+C to stop");

    let finished = tokio::select! {
        _ = tokio::signal::ctrl_c() => None,
        result = &mut bridge => Some(result),
    };
    let result = match finished {
        Some(result) => result,
        None => {
            info!("🛑 Ctrl+C received");
            service.stop().await;
            bridge.await
        }
    };

    if let Err(e) = result.context("bridge task panicked")? {
        error!("❌ Bridge terminated: {}", e);
        return Err(e.into());
    }

    info!("👋 Goodbye!");
    Ok(())
}
