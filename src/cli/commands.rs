use clap::{Arg, ArgAction, ArgMatches, Command};
use log::info;
use std::path::Path;

use crate::config::Config;
use crate::transport::list_serial_ports;
use crate::utils::error::BridgeError;
use crate::VERSION;

pub fn build_cli() -> Command {
    Command::new("fins-bridge")
        .version(VERSION)
        .about("Bridges Omron FINS/UDP requests to a C-mode Host Link serial device")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("TOML configuration file")
                .global(true),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Log every frame at debug level")
                .action(ArgAction::SetTrue)
                .global(true),
        )
        .subcommand(
            Command::new("run")
                .about("Start the bridge and serve until Ctrl+C")
                .args(link_args()),
        )
        .subcommand(Command::new("list-ports").about("List serial ports available on this machine"))
        .subcommand(
            Command::new("dump-config")
                .about("Print the effective configuration as TOML")
                .args(link_args())
                .arg(
                    Arg::new("output")
                        .short('o')
                        .long("output")
                        .value_name("FILE")
                        .help("Write to FILE instead of stdout"),
                ),
        )
}

/// Serial and network overrides shared by `run` and `dump-config`.
fn link_args() -> Vec<Arg> {
    vec![
        Arg::new("port").short('p').long("port").value_name("DEVICE").help("Serial device, e.g. /dev/ttyUSB0 or COM3"),
        Arg::new("baud").short('b').long("baud").value_name("RATE").help("Baud rate"),
        Arg::new("data-bits").long("data-bits").value_name("BITS").help("Data bits (5-8)"),
        Arg::new("stop-bits").long("stop-bits").value_name("BITS").help("Stop bits (1 or 2)"),
        Arg::new("parity").long("parity").value_name("PARITY").help("none, even or odd"),
        Arg::new("unit").short('u').long("unit").value_name("UNIT").help("Host Link unit number of the device"),
        Arg::new("bind").long("bind").value_name("ADDR").help("Local IP address to listen on"),
        Arg::new("udp-port").long("udp-port").value_name("PORT").help("UDP port to listen on"),
        Arg::new("node").short('n').long("node").value_name("NODE").help("FINS node number of this bridge"),
    ]
}

/// Builds the effective configuration: file (or defaults), then command line overrides.
pub fn load_config(matches: &ArgMatches) -> Result<Config, BridgeError> {
    let mut config = match matches.get_one::<String>("config") {
        Some(path) => {
            info!("📄 Loading configuration from {}", path);
            Config::from_file(path)?
        }
        None => Config::default(),
    };
    config.apply_matches(matches)?;
    Ok(config)
}

/// Runs the one-shot subcommands. Returns `Ok(true)` when one was handled.
pub fn handle_subcommands(matches: &ArgMatches) -> Result<bool, BridgeError> {
    if matches.subcommand_matches("list-ports").is_some() {
        info!("📡 Available Serial Ports:");
        let ports = list_serial_ports()?;
        info!("🔢 {} port(s) found", ports.len());
        return Ok(true);
    }

    if let Some(matches) = matches.subcommand_matches("dump-config") {
        let config = load_config(matches)?;
        match matches.get_one::<String>("output") {
            Some(path) => {
                config.save_to_file(Path::new(path))?;
                info!("💾 Configuration written to {}", path);
            }
            None => print!("{}", toml::to_string_pretty(&config)?),
        }
        return Ok(true);
    }

    Ok(false)
}
