//! FINS/UDP to Host Link bridge
//!
//! Accepts Omron FINS requests over UDP, forwards them as C-mode Host Link
//! commands on a serial line and turns the device's replies back into FINS
//! responses for the requesting client.

pub mod cli;
pub mod cmode;
pub mod config;
pub mod fins;
pub mod services;
pub mod transport;
pub mod utils;

// Re-export commonly used types
pub use cmode::{CModeCommand, CModeReply};
pub use config::Config;
pub use fins::{CommandCode, FinsRequest};
pub use services::{BridgeOptions, BridgeService, BridgeState, Correlator, PendingRequest};
pub use transport::{DatagramChannel, SerialChannel, SerialLink, UdpLink};
pub use utils::error::BridgeError;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
