pub mod bridge_service;
pub mod correlator;

pub use bridge_service::{BridgeOptions, BridgeService, BridgeState, BridgeStats};
pub use correlator::{Correlator, PendingRequest};
