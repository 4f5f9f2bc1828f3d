pub mod settings;

pub use settings::{BridgeTuning, Config, NetworkConfig, ParityConfig, SerialConfig};
