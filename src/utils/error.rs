use thiserror::Error;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Framing error: {0}")]
    FramingError(String),

    #[error("Malformed C-mode reply: {0}")]
    MalformedReply(String),

    #[error("FCS mismatch: expected {expected}, received {received}")]
    ChecksumMismatch { expected: String, received: String },

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Invalid FINS frame: {0}")]
    InvalidFrame(String),

    #[error("Frame addressed to node {destination}, this bridge is node {own}")]
    NotForThisNode { destination: u8, own: u8 },

    #[error("Unsupported command code: {0:04X}")]
    UnsupportedCommand(u16),

    #[error("Reply received with no pending client")]
    CorrelatorEmpty,

    #[error("Too many pending requests (capacity {0})")]
    CorrelatorFull(usize),

    #[error("{0} channel closed")]
    ChannelClosed(&'static str),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Communication error: {0}")]
    CommunicationError(String),

    #[error("Timeout occurred")]
    Timeout,

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl BridgeError {
    /// True for conditions the polling loop cannot recover from.
    pub fn is_fatal(&self) -> bool {
        matches!(self, BridgeError::ChannelClosed(_))
    }
}

impl From<std::io::Error> for BridgeError {
    fn from(err: std::io::Error) -> Self {
        BridgeError::CommunicationError(format!("IO error: {}", err))
    }
}

impl From<tokio::time::error::Elapsed> for BridgeError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        BridgeError::Timeout
    }
}

impl From<serialport::Error> for BridgeError {
    fn from(err: serialport::Error) -> Self {
        BridgeError::ConnectionError(format!("Serial port error: {}", err))
    }
}

impl From<toml::de::Error> for BridgeError {
    fn from(err: toml::de::Error) -> Self {
        BridgeError::ConfigError(format!("TOML parse error: {}", err))
    }
}

impl From<toml::ser::Error> for BridgeError {
    fn from(err: toml::ser::Error) -> Self {
        BridgeError::ConfigError(format!("TOML write error: {}", err))
    }
}
