use async_trait::async_trait;
use std::net::SocketAddr;
use std::time::Duration;

use crate::utils::error::BridgeError;

/// The serial side of the bridge: one downstream device, one command at a time.
#[async_trait]
pub trait SerialChannel: Send + Sync {
    async fn write(&self, data: &[u8]) -> Result<(), BridgeError>;

    /// Reads up to and including `terminator`. `Ok(None)` when nothing complete
    /// arrived within `timeout`.
    async fn read_until(&self, terminator: u8, timeout: Duration) -> Result<Option<Vec<u8>>, BridgeError>;

    /// Drops everything received but not yet returned by `read_until`.
    async fn flush_input(&self) -> Result<(), BridgeError>;

    /// Idempotent; safe to call while a read is in progress.
    async fn close(&self);

    fn is_open(&self) -> bool;
}

/// The network side of the bridge.
#[async_trait]
pub trait DatagramChannel: Send + Sync {
    /// `Ok(None)` when no datagram arrived within `timeout`.
    async fn receive_from(&self, timeout: Duration) -> Result<Option<(Vec<u8>, SocketAddr)>, BridgeError>;

    async fn send_to(&self, data: &[u8], target: SocketAddr) -> Result<(), BridgeError>;

    /// Idempotent; safe to call while a receive is in progress.
    async fn close(&self);

    fn is_open(&self) -> bool;
}
