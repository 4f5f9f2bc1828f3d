use async_trait::async_trait;
use log::{debug, info};
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::UdpSocket;

use super::traits::DatagramChannel;
use crate::utils::error::BridgeError;

pub const MAX_DATAGRAM_SIZE: usize = 4096;

/// FINS/UDP endpoint bound to the configured local address.
pub struct UdpLink {
    socket: Mutex<Option<Arc<UdpSocket>>>,
    local_addr: SocketAddr,
}

impl UdpLink {
    pub async fn bind(addr: SocketAddr) -> Result<Self, BridgeError> {
        let socket = UdpSocket::bind(addr).await.map_err(|e| {
            BridgeError::ConnectionError(format!("Failed to bind UDP socket on {}: {}", addr, e))
        })?;
        let local_addr = socket.local_addr()?;
        info!("🌐 UDP server listening on {}", local_addr);

        Ok(Self {
            socket: Mutex::new(Some(Arc::new(socket))),
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn socket(&self) -> Result<Arc<UdpSocket>, BridgeError> {
        self.socket
            .lock()
            .map_err(|_| BridgeError::CommunicationError("UDP socket lock poisoned".to_string()))?
            .as_ref()
            .cloned()
            .ok_or(BridgeError::ChannelClosed("UDP"))
    }
}

#[async_trait]
impl DatagramChannel for UdpLink {
    async fn receive_from(&self, timeout: Duration) -> Result<Option<(Vec<u8>, SocketAddr)>, BridgeError> {
        let socket = self.socket()?;
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

        match tokio::time::timeout(timeout, socket.recv_from(&mut buf)).await {
            Err(_) => Ok(None),
            Ok(Ok((len, from))) => {
                buf.truncate(len);
                Ok(Some((buf, from)))
            }
            // ICMP port unreachable from an earlier send surfaces here on some platforms
            Ok(Err(e)) if e.kind() == ErrorKind::ConnectionReset => {
                debug!("UDP receive reported connection reset, ignoring");
                Ok(None)
            }
            Ok(Err(e)) => Err(BridgeError::CommunicationError(format!("UDP receive failed: {}", e))),
        }
    }

    async fn send_to(&self, data: &[u8], target: SocketAddr) -> Result<(), BridgeError> {
        let socket = self.socket()?;
        let sent = socket
            .send_to(data, target)
            .await
            .map_err(|e| BridgeError::CommunicationError(format!("UDP send to {} failed: {}", target, e)))?;
        if sent != data.len() {
            return Err(BridgeError::CommunicationError(format!(
                "UDP send to {} truncated: {} of {} bytes",
                target,
                sent,
                data.len()
            )));
        }
        Ok(())
    }

    async fn close(&self) {
        let taken = match self.socket.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if taken.is_some() {
            info!("🌐 UDP server on {} closed", self.local_addr);
        }
    }

    fn is_open(&self) -> bool {
        self.socket.lock().map(|guard| guard.is_some()).unwrap_or(false)
    }
}
