use async_trait::async_trait;
use bytes::BytesMut;
use log::{debug, error, info, warn};
use serialport::{ClearBuffer, SerialPort};
use std::io::{ErrorKind, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use super::traits::SerialChannel;
use crate::cmode::fcs::START_MARK;
use crate::config::settings::{ParityConfig, SerialConfig};
use crate::utils::error::BridgeError;

struct PortState {
    port: Box<dyn SerialPort>,
    // bytes read past the last returned line, or a line still being received
    buffer: BytesMut,
}

/// Host Link serial port driven through `serialport`'s blocking API.
pub struct SerialLink {
    name: String,
    state: Arc<Mutex<Option<PortState>>>,
    closed: Arc<AtomicBool>,
}

impl SerialLink {
    pub fn open(config: &SerialConfig) -> Result<Self, BridgeError> {
        info!("🔌 Opening serial port: {}", config.port);
        info!(
            "⚙️  Configuration: {} baud, {} data bits, {} stop bits, parity {:?}",
            config.baud_rate, config.data_bits, config.stop_bits, config.parity
        );

        let data_bits = match config.data_bits {
            5 => serialport::DataBits::Five,
            6 => serialport::DataBits::Six,
            7 => serialport::DataBits::Seven,
            _ => serialport::DataBits::Eight,
        };
        let stop_bits = match config.stop_bits {
            2 => serialport::StopBits::Two,
            _ => serialport::StopBits::One,
        };
        let parity = match config.parity {
            ParityConfig::None => serialport::Parity::None,
            ParityConfig::Even => serialport::Parity::Even,
            ParityConfig::Odd => serialport::Parity::Odd,
        };

        let port = serialport::new(&config.port, config.baud_rate)
            .timeout(Duration::from_millis(config.read_slice_ms.max(1)))
            .data_bits(data_bits)
            .stop_bits(stop_bits)
            .parity(parity)
            .open()
            .map_err(|e| {
                error!("❌ Failed to open serial port {}: {}", config.port, e);
                BridgeError::ConnectionError(format!("Failed to open port {}: {}", config.port, e))
            })?;

        info!("✅ Serial port {} open", config.port);
        Ok(Self {
            name: config.port.clone(),
            state: Arc::new(Mutex::new(Some(PortState { port, buffer: BytesMut::with_capacity(256) }))),
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    async fn with_port<T, F>(&self, op: F) -> Result<T, BridgeError>
    where
        T: Send + 'static,
        F: FnOnce(&mut PortState) -> Result<T, BridgeError> + Send + 'static,
    {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BridgeError::ChannelClosed("serial"));
        }
        let state = Arc::clone(&self.state);
        let closed = Arc::clone(&self.closed);

        tokio::task::spawn_blocking(move || {
            let mut guard = state.lock().map_err(|_| {
                BridgeError::CommunicationError("serial port lock poisoned".to_string())
            })?;
            let result = match guard.as_mut() {
                Some(port_state) => op(port_state),
                None => Err(BridgeError::ChannelClosed("serial")),
            };
            // close() may have run while we held the port
            if closed.load(Ordering::SeqCst) {
                guard.take();
            }
            result
        })
        .await
        .map_err(|e| BridgeError::CommunicationError(format!("serial worker failed: {}", e)))?
    }
}

#[async_trait]
impl SerialChannel for SerialLink {
    async fn write(&self, data: &[u8]) -> Result<(), BridgeError> {
        let data = data.to_vec();
        self.with_port(move |state| {
            state
                .port
                .write_all(&data)
                .map_err(|e| BridgeError::CommunicationError(format!("Write failed: {}", e)))?;
            state
                .port
                .flush()
                .map_err(|e| BridgeError::CommunicationError(format!("Flush failed: {}", e)))
        })
        .await
    }

    async fn read_until(&self, terminator: u8, timeout: Duration) -> Result<Option<Vec<u8>>, BridgeError> {
        self.with_port(move |state| read_line(&mut state.port, &mut state.buffer, terminator, timeout))
            .await
    }

    async fn flush_input(&self) -> Result<(), BridgeError> {
        self.with_port(|state| {
            if !state.buffer.is_empty() {
                debug!("🧹 Discarding {} buffered serial bytes", state.buffer.len());
                state.buffer.clear();
            }
            state
                .port
                .clear(ClearBuffer::Input)
                .map_err(|e| BridgeError::CommunicationError(format!("Input flush failed: {}", e)))
        })
        .await
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // A read in progress holds the lock; it drops the port itself once it sees `closed`.
        if let Ok(mut guard) = self.state.try_lock() {
            guard.take();
        }
        info!("🔌 Serial port {} closed", self.name);
    }

    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }
}

/// Most bytes kept while waiting for a terminator. Well above the longest
/// single Host Link frame.
pub const MAX_PENDING_BYTES: usize = 2048;

/// Accumulates bytes from `reader` into `buffer` until `terminator` shows up or
/// `timeout` elapses. Bytes after the terminator stay in `buffer`.
///
/// A returned line starts at its last `@`, so a fragment left over from an
/// earlier, abandoned frame never prefixes a fresh one.
pub fn read_line<R: Read + ?Sized>(
    reader: &mut R,
    buffer: &mut BytesMut,
    terminator: u8,
    timeout: Duration,
) -> Result<Option<Vec<u8>>, BridgeError> {
    let deadline = Instant::now() + timeout;
    let mut chunk = [0u8; 256];

    loop {
        if let Some(pos) = buffer.iter().position(|&b| b == terminator) {
            let mut line = buffer.split_to(pos + 1);
            if let Some(start) = line.iter().rposition(|&b| b == START_MARK) {
                if start > 0 {
                    debug!("🧹 Dropping {} stale bytes ahead of frame", start);
                    let _ = line.split_to(start);
                }
            }
            return Ok(Some(line.to_vec()));
        }
        if buffer.len() > MAX_PENDING_BYTES {
            trim_overflow(buffer);
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }

        match reader.read(&mut chunk) {
            Ok(0) => std::thread::sleep(Duration::from_millis(1)),
            Ok(n) => buffer.extend_from_slice(&chunk[..n]),
            Err(ref e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted) => {}
            Err(e) => return Err(BridgeError::CommunicationError(format!("Read failed: {}", e))),
        }
    }
}

/// Keeps only the newest frame start, or nothing if that alone is too long.
fn trim_overflow(buffer: &mut BytesMut) {
    let len = buffer.len();
    let keep_from = buffer
        .iter()
        .rposition(|&b| b == START_MARK)
        .filter(|&start| len - start <= MAX_PENDING_BYTES);

    match keep_from {
        Some(start) => {
            warn!("⚠️  {} serial bytes without a terminator, discarding {}", len, start);
            let _ = buffer.split_to(start);
        }
        None => {
            warn!("⚠️  {} serial bytes without a terminator, discarding all", len);
            buffer.clear();
        }
    }
}
