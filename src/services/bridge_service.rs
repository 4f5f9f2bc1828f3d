use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::{sleep, Instant};

use super::correlator::{Correlator, PendingRequest};
use crate::cmode::{self, fcs::CR, CModeCommand};
use crate::config::Config;
use crate::fins::{self, FinsCommand};
use crate::transport::{DatagramChannel, SerialChannel};
use crate::utils::error::BridgeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Idle,
    Running,
    Stopping,
}

#[derive(Debug, Clone)]
pub struct BridgeOptions {
    pub own_node: u8,
    pub unit_number: u8,
    pub udp_timeout: Duration,
    pub serial_timeout: Duration,
    pub reply_timeout: Duration,
    pub idle_yield: Duration,
    pub max_pending: usize,
}

impl BridgeOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            own_node: config.own_node(),
            unit_number: config.serial.unit_number,
            udp_timeout: config.bridge.udp_timeout(),
            serial_timeout: config.bridge.serial_timeout(),
            reply_timeout: config.bridge.reply_timeout(),
            idle_yield: config.bridge.idle_yield(),
            max_pending: config.bridge.max_pending,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct BridgeStats {
    pub started_at: Option<DateTime<Utc>>,
    pub datagrams_received: u64,
    pub datagrams_rejected: u64,
    pub commands_sent: u64,
    pub responses_sent: u64,
    pub replies_dropped: u64,
    pub reply_timeouts: u64,
}

/// Requests waiting for the device, plus when the head command went out.
#[derive(Debug)]
struct Pipeline {
    correlator: Correlator,
    awaiting_since: Option<Instant>,
    next_sid: u8,
}

/// Shuttles FINS requests from the UDP side to the serial device and the
/// device's replies back to whoever asked.
///
/// At most one C-mode command is on the serial line at a time; requests that
/// arrive meanwhile wait in the correlator in arrival order.
#[derive(Clone)]
pub struct BridgeService {
    serial: Arc<dyn SerialChannel>,
    network: Arc<dyn DatagramChannel>,
    options: BridgeOptions,
    state: Arc<RwLock<BridgeState>>,
    pipeline: Arc<Mutex<Pipeline>>,
    stats: Arc<Mutex<BridgeStats>>,
}

impl BridgeService {
    pub fn new(serial: Arc<dyn SerialChannel>, network: Arc<dyn DatagramChannel>, options: BridgeOptions) -> Self {
        let correlator = Correlator::new(options.max_pending);
        Self {
            serial,
            network,
            options,
            state: Arc::new(RwLock::new(BridgeState::Idle)),
            pipeline: Arc::new(Mutex::new(Pipeline { correlator, awaiting_since: None, next_sid: 0 })),
            stats: Arc::new(Mutex::new(BridgeStats::default())),
        }
    }

    pub async fn state(&self) -> BridgeState {
        *self.state.read().await
    }

    pub fn stats(&self) -> BridgeStats {
        self.lock_stats().clone()
    }

    pub fn pending_requests(&self) -> usize {
        self.lock_pipeline().correlator.len()
    }

    /// Runs polling cycles until `stop` is called or both channels fail.
    pub async fn run(&self) -> Result<(), BridgeError> {
        if !self.enter_running().await {
            warn!("⚠️  Bridge already running");
            return Ok(());
        }
        info!("🚀 Bridge running as FINS node {}, Host Link unit {:02}", self.options.own_node, self.options.unit_number);

        let mut outcome = Ok(());
        while self.is_running().await {
            if let Err(e) = self.poll_once().await {
                if self.is_running().await {
                    error!("❌ Bridge loop stopping: {}", e);
                    outcome = Err(e);
                }
                break;
            }
            sleep(self.options.idle_yield).await;
        }

        self.finish().await;
        outcome
    }

    /// Requests shutdown. Safe to call from any task, any number of times.
    pub async fn stop(&self) {
        {
            let mut state = self.state.write().await;
            if *state == BridgeState::Running {
                *state = BridgeState::Stopping;
                info!("🛑 Stopping bridge...");
            }
        }
        self.release_resources().await;
    }

    async fn enter_running(&self) -> bool {
        let mut state = self.state.write().await;
        if *state != BridgeState::Idle {
            return false;
        }
        *state = BridgeState::Running;
        self.lock_stats().started_at = Some(Utc::now());
        true
    }

    async fn is_running(&self) -> bool {
        *self.state.read().await == BridgeState::Running
    }

    async fn finish(&self) {
        {
            let mut state = self.state.write().await;
            if *state == BridgeState::Running {
                *state = BridgeState::Stopping;
            }
        }
        self.release_resources().await;
        self.log_statistics();
        *self.state.write().await = BridgeState::Idle;
        info!("✅ Bridge stopped");
    }

    async fn release_resources(&self) {
        self.serial.close().await;
        self.network.close().await;

        let mut pipeline = self.lock_pipeline();
        if !pipeline.correlator.is_empty() {
            warn!("⚠️  Discarding {} unanswered request(s)", pipeline.correlator.len());
        }
        pipeline.correlator.clear();
        pipeline.awaiting_since = None;
    }

    /// One polling cycle: network first, then serial.
    ///
    /// Recoverable problems are logged here; an `Err` means the loop must end.
    pub async fn poll_once(&self) -> Result<(), BridgeError> {
        let udp_failure = match self.network.receive_from(self.options.udp_timeout).await {
            Ok(Some((datagram, from))) => {
                self.handle_datagram(&datagram, from).await?;
                None
            }
            Ok(None) => None,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                error!("❌ UDP receive error: {}", e);
                Some(e)
            }
        };

        self.expire_stale_request().await?;

        match self.serial.read_until(CR, self.options.serial_timeout).await {
            Ok(Some(line)) => self.handle_serial_line(&line).await?,
            Ok(None) => {}
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                error!("❌ Serial read error: {}", e);
                if let Some(udp_error) = udp_failure {
                    return Err(BridgeError::CommunicationError(format!(
                        "both channels failed (UDP: {}; serial: {})",
                        udp_error, e
                    )));
                }
            }
        }

        Ok(())
    }

    async fn handle_datagram(&self, datagram: &[u8], from: SocketAddr) -> Result<(), BridgeError> {
        self.lock_stats().datagrams_received += 1;
        info!("📥 UDP from {}: {}", from, hex::encode_upper(datagram));

        let request = match fins::decode_request(datagram, self.options.own_node) {
            Ok(request) => request,
            Err(e @ BridgeError::NotForThisNode { .. }) => {
                debug!("Ignoring datagram from {}: {}", from, e);
                self.lock_stats().datagrams_rejected += 1;
                return Ok(());
            }
            Err(e) => {
                warn!("⚠️  Dropping datagram from {}: {}", from, e);
                self.lock_stats().datagrams_rejected += 1;
                return Ok(());
            }
        };
        info!("🔎 {}", request);

        if let FinsCommand::AreaWrite(spec, payload) = &request.command {
            // Item count is forwarded as received; only flag obvious disagreement.
            let count = spec.count as usize;
            if payload.len() != count && payload.len() != count * 2 {
                warn!(
                    "⚠️  Write of {} items carries {} data bytes, forwarding as is",
                    spec.count,
                    payload.len()
                );
            }
        }

        let command_sid = {
            let mut pipeline = self.lock_pipeline();
            let sid = pipeline.next_sid;
            pipeline.next_sid = sid.wrapping_add(1);
            sid
        };
        let command = cmode::encode_command(&request, self.options.unit_number, command_sid);
        debug!("C-mode command: {}", command);
        let pending = PendingRequest {
            client: from,
            source_node: request.source_node(),
            sequence_id: request.sequence_id(),
            command_code: request.command_code(),
            command,
            command_sid,
        };

        if !self.is_running().await {
            debug!("Bridge stopping, request from {} not queued", from);
            return Ok(());
        }

        let queued_behind = {
            let mut pipeline = self.lock_pipeline();
            if let Err(e) = pipeline.correlator.enqueue(pending) {
                warn!("⚠️  {}; dropping request from {}", e, from);
                drop(pipeline);
                self.lock_stats().datagrams_rejected += 1;
                return Ok(());
            }
            pipeline.correlator.len() - 1
        };

        if queued_behind > 0 {
            debug!("Request from {} queued behind {} pending", from, queued_behind);
        }
        self.dispatch_next().await
    }

    /// Writes the head command to the device unless one is already awaiting its reply.
    async fn dispatch_next(&self) -> Result<(), BridgeError> {
        loop {
            let command: CModeCommand = {
                let mut pipeline = self.lock_pipeline();
                if pipeline.awaiting_since.is_some() {
                    return Ok(());
                }
                match pipeline.correlator.front() {
                    Some(head) => {
                        let command = head.command.clone();
                        pipeline.awaiting_since = Some(Instant::now());
                        command
                    }
                    None => return Ok(()),
                }
            };

            // whatever is still buffered belongs to an earlier exchange
            self.discard_serial_input().await?;

            match self.serial.write(command.as_bytes()).await {
                Ok(()) => {
                    self.lock_stats().commands_sent += 1;
                    info!("📤 Serial <- {}", command);
                    return Ok(());
                }
                Err(e) => {
                    let dropped = self.take_in_flight();
                    self.lock_stats().replies_dropped += 1;
                    if let Some(pending) = dropped {
                        error!("❌ Serial write failed, dropping request from {}: {}", pending.client, e);
                    }
                    if e.is_fatal() {
                        return Err(e);
                    }
                }
            }
        }
    }

    async fn discard_serial_input(&self) -> Result<(), BridgeError> {
        match self.serial.flush_input().await {
            Ok(()) => Ok(()),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                warn!("⚠️  Could not flush serial input: {}", e);
                Ok(())
            }
        }
    }

    async fn handle_serial_line(&self, line: &[u8]) -> Result<(), BridgeError> {
        self.discard_serial_input().await?;
        info!("📨 Serial -> {}", String::from_utf8_lossy(line).trim_end());

        let decoded = cmode::decode_reply(line);

        // A late reply to an expired command must not be handed to the next client.
        if let Ok(reply) = &decoded {
            let expected_sid = {
                let pipeline = self.lock_pipeline();
                match pipeline.correlator.front() {
                    Some(head) if pipeline.awaiting_since.is_some() && head.command_sid != reply.sid => {
                        Some(head.command_sid)
                    }
                    _ => None,
                }
            };
            if let Some(expected) = expected_sid {
                warn!(
                    "⚠️  Reply carries SID {:02X} while {:02X} is awaited, dropping late reply",
                    reply.sid, expected
                );
                self.lock_stats().replies_dropped += 1;
                return Ok(());
            }
        }

        let pending = match self.take_in_flight() {
            Some(pending) => pending,
            None => {
                warn!("⚠️  {}, dropping serial data", BridgeError::CorrelatorEmpty);
                self.lock_stats().replies_dropped += 1;
                return Ok(());
            }
        };

        let response = decoded.and_then(|reply| {
            if reply.unit != self.options.unit_number {
                warn!(
                    "⚠️  Reply from Host Link unit {:02}, expected unit {:02}",
                    reply.unit, self.options.unit_number
                );
            }
            if !reply.is_link_ok() {
                warn!("⚠️  Host Link end code {:02X} from unit {:02}", reply.link_end_code, reply.unit);
            }
            if !reply.is_normal_completion() {
                warn!("⚠️  Device answered {:04X} with end code {:04X}", reply.command_code, reply.end_code);
            }
            fins::encode_response(&reply, &pending, self.options.own_node)
        });

        match response {
            Ok(response) => match self.network.send_to(&response, pending.client).await {
                Ok(()) => {
                    self.lock_stats().responses_sent += 1;
                    info!("📬 FINS response to {}: {}", pending.client, hex::encode_upper(&response));
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    self.lock_stats().replies_dropped += 1;
                    error!("❌ Could not answer {}: {}", pending.client, e);
                }
            },
            Err(e) => {
                self.lock_stats().replies_dropped += 1;
                error!("❌ Reply for {} dropped: {}", pending.client, e);
            }
        }

        self.dispatch_next().await
    }

    async fn expire_stale_request(&self) -> Result<(), BridgeError> {
        let expired = {
            let mut pipeline = self.lock_pipeline();
            match pipeline.awaiting_since {
                Some(since) if since.elapsed() >= self.options.reply_timeout => {
                    pipeline.awaiting_since = None;
                    pipeline.correlator.dequeue_or_none()
                }
                _ => None,
            }
        };

        if let Some(pending) = expired {
            self.lock_stats().reply_timeouts += 1;
            warn!(
                "⏰ No reply from device within {:?}, dropping {} request from {}",
                self.options.reply_timeout, pending.command_code, pending.client
            );
            self.discard_serial_input().await?;
            self.dispatch_next().await?;
        }
        Ok(())
    }

    fn take_in_flight(&self) -> Option<PendingRequest> {
        let mut pipeline = self.lock_pipeline();
        pipeline.awaiting_since = None;
        pipeline.correlator.dequeue_or_none()
    }

    fn lock_pipeline(&self) -> MutexGuard<'_, Pipeline> {
        self.pipeline.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_stats(&self) -> MutexGuard<'_, BridgeStats> {
        self.stats.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn log_statistics(&self) {
        let stats = self.stats();
        info!("📊 Bridge statistics:");
        if let Some(started) = stats.started_at {
            let uptime = Utc::now().signed_duration_since(started);
            info!("   ⏱️  Uptime: {}s", uptime.num_seconds());
        }
        info!("   📥 Datagrams received: {}", stats.datagrams_received);
        info!("   🚫 Datagrams rejected: {}", stats.datagrams_rejected);
        info!("   📤 Commands sent: {}", stats.commands_sent);
        info!("   📬 Responses sent: {}", stats.responses_sent);
        info!("   ❌ Replies dropped: {}", stats.replies_dropped);
        info!("   ⏰ Reply timeouts: {}", stats.reply_timeouts);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    type DeviceFn = fn(&[u8]) -> Option<Vec<u8>>;

    /// Serial device stand-in; `device` produces the reply line for each written command.
    struct MockSerial {
        written: Mutex<Vec<Vec<u8>>>,
        replies: Mutex<VecDeque<Vec<u8>>>,
        device: Option<DeviceFn>,
        read_delay: Duration,
        flushes: AtomicUsize,
        closes: AtomicUsize,
        closed: AtomicBool,
        fail_reads: AtomicBool,
    }

    impl MockSerial {
        fn new(device: Option<DeviceFn>) -> Self {
            Self {
                written: Mutex::new(Vec::new()),
                replies: Mutex::new(VecDeque::new()),
                device,
                read_delay: Duration::ZERO,
                flushes: AtomicUsize::new(0),
                closes: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
                fail_reads: AtomicBool::new(false),
            }
        }

        fn with_read_delay(mut self, delay: Duration) -> Self {
            self.read_delay = delay;
            self
        }

        fn push_line(&self, line: &[u8]) {
            self.replies.lock().unwrap().push_back(line.to_vec());
        }

        fn written(&self) -> Vec<Vec<u8>> {
            self.written.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SerialChannel for MockSerial {
        async fn write(&self, data: &[u8]) -> Result<(), BridgeError> {
            if self.closed.load(Ordering::SeqCst) {
                return Err(BridgeError::ChannelClosed("serial"));
            }
            self.written.lock().unwrap().push(data.to_vec());
            if let Some(device) = self.device {
                if let Some(reply) = device(data) {
                    self.replies.lock().unwrap().push_back(reply);
                }
            }
            Ok(())
        }

        async fn read_until(&self, _terminator: u8, _timeout: Duration) -> Result<Option<Vec<u8>>, BridgeError> {
            if !self.read_delay.is_zero() {
                sleep(self.read_delay).await;
            }
            if self.closed.load(Ordering::SeqCst) {
                return Err(BridgeError::ChannelClosed("serial"));
            }
            if self.fail_reads.load(Ordering::SeqCst) {
                return Err(BridgeError::CommunicationError("framing error on port".to_string()));
            }
            Ok(self.replies.lock().unwrap().pop_front())
        }

        async fn flush_input(&self) -> Result<(), BridgeError> {
            self.flushes.fetch_add(1, Ordering::SeqCst);
            self.replies.lock().unwrap().clear();
            Ok(())
        }

        async fn close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
            self.closed.store(true, Ordering::SeqCst);
        }

        fn is_open(&self) -> bool {
            !self.closed.load(Ordering::SeqCst)
        }
    }

    struct MockNetwork {
        incoming: Mutex<VecDeque<(Vec<u8>, SocketAddr)>>,
        sent: Mutex<Vec<(Vec<u8>, SocketAddr)>>,
        closed: AtomicBool,
        fail_receives: AtomicBool,
    }

    impl MockNetwork {
        fn new() -> Self {
            Self {
                incoming: Mutex::new(VecDeque::new()),
                sent: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
                fail_receives: AtomicBool::new(false),
            }
        }

        fn push(&self, datagram: Vec<u8>, from: SocketAddr) {
            self.incoming.lock().unwrap().push_back((datagram, from));
        }

        fn sent(&self) -> Vec<(Vec<u8>, SocketAddr)> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl DatagramChannel for MockNetwork {
        async fn receive_from(&self, _timeout: Duration) -> Result<Option<(Vec<u8>, SocketAddr)>, BridgeError> {
            if self.closed.load(Ordering::SeqCst) {
                return Err(BridgeError::ChannelClosed("UDP"));
            }
            if self.fail_receives.load(Ordering::SeqCst) {
                return Err(BridgeError::CommunicationError("network unreachable".to_string()));
            }
            Ok(self.incoming.lock().unwrap().pop_front())
        }

        async fn send_to(&self, data: &[u8], target: SocketAddr) -> Result<(), BridgeError> {
            if self.closed.load(Ordering::SeqCst) {
                return Err(BridgeError::ChannelClosed("UDP"));
            }
            self.sent.lock().unwrap().push((data.to_vec(), target));
            Ok(())
        }

        async fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }

        fn is_open(&self) -> bool {
            !self.closed.load(Ordering::SeqCst)
        }
    }

    /// Answers like a healthy unit 00, echoing the command's SID.
    /// Area reads return the single word 0x0048.
    fn echo_device(command: &[u8]) -> Option<Vec<u8>> {
        let body = std::str::from_utf8(&command[1..command.len() - 4]).ok()?;
        let sid = &body[11..13];
        let code = &body[13..17];
        let reply_body = match code {
            "0101" => format!("00FA00400000{}{}00000048", sid, code),
            "0102" => format!("00FA00400000{}{}0000", sid, code),
            "0601" => format!("00FA00400000{}{}0000AABB", sid, code),
            _ => return None,
        };
        Some(CModeCommand::from_body(&reply_body).as_bytes().to_vec())
    }

    /// Area read reply from unit 00 carrying `sid`.
    fn read_reply(sid: u8) -> Vec<u8> {
        CModeCommand::from_body(&format!("00FA00400000{:02X}010100000048", sid))
            .as_bytes()
            .to_vec()
    }

    fn options() -> BridgeOptions {
        BridgeOptions {
            own_node: 0,
            unit_number: 0,
            udp_timeout: Duration::from_millis(5),
            serial_timeout: Duration::from_millis(5),
            reply_timeout: Duration::from_secs(5),
            idle_yield: Duration::from_millis(1),
            max_pending: 4,
        }
    }

    fn client(port: u16) -> SocketAddr {
        SocketAddr::from(([192, 168, 1, 20], port))
    }

    fn read_request(source_node: u8, sid: u8) -> Vec<u8> {
        vec![
            0x80, 0x00, 0x02, 0x00, 0x00, 0x00, 0x00, source_node, 0x00, sid, 0x01, 0x01, 0x82, 0x00, 0x00, 0x64,
            0x00, 0x01,
        ]
    }

    fn service(serial: &Arc<MockSerial>, network: &Arc<MockNetwork>, options: BridgeOptions) -> BridgeService {
        BridgeService::new(serial.clone(), network.clone(), options)
    }

    #[tokio::test]
    async fn test_area_read_end_to_end() {
        let serial = Arc::new(MockSerial::new(Some(echo_device)));
        let network = Arc::new(MockNetwork::new());
        let bridge = service(&serial, &network, options());
        assert!(bridge.enter_running().await);

        network.push(read_request(0x01, 0x05), client(9600));
        bridge.poll_once().await.unwrap();

        let written = serial.written();
        assert_eq!(written.len(), 1);
        assert_eq!(written[0], b"@00FA00000000001018200006400017E*\r".to_vec());

        let sent = network.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, client(9600));
        assert_eq!(
            sent[0].0,
            vec![0xC0, 0x00, 0x02, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x05, 0x01, 0x01, 0x00, 0x00, 0x00, 0x48]
        );
        // once before the command goes out, once after the reply line
        assert_eq!(serial.flushes.load(Ordering::SeqCst), 2);
        assert_eq!(bridge.pending_requests(), 0);

        let stats = bridge.stats();
        assert_eq!(stats.commands_sent, 1);
        assert_eq!(stats.responses_sent, 1);
    }

    #[tokio::test]
    async fn test_unsupported_command_writes_nothing() {
        let serial = Arc::new(MockSerial::new(Some(echo_device)));
        let network = Arc::new(MockNetwork::new());
        let bridge = service(&serial, &network, options());
        bridge.enter_running().await;

        for code in [[0x01, 0x03], [0x04, 0x01], [0x07, 0x01], [0xFF, 0xFF]] {
            let mut datagram = read_request(0x01, 0x01);
            datagram[10] = code[0];
            datagram[11] = code[1];
            network.push(datagram, client(9600));
            bridge.poll_once().await.unwrap();
        }

        assert!(serial.written().is_empty());
        assert!(network.sent().is_empty());
        assert_eq!(bridge.pending_requests(), 0);
        assert_eq!(bridge.stats().datagrams_rejected, 4);
    }

    #[tokio::test]
    async fn test_other_node_is_ignored() {
        let serial = Arc::new(MockSerial::new(Some(echo_device)));
        let network = Arc::new(MockNetwork::new());
        let mut opts = options();
        opts.own_node = 20;
        let bridge = service(&serial, &network, opts);
        bridge.enter_running().await;

        network.push(read_request(0x01, 0x01), client(9600));
        bridge.poll_once().await.unwrap();

        assert!(serial.written().is_empty());
        assert!(network.sent().is_empty());
    }

    #[tokio::test]
    async fn test_unsolicited_reply_is_dropped() {
        let serial = Arc::new(MockSerial::new(None));
        let network = Arc::new(MockNetwork::new());
        let bridge = service(&serial, &network, options());
        bridge.enter_running().await;

        serial.push_line(b"@00FA00400000000101000000484F*\r");
        bridge.poll_once().await.unwrap();

        assert!(network.sent().is_empty());
        assert_eq!(bridge.stats().replies_dropped, 1);
    }

    #[tokio::test]
    async fn test_one_command_in_flight_and_fifo_replies() {
        let serial = Arc::new(MockSerial::new(None));
        let network = Arc::new(MockNetwork::new());
        let bridge = service(&serial, &network, options());
        bridge.enter_running().await;

        network.push(read_request(0x01, 0x0A), client(1001));
        bridge.poll_once().await.unwrap();
        network.push(read_request(0x02, 0x0B), client(1002));
        bridge.poll_once().await.unwrap();

        // second command waits for the first reply
        assert_eq!(serial.written().len(), 1);
        assert_eq!(bridge.pending_requests(), 2);

        serial.push_line(&read_reply(0x00));
        bridge.poll_once().await.unwrap();
        assert_eq!(serial.written().len(), 2);

        serial.push_line(&read_reply(0x01));
        bridge.poll_once().await.unwrap();

        let sent = network.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].1, client(1001));
        assert_eq!((sent[0].0[4], sent[0].0[9]), (0x01, 0x0A));
        assert_eq!(sent[1].1, client(1002));
        assert_eq!((sent[1].0[4], sent[1].0[9]), (0x02, 0x0B));
        assert_eq!(bridge.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_overflow_refuses_newest() {
        let serial = Arc::new(MockSerial::new(None));
        let network = Arc::new(MockNetwork::new());
        let mut opts = options();
        opts.max_pending = 2;
        let bridge = service(&serial, &network, opts);
        bridge.enter_running().await;

        for sid in 0..3u8 {
            network.push(read_request(0x01, sid), client(2000 + sid as u16));
            bridge.poll_once().await.unwrap();
        }

        assert_eq!(bridge.pending_requests(), 2);
        assert_eq!(bridge.stats().datagrams_rejected, 1);
    }

    #[tokio::test]
    async fn test_bad_reply_consumes_pending_request() {
        let serial = Arc::new(MockSerial::new(None));
        let network = Arc::new(MockNetwork::new());
        let bridge = service(&serial, &network, options());
        bridge.enter_running().await;

        network.push(read_request(0x01, 0x01), client(3000));
        bridge.poll_once().await.unwrap();
        serial.push_line(b"@00FA00400000000101000000484E*\r");
        bridge.poll_once().await.unwrap();

        assert!(network.sent().is_empty());
        assert_eq!(bridge.pending_requests(), 0);
        assert_eq!(bridge.stats().replies_dropped, 1);
    }

    #[tokio::test]
    async fn test_silent_device_times_out_and_next_request_goes_out() {
        let serial = Arc::new(MockSerial::new(None));
        let network = Arc::new(MockNetwork::new());
        let mut opts = options();
        opts.reply_timeout = Duration::from_millis(20);
        let bridge = service(&serial, &network, opts);
        bridge.enter_running().await;

        network.push(read_request(0x01, 0x01), client(4000));
        bridge.poll_once().await.unwrap();
        network.push(read_request(0x02, 0x02), client(4001));
        bridge.poll_once().await.unwrap();
        assert_eq!(serial.written().len(), 1);

        sleep(Duration::from_millis(30)).await;
        bridge.poll_once().await.unwrap();

        assert_eq!(serial.written().len(), 2);
        assert_eq!(bridge.pending_requests(), 1);
        assert_eq!(bridge.stats().reply_timeouts, 1);
    }

    #[tokio::test]
    async fn test_late_reply_is_not_given_to_next_client() {
        let serial = Arc::new(MockSerial::new(None));
        let network = Arc::new(MockNetwork::new());
        let mut opts = options();
        opts.reply_timeout = Duration::from_millis(20);
        let bridge = service(&serial, &network, opts);
        bridge.enter_running().await;

        network.push(read_request(0x01, 0x01), client(4000));
        bridge.poll_once().await.unwrap();
        network.push(read_request(0x02, 0x02), client(4001));
        bridge.poll_once().await.unwrap();

        sleep(Duration::from_millis(30)).await;
        bridge.poll_once().await.unwrap();
        assert_eq!(serial.written().len(), 2);
        assert!(serial.written()[1].starts_with(b"@00FA000000001"));

        // the device finally answers the expired first command
        serial.push_line(&read_reply(0x00));
        bridge.poll_once().await.unwrap();
        assert!(network.sent().is_empty());
        assert_eq!(bridge.pending_requests(), 1);

        serial.push_line(&read_reply(0x01));
        bridge.poll_once().await.unwrap();
        let sent = network.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, client(4001));
        assert_eq!((sent[0].0[4], sent[0].0[9]), (0x02, 0x02));
        assert_eq!(bridge.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_stale_serial_data_is_flushed_before_dispatch() {
        let serial = Arc::new(MockSerial::new(Some(echo_device)));
        let network = Arc::new(MockNetwork::new());
        let bridge = service(&serial, &network, options());
        bridge.enter_running().await;

        // leftover from an earlier exchange, still sitting in the input buffer
        serial.push_line(b"@00FA004000000006010000AABB44*\r");
        network.push(read_request(0x01, 0x05), client(9600));
        bridge.poll_once().await.unwrap();

        let sent = network.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(&sent[0].0[10..], &[0x01, 0x01, 0x00, 0x00, 0x00, 0x48]);
        assert_eq!(bridge.stats().replies_dropped, 0);
    }

    #[tokio::test]
    async fn test_expired_request_flushes_serial_input() {
        let serial = Arc::new(MockSerial::new(None));
        let network = Arc::new(MockNetwork::new());
        let mut opts = options();
        opts.reply_timeout = Duration::from_millis(20);
        let bridge = service(&serial, &network, opts);
        bridge.enter_running().await;

        network.push(read_request(0x01, 0x01), client(4000));
        bridge.poll_once().await.unwrap();
        let flushes_before = serial.flushes.load(Ordering::SeqCst);

        sleep(Duration::from_millis(30)).await;
        bridge.poll_once().await.unwrap();

        assert_eq!(bridge.stats().reply_timeouts, 1);
        assert_eq!(serial.flushes.load(Ordering::SeqCst), flushes_before + 1);
    }

    #[tokio::test]
    async fn test_reply_from_other_unit_is_still_forwarded() {
        let serial = Arc::new(MockSerial::new(None));
        let network = Arc::new(MockNetwork::new());
        let bridge = service(&serial, &network, options());
        bridge.enter_running().await;

        network.push(read_request(0x01, 0x07), client(7000));
        bridge.poll_once().await.unwrap();
        let other_unit = CModeCommand::from_body("05FA0040000000010100000048");
        serial.push_line(other_unit.as_bytes());
        bridge.poll_once().await.unwrap();

        let sent = network.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0[9], 0x07);
    }

    #[tokio::test]
    async fn test_single_channel_failure_keeps_polling() {
        let serial = Arc::new(MockSerial::new(None));
        let network = Arc::new(MockNetwork::new());
        let bridge = service(&serial, &network, options());
        bridge.enter_running().await;

        serial.fail_reads.store(true, Ordering::SeqCst);
        network.push(read_request(0x01, 0x01), client(8000));
        bridge.poll_once().await.unwrap();
        assert_eq!(serial.written().len(), 1);

        serial.fail_reads.store(false, Ordering::SeqCst);
        network.fail_receives.store(true, Ordering::SeqCst);
        serial.push_line(&read_reply(0x00));
        bridge.poll_once().await.unwrap();
        assert_eq!(network.sent().len(), 1);
        assert_eq!(bridge.state().await, BridgeState::Running);
    }

    #[tokio::test]
    async fn test_run_survives_serial_failures() {
        let serial = Arc::new(MockSerial::new(None));
        serial.fail_reads.store(true, Ordering::SeqCst);
        let network = Arc::new(MockNetwork::new());
        let bridge = service(&serial, &network, options());

        let runner = bridge.clone();
        let handle = tokio::spawn(async move { runner.run().await });

        network.push(read_request(0x01, 0x01), client(8001));
        for _ in 0..200 {
            if !serial.written().is_empty() {
                break;
            }
            sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(serial.written().len(), 1);
        assert_eq!(bridge.state().await, BridgeState::Running);

        bridge.stop().await;
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_both_channels_failing_ends_loop() {
        let serial = Arc::new(MockSerial::new(None));
        serial.fail_reads.store(true, Ordering::SeqCst);
        let network = Arc::new(MockNetwork::new());
        network.fail_receives.store(true, Ordering::SeqCst);
        let bridge = service(&serial, &network, options());

        let result = bridge.run().await;
        assert!(matches!(result, Err(BridgeError::CommunicationError(_))));
        assert_eq!(bridge.state().await, BridgeState::Idle);
        assert!(!serial.is_open());
    }

    #[tokio::test]
    async fn test_write_and_status_commands() {
        let serial = Arc::new(MockSerial::new(Some(echo_device)));
        let network = Arc::new(MockNetwork::new());
        let bridge = service(&serial, &network, options());
        bridge.enter_running().await;

        let mut write = read_request(0x03, 0x21);
        write[11] = 0x02;
        write.extend_from_slice(&[0x12, 0x34]);
        network.push(write, client(5000));
        bridge.poll_once().await.unwrap();

        let status = vec![0x80, 0x00, 0x02, 0x00, 0x00, 0x00, 0x00, 0x03, 0x00, 0x22, 0x06, 0x01];
        network.push(status, client(5000));
        bridge.poll_once().await.unwrap();

        let written = serial.written();
        assert_eq!(written[0], b"@00FA0000000000102820000640001123479*\r".to_vec());
        assert_eq!(written[1], b"@00FA000000001060171*\r".to_vec());

        let sent = network.sent();
        assert_eq!(&sent[0].0[9..], &[0x21, 0x01, 0x02, 0x00, 0x00]);
        assert_eq!(&sent[1].0[9..], &[0x22, 0x06, 0x01, 0x00, 0x00, 0xAA, 0xBB]);
    }

    #[tokio::test]
    async fn test_run_until_stopped() {
        let serial = Arc::new(MockSerial::new(Some(echo_device)));
        let network = Arc::new(MockNetwork::new());
        let bridge = service(&serial, &network, options());

        let runner = bridge.clone();
        let handle = tokio::spawn(async move { runner.run().await });

        network.push(read_request(0x01, 0x05), client(9600));
        for _ in 0..200 {
            if !network.sent().is_empty() {
                break;
            }
            sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(network.sent().len(), 1);
        assert_eq!(bridge.state().await, BridgeState::Running);

        bridge.stop().await;
        handle.await.unwrap().unwrap();
        assert_eq!(bridge.state().await, BridgeState::Idle);
        assert!(!serial.is_open());
        assert!(!network.is_open());
    }

    #[tokio::test]
    async fn test_stop_mid_cycle_leaves_nothing_pending() {
        let serial = Arc::new(MockSerial::new(None).with_read_delay(Duration::from_millis(30)));
        let network = Arc::new(MockNetwork::new());
        let bridge = service(&serial, &network, options());

        network.push(read_request(0x01, 0x01), client(6000));
        let runner = bridge.clone();
        let handle = tokio::spawn(async move { runner.run().await });

        // let the first cycle accept the request and block in the serial read
        sleep(Duration::from_millis(10)).await;
        bridge.stop().await;
        bridge.stop().await;

        handle.await.unwrap().unwrap();
        assert_eq!(bridge.pending_requests(), 0);
        assert_eq!(bridge.state().await, BridgeState::Idle);
        assert!(serial.closes.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn test_stop_when_idle_is_harmless() {
        let serial = Arc::new(MockSerial::new(None));
        let network = Arc::new(MockNetwork::new());
        let bridge = service(&serial, &network, options());

        bridge.stop().await;
        assert_eq!(bridge.state().await, BridgeState::Idle);
        assert_eq!(bridge.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_closed_channel_ends_loop() {
        let serial = Arc::new(MockSerial::new(None));
        let network = Arc::new(MockNetwork::new());
        network.close().await;
        let bridge = service(&serial, &network, options());

        let result = bridge.run().await;
        assert!(matches!(result, Err(BridgeError::ChannelClosed("UDP"))));
        assert_eq!(bridge.state().await, BridgeState::Idle);
    }
}
