use std::net::SocketAddr;

use crate::cmode::CModeCommand;
use crate::fins::CommandCode;
use crate::utils::error::BridgeError;

pub const DEFAULT_CAPACITY: usize = 16;

/// A request that has been accepted from the network and still owes its client a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRequest {
    pub client: SocketAddr,
    pub source_node: u8,
    pub sequence_id: u8,
    pub command_code: CommandCode,
    pub command: CModeCommand,
    /// SID written into the C-mode command; the matching reply echoes it.
    pub command_sid: u8,
}

/// Fixed-capacity FIFO of pending requests, stored in a ring of slots.
///
/// The head is the request whose command is (or will next be) on the serial line.
/// When full, new requests are refused; the head is never displaced.
#[derive(Debug)]
pub struct Correlator {
    slots: Vec<Option<PendingRequest>>,
    head: usize,
    len: usize,
}

impl Correlator {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            head: 0,
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len == self.slots.len()
    }

    pub fn enqueue(&mut self, request: PendingRequest) -> Result<(), BridgeError> {
        if self.is_full() {
            return Err(BridgeError::CorrelatorFull(self.capacity()));
        }
        let tail = (self.head + self.len) % self.slots.len();
        self.slots[tail] = Some(request);
        self.len += 1;
        Ok(())
    }

    pub fn dequeue_or_none(&mut self) -> Option<PendingRequest> {
        if self.is_empty() {
            return None;
        }
        let request = self.slots[self.head].take();
        self.head = (self.head + 1) % self.slots.len();
        self.len -= 1;
        request
    }

    pub fn front(&self) -> Option<&PendingRequest> {
        if self.is_empty() {
            return None;
        }
        self.slots[self.head].as_ref()
    }

    pub fn clear(&mut self) {
        for slot in self.slots.iter_mut() {
            *slot = None;
        }
        self.head = 0;
        self.len = 0;
    }
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
