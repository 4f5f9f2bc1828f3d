use std::fmt;

use super::fcs;

/// Host Link header code for FINS-embedded commands.
pub const HEADER_CODE: &str = "FA";

/// Characters ahead of the FINS command code in a reply body:
/// unit number, header code, link end code, ICF, DA2, SA2, SID.
pub const REPLY_HEADER_LEN: usize = 14;

/// A framed C-mode command, ready to be written to the serial line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CModeCommand {
    bytes: Vec<u8>,
}

impl CModeCommand {
    pub fn from_body(body: &str) -> Self {
        Self { bytes: fcs::frame(body) }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// The text between '@' and the FCS.
    pub fn body(&self) -> &str {
        // frame() only ever receives &str, so the slice is valid UTF-8
        std::str::from_utf8(&self.bytes[1..self.bytes.len() - 4]).unwrap_or_default()
    }

    pub fn fcs(&self) -> &str {
        let end = self.bytes.len() - 2;
        std::str::from_utf8(&self.bytes[end - 2..end]).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl fmt::Display for CModeCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}{}*", self.body(), self.fcs())
    }
}

/// A decoded FINS reply received over Host Link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CModeReply {
    pub unit: u8,
    /// Host Link level end code; 00 when the frame itself was accepted.
    pub link_end_code: u8,
    /// SID echoed from the command's embedded FINS header.
    pub sid: u8,
    pub command_code: u16,
    /// FINS end code (MRES/SRES).
    pub end_code: u16,
    /// Response data as transmitted, still hex text.
    pub data_hex: String,
}

impl CModeReply {
    pub fn is_link_ok(&self) -> bool {
        self.link_end_code == 0
    }

    pub fn is_normal_completion(&self) -> bool {
        self.end_code == 0
    }
}

impl fmt::Display for CModeReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "unit {:02X} sid {:02X} cmd {:04X} end {:04X} data [{}]",
            self.unit, self.sid, self.command_code, self.end_code, self.data_hex
        )
    }
}
