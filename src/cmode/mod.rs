pub mod codec;
pub mod fcs;
pub mod protocol;

pub use codec::{decode_reply, encode_command};
pub use fcs::{compute_checksum, frame, unframe};
pub use protocol::{CModeCommand, CModeReply};
