pub mod codec;
pub mod protocol;

pub use codec::{decode_request, encode_response};
pub use protocol::{AreaSpec, CommandCode, FinsCommand, FinsHeader, FinsRequest};
