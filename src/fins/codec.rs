use log::debug;

use super::protocol::{AreaSpec, CommandCode, FinsCommand, FinsHeader, FinsRequest, HEADER_LEN, ICF_COMMAND};
use crate::cmode::CModeReply;
use crate::services::correlator::PendingRequest;
use crate::utils::error::BridgeError;

const COMMAND_CODE_END: usize = HEADER_LEN + 2;
/// Header + command code + area(1) + address(3) + count(2)
const AREA_PARAMS_END: usize = COMMAND_CODE_END + 6;

/// Parses a FINS command datagram addressed to `own_node`.
pub fn decode_request(datagram: &[u8], own_node: u8) -> Result<FinsRequest, BridgeError> {
    let header_bytes: &[u8; HEADER_LEN] = datagram
        .get(..HEADER_LEN)
        .and_then(|h| h.try_into().ok())
        .ok_or_else(|| BridgeError::InvalidFrame(format!("{} bytes is shorter than a FINS header", datagram.len())))?;
    let header = FinsHeader::from_bytes(header_bytes);

    if header.icf != ICF_COMMAND {
        return Err(BridgeError::InvalidFrame(format!("ICF {:02X} is not a command", header.icf)));
    }

    if header.da1 != own_node {
        return Err(BridgeError::NotForThisNode { destination: header.da1, own: own_node });
    }

    if datagram.len() < COMMAND_CODE_END {
        return Err(BridgeError::InvalidFrame("missing command code".to_string()));
    }

    let raw_code = u16::from_be_bytes([datagram[10], datagram[11]]);
    let command = match CommandCode::try_from(raw_code)? {
        CommandCode::StatusRead => FinsCommand::StatusRead,
        CommandCode::AreaRead => FinsCommand::AreaRead(parse_area_spec(datagram)?),
        CommandCode::AreaWrite => {
            let spec = parse_area_spec(datagram)?;
            let payload = datagram[AREA_PARAMS_END..].to_vec();
            if spec.count > 0 && payload.is_empty() {
                return Err(BridgeError::InvalidFrame(format!(
                    "write of {} items carries no data",
                    spec.count
                )));
            }
            FinsCommand::AreaWrite(spec, payload)
        }
    };

    Ok(FinsRequest { header, command })
}

fn parse_area_spec(datagram: &[u8]) -> Result<AreaSpec, BridgeError> {
    if datagram.len() < AREA_PARAMS_END {
        return Err(BridgeError::InvalidFrame(format!(
            "area command needs {} bytes, got {}",
            AREA_PARAMS_END,
            datagram.len()
        )));
    }
    Ok(AreaSpec {
        area: datagram[12],
        address: [datagram[13], datagram[14], datagram[15]],
        count: u16::from_be_bytes([datagram[16], datagram[17]]),
    })
}

/// Builds the FINS response datagram for `pending` out of a decoded C-mode reply.
pub fn encode_response(
    reply: &CModeReply,
    pending: &PendingRequest,
    own_node: u8,
) -> Result<Vec<u8>, BridgeError> {
    if reply.command_code != pending.command_code.code() {
        return Err(BridgeError::ProtocolError(format!(
            "reply to {:04X} does not match pending {}",
            reply.command_code, pending.command_code
        )));
    }

    let header = FinsHeader::response(pending.source_node, own_node, pending.sequence_id);
    let mut response = Vec::with_capacity(HEADER_LEN + 4 + reply.data_hex.len() / 2);
    response.extend_from_slice(&header.to_bytes());
    response.extend_from_slice(&reply.command_code.to_be_bytes());
    response.extend_from_slice(&reply.end_code.to_be_bytes());

    if pending.command_code.returns_data() {
        let data = hex::decode(&reply.data_hex).map_err(|e| {
            BridgeError::ProtocolError(format!("reply data {:?} is not hex: {}", reply.data_hex, e))
        })?;
        response.extend_from_slice(&data);
    } else if !reply.data_hex.is_empty() {
        debug!("Ignoring {} trailing characters in write reply", reply.data_hex.len());
    }

    Ok(response)
}
