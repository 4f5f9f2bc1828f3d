use super::fcs;
use super::protocol::{CModeCommand, CModeReply, HEADER_CODE, REPLY_HEADER_LEN};
use crate::fins::protocol::{FinsCommand, FinsRequest};
use crate::utils::error::BridgeError;

const COMMAND_CODE_END: usize = REPLY_HEADER_LEN + 4;
const END_CODE_END: usize = COMMAND_CODE_END + 4;

/// Response wait time digit followed by ICF, DA2 and SA2; the SID comes after.
const EMBEDDED_FINS_HEADER: &str = "0000000";
const REPLY_SID: std::ops::Range<usize> = 12..14;

/// Translates a FINS request into a framed C-mode command for Host Link unit `unit`.
///
/// `sid` goes into the embedded FINS header; the device echoes it in its reply.
pub fn encode_command(request: &FinsRequest, unit: u8, sid: u8) -> CModeCommand {
    let mut body = format!(
        "{:02X}{}{}{:02X}{:04X}",
        unit,
        HEADER_CODE,
        EMBEDDED_FINS_HEADER,
        sid,
        request.command_code().code()
    );

    match &request.command {
        FinsCommand::AreaRead(spec) => {
            body.push_str(&format!("{:02X}{}{:04X}", spec.area, hex::encode_upper(spec.address), spec.count));
        }
        FinsCommand::AreaWrite(spec, payload) => {
            body.push_str(&format!("{:02X}{}{:04X}", spec.area, hex::encode_upper(spec.address), spec.count));
            body.push_str(&hex::encode_upper(payload));
        }
        FinsCommand::StatusRead => {}
    }

    CModeCommand::from_body(&body)
}

/// Parses a Host Link reply line (`@...<FCS>*\r`) into its FINS fields.
pub fn decode_reply(raw: &[u8]) -> Result<CModeReply, BridgeError> {
    let body = fcs::unframe(raw)?;
    fcs::verify(raw)?;

    if !body.is_ascii() {
        return Err(BridgeError::MalformedReply("reply contains non-ASCII characters".to_string()));
    }

    if body.len() < COMMAND_CODE_END {
        return Err(BridgeError::MalformedReply(format!(
            "body {:?} is {} characters, need at least {}",
            body,
            body.len(),
            COMMAND_CODE_END
        )));
    }

    if &body[2..4] != HEADER_CODE {
        return Err(BridgeError::MalformedReply(format!("unexpected header code {:?}", &body[2..4])));
    }

    if body.len() < END_CODE_END {
        return Err(BridgeError::MalformedReply(format!("body {:?} has no end code", body)));
    }

    Ok(CModeReply {
        unit: parse_hex_u8(&body[0..2], "unit number")?,
        link_end_code: parse_hex_u8(&body[4..6], "link end code")?,
        sid: parse_hex_u8(&body[REPLY_SID], "SID")?,
        command_code: parse_hex_u16(&body[COMMAND_CODE_END - 4..COMMAND_CODE_END], "command code")?,
        end_code: parse_hex_u16(&body[COMMAND_CODE_END..END_CODE_END], "end code")?,
        data_hex: body[END_CODE_END..].to_string(),
    })
}

fn check_hex(field: &str, name: &str) -> Result<(), BridgeError> {
    if field.is_empty() || !field.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(BridgeError::MalformedReply(format!("{} {:?} is not hex", name, field)));
    }
    Ok(())
}

fn parse_hex_u8(field: &str, name: &str) -> Result<u8, BridgeError> {
    check_hex(field, name)?;
    u8::from_str_radix(field, 16).map_err(|e| BridgeError::MalformedReply(format!("{}: {}", name, e)))
}

fn parse_hex_u16(field: &str, name: &str) -> Result<u16, BridgeError> {
    check_hex(field, name)?;
    u16::from_str_radix(field, 16).map_err(|e| BridgeError::MalformedReply(format!("{}: {}", name, e)))
}
