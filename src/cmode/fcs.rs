use crate::utils::error::BridgeError;

pub const START_MARK: u8 = b'@';
pub const TERMINATOR: u8 = b'*';
pub const CR: u8 = b'\r';

/// FCS digits + '*' + CR
const TRAILER_LEN: usize = 4;

/// XOR of every byte, rendered as two uppercase hex digits.
pub fn compute_checksum(data: &[u8]) -> String {
    let fcs = data.iter().fold(0u8, |acc, &byte| acc ^ byte);
    format!("{:02X}", fcs)
}

/// Wraps a command body as `@<body><FCS>*\r`.
///
/// The FCS covers the start mark as well as the body, which is how Host Link
/// devices compute it.
pub fn frame(body: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + 1 + TRAILER_LEN);
    out.push(START_MARK);
    out.extend_from_slice(body.as_bytes());
    let fcs = compute_checksum(&out);
    out.extend_from_slice(fcs.as_bytes());
    out.push(TERMINATOR);
    out.push(CR);
    out
}

/// Returns the text between the first '@' and the FCS trailer.
pub fn unframe(raw: &[u8]) -> Result<&str, BridgeError> {
    let start = raw
        .iter()
        .position(|&b| b == START_MARK)
        .ok_or_else(|| BridgeError::FramingError("no '@' start mark".to_string()))?;

    if raw.len() < start + 1 + TRAILER_LEN {
        return Err(BridgeError::FramingError(format!(
            "frame too short: {} bytes",
            raw.len() - start
        )));
    }

    let end = raw.len() - TRAILER_LEN;
    let trailer = &raw[end..];
    if trailer[2] != TERMINATOR || trailer[3] != CR {
        return Err(BridgeError::FramingError(format!(
            "bad terminator: {:?}",
            String::from_utf8_lossy(trailer)
        )));
    }

    std::str::from_utf8(&raw[start + 1..end])
        .map_err(|_| BridgeError::FramingError("body is not ASCII".to_string()))
}

/// Recomputes the FCS of a framed message and compares it with the transmitted one.
pub fn verify(raw: &[u8]) -> Result<(), BridgeError> {
    unframe(raw)?;
    let start = raw.iter().position(|&b| b == START_MARK).unwrap_or(0);
    let end = raw.len() - TRAILER_LEN;

    let expected = compute_checksum(&raw[start..end]);
    let received = String::from_utf8_lossy(&raw[end..end + 2]).to_ascii_uppercase();
    if expected != received {
        return Err(BridgeError::ChecksumMismatch { expected, received });
    }
    Ok(())
}
