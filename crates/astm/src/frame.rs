//! CLSI LIS2-A2 low-level framing.
//!
//! A frame is `<STX><FN><data><ETX|ETB><C1><C2><CR><LF>` where `FN` is an ASCII digit `0`-`7`
//! and `C1C2` is the checksum in uppercase hex: the sum of every byte from `FN` through the
//! terminator inclusive, modulo 256. Frame numbers start at 1 and wrap 7 → 0.

use crate::{AstmError, AstmResult};

pub const STX: u8 = 0x02;
pub const ETX: u8 = 0x03;
pub const EOT: u8 = 0x04;
pub const ENQ: u8 = 0x05;
pub const ACK: u8 = 0x06;
pub const NAK: u8 = 0x15;
pub const ETB: u8 = 0x17;
pub const CR: u8 = 0x0D;
pub const LF: u8 = 0x0A;

/// Bytes following the terminator: two checksum characters, CR, LF.
pub const TRAILER_LEN: usize = 4;

/// A decoded frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub number: u8,
    pub data: String,
    /// `true` for an `ETX` frame, `false` for an intermediate `ETB` frame.
    pub is_final: bool,
}

/// Frame number that follows `current`.
pub fn next_frame_number(current: u8) -> u8 {
    (current + 1) % 8
}

/// Checksum over the frame number digit, payload and terminator.
pub fn checksum(frame_number: u8, data: &[u8], terminator: u8) -> u8 {
    let digit = b'0' + frame_number;
    data.iter()
        .fold(u32::from(digit) + u32::from(terminator), |acc, b| {
            acc + u32::from(*b)
        })
        .rem_euclid(256) as u8
}

/// Encode a final (`ETX`) frame.
///
/// # Errors
///
/// Returns [`AstmError::Frame`] if `frame_number` is above 7 or `data` contains a control
/// character that would corrupt the framing.
pub fn encode_frame(frame_number: u8, data: &str) -> AstmResult<Vec<u8>> {
    if frame_number > 7 {
        return Err(AstmError::Frame(format!(
            "frame number {frame_number} out of range 0-7"
        )));
    }
    if data
        .bytes()
        .any(|b| matches!(b, STX | ETX | EOT | ENQ | ACK | NAK | ETB | LF))
    {
        return Err(AstmError::Frame(
            "frame data contains reserved control characters".into(),
        ));
    }

    let payload = data.as_bytes();
    let sum = checksum(frame_number, payload, ETX);

    let mut out = Vec::with_capacity(payload.len() + 3 + TRAILER_LEN);
    out.push(STX);
    out.push(b'0' + frame_number);
    out.extend_from_slice(payload);
    out.push(ETX);
    out.extend_from_slice(format!("{sum:02X}").as_bytes());
    out.push(CR);
    out.push(LF);
    Ok(out)
}

/// Decode one complete frame (`STX` through `LF`) and verify its checksum.
///
/// # Errors
///
/// Returns [`AstmError::Frame`] for a missing `STX`, a frame number outside `0`-`7`, a missing
/// terminator, a malformed trailer or a checksum mismatch.
pub fn decode_frame(bytes: &[u8]) -> AstmResult<Frame> {
    let Some((&first, rest)) = bytes.split_first() else {
        return Err(AstmError::Frame("empty frame".into()));
    };
    if first != STX {
        return Err(AstmError::Frame(format!(
            "expected STX (0x02), received 0x{first:02X}"
        )));
    }

    let Some((&digit, rest)) = rest.split_first() else {
        return Err(AstmError::Frame("frame truncated before frame number".into()));
    };
    if !(b'0'..=b'7').contains(&digit) {
        return Err(AstmError::Frame(format!(
            "invalid frame number '{}'",
            digit as char
        )));
    }
    let number = digit - b'0';

    let terminator_at = rest
        .iter()
        .position(|b| *b == ETX || *b == ETB)
        .ok_or_else(|| AstmError::Frame("frame has no ETX/ETB terminator".into()))?;
    let payload = &rest[..terminator_at];
    let terminator = rest[terminator_at];
    let trailer = &rest[terminator_at + 1..];

    if trailer.len() != TRAILER_LEN || trailer[2] != CR || trailer[3] != LF {
        return Err(AstmError::Frame("malformed frame trailer".into()));
    }

    let received = std::str::from_utf8(&trailer[..2])
        .ok()
        .and_then(|hex| u8::from_str_radix(hex, 16).ok())
        .ok_or_else(|| AstmError::Frame("checksum is not two hex digits".into()))?;
    let expected = checksum(number, payload, terminator);
    if received != expected {
        return Err(AstmError::Frame(format!(
            "checksum mismatch: expected {expected:02X}, received {received:02X}"
        )));
    }

    let data = String::from_utf8(payload.to_vec())
        .map_err(|e| AstmError::Frame(format!("frame data is not UTF-8: {e}")))?;

    Ok(Frame {
        number,
        data,
        is_final: terminator == ETX,
    })
}
