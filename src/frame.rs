// ABOUTME: RTU frame and MBAP frame parsing/emission for the downstream and upstream legs
// ABOUTME: Two-phase check/parse split mirrors the teacher codec's Frame::check / Frame::parse

use crate::crc;
use bytes::{Buf, Bytes};
use std::io::Cursor;
use thiserror::Error;

/// Common Modbus function codes this broker decodes for the sniff stream.
/// Framing itself is function-code agnostic; only the best-effort decoder
/// in `events.rs` special-cases these.
pub mod function {
    pub const READ_HOLDING_REGISTERS: u8 = 0x03;
    pub const READ_INPUT_REGISTERS: u8 = 0x04;
    pub const WRITE_SINGLE_REGISTER: u8 = 0x06;
    pub const WRITE_MULTIPLE_REGISTERS: u8 = 0x10;

    /// The high bit set on a function code marks a Modbus exception response.
    pub const EXCEPTION_BIT: u8 = 0x80;
}

/// Modbus gateway exception codes used when the broker itself cannot relay
/// a transaction to a TCP client (spec.md §4.5, §7).
pub mod exception {
    pub const SLAVE_DEVICE_FAILURE: u8 = 0x04;
    pub const GATEWAY_PATH_UNAVAILABLE: u8 = 0x0A;
    pub const GATEWAY_TARGET_FAILED_TO_RESPOND: u8 = 0x0B;
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("fewer than 4 bytes in frame")]
    ShortFrame,
    #[error("not enough data buffered yet")]
    Incomplete,
    #[error("MBAP protocol-id must be 0, got {0}")]
    NonZeroProtocolId(u16),
    #[error("MBAP length field out of range: {0}")]
    BadLength(u16),
}

/// A parsed Modbus RTU frame, CRC stripped: unit-id, function, payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtuFrame {
    pub unit: u8,
    pub function: u8,
    pub payload: Bytes,
}

impl RtuFrame {
    pub fn new(unit: u8, function: u8, payload: impl Into<Bytes>) -> Self {
        RtuFrame {
            unit,
            function,
            payload: payload.into(),
        }
    }

    /// Serializes unit+function+payload and appends a freshly computed CRC.
    /// Invariant 4 in spec.md §3: CRC on any emitted downstream frame is
    /// always recomputed, never trusted from the caller.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(2 + self.payload.len());
        body.push(self.unit);
        body.push(self.function);
        body.extend_from_slice(&self.payload);
        crc::append(&body)
    }

    /// Parses a complete received frame of raw wire bytes (CRC included).
    /// Returns the frame plus whether its CRC verified. Callers decide what
    /// to do with a `crc_ok == false` result (spec.md invariant 4: inbound
    /// bytes aren't treated as a valid response until this check passes).
    pub fn parse_received(bytes: &[u8]) -> Result<(Self, bool), FrameError> {
        if bytes.len() < 4 {
            return Err(FrameError::ShortFrame);
        }
        let crc_ok = crc::verify(bytes);
        let body = &bytes[..bytes.len() - 2];
        let unit = body[0];
        let function = body[1];
        let payload = Bytes::copy_from_slice(&body[2..]);
        Ok((
            RtuFrame {
                unit,
                function,
                payload,
            },
            crc_ok,
        ))
    }
}

/// A decoded MBAP header plus the PDU bytes (function + data) that followed it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MbapRequest {
    pub transaction_id: u16,
    pub unit_id: u8,
    pub function: u8,
    pub payload: Bytes,
}

/// Checks whether `src` holds a complete MBAP frame, without allocating.
/// Mirrors the teacher's `Frame::check` — cheap enough to call before every
/// read, returning the number of header+PDU bytes to consume on success.
pub fn check_mbap(src: &[u8]) -> Result<usize, FrameError> {
    if src.len() < 7 {
        return Err(FrameError::Incomplete);
    }
    let mut cur = Cursor::new(src);
    let _transaction_id = cur.get_u16();
    let protocol_id = cur.get_u16();
    if protocol_id != 0 {
        return Err(FrameError::NonZeroProtocolId(protocol_id));
    }
    let length = cur.get_u16();
    if length < 2 || length > 253 {
        return Err(FrameError::BadLength(length));
    }
    let total = 6 + length as usize;
    if src.len() < total {
        return Err(FrameError::Incomplete);
    }
    Ok(total)
}

/// Parses an MBAP frame already known (via `check_mbap`) to be complete.
pub fn parse_mbap(src: &[u8]) -> Result<MbapRequest, FrameError> {
    let mut cur = Cursor::new(src);
    let transaction_id = cur.get_u16();
    let protocol_id = cur.get_u16();
    if protocol_id != 0 {
        return Err(FrameError::NonZeroProtocolId(protocol_id));
    }
    let length = cur.get_u16();
    if length < 2 || length > 253 {
        return Err(FrameError::BadLength(length));
    }
    let unit_id = cur.get_u8();
    let function = cur.get_u8();
    let data_len = length as usize - 2;
    if cur.remaining() < data_len {
        return Err(FrameError::Incomplete);
    }
    let start = cur.position() as usize;
    let payload = Bytes::copy_from_slice(&src[start..start + data_len]);
    Ok(MbapRequest {
        transaction_id,
        unit_id,
        function,
        payload,
    })
}

/// Assembles an MBAP reply from a transaction-id, unit-id, and PDU bytes
/// (function + data, CRC already stripped).
pub fn encode_mbap(transaction_id: u16, unit_id: u8, function: u8, payload: &[u8]) -> Vec<u8> {
    let pdu_len = 1 + payload.len(); // function byte + data
    let length = 1 + pdu_len as u16; // unit_id + pdu
    let mut out = Vec::with_capacity(7 + pdu_len);
    out.extend_from_slice(&transaction_id.to_be_bytes());
    out.extend_from_slice(&0u16.to_be_bytes());
    out.extend_from_slice(&length.to_be_bytes());
    out.push(unit_id);
    out.push(function);
    out.extend_from_slice(payload);
    out
}

/// Builds an MBAP exception reply: function with the high bit set, plus a
/// single exception-code byte (spec.md §4.5).
pub fn encode_mbap_exception(transaction_id: u16, unit_id: u8, function: u8, exception_code: u8) -> Vec<u8> {
    encode_mbap(
        transaction_id,
        unit_id,
        function | function::EXCEPTION_BIT,
        &[exception_code],
    )
}
