// ABOUTME: Sniff event schema plus the best-effort function-code decoder
// ABOUTME: Produces the newline-delimited JSON objects observers and the log file receive

use crate::error::BrokerError;
use crate::frame::function;
use chrono::Utc;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Role {
    Req,
    Rsp,
    Err,
    Info,
}

/// One sniff event, wire-compatible with spec.md §4.7's JSON shape. Field
/// order matches the spec's example object for readability in captured logs.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub ts: String,
    pub role: Role,
    pub from_client: String,
    pub to_client: String,
    pub uid: u8,
    pub func: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub addr: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<u16>,
    pub bytes: usize,
    pub crc_ok: bool,
    pub hex: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<&'static str>,
}

impl Event {
    fn now() -> String {
        Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
    }

    /// A REQ event, emitted before any bytes are written downstream
    /// (spec.md §5, ordering guarantee 3).
    pub fn request(from: &str, to: &str, uid: u8, func: u8, payload: &[u8], wire: &[u8]) -> Self {
        let (addr, count, value) = decode_request(func, payload);
        Event {
            ts: Self::now(),
            role: Role::Req,
            from_client: from.to_string(),
            to_client: to.to_string(),
            uid,
            func,
            addr,
            count,
            value,
            bytes: wire.len(),
            crc_ok: true,
            hex: hex_lower(wire),
            reason: None,
        }
    }

    /// An RSP event for a completed, CRC-verified transaction.
    pub fn response(from: &str, to: &str, uid: u8, func: u8, wire: &[u8], crc_ok: bool) -> Self {
        Event {
            ts: Self::now(),
            role: Role::Rsp,
            from_client: from.to_string(),
            to_client: to.to_string(),
            uid,
            func,
            addr: None,
            count: None,
            value: None,
            bytes: wire.len(),
            crc_ok,
            hex: hex_lower(wire),
            reason: None,
        }
    }

    /// An ERR event, naming the failure taxonomy variant (spec.md §7).
    pub fn error(from: &str, to: &str, uid: u8, func: u8, err: &BrokerError) -> Self {
        Event {
            ts: Self::now(),
            role: Role::Err,
            from_client: from.to_string(),
            to_client: to.to_string(),
            uid,
            func,
            addr: None,
            count: None,
            value: None,
            bytes: 0,
            crc_ok: false,
            hex: String::new(),
            reason: Some(err.reason()),
        }
    }

    /// An INFO lifecycle event (port open/close, observer join, shutdown).
    pub fn info(from: &str, to: &str, message: &str) -> Self {
        Event {
            ts: Self::now(),
            role: Role::Info,
            from_client: from.to_string(),
            to_client: to.to_string(),
            uid: 0,
            func: 0,
            addr: None,
            count: None,
            value: None,
            bytes: 0,
            crc_ok: false,
            hex: message.to_string(),
            reason: None,
        }
    }

    pub fn to_json_line(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

fn hex_lower(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Best-effort request-side decoder for the common function codes
/// (spec.md §4.7, §9). Unknown function codes leave all three fields absent.
fn decode_request(func: u8, payload: &[u8]) -> (Option<u16>, Option<u16>, Option<u16>) {
    match func {
        function::READ_HOLDING_REGISTERS | function::READ_INPUT_REGISTERS => {
            if payload.len() >= 4 {
                let addr = u16::from_be_bytes([payload[0], payload[1]]);
                let count = u16::from_be_bytes([payload[2], payload[3]]);
                (Some(addr), Some(count), None)
            } else {
                (None, None, None)
            }
        }
        function::WRITE_SINGLE_REGISTER => {
            if payload.len() >= 4 {
                let addr = u16::from_be_bytes([payload[0], payload[1]]);
                let value = u16::from_be_bytes([payload[2], payload[3]]);
                (Some(addr), None, Some(value))
            } else {
                (None, None, None)
            }
        }
        function::WRITE_MULTIPLE_REGISTERS => {
            if payload.len() >= 4 {
                let addr = u16::from_be_bytes([payload[0], payload[1]]);
                let count = u16::from_be_bytes([payload[2], payload[3]]);
                (Some(addr), Some(count), None)
            } else {
                (None, None, None)
            }
        }
        _ => (None, None, None),
    }
}
