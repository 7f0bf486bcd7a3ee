// ABOUTME: Crate-level error taxonomy shared by the transactor, TCP sessions, and Shine session
// ABOUTME: Every downstream I/O failure is translated into one of these before reaching a caller

use thiserror::Error;

/// Failure taxonomy for a transaction that did not complete normally
/// (spec.md §7). These never propagate as panics or unhandled task
/// failures — they are always returned as part of a `ResponseDescriptor`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// No bytes received within the configured read-timeout.
    #[error("downstream transaction timed out")]
    Timeout,

    /// Fewer than 4 bytes received before the read-timeout elapsed.
    #[error("response frame shorter than 4 bytes")]
    ShortFrame,

    /// Bytes were received but the trailing CRC16 did not verify.
    #[error("response frame failed CRC check")]
    CrcMismatch,

    /// The OS reported a write error on the downstream port.
    #[error("write to downstream port failed")]
    WriteFailed,

    /// The downstream port is currently closed, pending a reopen.
    #[error("downstream port is closed")]
    PortClosed,

    /// An upstream frame violated MBAP header rules.
    #[error("upstream protocol violation: {0}")]
    ProtocolError(&'static str),

    /// An observer's pending queue was full and it was evicted.
    #[error("observer queue overrun")]
    Overrun,

    /// The supervisor is shutting down and this transaction was abandoned.
    #[error("broker is shutting down")]
    Shutdown,
}

impl BrokerError {
    /// Maps a failed transaction to the Modbus gateway exception code a TCP
    /// client should see (spec.md §4.5, §7). Only the variants that can
    /// actually occur after a request has been submitted to the transactor
    /// are mapped; `ProtocolError`/`Overrun` never reach this path.
    pub fn to_mbap_exception_code(&self) -> u8 {
        use crate::frame::exception;
        match self {
            BrokerError::Timeout => exception::GATEWAY_TARGET_FAILED_TO_RESPOND,
            BrokerError::CrcMismatch | BrokerError::WriteFailed => exception::SLAVE_DEVICE_FAILURE,
            BrokerError::PortClosed => exception::GATEWAY_PATH_UNAVAILABLE,
            BrokerError::ShortFrame => exception::GATEWAY_TARGET_FAILED_TO_RESPOND,
            BrokerError::Shutdown => exception::GATEWAY_PATH_UNAVAILABLE,
            BrokerError::ProtocolError(_) | BrokerError::Overrun => exception::SLAVE_DEVICE_FAILURE,
        }
    }

    /// The `reason` string an observer sees on an ERR event (spec.md §4.7).
    pub fn reason(&self) -> &'static str {
        match self {
            BrokerError::Timeout => "Timeout",
            BrokerError::ShortFrame => "ShortFrame",
            BrokerError::CrcMismatch => "CrcMismatch",
            BrokerError::WriteFailed => "WriteFailed",
            BrokerError::PortClosed => "PortClosed",
            BrokerError::ProtocolError(_) => "ProtocolError",
            BrokerError::Overrun => "Overrun",
            BrokerError::Shutdown => "Shutdown",
        }
    }
}

/// Convenience result alias for non-hot-path code (startup, config loading),
/// mirroring the teacher crate's boxed-error `Result<T>` for code outside
/// the transaction taxonomy above.
pub type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_maps_to_gateway_target_failed() {
        assert_eq!(BrokerError::Timeout.to_mbap_exception_code(), 0x0B);
    }

    #[test]
    fn crc_mismatch_maps_to_slave_device_failure() {
        assert_eq!(BrokerError::CrcMismatch.to_mbap_exception_code(), 0x04);
    }

    #[test]
    fn port_closed_maps_to_gateway_path_unavailable() {
        assert_eq!(BrokerError::PortClosed.to_mbap_exception_code(), 0x0A);
    }
}
