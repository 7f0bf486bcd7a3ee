// ABOUTME: Canonical request/response descriptors moved between upstream sessions and the transactor
// ABOUTME: A descriptor is created by its origin session, consumed by the transactor, and never reused

use crate::error::BrokerError;
use bytes::Bytes;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

/// Where a request originated, carried through so the transactor's sniff
/// events can attribute REQ/RSP pairs (spec.md §3, §4.7).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    Shine,
    Tcp {
        endpoint: SocketAddr,
        peer: SocketAddr,
    },
}

impl Origin {
    /// A short label used in sniff events' `from_client`/`to_client` fields.
    pub fn label(&self) -> String {
        match self {
            Origin::Shine => "shine".to_string(),
            Origin::Tcp { endpoint, peer } => format!("{peer}@{endpoint}"),
        }
    }
}

/// A single downstream transaction to execute. Created by the upstream
/// session that decoded it, moved into `Transactor::transact`, and consumed
/// on completion — descriptors never survive past one transaction
/// (spec.md §3).
#[derive(Debug)]
pub struct RequestDescriptor {
    pub origin: Origin,
    pub unit: u8,
    pub function: u8,
    pub payload: Bytes,
    pub submitted_at: Instant,
    pub deadline: Instant,
}

impl RequestDescriptor {
    pub fn new(origin: Origin, unit: u8, function: u8, payload: Bytes, timeout: Duration) -> Self {
        let submitted_at = Instant::now();
        RequestDescriptor {
            origin,
            unit,
            function,
            payload,
            submitted_at,
            deadline: submitted_at + timeout,
        }
    }
}

/// The bytes of a successful response (unit through CRC, inclusive) plus
/// whether its CRC verified.
#[derive(Debug, Clone)]
pub struct ResponseOutcome {
    pub bytes: Bytes,
    pub crc_ok: bool,
    pub received_at: Instant,
}

/// The outcome of one transaction, returned to whoever submitted the
/// matching `RequestDescriptor`. "Matching" is established structurally by
/// the one-shot reply channel rather than carried as data — only one
/// descriptor is ever waiting on a given channel.
#[derive(Debug, Clone)]
pub struct ResponseDescriptor {
    pub unit: u8,
    pub function: u8,
    pub outcome: Result<ResponseOutcome, BrokerError>,
}

/// A request descriptor paired with the channel its result is delivered on.
/// Upstream sessions hold the receiver; the transactor holds (and consumes)
/// the descriptor plus the matching sender.
pub struct PendingRequest {
    pub request: RequestDescriptor,
    pub reply: oneshot::Sender<ResponseDescriptor>,
}

impl PendingRequest {
    pub fn new(request: RequestDescriptor) -> (Self, oneshot::Receiver<ResponseDescriptor>) {
        let (tx, rx) = oneshot::channel();
        (
            PendingRequest {
                request,
                reply: tx,
            },
            rx,
        )
    }
}
