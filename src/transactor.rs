// ABOUTME: Single-holder downstream arbiter: acquire, pace, write, read, release
// ABOUTME: transact() is the only place that touches the inverter serial port

use crate::error::BrokerError;
use crate::events::Event;
use crate::frame::RtuFrame;
use crate::request::{Origin, RequestDescriptor, ResponseDescriptor, ResponseOutcome};
use crate::serial::SerialPort;
use crate::sniff::Sniffer;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Shared pacing + port state, held by one `tokio::sync::Mutex` so every
/// transaction is strictly serialized (spec.md §4.2, §5). Acquiring this
/// mutex is itself the suspension point that realizes global FIFO ordering
/// among waiters.
struct Downstream {
    port: SerialPort,
    last_tx_end: Instant,
}

pub struct Transactor {
    downstream: Mutex<Downstream>,
    min_period: Duration,
    read_timeout: Duration,
    sniff: Sniffer,
}

impl Transactor {
    pub fn new(port: SerialPort, min_period: Duration, read_timeout: Duration, sniff: Sniffer) -> Self {
        Transactor {
            downstream: Mutex::new(Downstream {
                port,
                last_tx_end: Instant::now() - min_period,
            }),
            min_period,
            read_timeout,
            sniff,
        }
    }

    /// Executes one request end to end against the downstream bus. Never
    /// returns an `Err` to its caller in the sense of a panicking I/O
    /// failure — every downstream failure becomes a `ResponseDescriptor`
    /// carrying a `BrokerError` (spec.md §7 propagation policy).
    pub async fn transact(&self, request: RequestDescriptor) -> ResponseDescriptor {
        let origin_label = request.origin.label();
        let unit = request.unit;
        let function = request.function;

        if Instant::now() >= request.deadline {
            return self.fail(&request, BrokerError::Timeout);
        }

        let mut guard = self.downstream.lock().await;

        let now = Instant::now();
        let earliest = guard.last_tx_end + self.min_period;
        if now < earliest {
            tokio::time::sleep(earliest - now).await;
        }

        if !guard.port.is_open() {
            if let Err(e) = guard.port.ensure_open().await {
                warn!(error = %e, "downstream port unavailable at transaction time");
                let response = self.fail(&request, BrokerError::PortClosed);
                drop(guard);
                return response;
            }
        }

        // spec.md §4.4 step 3: drain any reply left over from the previous
        // transaction before writing this one's request, so a late byte
        // can't be mistaken for this transaction's response.
        if let Err(e) = guard.port.drain_input().await {
            warn!(error = %e, "downstream drain failed");
            guard.port.mark_closed();
            let response = self.fail(&request, BrokerError::PortClosed);
            drop(guard);
            return response;
        }

        let frame = RtuFrame::new(unit, function, request.payload.clone());
        let wire = frame.to_bytes();

        self.sniff.emit(Event::request(
            &origin_label,
            "rtu",
            unit,
            function,
            &request.payload,
            &wire,
        ));

        if let Err(e) = guard.port.write_all(&wire).await {
            warn!(error = %e, "downstream write failed");
            guard.port.mark_closed();
            guard.last_tx_end = Instant::now();
            let response = self.fail(&request, BrokerError::WriteFailed);
            drop(guard);
            return response;
        }
        guard.last_tx_end = Instant::now();

        let deadline = guard.last_tx_end + self.read_timeout.min(
            request
                .deadline
                .saturating_duration_since(guard.last_tx_end),
        );
        let bytes = match guard.port.read_until_deadline(deadline).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "downstream read failed");
                guard.port.mark_closed();
                let response = self.fail(&request, BrokerError::PortClosed);
                drop(guard);
                return response;
            }
        };

        // The guard is held through every RSP/ERR emit below (spec.md §5
        // ordering guarantee 3, invariant 5): releasing it before the event
        // is seen would let another transaction's REQ land between this
        // one's REQ and RSP/ERR on the sniff stream.
        let response = if bytes.is_empty() {
            self.fail(&request, BrokerError::Timeout)
        } else if bytes.len() < 4 {
            self.fail(&request, BrokerError::ShortFrame)
        } else {
            match RtuFrame::parse_received(&bytes) {
                Err(_) => self.fail(&request, BrokerError::ShortFrame),
                Ok((parsed, crc_ok)) => {
                    self.sniff.emit(Event::response(
                        "rtu",
                        &origin_label,
                        parsed.unit,
                        parsed.function,
                        &bytes,
                        crc_ok,
                    ));
                    if !crc_ok {
                        self.fail(&request, BrokerError::CrcMismatch)
                    } else {
                        debug!(unit, function, bytes = bytes.len(), "transaction completed");
                        ResponseDescriptor {
                            unit: parsed.unit,
                            function: parsed.function,
                            outcome: Ok(ResponseOutcome {
                                bytes: bytes.into(),
                                crc_ok,
                                received_at: Instant::now(),
                            }),
                        }
                    }
                }
            }
        };
        drop(guard);
        response
    }

    fn fail(&self, request: &RequestDescriptor, err: BrokerError) -> ResponseDescriptor {
        self.sniff.emit(Event::error(
            &request.origin.label(),
            "rtu",
            request.unit,
            request.function,
            &err,
        ));
        ResponseDescriptor {
            unit: request.unit,
            function: request.function,
            outcome: Err(err),
        }
    }

    /// Waits up to `grace` for any transaction currently holding the
    /// downstream mutex to finish, then returns regardless (spec.md §4.8).
    /// Because the mutex admits at most one holder, a successful acquire
    /// here is proof nothing is still mid-transaction; the supervisor calls
    /// this before tearing down the tasks that submit work to this
    /// transactor.
    pub async fn drain(&self, grace: Duration) {
        if tokio::time::timeout(grace, self.downstream.lock()).await.is_err() {
            warn!(grace_ms = grace.as_millis(), "shutdown grace deadline elapsed with a transaction still in flight");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crc;
    use crate::serial::{LineConfig, SerialParity};
    use bytes::Bytes;

    fn line() -> LineConfig {
        LineConfig {
            baud: 9600,
            data_bits: 8,
            parity: SerialParity::None,
            stop_bits: 1,
        }
    }

    #[tokio::test]
    async fn transact_against_closed_port_reports_port_closed() {
        let port = SerialPort::new("/dev/null-nonexistent-test", line());
        let (sniffer, _rx, _bc) = crate::sniff::Broadcaster::new(None);
        let transactor = Transactor::new(port, Duration::from_millis(1), Duration::from_millis(50), sniffer);
        let request = RequestDescriptor::new(Origin::Shine, 1, 0x03, Bytes::new(), Duration::from_millis(200));
        let response = transactor.transact(request).await;
        assert_eq!(response.outcome.unwrap_err(), BrokerError::PortClosed);
    }

    #[tokio::test]
    async fn already_expired_deadline_reports_timeout_without_touching_port() {
        let port = SerialPort::new("/dev/null-nonexistent-test", line());
        let (sniffer, _rx, _bc) = crate::sniff::Broadcaster::new(None);
        let transactor = Transactor::new(port, Duration::from_millis(1), Duration::from_millis(50), sniffer);
        let mut request = RequestDescriptor::new(Origin::Shine, 1, 0x03, Bytes::new(), Duration::from_millis(200));
        request.deadline = Instant::now() - Duration::from_millis(1);
        let response = transactor.transact(request).await;
        assert_eq!(response.outcome.unwrap_err(), BrokerError::Timeout);
    }

    #[tokio::test]
    async fn successful_transaction_returns_crc_verified_bytes() {
        let (here, mut there) = tokio::io::duplex(256);
        let port = SerialPort::from_stream("test", line(), here);
        let (sniffer, mut rx, _bc) = crate::sniff::Broadcaster::new(None);
        let transactor = Transactor::new(port, Duration::from_millis(1), Duration::from_millis(200), sniffer);

        let responder = tokio::spawn(async move {
            use tokio::io::{AsyncReadExt, AsyncWriteExt};
            let mut req = [0u8; 8];
            there.read_exact(&mut req).await.unwrap();
            let reply = crc::append(&[0x01, 0x03, 0x04, 0x00, 0x64, 0x00, 0x00]);
            there.write_all(&reply).await.unwrap();
            there.flush().await.unwrap();
        });

        let request = RequestDescriptor::new(
            Origin::Shine,
            1,
            0x03,
            Bytes::from_static(&[0x00, 0x00, 0x00, 0x02]),
            Duration::from_millis(500),
        );
        let response = transactor.transact(request).await;
        let outcome = response.outcome.unwrap();
        assert!(outcome.crc_ok);
        assert_eq!(response.unit, 1);
        assert_eq!(response.function, 0x03);

        // Both the REQ and RSP events were emitted, in order.
        let req_event = rx.recv().await.unwrap();
        assert_eq!(req_event.role, crate::events::Role::Req);
        let rsp_event = rx.recv().await.unwrap();
        assert_eq!(rsp_event.role, crate::events::Role::Rsp);

        responder.await.unwrap();
    }

    #[tokio::test]
    async fn bad_crc_on_response_reports_crc_mismatch() {
        let (here, mut there) = tokio::io::duplex(256);
        let port = SerialPort::from_stream("test", line(), here);
        let (sniffer, _rx, _bc) = crate::sniff::Broadcaster::new(None);
        let transactor = Transactor::new(port, Duration::from_millis(1), Duration::from_millis(200), sniffer);

        let responder = tokio::spawn(async move {
            use tokio::io::{AsyncReadExt, AsyncWriteExt};
            let mut req = [0u8; 8];
            there.read_exact(&mut req).await.unwrap();
            there.write_all(&[0x01, 0x03, 0x02, 0x00, 0x00, 0xDE, 0xAD]).await.unwrap();
            there.flush().await.unwrap();
        });

        let request = RequestDescriptor::new(
            Origin::Shine,
            1,
            0x03,
            Bytes::from_static(&[0x00, 0x00, 0x00, 0x01]),
            Duration::from_millis(500),
        );
        let response = transactor.transact(request).await;
        assert_eq!(response.outcome.unwrap_err(), BrokerError::CrcMismatch);

        responder.await.unwrap();
    }

    #[tokio::test]
    async fn stale_bytes_left_over_from_a_prior_transaction_are_drained_before_the_real_reply() {
        let (here, mut there) = tokio::io::duplex(256);
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        // A late reply the previous transaction never read, still sitting
        // in the port buffer when this transaction starts.
        there.write_all(&[0xAA, 0xBB, 0xCC]).await.unwrap();
        there.flush().await.unwrap();
        tokio::task::yield_now().await;

        let port = SerialPort::from_stream("test", line(), here);
        let (sniffer, _rx, _bc) = crate::sniff::Broadcaster::new(None);
        let transactor = Transactor::new(port, Duration::from_millis(1), Duration::from_millis(200), sniffer);

        let expected_reply = crc::append(&[0x01, 0x03, 0x04, 0x00, 0x64, 0x00, 0x00]);
        let expected_reply_for_responder = expected_reply.clone();
        let responder = tokio::spawn(async move {
            let mut req = [0u8; 8];
            there.read_exact(&mut req).await.unwrap();
            there.write_all(&expected_reply_for_responder).await.unwrap();
            there.flush().await.unwrap();
        });

        let request = RequestDescriptor::new(
            Origin::Shine,
            1,
            0x03,
            Bytes::from_static(&[0x00, 0x00, 0x00, 0x02]),
            Duration::from_millis(500),
        );
        let response = transactor.transact(request).await;
        let outcome = response.outcome.unwrap();
        assert!(outcome.crc_ok);
        assert_eq!(&outcome.bytes[..], &expected_reply[..]);

        responder.await.unwrap();
    }

    #[tokio::test]
    async fn drain_returns_promptly_when_nothing_is_in_flight() {
        let port = SerialPort::new("/dev/null-nonexistent-test", line());
        let (sniffer, _rx, _bc) = crate::sniff::Broadcaster::new(None);
        let transactor = Transactor::new(port, Duration::from_millis(1), Duration::from_millis(50), sniffer);
        transactor.drain(Duration::from_millis(50)).await;
    }
}
