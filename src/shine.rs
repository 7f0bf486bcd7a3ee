// ABOUTME: Vendor dongle passthrough session: reads RTU frames, submits them, writes the raw reply back
// ABOUTME: Reconnects with backoff when the Shine port disappears; TCP service is unaffected meanwhile

use crate::error::BrokerError;
use crate::events::Event;
use crate::frame::RtuFrame;
use crate::request::{Origin, RequestDescriptor};
use crate::serial::SerialPort;
use crate::sniff::Sniffer;
use crate::transactor::Transactor;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Runs the Shine passthrough session forever, reconnecting the dongle
/// port with backoff whenever it disappears (spec.md §4.6). This task owns
/// its own serial port exclusively — it is never the inverter port the
/// transactor serializes.
pub async fn run(
    mut port: SerialPort,
    transactor: Arc<Transactor>,
    sniff: Sniffer,
    read_timeout: Duration,
) {
    loop {
        if !port.is_open() {
            port.reopen_with_backoff().await;
            sniff.emit(Event::info("shine", "broker", "shine port opened"));
        }

        let deadline = std::time::Instant::now() + read_timeout;
        let bytes = match port.read_until_deadline(deadline).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "shine port read failed, marking closed");
                port.mark_closed();
                sniff.emit(Event::info("shine", "broker", "shine port closed"));
                continue;
            }
        };

        if bytes.is_empty() {
            continue;
        }
        if bytes.len() < 4 {
            sniff.emit(Event::error("shine", "rtu", 0, 0, &BrokerError::ShortFrame));
            continue;
        }

        let (parsed, crc_ok) = match RtuFrame::parse_received(&bytes) {
            Ok(r) => r,
            Err(_) => {
                sniff.emit(Event::error("shine", "rtu", 0, 0, &BrokerError::ShortFrame));
                continue;
            }
        };
        if !crc_ok {
            sniff.emit(Event::error(
                "shine",
                "rtu",
                parsed.unit,
                parsed.function,
                &BrokerError::CrcMismatch,
            ));
            continue;
        }

        let descriptor = RequestDescriptor::new(
            Origin::Shine,
            parsed.unit,
            parsed.function,
            parsed.payload,
            read_timeout,
        );
        let response = transactor.transact(descriptor).await;
        match response.outcome {
            Ok(outcome) => {
                if let Err(e) = port.write_all(&outcome.bytes).await {
                    warn!(error = %e, "shine port write failed, marking closed");
                    port.mark_closed();
                    sniff.emit(Event::info("shine", "broker", "shine port closed"));
                }
            }
            Err(_) => {
                // No synthetic reply on failure; the dongle retries per its
                // own protocol (spec.md §4.6).
                info!("shine transaction failed, no reply synthesized");
            }
        }
    }
}
