// ABOUTME: TCP listener accept loop and per-connection MBAP read/submit/reply session
// ABOUTME: One task per listener, one task per accepted connection, both spawned by the supervisor

use crate::frame::{self, FrameError};
use crate::request::{Origin, RequestDescriptor};
use crate::transactor::Transactor;
use bytes::BytesMut;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

/// Accepts connections on `bind` forever, spawning one session task per
/// peer. Mirrors the teacher's listener-then-per-connection-task shape
/// (`new_connection.rs`'s test harness), generalized to a standing server.
pub async fn run_listener(
    bind: SocketAddr,
    transactor: Arc<Transactor>,
    read_timeout: Duration,
) -> Result<(), std::io::Error> {
    let listener = TcpListener::bind(bind).await?;
    info!(%bind, "Modbus/TCP endpoint listening");
    loop {
        let (stream, peer) = listener.accept().await?;
        let transactor = transactor.clone();
        tokio::spawn(async move {
            if let Err(e) = run_session(stream, bind, peer, transactor, read_timeout).await {
                debug!(%peer, error = %e, "TCP session ended");
            }
        });
    }
}

/// One client's MBAP read → submit → reply loop. Requests on a single
/// connection are processed and replied to in arrival order (spec.md §5,
/// per-connection FIFO) because this loop never starts reading the next
/// request before the prior one's reply is written.
async fn run_session(
    stream: TcpStream,
    endpoint: SocketAddr,
    peer: SocketAddr,
    transactor: Arc<Transactor>,
    read_timeout: Duration,
) -> Result<(), std::io::Error> {
    let mut stream = BufWriter::new(stream);
    let mut buffer = BytesMut::with_capacity(4 * 1024);
    info!(%peer, %endpoint, "TCP client connected");

    loop {
        let request = match read_mbap_request(&mut stream, &mut buffer).await? {
            Some(req) => req,
            None => return Ok(()),
        };

        let reply = match request {
            Ok(req) => {
                let transaction_id = req.transaction_id;
                let unit_id = req.unit_id;
                let descriptor = RequestDescriptor::new(
                    Origin::Tcp { endpoint, peer },
                    unit_id,
                    req.function,
                    req.payload,
                    read_timeout,
                );
                let response = transactor.transact(descriptor).await;
                match response.outcome {
                    Ok(outcome) => {
                        // `outcome.bytes` is unit..CRC inclusive and already
                        // CRC-verified by the transactor; strip the 2-byte
                        // header and 2-byte trailer to recover the PDU data.
                        let payload = &outcome.bytes[2..outcome.bytes.len() - 2];
                        frame::encode_mbap(transaction_id, response.unit, response.function, payload)
                    }
                    Err(err) => frame::encode_mbap_exception(
                        transaction_id,
                        unit_id,
                        response.function,
                        err.to_mbap_exception_code(),
                    ),
                }
            }
            Err(()) => {
                // Protocol violation: close the connection with no reply
                // (spec.md §8 boundary behavior).
                return Ok(());
            }
        };

        stream.write_all(&reply).await?;
        stream.flush().await?;
    }
}

/// Reads bytes until a complete MBAP frame is buffered, parses it, and
/// returns `Ok(None)` on a clean peer close or `Err` on a real I/O error.
/// A parsed frame that violates MBAP rules comes back as `Some(Err(()))`
/// so the caller can close without replying, per spec.md's protocol-id rule.
async fn read_mbap_request(
    stream: &mut BufWriter<TcpStream>,
    buffer: &mut BytesMut,
) -> Result<Option<Result<frame::MbapRequest, ()>>, std::io::Error> {
    loop {
        match frame::check_mbap(buffer) {
            Ok(total) => {
                let bytes = buffer.split_to(total);
                return match frame::parse_mbap(&bytes) {
                    Ok(req) => Ok(Some(Ok(req))),
                    Err(_) => Ok(Some(Err(()))),
                };
            }
            Err(FrameError::Incomplete) => {}
            Err(e) => {
                warn!(error = %e, "rejecting malformed MBAP header");
                return Ok(Some(Err(())));
            }
        }

        if 0 == stream.read_buf(buffer).await? {
            return if buffer.is_empty() {
                Ok(None)
            } else {
                Ok(Some(Err(())))
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[tokio::test]
    async fn reads_one_complete_mbap_frame_from_two_chunks() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let req = [0x00u8, 0x01, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03, 0x00, 0x00, 0x00, 0x02];

        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            stream.write_all(&req[..4]).await.unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
            stream.write_all(&req[4..]).await.unwrap();
        });

        let (stream, _peer) = listener.accept().await.unwrap();
        let mut buffered = BufWriter::new(stream);
        let mut buffer = BytesMut::with_capacity(1024);
        let parsed = read_mbap_request(&mut buffered, &mut buffer)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(parsed.transaction_id, 1);
        assert_eq!(parsed.unit_id, 1);
        assert_eq!(parsed.function, 0x03);

        client.await.unwrap();
    }

    #[tokio::test]
    async fn clean_close_with_no_bytes_returns_none() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let _stream = TcpStream::connect(addr).await.unwrap();
        });

        let (stream, _peer) = listener.accept().await.unwrap();
        let mut buffered = BufWriter::new(stream);
        let mut buffer = BytesMut::with_capacity(1024);
        let result = read_mbap_request(&mut buffered, &mut buffer).await.unwrap();
        assert!(result.is_none());

        client.await.unwrap();
    }

    #[test]
    fn buffer_split_to_consumes_exact_frame() {
        let mut buf = BytesMut::from(&b"\x00\x01\x00\x00\x00\x06\x01\x03\x00\x00\x00\x02extra"[..]);
        let total = frame::check_mbap(&buf).unwrap();
        let frame_bytes = buf.split_to(total);
        assert_eq!(frame_bytes.len(), 12);
        assert_eq!(&buf[..], b"extra");
    }
}
