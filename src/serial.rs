// ABOUTME: Async serial port adapter the transactor holds exclusively
// ABOUTME: Abstracted behind DuplexPort so tests substitute tokio::io::duplex() for real hardware

use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_serial::{DataBits, Parity, SerialPortBuilderExt, StopBits};
use tracing::{info, warn};

/// The half-duplex byte stream the transactor writes requests to and reads
/// responses from. Implemented by `tokio_serial::SerialStream` for real
/// hardware and by `tokio::io::DuplexStream` in tests.
pub trait DuplexPort: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> DuplexPort for T {}

/// Serial line parameters for one leg of the bus (spec.md §6). Both the
/// Shine dongle port and the inverter port share this shape, with
/// independent values when overridden.
#[derive(Debug, Clone, Copy)]
pub struct LineConfig {
    pub baud: u32,
    pub data_bits: u8,
    pub parity: SerialParity,
    pub stop_bits: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SerialParity {
    None,
    Even,
    Odd,
}

impl LineConfig {
    fn to_tokio_serial(
        self,
    ) -> (DataBits, Parity, StopBits) {
        let data_bits = match self.data_bits {
            5 => DataBits::Five,
            6 => DataBits::Six,
            7 => DataBits::Seven,
            _ => DataBits::Eight,
        };
        let parity = match self.parity {
            SerialParity::None => Parity::None,
            SerialParity::Even => Parity::Even,
            SerialParity::Odd => Parity::Odd,
        };
        let stop_bits = match self.stop_bits {
            2 => StopBits::Two,
            _ => StopBits::One,
        };
        (data_bits, parity, stop_bits)
    }
}

/// Owns the downstream serial port. A single `SerialPort` instance is ever
/// constructed for the inverter leg; it lives inside the transactor's
/// mutex so only one transaction touches the wire at a time (spec.md §4.2).
pub struct SerialPort {
    path: String,
    line: LineConfig,
    inner: Option<Box<dyn DuplexPort>>,
    reopen_backoff: Duration,
}

impl SerialPort {
    pub fn new(path: impl Into<String>, line: LineConfig) -> Self {
        SerialPort {
            path: path.into(),
            line,
            inner: None,
            reopen_backoff: Duration::from_millis(250),
        }
    }

    /// Builds a port already backed by an arbitrary `DuplexPort`, bypassing
    /// `ensure_open`'s real-hardware dial. Used by tests to substitute
    /// `tokio::io::duplex()` for the transactor's read/write logic.
    #[cfg(test)]
    pub fn from_stream(path: impl Into<String>, line: LineConfig, stream: impl DuplexPort + 'static) -> Self {
        SerialPort {
            path: path.into(),
            line,
            inner: Some(Box::new(stream)),
            reopen_backoff: Duration::from_millis(250),
        }
    }

    pub fn is_open(&self) -> bool {
        self.inner.is_some()
    }

    /// Opens the port if it isn't already. Called lazily on first use and
    /// again after any I/O error forces a close (spec.md §4.8). Flushes
    /// both directions on a freshly opened handle (spec.md §4.3): any bytes
    /// left buffered by a prior process on this device are drained before
    /// the port is handed back to the caller.
    pub async fn ensure_open(&mut self) -> Result<(), std::io::Error> {
        if self.inner.is_some() {
            return Ok(());
        }
        let (data_bits, parity, stop_bits) = self.line.to_tokio_serial();
        let stream = tokio_serial::new(&self.path, self.line.baud)
            .data_bits(data_bits)
            .parity(parity)
            .stop_bits(stop_bits)
            .open_native_async()?;
        info!(port = %self.path, baud = self.line.baud, "opened serial port");
        self.inner = Some(Box::new(stream));
        self.drain_input().await?;
        Ok(())
    }

    /// Retries `ensure_open` with a capped linear backoff. Called from the
    /// supervisor's reconnect loop when the port was found closed.
    pub async fn reopen_with_backoff(&mut self) {
        loop {
            match self.ensure_open().await {
                Ok(()) => return,
                Err(e) => {
                    warn!(port = %self.path, error = %e, backoff_ms = self.reopen_backoff.as_millis(), "failed to reopen serial port, retrying");
                    tokio::time::sleep(self.reopen_backoff).await;
                    self.reopen_backoff = (self.reopen_backoff * 2).min(Duration::from_secs(5));
                }
            }
        }
    }

    /// Reads and discards whatever is already buffered on the port without
    /// blocking for new bytes (spec.md §4.4 step 3). Mirrors the reference
    /// `im-jababa-rust-modbus-rtu` master's `port.clear()` before `send()` —
    /// under the relaxed read-until-timeout model (spec.md §9 Q1) a late
    /// reply left over from the previous transaction would otherwise be
    /// read as this transaction's response.
    pub async fn drain_input(&mut self) -> Result<(), std::io::Error> {
        let port = match self.inner.as_mut() {
            Some(p) => p,
            None => return Ok(()),
        };
        let mut chunk = [0u8; 256];
        loop {
            match tokio::time::timeout(Duration::from_millis(0), port.read(&mut chunk)).await {
                Ok(Ok(0)) => break,
                Ok(Ok(_)) => continue,
                Ok(Err(e)) => return Err(e),
                Err(_elapsed) => break,
            }
        }
        Ok(())
    }

    /// Marks the port closed after an I/O failure, so the next transaction
    /// reports `PortClosed` instead of attempting a write on a dead handle.
    pub fn mark_closed(&mut self) {
        self.inner = None;
        self.reopen_backoff = Duration::from_millis(250);
    }

    /// Writes `frame` in full, flushing immediately. Modbus slaves treat any
    /// inter-byte gap as a new frame boundary, so this must not be split
    /// across multiple syscalls with awaits that could starve mid-write.
    pub async fn write_all(&mut self, frame: &[u8]) -> Result<(), std::io::Error> {
        let port = self.inner.as_mut().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotConnected, "serial port closed")
        })?;
        port.write_all(frame).await?;
        port.flush().await
    }

    /// Reads bytes until `deadline` elapses, returning whatever accumulated.
    /// Mirrors the teacher pack's blocking read-until-timeout idiom
    /// (`im-jababa`'s `Master::read`), adapted to async and a hard wall
    /// clock deadline instead of a single fixed timeout argument.
    pub async fn read_until_deadline(&mut self, deadline: Instant) -> Result<Vec<u8>, std::io::Error> {
        let port = self.inner.as_mut().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotConnected, "serial port closed")
        })?;
        let mut buf = Vec::with_capacity(256);
        let mut chunk = [0u8; 256];
        loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let remaining = deadline - now;
            match tokio::time::timeout(remaining, port.read(&mut chunk)).await {
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => {
                    buf.extend_from_slice(&chunk[..n]);
                    if buf.len() >= 256 {
                        break;
                    }
                }
                Ok(Err(e)) => return Err(e),
                Err(_elapsed) => break,
            }
        }
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_config_maps_data_bits() {
        let line = LineConfig {
            baud: 9600,
            data_bits: 7,
            parity: SerialParity::Even,
            stop_bits: 2,
        };
        let (d, p, s) = line.to_tokio_serial();
        assert_eq!(d, DataBits::Seven);
        assert_eq!(p, Parity::Even);
        assert_eq!(s, StopBits::Two);
    }

    #[test]
    fn default_eight_n_one() {
        let line = LineConfig {
            baud: 9600,
            data_bits: 8,
            parity: SerialParity::None,
            stop_bits: 1,
        };
        let (d, p, s) = line.to_tokio_serial();
        assert_eq!(d, DataBits::Eight);
        assert_eq!(p, Parity::None);
        assert_eq!(s, StopBits::One);
    }

    #[tokio::test]
    async fn closed_port_reports_not_connected() {
        let mut port = SerialPort::new("/dev/null-test-path", LineConfig {
            baud: 9600,
            data_bits: 8,
            parity: SerialParity::None,
            stop_bits: 1,
        });
        let err = port.write_all(&[0x01]).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::NotConnected);
    }

    fn line_9600_8n1() -> LineConfig {
        LineConfig {
            baud: 9600,
            data_bits: 8,
            parity: SerialParity::None,
            stop_bits: 1,
        }
    }

    #[tokio::test]
    async fn write_all_delivers_bytes_to_the_duplex_peer() {
        let (here, mut there) = tokio::io::duplex(64);
        let mut port = SerialPort::from_stream("test", line_9600_8n1(), here);
        port.write_all(&[0x01, 0x03, 0x00, 0x00]).await.unwrap();

        let mut buf = [0u8; 4];
        there.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [0x01, 0x03, 0x00, 0x00]);
    }

    #[tokio::test]
    async fn read_until_deadline_returns_what_arrived_before_timeout() {
        let (here, mut there) = tokio::io::duplex(64);
        let mut port = SerialPort::from_stream("test", line_9600_8n1(), here);
        there.write_all(&[0xAA, 0xBB, 0xCC]).await.unwrap();
        there.flush().await.unwrap();

        let deadline = Instant::now() + Duration::from_millis(100);
        let bytes = port.read_until_deadline(deadline).await.unwrap();
        assert_eq!(bytes, vec![0xAA, 0xBB, 0xCC]);
    }

    #[tokio::test]
    async fn read_until_deadline_times_out_on_silence() {
        let (here, _there) = tokio::io::duplex(64);
        let mut port = SerialPort::from_stream("test", line_9600_8n1(), here);

        let deadline = Instant::now() + Duration::from_millis(20);
        let bytes = port.read_until_deadline(deadline).await.unwrap();
        assert!(bytes.is_empty());
    }

    #[tokio::test]
    async fn drain_input_consumes_buffered_bytes_without_blocking() {
        let (here, mut there) = tokio::io::duplex(64);
        let mut port = SerialPort::from_stream("test", line_9600_8n1(), here);
        there.write_all(&[0xDE, 0xAD, 0xBE, 0xEF]).await.unwrap();
        there.flush().await.unwrap();
        tokio::task::yield_now().await;

        port.drain_input().await.unwrap();

        let deadline = Instant::now() + Duration::from_millis(20);
        let bytes = port.read_until_deadline(deadline).await.unwrap();
        assert!(bytes.is_empty(), "drain_input should have consumed the stale bytes");
    }

    #[tokio::test]
    async fn drain_input_on_idle_port_is_a_no_op() {
        let (here, _there) = tokio::io::duplex(64);
        let mut port = SerialPort::from_stream("test", line_9600_8n1(), here);
        port.drain_input().await.unwrap();
    }
}
