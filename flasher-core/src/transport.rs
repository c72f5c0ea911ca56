//! Transport abstraction (§4.7, C7): the core never opens a raw serial port
//! itself, it only consumes an abstract async byte stream. Two
//! implementations are provided: [`SerialTransport`] for real hardware
//! (via `tokio-serial`) and [`ScriptedTransport`] for tests.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_serial::SerialPort;

use crate::error::{Error, Result};

/// A reconfigurable, deadline-aware async byte stream.
///
/// Every method is a suspension point; callers (sessions, the XMODEM
/// sender) hold exclusive access to the transport for the duration of a
/// single command/response exchange (§5) — there is no internal locking
/// here, the orchestrator is the sole owner.
#[async_trait]
pub trait Transport: Send {
    /// Reads at least one byte into `buf`, returning the number of bytes
    /// read. If no bytes arrive before `deadline` elapses, returns
    /// `Err(Error::Timeout)` — a deadline expiry is a control-flow signal
    /// for callers, not a transport fault.
    async fn read_with_deadline(&mut self, buf: &mut [u8], deadline: Duration) -> Result<usize>;

    /// Writes the entire buffer, or fails with `Error::TransportIo`.
    async fn write_all(&mut self, bytes: &[u8]) -> Result<()>;

    /// Reconfigures the baud rate. Implementations must drain pending
    /// output and discard pending input as part of the switch (§4.7).
    async fn set_baudrate(&mut self, baud: u32) -> Result<()>;

    /// Discards any buffered input without touching the baud rate.
    async fn reset_input_buffer(&mut self) -> Result<()>;

    /// Closes the transport. Further use is undefined; orchestrator code
    /// only calls this at the very end of a session.
    async fn close(&mut self) -> Result<()>;
}

/// Real hardware transport over a serial port, opened by the CLI layer and
/// handed to the core as a `Box<dyn Transport>`.
pub struct SerialTransport {
    port: tokio_serial::SerialStream,
}

impl SerialTransport {
    /// Opens `path` (a device path or, on some platforms, a URL-like
    /// string) at `baud`. Opening the physical port is the CLI's job per
    /// §1 ("raw serial port opening... external collaborator"); this
    /// constructor is the one seam where that happens, kept thin on
    /// purpose.
    pub fn open(path: &str, baud: u32) -> Result<SerialTransport> {
        let port = tokio_serial::new(path, baud)
            .timeout(Duration::from_millis(50))
            .open_native_async()
            .map_err(|e| Error::TransportIo(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
        Ok(SerialTransport { port })
    }
}

#[async_trait]
impl Transport for SerialTransport {
    async fn read_with_deadline(&mut self, buf: &mut [u8], deadline: Duration) -> Result<usize> {
        match tokio::time::timeout(deadline, self.port.read(buf)).await {
            Ok(Ok(n)) => Ok(n),
            Ok(Err(e)) => Err(Error::TransportIo(e)),
            Err(_elapsed) => Err(Error::Timeout),
        }
    }

    async fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        AsyncWriteExt::write_all(&mut self.port, bytes)
            .await
            .map_err(Error::TransportIo)
    }

    async fn set_baudrate(&mut self, baud: u32) -> Result<()> {
        self.port.flush().await.map_err(Error::TransportIo)?;
        self.port
            .clear(tokio_serial::ClearBuffer::All)
            .map_err(|e| Error::TransportIo(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
        self.port
            .set_baud_rate(baud)
            .map_err(|e| Error::TransportIo(std::io::Error::new(std::io::ErrorKind::Other, e)))
    }

    async fn reset_input_buffer(&mut self) -> Result<()> {
        self.port
            .clear(tokio_serial::ClearBuffer::Input)
            .map_err(|e| Error::TransportIo(std::io::Error::new(std::io::ErrorKind::Other, e)))
    }

    async fn close(&mut self) -> Result<()> {
        self.port.flush().await.map_err(Error::TransportIo)
    }
}

/// One scripted step in a [`ScriptedTransport`]'s tape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Expect the next `write_all` call to write exactly these bytes.
    Write(Vec<u8>),
    /// Hand back these bytes on the next `read_with_deadline` call(s),
    /// possibly split across several calls if the caller's buffer is
    /// smaller than the chunk.
    Read(Vec<u8>),
    /// The next `read_with_deadline` call times out.
    Timeout,
}

/// An in-memory, scripted transport for tests: a tape of expected writes
/// and canned reads, consumed in order. Baud/reset calls are recorded but
/// otherwise inert.
pub struct ScriptedTransport {
    steps: VecDeque<Step>,
    pending_read: VecDeque<u8>,
    pub baudrate: u32,
    pub baud_changes: Vec<u32>,
    pub closed: bool,
}

impl ScriptedTransport {
    pub fn new(initial_baud: u32) -> Self {
        ScriptedTransport {
            steps: VecDeque::new(),
            pending_read: VecDeque::new(),
            baudrate: initial_baud,
            baud_changes: Vec::new(),
            closed: false,
        }
    }

    pub fn expect_write(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.steps.push_back(Step::Write(bytes.into()));
        self
    }

    pub fn then_read(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.steps.push_back(Step::Read(bytes.into()));
        self
    }

    pub fn then_timeout(mut self) -> Self {
        self.steps.push_back(Step::Timeout);
        self
    }

    /// True once every scripted step has been consumed.
    pub fn is_exhausted(&self) -> bool {
        self.steps.is_empty() && self.pending_read.is_empty()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn read_with_deadline(&mut self, buf: &mut [u8], _deadline: Duration) -> Result<usize> {
        if self.pending_read.is_empty() {
            match self.steps.pop_front() {
                Some(Step::Read(bytes)) => self.pending_read.extend(bytes),
                Some(Step::Timeout) => return Err(Error::Timeout),
                Some(Step::Write(w)) => {
                    self.steps.push_front(Step::Write(w));
                    return Err(Error::ProtocolError(
                        "scripted transport expected a write, got a read".into(),
                    ));
                }
                None => return Err(Error::Timeout),
            }
        }
        let n = buf.len().min(self.pending_read.len());
        for slot in buf.iter_mut().take(n) {
            *slot = self.pending_read.pop_front().unwrap();
        }
        Ok(n)
    }

    async fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        match self.steps.pop_front() {
            Some(Step::Write(expected)) if expected == bytes => Ok(()),
            Some(Step::Write(expected)) => Err(Error::ProtocolError(format!(
                "scripted transport expected write {expected:02x?}, got {bytes:02x?}"
            ))),
            Some(other) => {
                self.steps.push_front(other);
                Err(Error::ProtocolError(
                    "scripted transport expected a read, got a write".into(),
                ))
            }
            None => Err(Error::ProtocolError(format!(
                "scripted transport has no more steps, got unexpected write {bytes:02x?}"
            ))),
        }
    }

    async fn set_baudrate(&mut self, baud: u32) -> Result<()> {
        self.baudrate = baud;
        self.baud_changes.push(baud);
        Ok(())
    }

    async fn reset_input_buffer(&mut self) -> Result<()> {
        self.pending_read.clear();
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_transport_plays_back_writes_and_reads() {
        let mut t = ScriptedTransport::new(115200)
            .expect_write(b"\r".to_vec())
            .then_read(b"BL > ".to_vec());
        t.write_all(b"\r").await.unwrap();
        let mut buf = [0u8; 16];
        let n = t
            .read_with_deadline(&mut buf, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(&buf[..n], b"BL > ");
        assert!(t.is_exhausted());
    }

    #[tokio::test]
    async fn scripted_transport_splits_reads_across_small_buffers() {
        let mut t = ScriptedTransport::new(115200).then_read(b"0123456789".to_vec());
        let mut buf = [0u8; 4];
        let n1 = t
            .read_with_deadline(&mut buf, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(&buf[..n1], b"0123");
        let n2 = t
            .read_with_deadline(&mut buf, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(&buf[..n2], b"4567");
    }

    #[tokio::test]
    async fn scripted_transport_surfaces_timeout() {
        let mut t = ScriptedTransport::new(115200).then_timeout();
        let mut buf = [0u8; 4];
        let err = t
            .read_with_deadline(&mut buf, Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout));
    }
}
