//! Frame transports between a vat manager and its worker.

use std::io::{ErrorKind, Read, Write};
use std::sync::mpsc;

use serde_json::Value;

use crate::error::WorkerError;

/// Upper bound on a single frame body.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Bidirectional, in-order channel carrying one JSON value per frame.
pub trait Transport: Send {
    fn send(&mut self, frame: &Value) -> Result<(), WorkerError>;
    /// Blocks for the next frame. A cleanly closed peer yields
    /// [`WorkerError::Closed`].
    fn recv(&mut self) -> Result<Value, WorkerError>;
}

/// In-process transport over a pair of mpsc channels, used by thread workers.
#[derive(Debug)]
pub struct ChannelTransport {
    tx: mpsc::Sender<Value>,
    rx: mpsc::Receiver<Value>,
}

impl ChannelTransport {
    /// Returns two connected ends.
    pub fn pair() -> (Self, Self) {
        let (a_tx, b_rx) = mpsc::channel();
        let (b_tx, a_rx) = mpsc::channel();
        (
            Self { tx: a_tx, rx: a_rx },
            Self { tx: b_tx, rx: b_rx },
        )
    }
}

impl Transport for ChannelTransport {
    fn send(&mut self, frame: &Value) -> Result<(), WorkerError> {
        self.tx.send(frame.clone()).map_err(|_| WorkerError::Closed)
    }

    fn recv(&mut self) -> Result<Value, WorkerError> {
        self.rx.recv().map_err(|_| WorkerError::Closed)
    }
}

/// Length-prefixed frames (4-byte little-endian length, then JSON) over a
/// byte stream such as a child's stdin/stdout.
pub struct FramedTransport<R, W> {
    reader: R,
    writer: W,
}

impl<R: Read + Send, W: Write + Send> FramedTransport<R, W> {
    pub fn new(reader: R, writer: W) -> Self {
        Self { reader, writer }
    }
}

impl<R: Read + Send, W: Write + Send> Transport for FramedTransport<R, W> {
    fn send(&mut self, frame: &Value) -> Result<(), WorkerError> {
        let bytes = serde_json::to_vec(frame)?;
        if bytes.len() > MAX_FRAME_LEN {
            return Err(WorkerError::violation(format!(
                "frame of {} bytes exceeds limit",
                bytes.len()
            )));
        }
        self.writer.write_all(&(bytes.len() as u32).to_le_bytes())?;
        self.writer.write_all(&bytes)?;
        self.writer.flush()?;
        Ok(())
    }

    fn recv(&mut self) -> Result<Value, WorkerError> {
        let mut len_buf = [0u8; 4];
        let mut filled = 0;
        while filled < len_buf.len() {
            match self.reader.read(&mut len_buf[filled..]) {
                Ok(0) if filled == 0 => return Err(WorkerError::Closed),
                Ok(0) => {
                    return Err(WorkerError::violation(format!(
                        "truncated frame header (read {filled} bytes)"
                    )));
                }
                Ok(n) => filled += n,
                Err(err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) => return Err(err.into()),
            }
        }
        let len = u32::from_le_bytes(len_buf) as usize;
        if len > MAX_FRAME_LEN {
            return Err(WorkerError::violation(format!(
                "frame of {len} bytes exceeds limit"
            )));
        }
        let mut body = vec![0u8; len];
        if let Err(err) = self.reader.read_exact(&mut body) {
            if err.kind() == ErrorKind::UnexpectedEof {
                return Err(WorkerError::violation("truncated frame body"));
            }
            return Err(err.into());
        }
        Ok(serde_json::from_slice(&body)?)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use serde_json::json;

    use super::*;

    #[test]
    fn framed_round_trip() {
        let mut out = Vec::new();
        {
            let mut transport = FramedTransport::new(std::io::empty(), &mut out);
            transport.send(&json!(["setUplink"])).unwrap();
            transport.send(&json!(["shutdown"])).unwrap();
        }
        let mut transport = FramedTransport::new(Cursor::new(out), std::io::sink());
        assert_eq!(transport.recv().unwrap(), json!(["setUplink"]));
        assert_eq!(transport.recv().unwrap(), json!(["shutdown"]));
        assert!(matches!(transport.recv(), Err(WorkerError::Closed)));
    }

    #[test]
    fn torn_frames_are_violations() {
        let mut out = Vec::new();
        FramedTransport::new(std::io::empty(), &mut out)
            .send(&json!(["gotBundle"]))
            .unwrap();
        out.pop();
        let mut transport = FramedTransport::new(Cursor::new(out), std::io::sink());
        assert!(matches!(transport.recv(), Err(WorkerError::Violation(_))));

        let mut header_only = FramedTransport::new(Cursor::new(vec![3u8, 0]), std::io::sink());
        assert!(matches!(header_only.recv(), Err(WorkerError::Violation(_))));
    }

    #[test]
    fn channel_pair_is_crossed() {
        let (mut a, mut b) = ChannelTransport::pair();
        a.send(&json!(1)).unwrap();
        b.send(&json!(2)).unwrap();
        assert_eq!(b.recv().unwrap(), json!(1));
        assert_eq!(a.recv().unwrap(), json!(2));
        drop(a);
        assert!(matches!(b.recv(), Err(WorkerError::Closed)));
    }
}
