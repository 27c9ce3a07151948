use bytes::{BufMut, BytesMut};

use crate::proto::frame::Frame;

/// Accumulates RESP-encoded frames in an internal buffer.
///
/// A node connection in manual-flush mode keeps encoding commands into the
/// same encoder and only hands the buffer to the socket on flush, so a whole
/// pipeline goes out in a single write.
///
/// # Example
///
/// ```
/// use slotmux::proto::codec::Encoder;
/// use slotmux::proto::frame::Frame;
///
/// let mut encoder = Encoder::new();
/// encoder.encode(&Frame::ok());
/// assert_eq!(encoder.take().as_ref(), b"+OK\r\n");
/// ```
#[derive(Debug, Default)]
pub struct Encoder {
    buf: BytesMut,
    frames: usize,
}

impl Encoder {
    /// Creates a new encoder with an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends one frame to the buffer.
    pub fn encode(&mut self, frame: &Frame) {
        self.write_frame(frame);
        self.frames += 1;
    }

    /// Appends several frames back to back.
    pub fn encode_batch<'a>(&mut self, frames: impl IntoIterator<Item = &'a Frame>) {
        for frame in frames {
            self.encode(frame);
        }
    }

    /// Number of top-level frames currently buffered.
    pub fn pending_frames(&self) -> usize {
        self.frames
    }

    /// Returns true if nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Takes the encoded bytes, leaving the encoder empty and reusable.
    pub fn take(&mut self) -> BytesMut {
        self.frames = 0;
        self.buf.split()
    }

    fn write_frame(&mut self, frame: &Frame) {
        match frame {
            Frame::SimpleString(s) => self.write_line(b'+', s),
            Frame::Error(e) => self.write_line(b'-', e),
            Frame::Integer(n) => self.write_line(b':', n.to_string().as_bytes()),
            Frame::BulkString(Some(data)) => {
                self.write_line(b'$', data.len().to_string().as_bytes());
                self.buf.extend_from_slice(data);
                self.buf.extend_from_slice(b"\r\n");
            }
            Frame::BulkString(None) | Frame::Null => self.buf.extend_from_slice(b"$-1\r\n"),
            Frame::Array(items) => {
                self.write_line(b'*', items.len().to_string().as_bytes());
                for item in items {
                    self.write_frame(item);
                }
            }
        }
    }

    fn write_line(&mut self, prefix: u8, body: &[u8]) {
        self.buf.reserve(body.len() + 3);
        self.buf.put_u8(prefix);
        self.buf.extend_from_slice(body);
        self.buf.extend_from_slice(b"\r\n");
    }
}
