use bytes::{Buf, Bytes, BytesMut};

use crate::proto::error::{Error, Result};
use crate::proto::frame::Frame;

const DEFAULT_MAX_FRAME_SIZE: usize = 512 * 1024 * 1024;

/// Deepest array nesting accepted in one reply.
const MAX_DEPTH: usize = 32;

/// Streaming RESP decoder.
///
/// Bytes are appended as they arrive; [`decode`](Decoder::decode) yields a
/// frame only once it is complete. Elements of an unfinished array are
/// consumed as soon as they parse and kept aside, so a large reply split
/// across many socket reads is scanned once.
///
/// # Example
///
/// ```
/// use slotmux::proto::codec::Decoder;
/// use slotmux::proto::frame::Frame;
///
/// let mut decoder = Decoder::new();
/// decoder.append(b"+OK\r");
/// assert!(decoder.decode().unwrap().is_none());
/// decoder.append(b"\n");
/// assert_eq!(decoder.decode().unwrap(), Some(Frame::ok()));
/// ```
#[derive(Debug)]
pub struct Decoder {
    buf: BytesMut,
    max_frame_size: usize,
    open_arrays: Vec<PartialArray>,
}

#[derive(Debug)]
struct PartialArray {
    remaining: usize,
    items: Vec<Frame>,
}

enum Token {
    Frame(Frame),
    ArrayHeader(usize),
}

impl Decoder {
    /// Creates a new decoder with an empty buffer.
    pub fn new() -> Self {
        Self::with_max_frame_size(DEFAULT_MAX_FRAME_SIZE)
    }

    /// Creates a decoder rejecting bulk payloads larger than `max_frame_size`.
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            max_frame_size,
            open_arrays: Vec::new(),
        }
    }

    /// Appends raw bytes received from the network.
    pub fn append(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Number of buffered bytes not yet decoded.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Decodes the next complete frame.
    ///
    /// Returns `Ok(None)` when more data is needed.
    ///
    /// # Errors
    ///
    /// [`Error::Protocol`] on malformed input, oversized payloads or arrays
    /// nested deeper than 32 levels. The decoder is unusable afterwards.
    pub fn decode(&mut self) -> Result<Option<Frame>> {
        loop {
            let Some((token, consumed)) = self.next_token()? else {
                return Ok(None);
            };
            self.buf.advance(consumed);

            let mut frame = match token {
                Token::Frame(frame) => frame,
                Token::ArrayHeader(0) => Frame::Array(Vec::new()),
                Token::ArrayHeader(len) => {
                    if self.open_arrays.len() >= MAX_DEPTH {
                        return Err(protocol("array nesting too deep"));
                    }
                    self.open_arrays.push(PartialArray {
                        remaining: len,
                        items: Vec::with_capacity(len.min(1024)),
                    });
                    continue;
                }
            };

            loop {
                let Some(parent) = self.open_arrays.last_mut() else {
                    return Ok(Some(frame));
                };
                parent.items.push(frame);
                parent.remaining -= 1;
                if parent.remaining > 0 {
                    break;
                }
                match self.open_arrays.pop() {
                    Some(done) => frame = Frame::Array(done.items),
                    None => return Err(protocol("array stack underflow")),
                }
            }
        }
    }

    /// Parses one scalar frame or array header at the start of the buffer
    /// without consuming it. Returns the token and its encoded length.
    fn next_token(&self) -> Result<Option<(Token, usize)>> {
        let Some(&kind) = self.buf.first() else {
            return Ok(None);
        };
        let Some(line_end) = self.find_crlf(1) else {
            return Ok(None);
        };
        let line = &self.buf[1..line_end];
        let next = line_end + 2;

        let token = match kind {
            b'+' => (Token::Frame(Frame::SimpleString(line.to_vec())), next),
            b'-' => (Token::Frame(Frame::Error(line.to_vec())), next),
            b':' => (Token::Frame(Frame::Integer(parse_int(line)?)), next),
            b'$' => {
                let len = parse_int(line)?;
                if len < 0 {
                    return Ok(Some((Token::Frame(Frame::BulkString(None)), next)));
                }
                let len = len as usize;
                if len > self.max_frame_size {
                    return Err(protocol("bulk string length exceeds maximum frame size"));
                }
                if self.buf.len() < next + len + 2 {
                    return Ok(None);
                }
                if &self.buf[next + len..next + len + 2] != b"\r\n" {
                    return Err(protocol("bulk string not terminated by CRLF"));
                }
                let data = Bytes::copy_from_slice(&self.buf[next..next + len]);
                (Token::Frame(Frame::BulkString(Some(data))), next + len + 2)
            }
            b'*' => {
                let len = parse_int(line)?;
                if len < 0 {
                    return Ok(Some((Token::Frame(Frame::Null), next)));
                }
                let len = len as usize;
                if len > self.max_frame_size / 4 {
                    return Err(protocol("array length exceeds maximum frame size"));
                }
                (Token::ArrayHeader(len), next)
            }
            other => {
                return Err(protocol(format!("unknown frame type: {}", other as char)));
            }
        };
        Ok(Some(token))
    }

    fn find_crlf(&self, from: usize) -> Option<usize> {
        self.buf
            .get(from..)?
            .windows(2)
            .position(|w| w == b"\r\n")
            .map(|i| from + i)
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_int(line: &[u8]) -> Result<i64> {
    std::str::from_utf8(line)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| protocol("invalid integer"))
}

fn protocol(message: impl Into<String>) -> Error {
    Error::Protocol {
        message: message.into(),
    }
}
