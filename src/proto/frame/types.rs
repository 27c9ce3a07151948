use bytes::Bytes;

/// A RESP (Redis Serialization Protocol) frame.
///
/// - SimpleString: Status responses like "OK"
/// - Error: Error responses from the server
/// - Integer: Numeric responses
/// - BulkString: Binary-safe string data
/// - Array: Command arguments and array responses
/// - Null: NULL value
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Simple string (+OK).
    SimpleString(Vec<u8>),
    /// Error (-ERR).
    Error(Vec<u8>),
    /// Integer (:1000).
    Integer(i64),
    /// Bulk string ($6\r\nfoobar).
    BulkString(Option<Bytes>),
    /// Array (*2\r\n...).
    Array(Vec<Frame>),
    /// Null ($-1 or *-1).
    Null,
}

impl Frame {
    /// The `+OK` status reply.
    pub fn ok() -> Self {
        Frame::SimpleString(b"OK".to_vec())
    }

    /// Builds a non-null bulk string frame.
    pub fn bulk(data: impl Into<Bytes>) -> Self {
        Frame::BulkString(Some(data.into()))
    }

    /// Builds an error frame from a message.
    pub fn error(message: impl AsRef<str>) -> Self {
        Frame::Error(message.as_ref().as_bytes().to_vec())
    }

    /// Returns true if this frame is an error reply.
    pub fn is_error(&self) -> bool {
        matches!(self, Frame::Error(_))
    }

    /// Returns true if this frame is the `OK` status reply.
    pub fn is_ok(&self) -> bool {
        matches!(self, Frame::SimpleString(s) if s.as_slice() == b"OK")
    }

    /// Returns true if this frame is Null.
    pub fn is_null(&self) -> bool {
        matches!(self, Frame::Null | Frame::BulkString(None))
    }

    /// Returns the payload of a bulk or simple string frame.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Frame::BulkString(Some(b)) => Some(b),
            Frame::SimpleString(s) => Some(s),
            _ => None,
        }
    }
}
