use std::fmt;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};

use crate::proto::codec::{Decoder, Encoder};
use crate::proto::frame::Frame;
use crate::{Error, Result};

const READ_CHUNK: usize = 4096;

/// A framed RESP stream to a single node.
///
/// Wraps a transport (normally a `TcpStream`) and handles frame encoding and
/// decoding. [`split`](Connection::split) hands the two directions to
/// independent tasks so writes never wait on reads.
pub struct Connection<S> {
    stream: S,
    decoder: Decoder,
    encoder: Encoder,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Creates a new connection over the given stream.
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            decoder: Decoder::new(),
            encoder: Encoder::new(),
        }
    }

    /// Writes one frame and flushes it to the transport.
    pub async fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        self.encoder.encode(frame);
        let data = self.encoder.take();
        self.stream.write_all(&data).await?;
        Ok(())
    }

    /// Reads the next complete frame.
    pub async fn read_frame(&mut self) -> Result<Frame> {
        read_frame(&mut self.stream, &mut self.decoder).await
    }

    /// Splits into independently owned read and write halves.
    pub fn split(self) -> (ConnectionReader<S>, ConnectionWriter<S>) {
        let (read, write) = tokio::io::split(self.stream);
        (
            ConnectionReader {
                stream: read,
                decoder: self.decoder,
            },
            ConnectionWriter {
                stream: write,
                encoder: self.encoder,
            },
        )
    }
}

impl<S> fmt::Debug for Connection<S>
where
    S: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("stream", &self.stream)
            .field("buffered", &self.decoder.buffered())
            .finish()
    }
}

/// Read half of a split [`Connection`].
pub struct ConnectionReader<S> {
    stream: ReadHalf<S>,
    decoder: Decoder,
}

impl<S> ConnectionReader<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Reads the next complete frame.
    pub async fn read_frame(&mut self) -> Result<Frame> {
        read_frame(&mut self.stream, &mut self.decoder).await
    }
}

/// Write half of a split [`Connection`].
///
/// Frames can either be written one at a time or staged into the internal
/// encoder and written together with [`flush`](ConnectionWriter::flush).
pub struct ConnectionWriter<S> {
    stream: WriteHalf<S>,
    encoder: Encoder,
}

impl<S> ConnectionWriter<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Encodes and writes one frame immediately.
    pub async fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        self.encoder.encode(frame);
        self.flush().await.map(|_| ())
    }

    /// Writes `frames` at once, leaving anything staged in place.
    pub async fn write_now(&mut self, frames: &[Frame]) -> Result<()> {
        let mut encoder = Encoder::new();
        encoder.encode_batch(frames);
        let data: BytesMut = encoder.take();
        self.stream.write_all(&data).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Encodes a frame into the pending buffer without writing it.
    pub fn stage(&mut self, frame: &Frame) {
        self.encoder.encode(frame);
    }

    /// Number of staged frames not yet written.
    pub fn staged(&self) -> usize {
        self.encoder.pending_frames()
    }

    /// Writes everything staged so far. Returns the number of frames written.
    pub async fn flush(&mut self) -> Result<usize> {
        if self.encoder.is_empty() {
            return Ok(0);
        }
        let frames = self.encoder.pending_frames();
        let data: BytesMut = self.encoder.take();
        self.stream.write_all(&data).await?;
        self.stream.flush().await?;
        Ok(frames)
    }

    /// Shuts down the write direction of the transport.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.stream.shutdown().await?;
        Ok(())
    }
}

async fn read_frame<R>(stream: &mut R, decoder: &mut Decoder) -> Result<Frame>
where
    R: AsyncRead + Unpin,
{
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        if let Some(frame) = decoder.decode()? {
            return Ok(frame);
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(Error::ConnectionClosed);
        }
        decoder.append(&chunk[..n]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::{TcpListener, TcpStream};

    #[tokio::test]
    async fn test_connection_ping_pong() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut conn = Connection::new(stream);
            let frame = conn.read_frame().await.unwrap();
            assert_eq!(frame, Frame::Array(vec![Frame::bulk("PING")]));
            conn.write_frame(&Frame::SimpleString(b"PONG".to_vec()))
                .await
                .unwrap();
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        let mut conn = Connection::new(stream);
        conn.write_frame(&Frame::Array(vec![Frame::bulk("PING")]))
            .await
            .unwrap();
        let frame = conn.read_frame().await.unwrap();
        assert_eq!(frame, Frame::SimpleString(b"PONG".to_vec()));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_staged_frames_written_on_flush() {
        let (client, server) = tokio::io::duplex(1024);
        let (_, mut writer) = Connection::new(client).split();
        let mut peer = Connection::new(server);

        writer.stage(&Frame::Integer(1));
        writer.stage(&Frame::Integer(2));
        assert_eq!(writer.staged(), 2);
        assert_eq!(writer.flush().await.unwrap(), 2);
        assert_eq!(writer.staged(), 0);

        assert_eq!(peer.read_frame().await.unwrap(), Frame::Integer(1));
        assert_eq!(peer.read_frame().await.unwrap(), Frame::Integer(2));
    }

    #[tokio::test]
    async fn test_read_reports_closed_stream() {
        let (client, server) = tokio::io::duplex(64);
        drop(server);
        let mut conn = Connection::new(client);
        assert!(matches!(
            conn.read_frame().await,
            Err(Error::ConnectionClosed)
        ));
    }
}
