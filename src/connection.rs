// ABOUTME: Buffered frame-level I/O over any bidirectional byte transport
// ABOUTME: Read and write halves are separable so the mux can pump them concurrently

use crate::codec::{CodecError, Frame};
use bytes::{Buf, BytesMut};
use std::io::{self, Cursor};
use tokio::io::{
    AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter, ReadHalf, WriteHalf,
};

/// Reads whole frames out of a byte stream.
///
/// Accumulates transport bytes in a `BytesMut` and surfaces only complete
/// frames; upper layers never observe a partial frame.
#[derive(Debug)]
pub struct FrameReader<R> {
    inner: R,
    buffer: BytesMut,
    max_payload: u32,
}

impl<R> FrameReader<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(inner: R, max_payload: u32) -> Self {
        Self {
            inner,
            // Streams carry bulk data; start at 16KB and let BytesMut grow.
            buffer: BytesMut::with_capacity(16 * 1024),
            max_payload,
        }
    }

    /// Read a single frame.
    ///
    /// Waits until enough data has been buffered to parse a whole frame.
    /// Data beyond the frame stays buffered for the next call.
    ///
    /// Returns `Ok(None)` on a clean EOF at a frame boundary. EOF in the
    /// middle of a frame, and every malformed header, is an error; the
    /// caller must drop the connection.
    pub async fn read_frame(&mut self) -> Result<Option<Frame>, CodecError> {
        loop {
            if let Some(frame) = self.parse_frame()? {
                return Ok(Some(frame));
            }

            // Not enough buffered data; pull more from the transport.
            // `0` indicates end of stream.
            if 0 == self.inner.read_buf(&mut self.buffer).await? {
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                // The peer vanished while sending a frame.
                return Err(CodecError::Io(io::Error::new(
                    io::ErrorKind::ConnectionReset,
                    "transport closed mid-frame",
                )));
            }
        }
    }

    /// Try to parse one frame out of the read buffer. `Ok(None)` means more
    /// data is needed; any other error is fatal for the connection.
    fn parse_frame(&mut self) -> Result<Option<Frame>, CodecError> {
        let mut cursor = Cursor::new(&self.buffer[..]);

        // The length check is much cheaper than a full parse and avoids
        // allocating for partially received frames.
        match Frame::check(&mut cursor, self.max_payload) {
            Ok(total) => {
                cursor.set_position(0);
                let frame = Frame::parse(&mut cursor, self.max_payload)?;
                self.buffer.advance(total);
                Ok(Some(frame))
            }
            Err(CodecError::Incomplete) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Writes frames into a byte stream through a `BufWriter`.
#[derive(Debug)]
pub struct FrameWriter<W> {
    inner: BufWriter<W>,
    max_payload: u32,
}

impl<W> FrameWriter<W>
where
    W: AsyncWrite + Unpin,
{
    pub fn new(inner: W, max_payload: u32) -> Self {
        Self {
            // Frames are small relative to syscall cost; batch them.
            inner: BufWriter::new(inner),
            max_payload,
        }
    }

    /// Write a single frame and flush it to the transport.
    pub async fn write_frame(&mut self, frame: &Frame) -> Result<(), CodecError> {
        let mut buf = BytesMut::new();
        frame.encode(&mut buf, self.max_payload)?;
        self.inner.write_all(&buf).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Write a batch of frames with a single flush.
    pub async fn write_frames(&mut self, frames: &[Frame]) -> Result<(), CodecError> {
        let mut buf = BytesMut::new();
        for frame in frames {
            frame.encode(&mut buf, self.max_payload)?;
        }
        self.inner.write_all(&buf).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Shut down the write half, signalling EOF to the peer.
    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.inner.shutdown().await
    }
}

/// Frame-level connection over a byte transport.
///
/// The bus does not care whether the transport is a unix socket (worker
/// endpoint), a TCP socket, or an in-process duplex pipe in tests; anything
/// `AsyncRead + AsyncWrite` works. Single-task users read and write through
/// this; the multiplexer calls [`Connection::into_split`] and runs a pump
/// per half.
#[derive(Debug)]
pub struct Connection<T> {
    reader: FrameReader<ReadHalf<T>>,
    writer: FrameWriter<WriteHalf<T>>,
}

impl<T> Connection<T>
where
    T: AsyncRead + AsyncWrite,
{
    /// Create a new `Connection` backed by `transport`.
    pub fn new(transport: T, max_payload: u32) -> Connection<T> {
        let (read, write) = tokio::io::split(transport);
        Connection {
            reader: FrameReader::new(read, max_payload),
            writer: FrameWriter::new(write, max_payload),
        }
    }

    /// See [`FrameReader::read_frame`].
    pub async fn read_frame(&mut self) -> Result<Option<Frame>, CodecError> {
        self.reader.read_frame().await
    }

    /// See [`FrameWriter::write_frame`].
    pub async fn write_frame(&mut self, frame: &Frame) -> Result<(), CodecError> {
        self.writer.write_frame(frame).await
    }

    /// Split into independently owned halves for concurrent pumping.
    pub fn into_split(self) -> (FrameReader<ReadHalf<T>>, FrameWriter<WriteHalf<T>>) {
        (self.reader, self.writer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::DEFAULT_MAX_PAYLOAD;
    use bytes::Bytes;

    #[tokio::test]
    async fn frame_roundtrip_over_duplex() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let mut left = Connection::new(a, DEFAULT_MAX_PAYLOAD);
        let mut right = Connection::new(b, DEFAULT_MAX_PAYLOAD);

        let frame = Frame::StreamData {
            stream_id: 5,
            payload: Bytes::from_static(b"payload bytes"),
        };
        left.write_frame(&frame).await.unwrap();

        let received = right.read_frame().await.unwrap().unwrap();
        assert_eq!(received, frame);
    }

    #[tokio::test]
    async fn split_delivery_reassembles() {
        // Feed a frame one byte at a time; the reader must never surface a
        // partial frame.
        let (mut a, b) = tokio::io::duplex(1024);
        let mut right = Connection::new(b, DEFAULT_MAX_PAYLOAD);

        let bytes = Frame::Ping { nonce: 77 }
            .to_bytes(DEFAULT_MAX_PAYLOAD)
            .unwrap();

        let writer = tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            for chunk in bytes.chunks(1) {
                a.write_all(chunk).await.unwrap();
                tokio::task::yield_now().await;
            }
            a
        });

        let received = right.read_frame().await.unwrap().unwrap();
        assert_eq!(received, Frame::Ping { nonce: 77 });
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn clean_eof_returns_none() {
        let (a, b) = tokio::io::duplex(1024);
        let mut right = Connection::new(b, DEFAULT_MAX_PAYLOAD);
        drop(a);
        assert!(right.read_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn eof_mid_frame_is_an_error() {
        let (mut a, b) = tokio::io::duplex(1024);
        let mut right = Connection::new(b, DEFAULT_MAX_PAYLOAD);

        let bytes = Frame::Ping { nonce: 1 }
            .to_bytes(DEFAULT_MAX_PAYLOAD)
            .unwrap();
        {
            use tokio::io::AsyncWriteExt;
            a.write_all(&bytes[..6]).await.unwrap();
        }
        drop(a);

        assert!(right.read_frame().await.is_err());
    }

    #[tokio::test]
    async fn multiple_frames_in_one_read() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let mut left = Connection::new(a, DEFAULT_MAX_PAYLOAD);
        let mut right = Connection::new(b, DEFAULT_MAX_PAYLOAD);

        let frames = vec![
            Frame::StreamClose { stream_id: 1 },
            Frame::Ping { nonce: 2 },
            Frame::StreamWindow {
                stream_id: 3,
                credit: 100,
            },
        ];
        left.writer.write_frames(&frames).await.unwrap();

        for expected in &frames {
            let got = right.read_frame().await.unwrap().unwrap();
            assert_eq!(&got, expected);
        }
    }
}
