use std::net::SocketAddr;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;

use super::error::PeerError;
use super::message::{handshake_len, Handshake};
use crate::constants::MAX_FRAME_SIZE;

const READ_CHUNK: usize = 32 * 1024;

/// A peer socket during handshake, before it splits into halves.
pub struct Transport {
    stream: TcpStream,
    buf: BytesMut,
}

impl Transport {
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            buf: BytesMut::with_capacity(READ_CHUNK),
        }
    }

    pub fn peer_addr(&self) -> std::io::Result<SocketAddr> {
        self.stream.peer_addr()
    }

    pub async fn send_handshake(
        &mut self,
        handshake: &Handshake,
        limit: Duration,
    ) -> Result<(), PeerError> {
        let data = handshake.encode();
        timeout(limit, self.stream.write_all(&data))
            .await
            .map_err(|_| PeerError::PeerDisconnected)??;
        Ok(())
    }

    /// Reads the variable-length handshake: one length byte, then the
    /// remaining `48 + n` bytes.
    pub async fn read_handshake(&mut self, limit: Duration) -> Result<Handshake, PeerError> {
        self.fill(1, limit).await?;
        let n = self.buf[0] as usize;
        if n == 0 {
            return Err(PeerError::UnexpectedProtocol);
        }
        self.fill(handshake_len(n), limit).await?;
        let data = self.buf.split_to(handshake_len(n));
        Handshake::decode(&data)
    }

    /// Splits into reader and writer halves for the two peer tasks.
    ///
    /// Bytes already buffered past the handshake stay with the reader.
    pub fn split(self) -> (FrameReader, FrameWriter) {
        let (read, write) = self.stream.into_split();
        (
            FrameReader {
                half: read,
                buf: self.buf,
            },
            FrameWriter { half: write },
        )
    }

    async fn fill(&mut self, want: usize, limit: Duration) -> Result<(), PeerError> {
        while self.buf.len() < want {
            let n = timeout(limit, self.stream.read_buf(&mut self.buf))
                .await
                .map_err(|_| PeerError::PeerDisconnected)??;
            if n == 0 {
                return Err(PeerError::PeerDisconnected);
            }
        }
        Ok(())
    }
}

/// The reading half of a peer socket.
pub struct FrameReader {
    half: OwnedReadHalf,
    buf: BytesMut,
}

impl FrameReader {
    /// Reads one length-prefixed frame, prefix included.
    ///
    /// `idle` bounds each wait for bytes; a silent peer surfaces as
    /// [`PeerError::PeerDisconnected`].
    pub async fn read_frame(&mut self, idle: Duration) -> Result<Bytes, PeerError> {
        self.fill(4, idle).await?;
        let length =
            u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if length > MAX_FRAME_SIZE {
            return Err(PeerError::Decoding(format!("frame of {} bytes", length)));
        }
        self.fill(4 + length, idle).await?;
        Ok(self.buf.split_to(4 + length).freeze())
    }

    async fn fill(&mut self, want: usize, idle: Duration) -> Result<(), PeerError> {
        while self.buf.len() < want {
            let n = timeout(idle, self.half.read_buf(&mut self.buf))
                .await
                .map_err(|_| PeerError::PeerDisconnected)??;
            if n == 0 {
                return Err(PeerError::PeerDisconnected);
            }
        }
        Ok(())
    }
}

/// The writing half of a peer socket.
pub struct FrameWriter {
    half: OwnedWriteHalf,
}

impl FrameWriter {
    pub async fn write_frame(&mut self, data: &[u8]) -> Result<(), PeerError> {
        self.half.write_all(data).await?;
        Ok(())
    }
}
