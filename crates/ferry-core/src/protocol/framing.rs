//! Length-prefixed frames on a physical connection
//!
//! Layout: `magic "FRY1" | channel u32 | type u8 | length u32 | payload`,
//! integers big-endian.

use std::io;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;

use super::packet::PacketType;

pub const MAGIC: [u8; 4] = *b"FRY1";
const HEADER_LEN: usize = 4 + 4 + 1 + 4;

/// Time allowed to complete a frame once its first byte arrived
pub const DEFAULT_FRAME_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("bad frame magic {0:02x?}")]
    BadMagic([u8; 4]),

    #[error("unknown packet type {0}")]
    UnknownType(u8),

    #[error("{kind:?} payload of {length} bytes exceeds {max}")]
    PayloadTooLarge {
        kind: PacketType,
        length: usize,
        max: usize,
    },

    #[error("frame not completed in time")]
    FrameTimeout,

    #[error("connection idle for too long")]
    IdleTimeout,
}

/// One frame as read from or written to the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub channel: u32,
    pub kind: PacketType,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.payload.len());
        out.extend_from_slice(&MAGIC);
        out.extend_from_slice(&self.channel.to_be_bytes());
        out.push(self.kind as u8);
        out.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.payload);
        out
    }
}

/// Reads frames from an async reader
pub struct FrameReader<R> {
    reader: R,
    max_blocksize: u32,
}

impl<R> FrameReader<R> {
    pub fn new(reader: R, max_blocksize: u32) -> Self {
        Self { reader, max_blocksize }
    }
}

impl<R: AsyncReadExt + Unpin> FrameReader<R> {
    /// Read the next frame. Returns `Ok(None)` when the peer closed cleanly.
    ///
    /// The first byte must show up within `idle_timeout`, then the whole
    /// frame within `frame_timeout`. An idle timeout consumes nothing, so
    /// the caller may simply read again.
    pub async fn read_frame(
        &mut self,
        idle_timeout: Duration,
        frame_timeout: Duration,
    ) -> Result<Option<Frame>, FrameError> {
        let first = match timeout(idle_timeout, self.read_byte_allow_eof()).await {
            Ok(Ok(Some(b))) => b,
            Ok(Ok(None)) => return Ok(None),
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(FrameError::IdleTimeout),
        };

        match timeout(frame_timeout, self.read_after_first_byte(first)).await {
            Ok(result) => result.map(Some),
            Err(_) => Err(FrameError::FrameTimeout),
        }
    }

    async fn read_byte_allow_eof(&mut self) -> Result<Option<u8>, FrameError> {
        let mut byte = [0u8; 1];
        match self.reader.read(&mut byte).await? {
            0 => Ok(None),
            _ => Ok(Some(byte[0])),
        }
    }

    async fn read_after_first_byte(&mut self, first: u8) -> Result<Frame, FrameError> {
        let mut header = [0u8; HEADER_LEN];
        header[0] = first;
        self.reader.read_exact(&mut header[1..]).await?;

        let mut magic = [0u8; 4];
        magic.copy_from_slice(&header[..4]);
        if magic != MAGIC {
            return Err(FrameError::BadMagic(magic));
        }

        let mut channel = [0u8; 4];
        channel.copy_from_slice(&header[4..8]);
        let kind = PacketType::from_u8(header[8]).ok_or(FrameError::UnknownType(header[8]))?;
        let mut length = [0u8; 4];
        length.copy_from_slice(&header[9..13]);
        let length = u32::from_be_bytes(length) as usize;

        let max = kind.max_payload(self.max_blocksize);
        if length > max {
            return Err(FrameError::PayloadTooLarge { kind, length, max });
        }

        let mut payload = vec![0u8; length];
        self.reader.read_exact(&mut payload).await?;

        Ok(Frame {
            channel: u32::from_be_bytes(channel),
            kind,
            payload,
        })
    }
}

/// Writes frames to an async writer
pub struct FrameWriter<W> {
    writer: W,
}

impl<W> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.writer
    }
}

impl<W: AsyncWriteExt + Unpin> FrameWriter<W> {
    pub async fn write_frame(&mut self, frame: &Frame) -> Result<(), FrameError> {
        self.writer.write_all(&frame.to_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }
}
