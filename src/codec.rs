//! Packet framing for the muxrpc wire format.
//!
//! Every packet starts with a 9-byte header:
//!
//! ```text
//! +-------+-----------------+------------------+
//! | flags | body length u32 | request no. i32  |
//! | 1 B   | 4 B big-endian  | 4 B big-endian   |
//! +-------+-----------------+------------------+
//! ```
//!
//! followed by `body length` bytes of body. A header of all zeroes is the
//! goodbye marker and ends the packet stream.

use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Size of the packet header in bytes.
pub const HEADER_SIZE: usize = 9;

/// Default upper bound on a single packet body (16 MB).
pub const DEFAULT_MAX_BODY_SIZE: usize = 16 * 1024 * 1024;

const GOODBYE: [u8; HEADER_SIZE] = [0; HEADER_SIZE];

/// How a packet body should be interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyType {
    Binary,
    String,
    Json,
}

/// Packet flag byte.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct Flags(u8);

impl Flags {
    pub const BINARY: Flags = Flags(0);
    pub const STRING: Flags = Flags(1);
    pub const JSON: Flags = Flags(2);
    /// Last packet of a stream, or an error.
    pub const END_ERR: Flags = Flags(4);
    /// Packet belongs to a stream rather than a single async reply.
    pub const STREAM: Flags = Flags(8);

    const TYPE_MASK: u8 = 0b11;

    pub fn from_bits(bits: u8) -> Self {
        Flags(bits)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_stream(self) -> bool {
        self.contains(Flags::STREAM)
    }

    pub fn is_end_err(self) -> bool {
        self.contains(Flags::END_ERR)
    }

    pub fn body_type(self) -> BodyType {
        match self.0 & Self::TYPE_MASK {
            1 => BodyType::String,
            2 => BodyType::Json,
            _ => BodyType::Binary,
        }
    }
}

impl std::ops::BitOr for Flags {
    type Output = Flags;

    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}

impl From<BodyType> for Flags {
    fn from(kind: BodyType) -> Self {
        match kind {
            BodyType::Binary => Flags::BINARY,
            BodyType::String => Flags::STRING,
            BodyType::Json => Flags::JSON,
        }
    }
}

impl fmt::Debug for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.body_type())?;
        if self.is_stream() {
            write!(f, "|STREAM")?;
        }
        if self.is_end_err() {
            write!(f, "|END_ERR")?;
        }
        Ok(())
    }
}

/// A single framed packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub flags: Flags,
    /// Multiplexing number. The sign tells which side opened the stream.
    pub req: i32,
    pub body: Bytes,
}

impl Packet {
    pub fn new(flags: Flags, req: i32, body: impl Into<Bytes>) -> Self {
        Self {
            flags,
            req,
            body: body.into(),
        }
    }

    /// Encode header and body into one contiguous buffer.
    pub fn encode(&self) -> io::Result<BytesMut> {
        let len = u32::try_from(self.body.len()).map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidInput, "packet body exceeds u32 length")
        })?;
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.body.len());
        buf.put_u8(self.flags.bits());
        buf.put_u32(len);
        buf.put_i32(self.req);
        buf.extend_from_slice(&self.body);
        Ok(buf)
    }
}

/// Reads packets off an async byte stream.
pub struct PacketReader<R> {
    inner: R,
    max_body_size: usize,
}

impl<R: AsyncRead + Unpin> PacketReader<R> {
    pub fn new(inner: R, max_body_size: usize) -> Self {
        Self {
            inner,
            max_body_size,
        }
    }

    /// Read the next packet.
    ///
    /// Returns `Ok(None)` on a clean end: EOF before any header byte, or the
    /// goodbye header. EOF in the middle of a packet is `UnexpectedEof`.
    pub async fn read_packet(&mut self) -> io::Result<Option<Packet>> {
        let mut header = [0u8; HEADER_SIZE];

        let n = self.inner.read(&mut header).await?;
        if n == 0 {
            return Ok(None);
        }
        if n < HEADER_SIZE {
            self.inner.read_exact(&mut header[n..]).await?;
        }

        if header == GOODBYE {
            return Ok(None);
        }

        let flags = Flags::from_bits(header[0]);
        let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
        let req = i32::from_be_bytes([header[5], header[6], header[7], header[8]]);

        if len > self.max_body_size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("packet body of {len} bytes exceeds limit of {}", self.max_body_size),
            ));
        }

        let mut body = BytesMut::zeroed(len);
        self.inner.read_exact(&mut body).await?;

        Ok(Some(Packet {
            flags,
            req,
            body: body.freeze(),
        }))
    }
}

/// Writes packets onto an async byte stream.
pub struct PacketWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> PacketWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Write and flush one packet.
    pub async fn write_packet(&mut self, pkt: &Packet) -> io::Result<()> {
        let buf = pkt.encode()?;
        self.inner.write_all(&buf).await?;
        self.inner.flush().await
    }

    /// Send the goodbye header and shut down the write side.
    pub async fn close(&mut self) -> io::Result<()> {
        self.inner.write_all(&GOODBYE).await?;
        self.inner.flush().await?;
        self.inner.shutdown().await
    }
}
