//! Framing shared by every inter-process link.
//!
//! Each link kind (login server, map server, client) owns a [`LengthTable`]:
//! `lens[cmd - base]` is the fixed frame length, `-1` means the total length
//! is a `u32` at offset 2, and `0` means the id is unknown on that link.
//! [`FrameReader`] buffers bytes per connection and only yields a frame once
//! it is complete; an unknown id or a bad length is fatal for the connection.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Largest frame any link may declare.
pub const MAX_FRAME: usize = 256 * 1024;

/// Header of a variable frame: cmd (2) + total length (4).
pub const VAR_HEADER: usize = 6;

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("unknown packet 0x{cmd:04X} on {link} link")]
    UnknownCommand { link: &'static str, cmd: u16 },

    #[error("bad length {len} for packet 0x{cmd:04X} on {link} link")]
    BadLength { link: &'static str, cmd: u16, len: usize },

    #[error("packet 0x{cmd:04X} truncated: need {need} bytes at offset {pos}, have {have}")]
    Short { cmd: u16, pos: usize, need: usize, have: usize },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Expected size of one message id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameLen {
    Fixed(usize),
    Variable,
}

#[derive(Debug)]
pub struct LengthTable {
    pub link: &'static str,
    pub base: u16,
    pub lens: &'static [i32],
}

impl LengthTable {
    pub fn lookup(&self, cmd: u16) -> Option<FrameLen> {
        let idx = (cmd as usize).wrapping_sub(self.base as usize);
        match self.lens.get(idx).copied() {
            Some(-1) => Some(FrameLen::Variable),
            Some(n) if n >= 2 => Some(FrameLen::Fixed(n as usize)),
            _ => None,
        }
    }
}

/// Per-connection receive buffer.
pub struct FrameReader {
    table: &'static LengthTable,
    buf: BytesMut,
}

impl FrameReader {
    pub fn new(table: &'static LengthTable) -> Self {
        Self { table, buf: BytesMut::with_capacity(4096) }
    }

    /// Seed the buffer with bytes already consumed by the accept path.
    pub fn with_prefix(table: &'static LengthTable, prefix: &[u8]) -> Self {
        let mut r = Self::new(table);
        r.buf.extend_from_slice(prefix);
        r
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Pops one complete frame, or `None` if more bytes are needed.
    pub fn next_frame(&mut self) -> Result<Option<Bytes>, DispatchError> {
        if self.buf.len() < 2 {
            return Ok(None);
        }
        let cmd = u16::from_le_bytes([self.buf[0], self.buf[1]]);
        let link = self.table.link;
        let len = match self.table.lookup(cmd) {
            None => return Err(DispatchError::UnknownCommand { link, cmd }),
            Some(FrameLen::Fixed(n)) => n,
            Some(FrameLen::Variable) => {
                if self.buf.len() < VAR_HEADER {
                    return Ok(None);
                }
                let n = u32::from_le_bytes([self.buf[2], self.buf[3], self.buf[4], self.buf[5]]) as usize;
                if n < VAR_HEADER || n > MAX_FRAME {
                    return Err(DispatchError::BadLength { link, cmd, len: n });
                }
                n
            }
        };
        if self.buf.len() < len {
            return Ok(None);
        }
        Ok(Some(self.buf.split_to(len).freeze()))
    }

    /// Reads from `src` until a frame is complete. `Ok(None)` means the peer
    /// closed the connection cleanly between frames.
    pub async fn read_frame<R>(&mut self, src: &mut R) -> Result<Option<Bytes>, DispatchError>
    where
        R: AsyncRead + Unpin,
    {
        loop {
            if let Some(frame) = self.next_frame()? {
                return Ok(Some(frame));
            }
            if src.read_buf(&mut self.buf).await? == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(DispatchError::Io(std::io::ErrorKind::UnexpectedEof.into()));
            }
        }
    }
}

/// Bounds-checked little-endian reader over one frame.
pub struct PacketReader<'a> {
    pkt: &'a [u8],
    pos: usize,
}

impl<'a> PacketReader<'a> {
    /// Starts reading after the command word.
    pub fn new(pkt: &'a [u8]) -> Self {
        Self { pkt, pos: 2 }
    }

    /// Starts reading after the command word and the `u32` total length.
    pub fn variable(pkt: &'a [u8]) -> Self {
        Self { pkt, pos: VAR_HEADER }
    }

    /// Reads a headerless body (e.g. a decompressed record).
    pub fn body(pkt: &'a [u8]) -> Self {
        Self { pkt, pos: 0 }
    }

    pub fn cmd(&self) -> u16 {
        match self.pkt {
            [a, b, ..] if self.pos > 0 => u16::from_le_bytes([*a, *b]),
            _ => 0,
        }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DispatchError> {
        let end = self.pos.checked_add(n).filter(|&e| e <= self.pkt.len());
        match end {
            Some(end) => {
                let s = &self.pkt[self.pos..end];
                self.pos = end;
                Ok(s)
            }
            None => Err(DispatchError::Short {
                cmd: self.cmd(),
                pos: self.pos,
                need: n,
                have: self.pkt.len().saturating_sub(self.pos),
            }),
        }
    }

    pub fn u8(&mut self) -> Result<u8, DispatchError> {
        Ok(self.take(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16, DispatchError> {
        Ok(self.take(2)?.get_u16_le())
    }

    pub fn u32(&mut self) -> Result<u32, DispatchError> {
        Ok(self.take(4)?.get_u32_le())
    }

    pub fn u64(&mut self) -> Result<u64, DispatchError> {
        Ok(self.take(8)?.get_u64_le())
    }

    /// NUL-padded fixed string field.
    pub fn str_fixed(&mut self, len: usize) -> Result<String, DispatchError> {
        Ok(read_str(self.take(len)?))
    }

    pub fn remaining(&self) -> usize {
        self.pkt.len().saturating_sub(self.pos)
    }

    pub fn rest(&mut self) -> &'a [u8] {
        let s = &self.pkt[self.pos.min(self.pkt.len())..];
        self.pos = self.pkt.len();
        s
    }
}

/// Little-endian frame builder. Variable frames get their length patched
/// in by [`PacketBuilder::finish`].
pub struct PacketBuilder {
    buf: BytesMut,
    variable: bool,
}

impl PacketBuilder {
    pub fn new(cmd: u16) -> Self {
        let mut buf = BytesMut::with_capacity(32);
        buf.put_u16_le(cmd);
        Self { buf, variable: false }
    }

    pub fn variable(cmd: u16) -> Self {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_u16_le(cmd);
        buf.put_u32_le(0);
        Self { buf, variable: true }
    }

    pub fn u8(mut self, v: u8) -> Self {
        self.buf.put_u8(v);
        self
    }

    pub fn u16(mut self, v: u16) -> Self {
        self.buf.put_u16_le(v);
        self
    }

    pub fn u32(mut self, v: u32) -> Self {
        self.buf.put_u32_le(v);
        self
    }

    pub fn u64(mut self, v: u64) -> Self {
        self.buf.put_u64_le(v);
        self
    }

    pub fn str_fixed(mut self, s: &str, len: usize) -> Self {
        write_str_padded(&mut self.buf, s, len);
        self
    }

    pub fn bytes(mut self, b: &[u8]) -> Self {
        self.buf.put_slice(b);
        self
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn finish(mut self) -> Vec<u8> {
        if self.variable {
            let len = self.buf.len() as u32;
            self.buf[2..6].copy_from_slice(&len.to_le_bytes());
        }
        self.buf.to_vec()
    }
}

pub fn read_str(src: &[u8]) -> String {
    let nul = src.iter().position(|&b| b == 0).unwrap_or(src.len());
    String::from_utf8_lossy(&src[..nul]).into_owned()
}

/// Writes `s` truncated to `len - 1` bytes and NUL-pads to `len`.
pub fn write_str_padded(buf: &mut BytesMut, s: &str, len: usize) {
    let bytes = s.as_bytes();
    let n = bytes.len().min(len.saturating_sub(1));
    buf.put_slice(&bytes[..n]);
    buf.put_bytes(0, len - n);
}
