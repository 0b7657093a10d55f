//! Frame encoding and decoding.
//!
//! Pure conversion between frames and wire bytes, plus the streaming
//! reader used by `ConnectionChannel::receive`.
//!
//! ```text
//!  byte 0: FIN | RSV1-3 | opcode (4 bits)
//!  byte 1: MASK | length (7 bits)
//!  126 => 2-byte big-endian length follows
//!  127 => 8-byte big-endian length follows
//!  mask key (4 bytes) if MASK is set, then the payload
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Largest length that fits in the 7-bit field.
const SMALL_PAYLOAD_MAX: usize = 125;

/// Largest length that fits in the 16-bit extended field.
const MEDIUM_PAYLOAD_MAX: usize = 65_535;

/// 2 header bytes + 8 extended length bytes + 4 mask bytes.
pub const MAX_HEADER_LEN: usize = 14;

/// Default cap on a single frame or reassembled message (16 MiB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

const FIN_BIT: u8 = 0x80;
const RESERVED_BITS: u8 = 0x70;
const OPCODE_BITS: u8 = 0x0F;
const MASK_BIT: u8 = 0x80;
const LENGTH_BITS: u8 = 0x7F;

/// Frame decoding errors.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("unknown opcode {0:#x}")]
    UnknownOpcode(u8),

    #[error("reserved header bits set: {0:#04x}")]
    ReservedBits(u8),

    #[error("payload of {size} bytes exceeds limit of {max} bytes")]
    PayloadTooLarge { size: u64, max: usize },

    #[error("fragmented message started while another is still in progress")]
    FragmentInProgress,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Frame opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl OpCode {
    /// Parse an opcode from the low nibble of the first header byte.
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0x0 => Some(OpCode::Continuation),
            0x1 => Some(OpCode::Text),
            0x2 => Some(OpCode::Binary),
            0x8 => Some(OpCode::Close),
            0x9 => Some(OpCode::Ping),
            0xA => Some(OpCode::Pong),
            _ => None,
        }
    }
}

/// Which end of the connection a channel speaks for.
///
/// Fixed at construction. Clients mask every outgoing frame and servers
/// expect masked input; servers send unmasked frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

impl Role {
    /// Whether frames sent from this role carry a mask key.
    pub fn masks_outgoing(self) -> bool {
        matches!(self, Role::Client)
    }

    /// Whether frames received by this role are expected to be masked.
    pub fn expects_masked(self) -> bool {
        matches!(self, Role::Server)
    }

    /// A fresh random mask key for client frames, `None` for server frames.
    pub fn mask_key(self) -> Option<[u8; 4]> {
        self.masks_outgoing().then(rand::random::<[u8; 4]>)
    }
}

/// XOR `data` with `mask`, cycling the key every four bytes.
///
/// Applying the same key twice restores the original bytes.
pub fn apply_mask(data: &mut [u8], mask: [u8; 4]) {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= mask[i & 3];
    }
}

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub fin: bool,
    pub opcode: OpCode,
    pub mask: Option<[u8; 4]>,
    pub payload_len: u64,
}

impl FrameHeader {
    /// Total header size implied by the first two header bytes.
    pub fn len_from_prefix(byte1: u8) -> usize {
        let extended = match byte1 & LENGTH_BITS {
            126 => 2,
            127 => 8,
            _ => 0,
        };
        let mask = if byte1 & MASK_BIT != 0 { 4 } else { 0 };
        2 + extended + mask
    }

    /// Parse a header from the start of `buf`.
    ///
    /// Returns `Ok(None)` if `buf` does not yet hold the whole header,
    /// otherwise the header and the number of bytes it occupied.
    pub fn parse(buf: &[u8]) -> Result<Option<(FrameHeader, usize)>, FrameError> {
        if buf.len() < 2 {
            return Ok(None);
        }

        let byte0 = buf[0];
        let byte1 = buf[1];

        if byte0 & RESERVED_BITS != 0 {
            return Err(FrameError::ReservedBits(byte0 & RESERVED_BITS));
        }
        let opcode = OpCode::from_u8(byte0 & OPCODE_BITS)
            .ok_or(FrameError::UnknownOpcode(byte0 & OPCODE_BITS))?;

        let header_len = Self::len_from_prefix(byte1);
        if buf.len() < header_len {
            return Ok(None);
        }

        let (payload_len, mask_offset) = match byte1 & LENGTH_BITS {
            126 => (u16::from_be_bytes([buf[2], buf[3]]) as u64, 4),
            127 => {
                let mut len = [0u8; 8];
                len.copy_from_slice(&buf[2..10]);
                (u64::from_be_bytes(len), 10)
            }
            n => (n as u64, 2),
        };

        let mask = (byte1 & MASK_BIT != 0).then(|| {
            [
                buf[mask_offset],
                buf[mask_offset + 1],
                buf[mask_offset + 2],
                buf[mask_offset + 3],
            ]
        });

        Ok(Some((
            FrameHeader {
                fin: byte0 & FIN_BIT != 0,
                opcode,
                mask,
                payload_len,
            },
            header_len,
        )))
    }
}

/// One wire frame. The payload is always held unmasked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub opcode: OpCode,
    pub mask: Option<[u8; 4]>,
    pub payload: Bytes,
}

impl Frame {
    /// Build a frame, masking it if `role` is a client.
    pub fn new(opcode: OpCode, payload: impl Into<Bytes>, fin: bool, role: Role) -> Self {
        Self {
            fin,
            opcode,
            mask: role.mask_key(),
            payload: payload.into(),
        }
    }

    /// Append the wire form of this frame to `buf`.
    pub fn encode(&self, buf: &mut BytesMut) {
        encode_frame(buf, self.opcode, &self.payload, self.fin, self.mask);
    }

    /// Decode one frame from the start of `buf`.
    ///
    /// Returns `Ok(None)` if the buffer holds only part of a frame,
    /// otherwise the frame and the number of bytes consumed.
    pub fn decode(buf: &[u8]) -> Result<Option<(Frame, usize)>, FrameError> {
        let Some((header, header_len)) = FrameHeader::parse(buf)? else {
            return Ok(None);
        };

        let payload_len = usize::try_from(header.payload_len).map_err(|_| {
            FrameError::PayloadTooLarge {
                size: header.payload_len,
                max: usize::MAX,
            }
        })?;
        let Some(total) = header_len.checked_add(payload_len) else {
            return Err(FrameError::PayloadTooLarge {
                size: header.payload_len,
                max: usize::MAX - header_len,
            });
        };
        if buf.len() < total {
            return Ok(None);
        }

        let mut payload = buf[header_len..total].to_vec();
        if let Some(mask) = header.mask {
            apply_mask(&mut payload, mask);
        }

        Ok(Some((
            Frame {
                fin: header.fin,
                opcode: header.opcode,
                mask: header.mask,
                payload: Bytes::from(payload),
            },
            total,
        )))
    }
}

/// Append a single frame to `buf`.
///
/// The length field always equals `payload.len()`. When `mask` is given the
/// key follows the length and the payload is written XOR-masked.
pub fn encode_frame(
    buf: &mut BytesMut,
    opcode: OpCode,
    payload: &[u8],
    fin: bool,
    mask: Option<[u8; 4]>,
) {
    let payload_len = payload.len();
    buf.reserve(MAX_HEADER_LEN + payload_len);

    let fin_bit = if fin { FIN_BIT } else { 0 };
    buf.put_u8(fin_bit | opcode as u8);

    let mask_bit = if mask.is_some() { MASK_BIT } else { 0 };
    if payload_len <= SMALL_PAYLOAD_MAX {
        buf.put_u8(mask_bit | payload_len as u8);
    } else if payload_len <= MEDIUM_PAYLOAD_MAX {
        buf.put_u8(mask_bit | 126);
        buf.put_u16(payload_len as u16);
    } else {
        buf.put_u8(mask_bit | 127);
        buf.put_u64(payload_len as u64);
    }

    match mask {
        Some(key) => {
            buf.put_slice(&key);
            let start = buf.len();
            buf.put_slice(payload);
            apply_mask(&mut buf[start..], key);
        }
        None => buf.put_slice(payload),
    }
}

/// Encode a whole message as one or more frames.
///
/// With `fragment = Some(n)` and a payload longer than `n`, the payload is
/// split into `n`-byte chunks: the first carries `opcode`, the rest are
/// continuations, and only the last has FIN set. Client frames each get
/// their own mask key.
pub fn encode_message(
    payload: &[u8],
    opcode: OpCode,
    role: Role,
    fragment: Option<usize>,
) -> BytesMut {
    let mut buf = BytesMut::with_capacity(payload.len() + MAX_HEADER_LEN);

    match fragment {
        Some(size) if size > 0 && payload.len() > size => {
            let chunks = payload.chunks(size);
            let last = chunks.len() - 1;
            for (i, chunk) in chunks.enumerate() {
                let op = if i == 0 { opcode } else { OpCode::Continuation };
                encode_frame(&mut buf, op, chunk, i == last, role.mask_key());
            }
        }
        _ => encode_frame(&mut buf, opcode, payload, true, role.mask_key()),
    }

    buf
}

/// Whether an I/O error means the peer went away.
pub(crate) fn is_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
    )
}

/// Fill `buf` completely, or report `false` if the stream ended first.
async fn read_exact_or_eof<R>(reader: &mut R, buf: &mut [u8]) -> Result<bool, FrameError>
where
    R: AsyncRead + Unpin,
{
    match reader.read_exact(buf).await {
        Ok(_) => Ok(true),
        Err(e) if is_disconnect(&e) => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Read one frame from a byte stream.
///
/// Returns `Ok(None)` when the stream ends or resets before a whole frame
/// arrives; a truncated frame is a disconnect, not an error.
pub async fn read_frame<R>(reader: &mut R, max_payload: usize) -> Result<Option<Frame>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; MAX_HEADER_LEN];
    if !read_exact_or_eof(reader, &mut header[..2]).await? {
        return Ok(None);
    }

    let header_len = FrameHeader::len_from_prefix(header[1]);
    if !read_exact_or_eof(reader, &mut header[2..header_len]).await? {
        return Ok(None);
    }

    let Some((header, _)) = FrameHeader::parse(&header[..header_len])? else {
        return Ok(None);
    };

    if header.payload_len > max_payload as u64 {
        return Err(FrameError::PayloadTooLarge {
            size: header.payload_len,
            max: max_payload,
        });
    }

    let mut payload = vec![0u8; header.payload_len as usize];
    if !read_exact_or_eof(reader, &mut payload).await? {
        return Ok(None);
    }
    if let Some(mask) = header.mask {
        apply_mask(&mut payload, mask);
    }

    Ok(Some(Frame {
        fin: header.fin,
        opcode: header.opcode,
        mask: header.mask,
        payload: Bytes::from(payload),
    }))
}
