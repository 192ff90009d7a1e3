//! Binary frame codec (RFC 6455 subset)
//!
//! Reads client frames of any length encoding, masked or not, and writes
//! unfragmented, unmasked server frames.
//!
//! ```text
//!  byte 0: FIN | RSV1-3 | opcode(4)
//!  byte 1: MASK | len(7)      len 126 -> u16 BE follows, 127 -> u64 BE follows
//!  [mask key: 4 bytes]        only when MASK is set
//!  payload                    XOR maskKey[i % 4] when masked
//! ```

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::FrameError;

const FIN: u8 = 0x80;
const MASK: u8 = 0x80;

/// Frame opcode (low 4 bits of the first header byte)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
    /// Reserved opcodes, carried through so the caller can skip them
    Other(u8),
}

impl OpCode {
    /// Parse the opcode nibble
    pub fn from_u8(byte: u8) -> Self {
        match byte & 0x0F {
            0x0 => OpCode::Continuation,
            0x1 => OpCode::Text,
            0x2 => OpCode::Binary,
            0x8 => OpCode::Close,
            0x9 => OpCode::Ping,
            0xA => OpCode::Pong,
            other => OpCode::Other(other),
        }
    }

    /// The opcode nibble
    pub fn as_u8(self) -> u8 {
        match self {
            OpCode::Continuation => 0x0,
            OpCode::Text => 0x1,
            OpCode::Binary => 0x2,
            OpCode::Close => 0x8,
            OpCode::Ping => 0x9,
            OpCode::Pong => 0xA,
            OpCode::Other(b) => b & 0x0F,
        }
    }
}

/// One decoded frame with its payload already unmasked
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub opcode: OpCode,
    pub payload: Vec<u8>,
}

/// Read one frame
///
/// Returns `Ok(None)` on a close frame. Short reads surface as
/// `FrameError::Io`; a declared length above `max_len` as `TooLarge`.
/// Either way the stream is unusable afterwards.
pub async fn read_frame<R>(reader: &mut R, max_len: usize) -> Result<Option<Frame>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 2];
    reader.read_exact(&mut header).await?;

    let opcode = OpCode::from_u8(header[0]);
    if opcode == OpCode::Close {
        return Ok(None);
    }

    let masked = header[1] & MASK != 0;
    let len = match header[1] & 0x7F {
        126 => u64::from(reader.read_u16().await?),
        127 => reader.read_u64().await?,
        n => u64::from(n),
    };
    if len > max_len as u64 {
        return Err(FrameError::TooLarge { len, max: max_len });
    }

    let mask_key = if masked {
        let mut key = [0u8; 4];
        reader.read_exact(&mut key).await?;
        Some(key)
    } else {
        None
    };

    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;

    if let Some(key) = mask_key {
        apply_mask(&mut payload, key);
    }

    Ok(Some(Frame { opcode, payload }))
}

/// Encode a final, unmasked frame as sent by the server
pub fn encode_frame(opcode: OpCode, payload: &[u8]) -> Vec<u8> {
    encode_frame_with_mask(opcode, payload, None)
}

/// Encode a final frame, masking the payload when a key is given
pub fn encode_frame_with_mask(opcode: OpCode, payload: &[u8], mask_key: Option<[u8; 4]>) -> Vec<u8> {
    let len = payload.len();
    let mut out = Vec::with_capacity(len + 14);
    out.push(FIN | opcode.as_u8());

    let mask_bit = if mask_key.is_some() { MASK } else { 0 };
    if len <= 125 {
        out.push(mask_bit | len as u8);
    } else if len <= u16::MAX as usize {
        out.push(mask_bit | 126);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        out.push(mask_bit | 127);
        out.extend_from_slice(&(len as u64).to_be_bytes());
    }

    match mask_key {
        Some(key) => {
            out.extend_from_slice(&key);
            let start = out.len();
            out.extend_from_slice(payload);
            apply_mask(&mut out[start..], key);
        }
        None => out.extend_from_slice(payload),
    }
    out
}

fn apply_mask(payload: &mut [u8], key: [u8; 4]) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= key[i % 4];
    }
}
