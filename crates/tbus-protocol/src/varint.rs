//! Little-endian base-128 integers.
//!
//! Each byte carries 7 data bits, least significant group first; bit 7 is set
//! on every byte except the last. Decoders are bounded: a varint that still
//! has its continuation bit set after `max_bytes` bytes is a framing error.

use std::io;

use bytes::{Buf, BufMut};
use tbus_types::TbusError;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Widest message id encoding (a full `u32` needs 5 groups of 7 bits).
pub const MSG_ID_MAX_BYTES: usize = 5;

/// Widest body length encoding (28 bits).
pub const BODY_LEN_MAX_BYTES: usize = 4;

/// Widest compact 16-bit length encoding.
pub const COMPACT_LEN_MAX_BYTES: usize = 2;

const CONTINUATION: u8 = 0x80;
const DATA_BITS: u8 = 0x7f;

/// Append `val` to `buf`, returning the number of bytes written.
pub fn encode(buf: &mut impl BufMut, mut val: u32) -> usize {
    let mut written = 0;
    loop {
        let mut byte = (val as u8) & DATA_BITS;
        val >>= 7;
        if val != 0 {
            byte |= CONTINUATION;
        }
        buf.put_u8(byte);
        written += 1;
        if val == 0 {
            return written;
        }
    }
}

/// Number of bytes [`encode`] produces for `val`.
pub fn encoded_len(val: u32) -> usize {
    let bits = 32 - val.leading_zeros() as usize;
    bits.div_ceil(7).max(1)
}

/// Decode a varint of at most `max_bytes` bytes from `buf`.
pub fn decode(buf: &mut impl Buf, max_bytes: usize) -> Result<u32, TbusError> {
    let mut val = 0u64;
    for i in 0..max_bytes {
        if !buf.has_remaining() {
            return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
        }
        let byte = buf.get_u8();
        val |= u64::from(byte & DATA_BITS) << (7 * i);
        if byte & CONTINUATION == 0 {
            return narrow(val);
        }
    }
    Err(too_wide(max_bytes))
}

/// Read a varint of at most `max_bytes` bytes from an async reader.
pub async fn read<R>(reader: &mut R, max_bytes: usize) -> Result<u32, TbusError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut val = 0u64;
    for i in 0..max_bytes {
        let byte = reader.read_u8().await?;
        val |= u64::from(byte & DATA_BITS) << (7 * i);
        if byte & CONTINUATION == 0 {
            return narrow(val);
        }
    }
    Err(too_wide(max_bytes))
}

fn narrow(val: u64) -> Result<u32, TbusError> {
    u32::try_from(val).map_err(|_| TbusError::Framing(format!("varint {val} overflows 32 bits")))
}

fn too_wide(max_bytes: usize) -> TbusError {
    TbusError::Framing(format!("varint exceeds {max_bytes} bytes"))
}
