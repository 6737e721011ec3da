//! [`Msg`] and its framing.
//!
//! ```text
//! ┌──────────────┬────────┬───────┬────────────┬──────────────┬───────────┬──────────┐
//! │ 110nnnnn (?) │ addrs  │ flags │ msg id     │ body length  │ body flag │ body     │
//! │ n = hops - 1 │ n + 1  │ 0001e │ varint ≤ 5 │ varint ≤ 4   │ 1 byte    │ len - 1  │
//! └──────────────┴────────┴───────┴────────────┴──────────────┴───────────┴──────────┘
//! ```
//!
//! The body length counts the body flag byte. A decoded body length of zero
//! yields flag `0` and no data.
//!
//! Decoding is streaming: the header is read first to learn the body length,
//! then exactly that many bytes are read. [`Msg::decode`] works on an
//! in-memory [`Buf`]; [`Msg::read_from`] on any [`AsyncRead`].

use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use tbus_types::{RemoteError, TbusError};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::payload;
use crate::route::RouteAddr;
use crate::varint::{self, BODY_LEN_MAX_BYTES, MSG_ID_MAX_BYTES};

pub const PFX_ROUTING_MASK: u8 = 0xe0;
pub const PFX_ROUTING: u8 = 0xc0;
pub const PFX_ROUTING_ADDR_NUM: u8 = 0x1f;

/// Most hops a single routing prefix can describe.
pub const ROUTING_ADDRS_MAX: usize = 32;

pub const FORMAT_MASK: u8 = 0xf0;
/// Protocol revision 1.
pub const FORMAT: u8 = 0x10;
/// Set in the flags byte of unsolicited events.
pub const EVENT_MASK: u8 = 0x01;

/// Set in the body flag byte when the body is an encoded [`RemoteError`].
pub const BODY_ERROR: u8 = 0x80;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MsgHead {
    /// Remaining hops; empty once the message reached its terminal device.
    pub addrs: RouteAddr,
    pub flag: u8,
    pub msg_id: u32,
}

impl MsgHead {
    /// Whether the message still has bus hops to take.
    pub fn need_route(&self) -> bool {
        !self.addrs.is_empty()
    }

    pub fn is_event(&self) -> bool {
        self.flag & EVENT_MASK != 0
    }
}

impl Default for MsgHead {
    fn default() -> Self {
        Self {
            addrs: RouteAddr::new(),
            flag: FORMAT,
            msg_id: 0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MsgBody {
    /// Method index for calls, channel index for events, [`BODY_ERROR`] for
    /// error replies.
    pub flag: u8,
    pub data: Bytes,
}

impl MsgBody {
    pub fn is_error(&self) -> bool {
        self.flag & BODY_ERROR != 0
    }

    /// Decode the body as `T`, or as the carried error when the error flag is
    /// set.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, TbusError> {
        if self.is_error() {
            return Err(self.decode_error());
        }
        payload::decode(&self.data)
    }

    /// The error carried in an error body. An undecodable error record is
    /// itself reported as a payload error.
    pub fn decode_error(&self) -> TbusError {
        match payload::decode::<RemoteError>(&self.data) {
            Ok(remote) => remote.into(),
            Err(e) => e,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Msg {
    pub head: MsgHead,
    pub body: MsgBody,
}

impl Msg {
    /// Size of the body on the wire, flag byte included.
    pub fn body_len(&self) -> usize {
        self.body.data.len() + 1
    }

    /// Exact number of bytes [`Msg::encode`] writes.
    pub fn encoded_len(&self) -> usize {
        let hops = self.head.addrs.len();
        let prefix = if hops > 0 { hops + 1 } else { 0 };
        let body_len = self.body_len();
        prefix
            + 1
            + varint::encoded_len(self.head.msg_id)
            + varint::encoded_len(body_len as u32)
            + body_len
    }

    /// Append the framed message to `buf`.
    pub fn encode(&self, buf: &mut impl BufMut) -> Result<(), TbusError> {
        let hops = self.head.addrs.len();
        if hops > ROUTING_ADDRS_MAX {
            return Err(TbusError::TooManyAddresses(hops));
        }
        let body_len = self.body_len();
        if body_len > u32::MAX as usize || varint::encoded_len(body_len as u32) > BODY_LEN_MAX_BYTES {
            return Err(TbusError::Framing(format!("body of {body_len} bytes is too large")));
        }
        if hops > 0 {
            buf.put_u8(PFX_ROUTING | (hops - 1) as u8);
            buf.put_slice(&self.head.addrs);
        }
        buf.put_u8((self.head.flag & !FORMAT_MASK) | FORMAT);
        varint::encode(buf, self.head.msg_id);
        varint::encode(buf, body_len as u32);
        buf.put_u8(self.body.flag);
        buf.put_slice(&self.body.data);
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Bytes, TbusError> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Decode one message from the front of `buf`.
    ///
    /// Running out of input is reported as an `UnexpectedEof` I/O error.
    pub fn decode(buf: &mut impl Buf) -> Result<Msg, TbusError> {
        let leading = take_u8(buf)?;
        let (addrs, flag) = if is_routing(leading) {
            let hops = routing_hops(leading);
            ensure(buf, hops)?;
            let addrs = RouteAddr::from(buf.copy_to_bytes(hops).to_vec());
            (addrs, take_u8(buf)?)
        } else {
            (RouteAddr::new(), leading)
        };
        check_format(flag)?;
        let msg_id = varint::decode(buf, MSG_ID_MAX_BYTES)?;
        let body_len = varint::decode(buf, BODY_LEN_MAX_BYTES)? as usize;
        ensure(buf, body_len)?;
        let body = split_body(buf.copy_to_bytes(body_len));
        Ok(Msg {
            head: MsgHead {
                addrs,
                flag,
                msg_id,
            },
            body,
        })
    }

    /// Read one message from an async stream.
    ///
    /// Returns `Ok(None)` when the stream ends cleanly before the first byte
    /// of a frame; an end of stream inside a frame is an `UnexpectedEof`
    /// error.
    pub async fn read_from<R>(reader: &mut R) -> Result<Option<Msg>, TbusError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut leading = [0u8; 1];
        if reader.read(&mut leading).await? == 0 {
            return Ok(None);
        }
        let (addrs, flag) = if is_routing(leading[0]) {
            let mut addrs = vec![0u8; routing_hops(leading[0])];
            reader.read_exact(&mut addrs).await?;
            (RouteAddr::from(addrs), reader.read_u8().await?)
        } else {
            (RouteAddr::new(), leading[0])
        };
        check_format(flag)?;
        let msg_id = varint::read(reader, MSG_ID_MAX_BYTES).await?;
        let body_len = varint::read(reader, BODY_LEN_MAX_BYTES).await? as usize;
        let mut raw = vec![0u8; body_len];
        reader.read_exact(&mut raw).await?;
        Ok(Some(Msg {
            head: MsgHead {
                addrs,
                flag,
                msg_id,
            },
            body: split_body(Bytes::from(raw)),
        }))
    }

    /// Encode and write the whole frame, then flush.
    pub async fn write_to<W>(&self, writer: &mut W) -> Result<(), TbusError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let frame = self.to_bytes()?;
        writer.write_all(&frame).await?;
        writer.flush().await?;
        Ok(())
    }
}

fn is_routing(byte: u8) -> bool {
    byte & PFX_ROUTING_MASK == PFX_ROUTING
}

fn routing_hops(prefix: u8) -> usize {
    usize::from(prefix & PFX_ROUTING_ADDR_NUM) + 1
}

fn check_format(flag: u8) -> Result<(), TbusError> {
    if flag & FORMAT_MASK == FORMAT {
        Ok(())
    } else {
        Err(TbusError::Framing(format!("unknown byte 0x{flag:02x}")))
    }
}

fn split_body(mut raw: Bytes) -> MsgBody {
    if raw.is_empty() {
        return MsgBody::default();
    }
    let flag = raw.get_u8();
    MsgBody { flag, data: raw }
}

fn take_u8(buf: &mut impl Buf) -> Result<u8, TbusError> {
    ensure(buf, 1)?;
    Ok(buf.get_u8())
}

fn ensure(buf: &impl Buf, len: usize) -> Result<(), TbusError> {
    if buf.remaining() < len {
        Err(io::Error::from(io::ErrorKind::UnexpectedEof).into())
    } else {
        Ok(())
    }
}
