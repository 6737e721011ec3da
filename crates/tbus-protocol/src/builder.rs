//! Fluent construction of [`Msg`] values.

use bytes::Bytes;
use serde::Serialize;
use tbus_types::{RemoteError, TbusError};

use crate::payload;
use crate::route::RouteAddr;
use crate::wire::{BODY_ERROR, EVENT_MASK, Msg};

/// Builds a [`Msg`] one part at a time.
///
/// ```
/// use tbus_protocol::MsgBuilder;
///
/// let msg = MsgBuilder::new().route_to([1u8, 2]).msg_id(7).body(1, Vec::<u8>::new()).build();
/// assert!(msg.head.need_route());
/// ```
#[derive(Debug, Default)]
pub struct MsgBuilder {
    msg: Msg,
}

impl MsgBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route_to(mut self, addrs: impl Into<RouteAddr>) -> Self {
        self.msg.head.addrs = addrs.into();
        self
    }

    pub fn msg_id(mut self, msg_id: u32) -> Self {
        self.msg.head.msg_id = msg_id;
        self
    }

    /// Raw body with the given method (or channel) index.
    pub fn body(mut self, flag: u8, data: impl Into<Bytes>) -> Self {
        self.msg.body.flag = flag;
        self.msg.body.data = data.into();
        self
    }

    /// Body with `value` encoded as the payload.
    pub fn encode_body<T>(self, flag: u8, value: &T) -> Result<Self, TbusError>
    where
        T: Serialize + ?Sized,
    {
        let data = payload::encode(value)?;
        Ok(self.body(flag, data))
    }

    /// Error reply body.
    pub fn error(self, err: &RemoteError) -> Result<Self, TbusError> {
        self.encode_body(BODY_ERROR, err)
    }

    /// Mark the message as an event on `channel`.
    pub fn event(mut self, channel: u8, data: impl Into<Bytes>) -> Self {
        self.msg.head.flag |= EVENT_MASK;
        self.body(channel, data)
    }

    pub fn encode_event<T>(self, channel: u8, value: &T) -> Result<Self, TbusError>
    where
        T: Serialize + ?Sized,
    {
        let data = payload::encode(value)?;
        Ok(self.event(channel, data))
    }

    pub fn build(self) -> Msg {
        self.msg
    }
}
