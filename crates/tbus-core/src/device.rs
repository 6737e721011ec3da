//! Devices and the ports they talk through.
//!
//! Everything that can receive a [`Msg`] implements [`MsgSender`]. A
//! [`Device`] is a `MsgSender` with an identity that can be attached to a
//! bus; once attached it holds the bus's port (another `MsgSender`) and sends
//! its replies and events through it.
//!
//! [`DeviceBase`] carries the state every device needs (identity and port)
//! and the helpers for replying and emitting events.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use tbus_protocol::{Msg, MsgBuilder};
use tbus_types::{DeviceInfo, RemoteError, TbusError, UNATTACHED_ADDRESS};
use tracing::debug;

use crate::{read, write};

/// Anything that accepts messages: a device, a bus slot, a stream, a master.
#[async_trait]
pub trait MsgSender: Send + Sync {
    async fn send_msg(&self, msg: Msg) -> Result<(), TbusError>;
}

/// An addressable endpoint.
///
/// Only [`Device::base`] and [`MsgSender::send_msg`] are required; the rest
/// defaults to the shared [`DeviceBase`] behaviour.
#[async_trait]
pub trait Device: MsgSender {
    fn base(&self) -> &DeviceBase;

    fn info(&self) -> DeviceInfo {
        self.base().info()
    }

    fn address(&self) -> u8 {
        self.base().address()
    }

    fn class_id(&self) -> u32 {
        self.base().class_id()
    }

    fn device_id(&self) -> u32 {
        self.base().device_id()
    }

    /// Bind the device to `port` under `addr`.
    ///
    /// # Errors
    ///
    /// [`TbusError::AlreadyAttached`] when the device already has a port.
    async fn attach(&self, port: Arc<dyn MsgSender>, addr: u8) -> Result<(), TbusError> {
        self.base().attach(port, addr)
    }

    async fn detach(&self) -> Result<(), TbusError> {
        self.base().detach();
        Ok(())
    }

    fn bus_port(&self) -> Option<Arc<dyn MsgSender>> {
        self.base().bus_port()
    }
}

/// Identity and port shared by every device implementation.
pub struct DeviceBase {
    info: RwLock<DeviceInfo>,
    port: RwLock<Option<Arc<dyn MsgSender>>>,
}

impl DeviceBase {
    pub fn new(class_id: u32) -> Self {
        Self::with_info(DeviceInfo::new(class_id))
    }

    pub fn with_info(info: DeviceInfo) -> Self {
        Self {
            info: RwLock::new(info),
            port: RwLock::new(None),
        }
    }

    /// Snapshot of the current identity.
    pub fn info(&self) -> DeviceInfo {
        read(&self.info).clone()
    }

    pub fn address(&self) -> u8 {
        read(&self.info).address
    }

    pub fn class_id(&self) -> u32 {
        read(&self.info).class_id
    }

    pub fn device_id(&self) -> u32 {
        read(&self.info).device_id
    }

    pub fn set_device_id(&self, device_id: u32) {
        write(&self.info).device_id = device_id;
    }

    pub fn add_label(&self, key: impl Into<String>, value: impl Into<String>) {
        write(&self.info).labels.insert(key.into(), value.into());
    }

    pub fn attach(&self, port: Arc<dyn MsgSender>, addr: u8) -> Result<(), TbusError> {
        let mut slot = write(&self.port);
        if slot.is_some() {
            return Err(TbusError::AlreadyAttached);
        }
        *slot = Some(port);
        write(&self.info).address = addr;
        Ok(())
    }

    /// Drop the port and reset the address. Returns the previous port.
    pub fn detach(&self) -> Option<Arc<dyn MsgSender>> {
        let port = write(&self.port).take();
        write(&self.info).address = UNATTACHED_ADDRESS;
        port
    }

    pub fn bus_port(&self) -> Option<Arc<dyn MsgSender>> {
        read(&self.port).clone()
    }

    pub fn is_attached(&self) -> bool {
        read(&self.port).is_some()
    }

    /// Send `msg` up through the bus port.
    pub async fn send_to_bus(&self, msg: Msg) -> Result<(), TbusError> {
        let port = self.bus_port().ok_or(TbusError::NotAttached)?;
        port.send_msg(msg).await
    }

    /// Reply to the call `msg_id` with either a payload or an error record.
    pub async fn reply(
        &self,
        msg_id: u32,
        result: Result<Bytes, RemoteError>,
    ) -> Result<(), TbusError> {
        let builder = MsgBuilder::new().msg_id(msg_id);
        let msg = match result {
            Ok(data) => builder.body(0, data).build(),
            Err(err) => {
                debug!(msg_id, code = ?err.code, "replying with error");
                builder.error(&err)?.build()
            }
        };
        self.send_to_bus(msg).await
    }

    /// Emit an event on `channel` with `value` as the payload.
    pub async fn emit_event<T>(&self, channel: u8, value: &T) -> Result<(), TbusError>
    where
        T: Serialize + ?Sized,
    {
        let msg = MsgBuilder::new().encode_event(channel, value)?.build();
        self.send_to_bus(msg).await
    }

    pub async fn emit_raw(&self, channel: u8, data: impl Into<Bytes>) -> Result<(), TbusError> {
        self.send_to_bus(MsgBuilder::new().event(channel, data).build())
            .await
    }
}
