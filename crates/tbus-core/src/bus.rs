//! Buses: routing one address byte per hop.
//!
//! A [`LocalBus`] owns up to 255 device slots. It is itself a [`Device`], so
//! it can be plugged into another bus to form a tree. Messages arriving with
//! a non-empty routing chain are forwarded to the slot named by the first
//! byte (which is consumed); messages with an empty chain are calls on the bus
//! itself, of which only the built-in enumeration exists.
//!
//! Slot `0` is the bus's own reflexive device: routing through it delivers
//! back to the bus.
//!
//! Every plugged device talks upward through its own [`SlotPort`], which
//! prepends the slot address to events so the receiver sees the full address
//! chain of the emitter.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use tbus_protocol::{Msg, payload};
use tbus_types::{
    BUS_CLASS_ID, BUS_METHOD_ENUMERATE, BusEnumeration, DeviceInfo, RemoteError, TbusError,
    UNATTACHED_ADDRESS,
};
use tracing::{debug, info};

use crate::device::{Device, DeviceBase, MsgSender};
use crate::idgen::BitBucket;
use crate::{read, write};

/// Something devices can be plugged into.
#[async_trait]
pub trait Bus: Send + Sync {
    /// Plug `device` into the lowest free slot and return its address.
    ///
    /// # Errors
    ///
    /// [`TbusError::AddressNotAvailable`] when all 255 slots are taken, or
    /// whatever the device's `attach` reports (the slot is freed again).
    async fn plug(&self, device: Arc<dyn Device>) -> Result<u8, TbusError>;

    /// Detach `device` and free its slot. Unknown devices are ignored.
    async fn unplug(&self, device: &dyn Device) -> Result<(), TbusError>;
}

struct Slots {
    /// Set bit = free address.
    free: BitBucket,
    devices: BTreeMap<u8, Arc<dyn Device>>,
}

/// In-process bus.
pub struct LocalBus {
    base: DeviceBase,
    slots: RwLock<Slots>,
    this: Weak<LocalBus>,
}

impl LocalBus {
    pub fn new() -> Arc<Self> {
        Self::with_info(DeviceInfo::new(BUS_CLASS_ID))
    }

    /// A bus reporting `info` as its own identity.
    pub fn with_info(info: DeviceInfo) -> Arc<Self> {
        let mut free = BitBucket::full();
        free.clear(UNATTACHED_ADDRESS);
        Arc::new_cyclic(|this| Self {
            base: DeviceBase::with_info(info),
            slots: RwLock::new(Slots {
                free,
                devices: BTreeMap::new(),
            }),
            this: this.clone(),
        })
    }

    /// The device plugged at `addr`.
    pub fn device(&self, addr: u8) -> Option<Arc<dyn Device>> {
        read(&self.slots).devices.get(&addr).cloned()
    }

    pub fn len(&self) -> usize {
        read(&self.slots).devices.len()
    }

    pub fn is_empty(&self) -> bool {
        read(&self.slots).devices.is_empty()
    }

    /// Identity of every plugged device, by address ascending.
    pub fn enumerate(&self) -> BusEnumeration {
        let devices = read(&self.slots)
            .devices
            .values()
            .map(|dev| dev.info())
            .collect();
        BusEnumeration { devices }
    }

    async fn route(&self, mut msg: Msg) -> Result<(), TbusError> {
        let Some(addr) = msg.head.addrs.pop_front() else {
            return self.handle(msg).await;
        };
        if addr == UNATTACHED_ADDRESS {
            return self.send_msg(msg).await;
        }
        match self.device(addr) {
            Some(device) => {
                debug!(addr, msg_id = msg.head.msg_id, "routing");
                device.send_msg(msg).await
            }
            None => {
                debug!(addr, msg_id = msg.head.msg_id, "no device at address");
                self.base
                    .reply(msg.head.msg_id, Err(RemoteError::invalid_address(addr)))
                    .await
            }
        }
    }

    /// Calls addressed to the bus itself.
    async fn handle(&self, msg: Msg) -> Result<(), TbusError> {
        if msg.head.is_event() {
            return Ok(());
        }
        let result = match msg.body.flag {
            BUS_METHOD_ENUMERATE => payload::encode(&self.enumerate())
                .map(Bytes::from)
                .map_err(|e| RemoteError::from(&e)),
            other => Err(RemoteError::invalid_method(other)),
        };
        self.base.reply(msg.head.msg_id, result).await
    }
}

#[async_trait]
impl MsgSender for LocalBus {
    async fn send_msg(&self, msg: Msg) -> Result<(), TbusError> {
        self.route(msg).await
    }
}

impl Device for LocalBus {
    fn base(&self) -> &DeviceBase {
        &self.base
    }
}

#[async_trait]
impl Bus for LocalBus {
    async fn plug(&self, device: Arc<dyn Device>) -> Result<u8, TbusError> {
        let addr = {
            let mut slots = write(&self.slots);
            let addr = slots.free.first_set().ok_or(TbusError::AddressNotAvailable)?;
            slots.free.clear(addr);
            slots.devices.insert(addr, device.clone());
            addr
        };
        let port = Arc::new(SlotPort {
            bus: self.this.clone(),
            addr,
        });
        if let Err(e) = device.attach(port, addr).await {
            let mut slots = write(&self.slots);
            slots.devices.remove(&addr);
            slots.free.set(addr);
            return Err(e);
        }
        info!(
            addr,
            class_id = device.class_id(),
            device_id = device.device_id(),
            "device plugged"
        );
        Ok(addr)
    }

    async fn unplug(&self, device: &dyn Device) -> Result<(), TbusError> {
        let addr = device.address();
        if addr == UNATTACHED_ADDRESS {
            return Ok(());
        }
        let removed = {
            let mut slots = write(&self.slots);
            let owned = slots.devices.get(&addr).is_some_and(|plugged| {
                std::ptr::addr_eq(Arc::as_ptr(plugged), std::ptr::from_ref(device))
            });
            if owned {
                slots.devices.remove(&addr);
                slots.free.set(addr);
            }
            owned
        };
        if removed {
            device.detach().await?;
            info!(addr, class_id = device.class_id(), "device unplugged");
        }
        Ok(())
    }
}

/// Upward port handed to the device in one slot.
struct SlotPort {
    bus: Weak<LocalBus>,
    addr: u8,
}

#[async_trait]
impl MsgSender for SlotPort {
    async fn send_msg(&self, mut msg: Msg) -> Result<(), TbusError> {
        let bus = self.bus.upgrade().ok_or(TbusError::NotAttached)?;
        if msg.head.is_event() {
            msg.head.addrs.push_front(self.addr);
        }
        bus.base.send_to_bus(msg).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::tests::recording_port;
    use crate::dispatch::{DispatchTable, ServiceDevice};
    use tbus_protocol::MsgBuilder;
    use tokio::sync::mpsc;

    fn leaf(class_id: u32) -> Arc<ServiceDevice> {
        let table = DispatchTable::new().method(1, |n: u32| async move {
            Ok::<_, RemoteError>(n + 1)
        });
        Arc::new(ServiceDevice::new(DeviceInfo::new(class_id), table))
    }

    async fn attached_bus() -> (Arc<LocalBus>, mpsc::UnboundedReceiver<Msg>) {
        let bus = LocalBus::new();
        let (port, rx) = recording_port();
        bus.attach(port, 0).await.unwrap();
        (bus, rx)
    }

    #[tokio::test]
    async fn plug_takes_lowest_free_address() {
        let bus = LocalBus::new();
        let a = leaf(0x10);
        let b = leaf(0x11);
        let c = leaf(0x12);
        assert_eq!(bus.plug(a.clone()).await.unwrap(), 1);
        assert_eq!(bus.plug(b.clone()).await.unwrap(), 2);
        assert_eq!(b.address(), 2);

        bus.unplug(a.as_ref()).await.unwrap();
        assert_eq!(a.address(), UNATTACHED_ADDRESS);
        assert!(a.bus_port().is_none());
        assert_eq!(bus.plug(c).await.unwrap(), 1);
        assert_eq!(bus.len(), 2);
    }

    #[tokio::test]
    async fn address_space_exhaustion() {
        let bus = LocalBus::new();
        for expected in 1..=255u8 {
            assert_eq!(bus.plug(leaf(0x10)).await.unwrap(), expected);
        }
        assert!(matches!(
            bus.plug(leaf(0x10)).await,
            Err(TbusError::AddressNotAvailable)
        ));
    }

    #[tokio::test]
    async fn failed_attach_rolls_back() {
        let bus = LocalBus::new();
        let device = leaf(0x10);
        let (port, _rx) = recording_port();
        device.attach(port, 9).await.unwrap();

        assert!(matches!(
            bus.plug(device.clone()).await,
            Err(TbusError::AlreadyAttached)
        ));
        assert!(bus.is_empty());
        assert_eq!(bus.plug(leaf(0x11)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn unplug_ignores_foreign_device() {
        let bus = LocalBus::new();
        let other = LocalBus::new();
        let mine = leaf(0x10);
        let theirs = leaf(0x11);
        bus.plug(mine.clone()).await.unwrap();
        other.plug(theirs.clone()).await.unwrap();

        // Same address, different bus.
        bus.unplug(theirs.as_ref()).await.unwrap();
        assert_eq!(bus.len(), 1);
        assert_eq!(theirs.address(), 1);
    }

    #[tokio::test]
    async fn enumerate_is_sorted_and_excludes_self() {
        let (bus, mut rx) = attached_bus().await;
        bus.plug(leaf(0x10)).await.unwrap();
        bus.plug(leaf(0x11)).await.unwrap();
        bus.plug(leaf(0x12)).await.unwrap();
        bus.unplug(bus.device(2).unwrap().as_ref()).await.unwrap();

        let call = MsgBuilder::new()
            .msg_id(3)
            .body(BUS_METHOD_ENUMERATE, Bytes::new())
            .build();
        bus.send_msg(call).await.unwrap();
        let reply = rx.recv().await.unwrap();
        let listing: BusEnumeration = reply.body.decode().unwrap();
        let addrs: Vec<u8> = listing.devices.iter().map(|d| d.address).collect();
        assert_eq!(addrs, vec![1, 3]);
        assert_eq!(listing.devices[1].class_id, 0x12);
    }

    #[tokio::test]
    async fn missing_address_replies_invalid_address() {
        let (bus, mut rx) = attached_bus().await;
        let call = MsgBuilder::new().route_to([7u8]).msg_id(11).build();
        bus.send_msg(call).await.unwrap();
        let reply = rx.recv().await.unwrap();
        assert_eq!(reply.head.msg_id, 11);
        assert!(matches!(
            reply.body.decode::<()>(),
            Err(TbusError::InvalidAddress)
        ));
    }

    #[tokio::test]
    async fn unknown_bus_method_is_invalid_method() {
        let (bus, mut rx) = attached_bus().await;
        let call = MsgBuilder::new().msg_id(1).body(9, Bytes::new()).build();
        bus.send_msg(call).await.unwrap();
        let reply = rx.recv().await.unwrap();
        assert!(matches!(
            reply.body.decode::<()>(),
            Err(TbusError::InvalidMethod)
        ));
    }

    #[tokio::test]
    async fn address_zero_is_the_bus_itself() {
        let (bus, mut rx) = attached_bus().await;
        bus.plug(leaf(0x10)).await.unwrap();
        let call = MsgBuilder::new()
            .route_to([0u8, 0])
            .msg_id(2)
            .body(BUS_METHOD_ENUMERATE, Bytes::new())
            .build();
        bus.send_msg(call).await.unwrap();
        let listing: BusEnumeration = rx.recv().await.unwrap().body.decode().unwrap();
        assert_eq!(listing.devices.len(), 1);
    }

    #[tokio::test]
    async fn routed_call_reaches_leaf_and_reply_comes_back() {
        let (bus, mut rx) = attached_bus().await;
        bus.plug(leaf(0x10)).await.unwrap();
        let call = MsgBuilder::new()
            .route_to([1u8])
            .msg_id(20)
            .encode_body(1, &41u32)
            .unwrap()
            .build();
        bus.send_msg(call).await.unwrap();
        let reply = rx.recv().await.unwrap();
        assert_eq!(reply.head.msg_id, 20);
        assert!(reply.head.addrs.is_empty());
        assert_eq!(reply.body.decode::<u32>().unwrap(), 42);
    }

    #[tokio::test]
    async fn nested_events_carry_full_chain() {
        let (root, mut rx) = attached_bus().await;
        let inner = LocalBus::new();
        root.plug(inner.clone()).await.unwrap();
        let device = leaf(0x10);
        inner.plug(device.clone()).await.unwrap();
        inner.plug(leaf(0x11)).await.unwrap();

        device.handle().emit_event(2, &5u8).await.unwrap();
        let event = rx.recv().await.unwrap();
        assert!(event.head.is_event());
        assert_eq!(event.head.addrs.as_slice(), &[1, 1]);

        inner.base().emit_event(3, &()).await.unwrap();
        let event = rx.recv().await.unwrap();
        assert_eq!(event.head.addrs.as_slice(), &[1]);
    }
}
