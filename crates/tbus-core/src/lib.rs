//! `tbus-core` – devices, buses and the calling side of tbus.
//!
//! # Overview
//!
//! - [`idgen`] – [`BitBucket`] and the minimum-value id allocator [`MinIdGen`].
//! - [`device`] – the [`MsgSender`] and [`Device`] traits and [`DeviceBase`].
//! - [`dispatch`] – [`DispatchTable`] and the leaf [`ServiceDevice`].
//! - [`bus`] – the [`Bus`] trait and the in-process [`LocalBus`].
//! - [`master`] – [`Master`] and [`Invocation`]: ids, correlation, timeouts.
//! - [`prefix_map`] / [`subscription`] – event fan-out by address chain.
//! - [`controller`] – typed [`Controller`] and the bus controller [`BusCtl`].
//! - [`signal`] – abort signals.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use tbus_core::{Bus, BusCtl, DispatchTable, LocalBus, Master, ServiceDevice};
//! use tbus_types::{DeviceInfo, RemoteError};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), tbus_types::TbusError> {
//! let bus = LocalBus::new();
//! let table = DispatchTable::new().method(2, |n: u32| async move { Ok::<_, RemoteError>(n * 2) });
//! bus.plug(Arc::new(ServiceDevice::new(DeviceInfo::new(0x100), table))).await?;
//!
//! let master = Master::new(bus).await?;
//! let doubled: u32 = master.invoke(2, &21u32, [1u8]).await?.result().await?;
//! assert_eq!(doubled, 42);
//! assert_eq!(BusCtl::new(master, Vec::<u8>::new()).enumerate().await?.devices.len(), 1);
//! # Ok(())
//! # }
//! ```

use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

pub mod bus;
pub mod controller;
pub mod device;
pub mod dispatch;
pub mod idgen;
pub mod master;
pub mod prefix_map;
pub mod signal;
pub mod subscription;

pub use bus::{Bus, LocalBus};
pub use controller::{BusCtl, Controller, EventStream};
pub use device::{Device, DeviceBase, MsgSender};
pub use dispatch::{DispatchTable, ServiceDevice};
pub use idgen::{BitBucket, MinIdGen};
pub use master::{DEFAULT_INVOCATION_TIMEOUT, Invocation, Master};
pub use prefix_map::PrefixMap;
pub use subscription::{Event, EventHandler, Subscription};

// Lock helpers. A panicking holder leaves the protected tables consistent
// (every critical section is a single map or bitmap update), so poisoning is
// ignored.

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
