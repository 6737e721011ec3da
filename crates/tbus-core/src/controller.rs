//! Typed client helpers.
//!
//! A [`Controller`] targets one device through a [`Master`]: it remembers the
//! address chain, the timeout and an optional abort signal, and turns calls
//! and event streams into typed values. Device-class specific controllers
//! wrap one, the way [`BusCtl`] does for the built-in bus class.

use std::future::Future;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tbus_protocol::RouteAddr;
use tbus_types::{BUS_METHOD_ENUMERATE, BusEnumeration, TbusError};
use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::master::{Invocation, Master};
use crate::subscription::{Event, Subscription};

/// Buffered events per [`EventStream`] before the producer waits.
const EVENT_BUFFER: usize = 64;

#[derive(Clone)]
pub struct Controller {
    master: Master,
    address: RouteAddr,
    timeout: Option<Duration>,
    abort: Option<watch::Receiver<bool>>,
}

impl Controller {
    /// Target the device at `address`, inheriting the master's timeout.
    pub fn new(master: Master, address: impl Into<RouteAddr>) -> Self {
        let timeout = master.timeout();
        Self {
            master,
            address: address.into(),
            timeout,
            abort: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Abort every wait started through this controller once `signal`
    /// turns `true`.
    pub fn with_abort(mut self, signal: watch::Receiver<bool>) -> Self {
        self.abort = Some(signal);
        self
    }

    pub fn address(&self) -> &RouteAddr {
        &self.address
    }

    pub fn master(&self) -> &Master {
        &self.master
    }

    /// Start a call and return the pending invocation, configured with this
    /// controller's timeout and abort signal.
    pub async fn start<P>(&self, method: u8, params: &P) -> Result<Invocation, TbusError>
    where
        P: Serialize + ?Sized,
    {
        let inv = self
            .master
            .invoke(method, params, &self.address)
            .await?
            .timeout(self.timeout);
        Ok(match &self.abort {
            Some(signal) => inv.abort_on(signal.clone()),
            None => inv,
        })
    }

    /// Call `method` and decode its result.
    pub async fn invoke<P, R>(&self, method: u8, params: &P) -> Result<R, TbusError>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        self.start(method, params).await?.result().await
    }

    /// Run `handler` with every decodable event on `channel`. Events whose
    /// payload does not decode as `T` are skipped.
    pub fn subscribe<T, F, Fut>(&self, channel: u8, handler: F) -> Subscription
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler = std::sync::Arc::new(handler);
        self.master
            .subscribe(channel, &self.address, move |event: Event| {
                let handler = handler.clone();
                async move {
                    match event.decode::<T>() {
                        Ok(value) => handler(value).await,
                        Err(e) => debug!(
                            channel = event.channel,
                            address = %event.address,
                            error = %e,
                            "skipping undecodable event"
                        ),
                    }
                }
            })
    }

    /// Receive the decoded events on `channel` through a stream.
    pub fn events<T>(&self, channel: u8) -> EventStream<T>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let subscription = self.subscribe(channel, move |value: T| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(value).await;
            }
        });
        EventStream {
            rx,
            _subscription: subscription,
        }
    }
}

/// Decoded events of one channel. Dropping it unsubscribes.
pub struct EventStream<T> {
    rx: mpsc::Receiver<T>,
    _subscription: Subscription,
}

impl<T> EventStream<T> {
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }
}

/// Controller for the built-in bus device class.
#[derive(Clone)]
pub struct BusCtl {
    ctl: Controller,
}

impl BusCtl {
    pub fn new(master: Master, address: impl Into<RouteAddr>) -> Self {
        Self {
            ctl: Controller::new(master, address),
        }
    }

    pub fn from_controller(ctl: Controller) -> Self {
        Self { ctl }
    }

    pub fn controller(&self) -> &Controller {
        &self.ctl
    }

    /// Devices plugged directly into the bus, by address ascending.
    pub async fn enumerate(&self) -> Result<BusEnumeration, TbusError> {
        self.ctl.invoke(BUS_METHOD_ENUMERATE, &()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{Bus, LocalBus};
    use crate::device::Device;
    use crate::dispatch::{DispatchTable, ServiceDevice};
    use crate::signal::abort_signal;
    use std::sync::Arc;
    use tbus_types::{BUS_CLASS_ID, DeviceInfo, RemoteError};
    use tokio::time::timeout;

    fn leaf() -> Arc<ServiceDevice> {
        let table = DispatchTable::new()
            .method(2, |text: String| async move { Ok::<_, RemoteError>(text) });
        Arc::new(ServiceDevice::new(
            DeviceInfo::new(0x70).with_device_id(3),
            table,
        ))
    }

    /// Root bus with a nested bus at 1, which holds a leaf at 1.
    async fn tree() -> Result<(Master, Arc<ServiceDevice>), TbusError> {
        let root = LocalBus::new();
        let nested = LocalBus::new();
        root.plug(nested.clone()).await?;
        let device = leaf();
        nested.plug(device.clone()).await?;
        Ok((Master::new(root).await?, device))
    }

    #[tokio::test]
    async fn bus_tree_enumeration() -> Result<(), Box<dyn std::error::Error>> {
        let (master, _device) = tree().await?;

        let root = BusCtl::new(master.clone(), RouteAddr::new()).enumerate().await?;
        assert_eq!(root.devices.len(), 1);
        assert_eq!(root.devices[0].address, 1);
        assert_eq!(root.devices[0].class_id, BUS_CLASS_ID);

        let nested = BusCtl::new(master.clone(), [1u8]).enumerate().await?;
        assert_eq!(nested.devices.len(), 1);
        assert_eq!(nested.devices[0].class_id, 0x70);
        assert_eq!(nested.devices[0].device_id, 3);

        // The leaf only has method 2 and cannot route further.
        let leaf_err = BusCtl::new(master.clone(), [1u8, 1]).enumerate().await.unwrap_err();
        assert!(matches!(leaf_err, TbusError::InvalidMethod));
        let past_leaf = BusCtl::new(master.clone(), [1u8, 1, 1]).enumerate().await.unwrap_err();
        assert!(matches!(past_leaf, TbusError::RouteNotSupported));

        let missing = BusCtl::new(master, [1u8, 2]).enumerate().await.unwrap_err();
        assert!(matches!(missing, TbusError::InvalidAddress));
        Ok(())
    }

    #[tokio::test]
    async fn typed_invoke_through_nested_bus() -> Result<(), Box<dyn std::error::Error>> {
        let (master, _device) = tree().await?;
        let ctl = Controller::new(master, [1u8, 1]);
        let reply: String = ctl.invoke(2, "over two hops").await?;
        assert_eq!(reply, "over two hops");
        Ok(())
    }

    #[tokio::test]
    async fn controller_abort_applies_to_calls() -> Result<(), Box<dyn std::error::Error>> {
        // A detached leaf still receives calls but its replies go nowhere.
        let root = LocalBus::new();
        let silent = leaf();
        root.plug(silent.clone()).await?;
        silent.detach().await?;
        let master = Master::new(root).await?;

        let (abort, signal) = abort_signal();
        let ctl = Controller::new(master.clone(), [1u8])
            .with_timeout(None)
            .with_abort(signal);
        let call = tokio::spawn(async move { ctl.invoke::<_, String>(2, "lost").await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        abort.send(true)?;
        assert!(matches!(call.await?, Err(TbusError::RecvAborted)));
        assert_eq!(master.pending_count(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn event_fan_out_by_channel() -> Result<(), Box<dyn std::error::Error>> {
        let (master, device) = tree().await?;
        let ctl = Controller::new(master, [1u8, 1]);
        let mut first = ctl.events::<u32>(2);
        let mut second = ctl.events::<u32>(2);
        let mut other = ctl.events::<u32>(3);

        device.handle().emit_event(2, &7u32).await?;

        let wait = Duration::from_secs(1);
        assert_eq!(timeout(wait, first.recv()).await?, Some(7));
        assert_eq!(timeout(wait, second.recv()).await?, Some(7));
        assert!(timeout(Duration::from_millis(50), other.recv()).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn undecodable_events_are_skipped() -> Result<(), Box<dyn std::error::Error>> {
        let (master, device) = tree().await?;
        let ctl = Controller::new(master, [1u8, 1]);
        let mut texts = ctl.events::<String>(1);

        // 0xff is not a valid length-prefixed UTF-8 string.
        device.handle().emit_raw(1, vec![0xffu8]).await?;
        device.handle().emit_event(1, "ok").await?;
        let got = timeout(Duration::from_secs(1), texts.recv()).await?;
        assert_eq!(got.as_deref(), Some("ok"));
        Ok(())
    }
}
