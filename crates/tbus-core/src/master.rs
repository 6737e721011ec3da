//! [`Master`] – the calling side of the bus.
//!
//! The master owns one device (usually the root [`LocalBus`][crate::LocalBus])
//! and attaches itself as that device's bus port at address `0`. Calls go
//! down through the device; replies and events come back up through the
//! port.
//!
//! # Invocation lifecycle
//!
//! ```text
//! invoke ──► Pending ──► Completed   (reply arrived)
//!                   ├──► TimedOut    (RecvTimeout, id released)
//!                   └──► Aborted     (RecvAborted, id released)
//! ```
//!
//! Message ids come from a [`MinIdGen`] and are released exactly once:
//! either by the receive path when the reply arrives, or by abandoning the
//! invocation. Each pending entry carries a sequence number so an abandoned
//! invocation can never release an id that has since been handed to a newer
//! call.

use std::collections::HashMap;
use std::future::{self, Future};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tbus_protocol::wire::ROUTING_ADDRS_MAX;
use tbus_protocol::{Msg, MsgBuilder, RouteAddr, payload};
use tbus_types::TbusError;
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

use crate::device::{Device, MsgSender};
use crate::idgen::MinIdGen;
use crate::lock;
use crate::signal;
use crate::subscription::{Event, Subscription, Subscriptions, event_handler};

/// Invocation timeout used unless overridden.
pub const DEFAULT_INVOCATION_TIMEOUT: Duration = Duration::from_secs(60);

struct Pending {
    seq: u64,
    reply: oneshot::Sender<Msg>,
}

#[derive(Default)]
struct Table {
    ids: MinIdGen,
    pending: HashMap<u32, Pending>,
}

struct MasterInner {
    device: Arc<dyn Device>,
    table: Mutex<Table>,
    seq: AtomicU64,
    closed: AtomicBool,
    subs: Subscriptions,
}

impl MasterInner {
    /// Receive path for replies.
    fn complete(&self, msg: Msg) {
        let msg_id = msg.head.msg_id;
        let pending = {
            let mut table = lock(&self.table);
            let pending = table.pending.remove(&msg_id);
            if pending.is_some() {
                table.ids.release(msg_id);
            }
            pending
        };
        match pending {
            Some(pending) => {
                if pending.reply.send(msg).is_err() {
                    debug!(msg_id, "reply arrived after waiter left");
                }
            }
            None => warn!(msg_id, "dropping reply for unknown invocation"),
        }
    }

    /// Drop the pending entry for `msg_id` if it still belongs to `seq`.
    fn abandon(&self, msg_id: u32, seq: u64) {
        let mut table = lock(&self.table);
        if table.pending.get(&msg_id).is_some_and(|p| p.seq == seq) {
            table.pending.remove(&msg_id);
            table.ids.release(msg_id);
            debug!(msg_id, "invocation abandoned");
        }
    }
}

/// Port the master hands to its device.
struct MasterPort {
    master: Weak<MasterInner>,
}

#[async_trait]
impl MsgSender for MasterPort {
    async fn send_msg(&self, msg: Msg) -> Result<(), TbusError> {
        let master = self.master.upgrade().ok_or(TbusError::NotAttached)?;
        if msg.head.is_event() {
            master.subs.dispatch(msg);
        } else {
            master.complete(msg);
        }
        Ok(())
    }
}

/// Issues calls and receives replies and events. Clones share all state.
#[derive(Clone)]
pub struct Master {
    inner: Arc<MasterInner>,
    timeout: Option<Duration>,
}

impl Master {
    /// Attach to `device` at address `0`.
    pub async fn new(device: Arc<dyn Device>) -> Result<Self, TbusError> {
        let inner = Arc::new(MasterInner {
            device,
            table: Mutex::new(Table::default()),
            seq: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            subs: Subscriptions::default(),
        });
        let port = Arc::new(MasterPort {
            master: Arc::downgrade(&inner),
        });
        inner.device.attach(port, 0).await?;
        info!(class_id = inner.device.class_id(), "master attached");
        Ok(Self {
            inner,
            timeout: Some(DEFAULT_INVOCATION_TIMEOUT),
        })
    }

    /// Default timeout for invocations created through this handle; `None`
    /// waits forever.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn device(&self) -> &Arc<dyn Device> {
        &self.inner.device
    }

    /// Call `method` on the device at `addrs` with `params` as the payload.
    pub async fn invoke<P>(
        &self,
        method: u8,
        params: &P,
        addrs: impl Into<RouteAddr>,
    ) -> Result<Invocation, TbusError>
    where
        P: Serialize + ?Sized,
    {
        let body = payload::encode(params)?;
        self.invoke_raw(method, body, addrs).await
    }

    /// Call `method` with an already encoded body.
    ///
    /// # Errors
    ///
    /// Anything sending the call fails with; no invocation stays registered
    /// in that case.
    pub async fn invoke_raw(
        &self,
        method: u8,
        body: impl Into<Bytes>,
        addrs: impl Into<RouteAddr>,
    ) -> Result<Invocation, TbusError> {
        let addrs = addrs.into();
        if addrs.len() > ROUTING_ADDRS_MAX {
            return Err(TbusError::TooManyAddresses(addrs.len()));
        }
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(TbusError::NotAttached);
        }
        let seq = self.inner.seq.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        let msg_id = {
            let mut table = lock(&self.inner.table);
            let msg_id = table.ids.alloc();
            table.pending.insert(msg_id, Pending { seq, reply: tx });
            msg_id
        };
        debug!(msg_id, method, route = %addrs, "invoking");
        let msg = MsgBuilder::new()
            .route_to(addrs)
            .msg_id(msg_id)
            .body(method, body)
            .build();
        if let Err(e) = self.inner.device.send_msg(msg).await {
            self.inner.abandon(msg_id, seq);
            return Err(e);
        }
        Ok(Invocation {
            master: self.inner.clone(),
            msg_id,
            seq,
            reply: Some(rx),
            timeout: self.timeout,
            abort: None,
        })
    }

    /// Run `handler` for every event on `channel` from the device at `addrs`.
    pub fn subscribe<F, Fut>(
        &self,
        channel: u8,
        addrs: impl Into<RouteAddr>,
        handler: F,
    ) -> Subscription
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.inner
            .subs
            .subscribe(channel, addrs.into(), event_handler(handler))
    }

    /// Number of invocations still waiting for a reply.
    pub fn pending_count(&self) -> usize {
        lock(&self.inner.table).pending.len()
    }

    /// Detach from the device and end every pending invocation with
    /// [`TbusError::RecvEnd`].
    pub async fn close(&self) -> Result<(), TbusError> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let pending = {
            let mut table = lock(&self.inner.table);
            let pending = std::mem::take(&mut table.pending);
            table.ids = MinIdGen::new();
            pending
        };
        drop(pending);
        info!("master closed");
        self.inner.device.detach().await
    }

    #[cfg(test)]
    fn is_held(&self, msg_id: u32) -> bool {
        lock(&self.inner.table).ids.is_held(msg_id)
    }
}

/// A call in flight.
///
/// Waiting consumes the invocation. Dropping it without waiting abandons it:
/// the id is released and a late reply is discarded.
#[must_use = "dropping an invocation abandons it"]
pub struct Invocation {
    master: Arc<MasterInner>,
    msg_id: u32,
    seq: u64,
    reply: Option<oneshot::Receiver<Msg>>,
    timeout: Option<Duration>,
    abort: Option<watch::Receiver<bool>>,
}

impl Invocation {
    pub fn message_id(&self) -> u32 {
        self.msg_id
    }

    /// Override the timeout; `None` waits forever.
    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Abort the wait once `signal` turns `true`.
    pub fn abort_on(mut self, signal: watch::Receiver<bool>) -> Self {
        self.abort = Some(signal);
        self
    }

    /// Wait for the raw reply.
    ///
    /// # Errors
    ///
    /// - [`TbusError::RecvTimeout`] when the timeout elapses first.
    /// - [`TbusError::RecvAborted`] when the abort signal fires first.
    /// - [`TbusError::RecvEnd`] when the master was closed.
    pub async fn wait(mut self) -> Result<Msg, TbusError> {
        let reply = self.reply.take().ok_or(TbusError::RecvEnd)?;
        let expiry = self.timeout;
        let abort = self.abort.take();
        let msg_id = self.msg_id;
        let outcome = tokio::select! {
            biased;
            reply = reply => reply.map_err(|_| TbusError::RecvEnd),
            _ = expire(expiry) => Err(TbusError::RecvTimeout),
            _ = signal::aborted(abort) => Err(TbusError::RecvAborted),
        };
        if let Err(e) = &outcome {
            debug!(msg_id, error = %e, "invocation ended without reply");
        }
        // Dropping `self` abandons the entry if it is still pending.
        outcome
    }

    /// Wait for the reply and decode it, surfacing an error reply as the
    /// matching [`TbusError`].
    pub async fn result<T: DeserializeOwned>(self) -> Result<T, TbusError> {
        self.wait().await?.body.decode()
    }

    /// Give up on the reply.
    pub fn ignore(self) {}
}

impl Drop for Invocation {
    fn drop(&mut self) {
        self.master.abandon(self.msg_id, self.seq);
    }
}

async fn expire(timeout: Option<Duration>) {
    match timeout {
        Some(timeout) => tokio::time::sleep(timeout).await,
        None => future::pending().await,
    }
}
