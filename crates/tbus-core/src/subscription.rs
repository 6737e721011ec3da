//! Event subscriptions.
//!
//! Subscribers are kept per channel in a [`PrefixMap`] keyed by the address
//! chain of the emitting device. All subscribers of the same chain share one
//! list. Handlers run in their own tasks, and the registry lock is released
//! before any of them starts, so a handler may subscribe or unsubscribe
//! freely.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, Weak};

use bytes::Bytes;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde::de::DeserializeOwned;
use tbus_protocol::{Msg, RouteAddr, payload};
use tbus_types::TbusError;
use tracing::debug;

use crate::lock;
use crate::prefix_map::PrefixMap;

/// An event as seen by a subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub channel: u8,
    /// Address chain of the emitting device, relative to the master.
    pub address: RouteAddr,
    pub body: Bytes,
}

impl Event {
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, TbusError> {
        payload::decode(&self.body)
    }
}

impl From<Msg> for Event {
    fn from(msg: Msg) -> Self {
        Self {
            channel: msg.body.flag,
            address: msg.head.addrs,
            body: msg.body.data,
        }
    }
}

pub type EventHandler = Arc<dyn Fn(Event) -> BoxFuture<'static, ()> + Send + Sync>;

pub(crate) fn event_handler<F, Fut>(handler: F) -> EventHandler
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |event| handler(event).boxed())
}

type Subscribers = Vec<(u64, EventHandler)>;

#[derive(Default)]
struct Registry {
    next_id: u64,
    channels: HashMap<u8, PrefixMap<Subscribers>>,
}

/// Channel → address chain → handlers.
#[derive(Clone, Default)]
pub(crate) struct Subscriptions {
    registry: Arc<Mutex<Registry>>,
}

impl Subscriptions {
    pub(crate) fn subscribe(
        &self,
        channel: u8,
        address: RouteAddr,
        handler: EventHandler,
    ) -> Subscription {
        let mut registry = lock(&self.registry);
        let id = registry.next_id;
        registry.next_id += 1;
        registry
            .channels
            .entry(channel)
            .or_default()
            .get_or_insert_with(&address, Vec::new)
            .push((id, handler));
        debug!(channel, address = %address, id, "subscribed");
        Subscription {
            registry: Arc::downgrade(&self.registry),
            channel,
            address,
            id,
            closed: false,
        }
    }

    /// Hand `msg` to every matching handler, each in its own task.
    pub(crate) fn dispatch(&self, msg: Msg) {
        let handlers: Vec<EventHandler> = {
            let registry = lock(&self.registry);
            registry
                .channels
                .get(&msg.body.flag)
                .and_then(|map| map.lookup(&msg.head.addrs))
                .map(|subs| subs.iter().map(|(_, h)| h.clone()).collect())
                .unwrap_or_default()
        };
        if handlers.is_empty() {
            debug!(
                channel = msg.body.flag,
                address = %msg.head.addrs,
                "event without subscribers"
            );
            return;
        }
        let event = Event::from(msg);
        for handler in handlers {
            tokio::spawn(handler(event.clone()));
        }
    }

    #[cfg(test)]
    pub(crate) fn channel_count(&self) -> usize {
        lock(&self.registry).channels.len()
    }
}

fn unsubscribe(registry: &Mutex<Registry>, channel: u8, address: &RouteAddr, id: u64) {
    let mut registry = lock(registry);
    let Some(map) = registry.channels.get_mut(&channel) else {
        return;
    };
    let now_empty = match map.lookup_mut(address) {
        Some(subs) => {
            subs.retain(|(sub, _)| *sub != id);
            subs.is_empty()
        }
        None => false,
    };
    if now_empty {
        map.remove(address);
    }
    if map.is_empty() {
        registry.channels.remove(&channel);
    }
}

/// Handle on one registered handler. Closing or dropping it unsubscribes.
pub struct Subscription {
    registry: Weak<Mutex<Registry>>,
    channel: u8,
    address: RouteAddr,
    id: u64,
    closed: bool,
}

impl Subscription {
    pub fn channel(&self) -> u8 {
        self.channel
    }

    pub fn address(&self) -> &RouteAddr {
        &self.address
    }

    /// Remove the handler. Calling it more than once is harmless.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Some(registry) = self.registry.upgrade() {
            unsubscribe(&registry, self.channel, &self.address, self.id);
            debug!(channel = self.channel, address = %self.address, id = self.id, "unsubscribed");
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("channel", &self.channel)
            .field("address", &self.address)
            .field("id", &self.id)
            .field("closed", &self.closed)
            .finish()
    }
}
