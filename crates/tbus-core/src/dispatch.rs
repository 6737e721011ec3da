//! Method dispatch for leaf devices.
//!
//! A [`DispatchTable`] maps a method index to a handler that turns the call
//! body into a reply payload. It is built once per device class and shared by
//! every instance. [`ServiceDevice`] couples a table with a [`DeviceBase`] to
//! get a complete leaf device.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tbus_protocol::{Msg, payload};
use tbus_types::{DeviceInfo, RemoteError, TbusError};
use tracing::{debug, warn};

use crate::device::{Device, DeviceBase, MsgSender};

/// Future returned by a method handler.
pub type MethodFuture = BoxFuture<'static, Result<Bytes, RemoteError>>;

type Handler = Arc<dyn Fn(Bytes) -> MethodFuture + Send + Sync>;

/// Method index → handler.
///
/// ```
/// use tbus_core::dispatch::DispatchTable;
/// use tbus_types::RemoteError;
///
/// let table = DispatchTable::new()
///     .method(1, |text: String| async move { Ok::<_, RemoteError>(text) })
///     .method(2, |_: ()| async { Ok::<_, RemoteError>(7u32) });
/// assert!(table.contains(1));
/// ```
#[derive(Clone, Default)]
pub struct DispatchTable {
    methods: HashMap<u8, Handler>,
}

impl DispatchTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler working on raw payload bytes.
    pub fn raw_method<F, Fut>(mut self, index: u8, handler: F) -> Self
    where
        F: Fn(Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Bytes, RemoteError>> + Send + 'static,
    {
        self.methods
            .insert(index, Arc::new(move |body| handler(body).boxed()));
        self
    }

    /// Register a handler with typed parameters and result.
    ///
    /// Undecodable parameters are answered with an application error without
    /// calling `handler`.
    pub fn method<P, R, F, Fut>(self, index: u8, handler: F) -> Self
    where
        P: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, RemoteError>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.raw_method(index, move |body: Bytes| {
            let handler = handler.clone();
            async move {
                let params: P = payload::decode(&body)
                    .map_err(|e| RemoteError::application(format!("bad parameters: {e}")))?;
                let reply = handler(params).await?;
                payload::encode(&reply)
                    .map(Bytes::from)
                    .map_err(|e| RemoteError::from(&e))
            }
        })
    }

    pub fn contains(&self, index: u8) -> bool {
        self.methods.contains_key(&index)
    }

    /// Registered method indices, ascending.
    pub fn indices(&self) -> Vec<u8> {
        let mut indices: Vec<u8> = self.methods.keys().copied().collect();
        indices.sort_unstable();
        indices
    }

    /// Run the handler for `index`.
    pub async fn dispatch(&self, index: u8, body: Bytes) -> Result<Bytes, RemoteError> {
        match self.methods.get(&index) {
            Some(handler) => handler(body).await,
            None => Err(RemoteError::invalid_method(index)),
        }
    }
}

/// A leaf device answering calls from a [`DispatchTable`].
///
/// Every call runs in its own task so a slow method never holds up the
/// routing path. Calls that still carry routing addresses are answered with
/// "route not supported".
pub struct ServiceDevice {
    base: Arc<DeviceBase>,
    table: Arc<DispatchTable>,
}

impl ServiceDevice {
    pub fn new(info: DeviceInfo, table: DispatchTable) -> Self {
        Self {
            base: Arc::new(DeviceBase::with_info(info)),
            table: Arc::new(table),
        }
    }

    /// Shared handle on the device state, for emitting events from outside
    /// the dispatch path.
    pub fn handle(&self) -> Arc<DeviceBase> {
        self.base.clone()
    }
}

#[async_trait]
impl MsgSender for ServiceDevice {
    async fn send_msg(&self, msg: Msg) -> Result<(), TbusError> {
        let msg_id = msg.head.msg_id;
        if msg.head.is_event() {
            debug!(msg_id, "leaf device ignores event");
            return Ok(());
        }
        if msg.head.need_route() {
            return self
                .base
                .reply(msg_id, Err(RemoteError::route_not_supported()))
                .await;
        }
        let base = self.base.clone();
        let table = self.table.clone();
        tokio::spawn(async move {
            let method = msg.body.flag;
            let result = table.dispatch(method, msg.body.data).await;
            if let Err(e) = base.reply(msg_id, result).await {
                warn!(msg_id, method, error = %e, "failed to send reply");
            }
        });
        Ok(())
    }
}

impl Device for ServiceDevice {
    fn base(&self) -> &DeviceBase {
        &self.base
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::tests::recording_port;
    use tbus_protocol::MsgBuilder;

    fn echo_table() -> DispatchTable {
        DispatchTable::new()
            .method(1, |text: String| async move { Ok::<_, RemoteError>(text) })
            .method(2, |_: ()| async { Err::<(), _>(RemoteError::application("errorLED")) })
    }

    #[tokio::test]
    async fn typed_method_decodes_and_encodes() {
        let table = echo_table();
        let body = Bytes::from(payload::encode("hello").unwrap());
        let reply = table.dispatch(1, body).await.unwrap();
        assert_eq!(payload::decode::<String>(&reply).unwrap(), "hello");
        assert_eq!(table.indices(), vec![1, 2]);
    }

    #[tokio::test]
    async fn unknown_method_is_invalid_method() {
        let err = echo_table().dispatch(9, Bytes::new()).await.unwrap_err();
        assert_eq!(err, RemoteError::invalid_method(9));
    }

    #[tokio::test]
    async fn bad_parameters_are_application_error() {
        // A length prefix promising more bytes than present.
        let err = echo_table()
            .dispatch(1, Bytes::from_static(&[5, b'a']))
            .await
            .unwrap_err();
        assert!(err.message.starts_with("bad parameters"));
    }

    #[tokio::test]
    async fn service_device_replies_through_port() {
        let device = ServiceDevice::new(DeviceInfo::new(0x30), echo_table());
        let (port, mut rx) = recording_port();
        device.attach(port, 1).await.unwrap();

        let call = MsgBuilder::new()
            .msg_id(5)
            .encode_body(1, "ping")
            .unwrap()
            .build();
        device.send_msg(call).await.unwrap();
        let reply = rx.recv().await.unwrap();
        assert_eq!(reply.head.msg_id, 5);
        assert_eq!(reply.body.decode::<String>().unwrap(), "ping");

        let failing = MsgBuilder::new().msg_id(6).body(2, Bytes::new()).build();
        device.send_msg(failing).await.unwrap();
        let reply = rx.recv().await.unwrap();
        assert!(matches!(reply.body.decode::<()>(), Err(TbusError::Remote(m)) if m == "errorLED"));
    }

    #[tokio::test]
    async fn routed_call_to_leaf_is_route_not_supported() {
        let device = ServiceDevice::new(DeviceInfo::new(0x30), echo_table());
        let (port, mut rx) = recording_port();
        device.attach(port, 1).await.unwrap();

        let call = MsgBuilder::new().route_to([1u8]).msg_id(8).build();
        device.send_msg(call).await.unwrap();
        let reply = rx.recv().await.unwrap();
        assert!(matches!(
            reply.body.decode::<()>(),
            Err(TbusError::RouteNotSupported)
        ));
    }
}
