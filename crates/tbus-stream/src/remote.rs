//! Remote buses and devices over TCP.
//!
//! # Handshake
//!
//! ```text
//! device side (RemoteBusPort)            host side (RemoteDeviceHost)
//!   ── DeviceInfo (identity) ──────────────►  accept, decode identity
//!                                             plug RemoteDevice into bus
//!   ◄───────────── DeviceInfo (address) ──    sent on first attach
//!   attach local device at that address
//!   ◄──────────────── frames ─────────────►
//! ```
//!
//! Both handshake frames carry message id `0`, body flag `0` and no routing.
//! When the connection closes the host unplugs the remote device and the
//! device side detaches its local device.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tbus_core::signal;
use tbus_core::{Bus, Device, DeviceBase, MsgSender};
use tbus_protocol::{Msg, MsgBuilder};
use tbus_types::{DeviceInfo, TbusError, ignore_closing};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::{Mutex, mpsc, watch};
use tracing::{debug, info, warn};

use crate::streamer::{BoxedReader, MsgStreamer, StreamBusPort, decode_stream};

/// How long either side waits for the peer's handshake frame.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

fn identity_msg(info: &DeviceInfo) -> Result<Msg, TbusError> {
    Ok(MsgBuilder::new().encode_body(0, info)?.build())
}

async fn read_identity<R>(reader: &mut R) -> Result<DeviceInfo, TbusError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let msg = tokio::time::timeout(HANDSHAKE_TIMEOUT, Msg::read_from(reader))
        .await
        .map_err(|_| TbusError::RecvTimeout)??
        .ok_or(TbusError::RecvEnd)?;
    msg.body.decode()
}

// ---------------------------------------------------------------------------
// Device side
// ---------------------------------------------------------------------------

/// Exposes a local device (usually a bus) to a remote host.
pub struct RemoteBusPort {
    device: Arc<dyn Device>,
}

impl RemoteBusPort {
    pub fn new(device: Arc<dyn Device>) -> Self {
        Self { device }
    }

    pub fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }

    /// Connect to the host at `addr` and serve until the connection closes
    /// or `shutdown` fires.
    pub async fn connect(
        &self,
        addr: impl ToSocketAddrs,
        shutdown: Option<watch::Receiver<bool>>,
    ) -> Result<(), TbusError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        ignore_closing(self.run_conn(reader, writer, shutdown).await)
    }

    /// Run the connecting half of the handshake on an established stream,
    /// then pump frames to the device.
    pub async fn run_conn(
        &self,
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
        shutdown: Option<watch::Receiver<bool>>,
    ) -> Result<(), TbusError> {
        let mut port = StreamBusPort::new(reader, writer);
        port.streamer()
            .send_msg(identity_msg(&self.device.info())?)
            .await?;
        let assigned = tokio::time::timeout(HANDSHAKE_TIMEOUT, port.read_msg())
            .await
            .map_err(|_| TbusError::RecvTimeout)??
            .ok_or(TbusError::RecvEnd)?;
        let assigned: DeviceInfo = assigned.body.decode()?;
        info!(addr = assigned.address, "attached to remote bus");
        let result = port
            .run(self.device.clone(), assigned.address, shutdown)
            .await;
        info!(addr = assigned.address, "detached from remote bus");
        result
    }
}

// ---------------------------------------------------------------------------
// Host side
// ---------------------------------------------------------------------------

/// A device living at the other end of a connection.
///
/// Calls routed to it are written to the stream; frames read from the
/// stream (replies and events) go up through its bus port.
pub struct RemoteDevice {
    base: DeviceBase,
    streamer: MsgStreamer,
    reader: Mutex<Option<BoxedReader>>,
    /// Set until the handshake reply went out.
    greeting: AtomicBool,
    peer: Option<SocketAddr>,
}

impl RemoteDevice {
    /// A device with the identity the peer announced.
    pub fn new(
        info: DeviceInfo,
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        let info = DeviceInfo {
            address: 0,
            ..info
        };
        Self {
            base: DeviceBase::with_info(info),
            streamer: MsgStreamer::new(writer),
            reader: Mutex::new(Some(Box::new(reader))),
            greeting: AtomicBool::new(true),
            peer: None,
        }
    }

    /// Read the peer's identity from a freshly accepted stream.
    pub async fn handshake(
        mut reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Result<Self, TbusError> {
        let info = read_identity(&mut reader).await?;
        Ok(Self::new(info, reader, writer))
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Pump inbound frames to the bus port until the connection closes.
    pub async fn run(&self, shutdown: Option<watch::Receiver<bool>>) -> Result<(), TbusError> {
        let port = self.base.bus_port().ok_or(TbusError::NotAttached)?;
        let mut reader = self.reader.lock().await.take().ok_or(TbusError::RecvEnd)?;
        decode_stream(&mut reader, port.as_ref(), shutdown).await
    }

    /// Plug into `bus`, run until the connection closes, unplug.
    pub async fn serve(
        self: Arc<Self>,
        bus: Arc<dyn Bus>,
        shutdown: Option<watch::Receiver<bool>>,
    ) -> Result<(), TbusError> {
        let addr = bus.plug(self.clone()).await?;
        let result = self.run(shutdown).await;
        if let Err(e) = &result {
            warn!(addr, peer = ?self.peer, error = %e, "remote device failed");
        }
        bus.unplug(self.as_ref()).await?;
        self.streamer.shutdown().await?;
        result
    }

    /// Close the write side of the connection.
    pub async fn close(&self) -> Result<(), TbusError> {
        self.streamer.shutdown().await
    }
}

#[async_trait]
impl MsgSender for RemoteDevice {
    async fn send_msg(&self, msg: Msg) -> Result<(), TbusError> {
        self.streamer.send_msg(msg).await
    }
}

#[async_trait]
impl Device for RemoteDevice {
    fn base(&self) -> &DeviceBase {
        &self.base
    }

    async fn attach(&self, port: Arc<dyn MsgSender>, addr: u8) -> Result<(), TbusError> {
        self.base.attach(port, addr)?;
        if self.greeting.swap(false, Ordering::AcqRel) {
            let sent = match identity_msg(&self.base.info()) {
                Ok(msg) => self.streamer.send_msg(msg).await,
                Err(e) => Err(e),
            };
            if let Err(e) = sent {
                self.base.detach();
                return Err(e);
            }
            info!(addr, peer = ?self.peer, class_id = self.base.class_id(), "remote device attached");
        }
        Ok(())
    }
}

/// Lifecycle notifications from [`RemoteDeviceHost::run`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    Attached(DeviceInfo),
    Detached(DeviceInfo),
}

/// Accepts remote devices on a TCP listener.
pub struct RemoteDeviceHost {
    listener: TcpListener,
    notify: Option<mpsc::UnboundedSender<HostEvent>>,
}

impl RemoteDeviceHost {
    pub async fn bind(addr: impl ToSocketAddrs) -> Result<Self, TbusError> {
        Ok(Self::from_listener(TcpListener::bind(addr).await?))
    }

    pub fn from_listener(listener: TcpListener) -> Self {
        Self {
            listener,
            notify: None,
        }
    }

    /// Report attachments and detachments to `tx`.
    pub fn with_notify(mut self, tx: mpsc::UnboundedSender<HostEvent>) -> Self {
        self.notify = Some(tx);
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TbusError> {
        Ok(self.listener.local_addr()?)
    }

    /// Wait for the next connection whose first frame is a valid identity.
    /// Connections that fail the handshake are dropped and skipped.
    pub async fn accept(&self) -> Result<RemoteDevice, TbusError> {
        loop {
            let (stream, peer) = self.listener.accept().await?;
            match accept_device(stream, peer).await {
                Ok(device) => return Ok(device),
                Err(e) => warn!(%peer, error = %e, "rejected connection"),
            }
        }
    }

    /// Accept devices and serve each one on `bus` until `shutdown` fires.
    /// Handshakes run concurrently, one task per connection.
    pub async fn run(
        &self,
        bus: Arc<dyn Bus>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(), TbusError> {
        let stop = signal::aborted(Some(shutdown.clone()));
        tokio::pin!(stop);
        loop {
            let (stream, peer) = tokio::select! {
                biased;
                _ = &mut stop => return Ok(()),
                accepted = self.listener.accept() => accepted?,
            };
            debug!(%peer, "connection accepted");
            let bus = bus.clone();
            let shutdown = shutdown.clone();
            let notify = self.notify.clone();
            tokio::spawn(async move {
                let device = match accept_device(stream, peer).await {
                    Ok(device) => Arc::new(device),
                    Err(e) => {
                        warn!(%peer, error = %e, "rejected connection");
                        return;
                    }
                };
                serve_notified(device, bus, shutdown, notify).await;
            });
        }
    }
}

async fn accept_device(stream: TcpStream, peer: SocketAddr) -> Result<RemoteDevice, TbusError> {
    stream.set_nodelay(true)?;
    let (reader, writer) = stream.into_split();
    let mut device = RemoteDevice::handshake(reader, writer).await?;
    device.peer = Some(peer);
    Ok(device)
}

async fn serve_notified(
    device: Arc<RemoteDevice>,
    bus: Arc<dyn Bus>,
    shutdown: watch::Receiver<bool>,
    notify: Option<mpsc::UnboundedSender<HostEvent>>,
) {
    let addr = match bus.plug(device.clone()).await {
        Ok(addr) => addr,
        Err(e) => {
            warn!(peer = ?device.peer, error = %e, "could not plug remote device");
            return;
        }
    };
    let info = device.info();
    if let Some(tx) = &notify {
        let _ = tx.send(HostEvent::Attached(info.clone()));
    }
    if let Err(e) = device.run(Some(shutdown)).await {
        warn!(addr, peer = ?device.peer, error = %e, "remote device failed");
    }
    if let Err(e) = bus.unplug(device.as_ref()).await {
        warn!(addr, error = %e, "unplug failed");
    }
    let _ = device.close().await;
    info!(addr, peer = ?device.peer, "remote device detached");
    if let Some(tx) = &notify {
        let _ = tx.send(HostEvent::Detached(info));
    }
}
