//! Framing messages over a byte stream.
//!
//! [`MsgStreamer`] is the write half: a [`MsgSender`] that encodes each
//! message and writes the whole frame under a lock, so concurrent senders
//! never interleave. [`decode_stream`] is the read half: it decodes frames
//! until the stream ends and hands each one to a sender.
//!
//! [`StreamBusPort`] joins both around a local device: the device gets the
//! streamer as its bus port, and inbound frames are delivered to it.

use std::sync::Arc;

use async_trait::async_trait;
use tbus_core::signal;
use tbus_core::{Device, MsgSender};
use tbus_protocol::Msg;
use tbus_types::{TbusError, ignore_closing};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, watch};
use tracing::debug;

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Serialised frame writer.
pub struct MsgStreamer {
    writer: Mutex<BoxedWriter>,
}

impl MsgStreamer {
    pub fn new(writer: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        Self {
            writer: Mutex::new(Box::new(writer)),
        }
    }

    /// Shut down the write side so the peer sees the end of the stream.
    pub async fn shutdown(&self) -> Result<(), TbusError> {
        let mut writer = self.writer.lock().await;
        ignore_closing(writer.shutdown().await.map_err(TbusError::from))
    }
}

#[async_trait]
impl MsgSender for MsgStreamer {
    async fn send_msg(&self, msg: Msg) -> Result<(), TbusError> {
        let frame = msg.to_bytes()?;
        let mut writer = self.writer.lock().await;
        writer.write_all(&frame).await?;
        writer.flush().await?;
        Ok(())
    }
}

/// Decode frames from `reader` and pass each to `sender` until the stream
/// ends or `shutdown` fires.
///
/// A clean end of stream and connection-closed errors return `Ok(())`;
/// framing errors and failures of `sender` end the loop with the error.
pub async fn decode_stream<R>(
    reader: &mut R,
    sender: &dyn MsgSender,
    shutdown: Option<watch::Receiver<bool>>,
) -> Result<(), TbusError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let stop = signal::aborted(shutdown);
    tokio::pin!(stop);
    loop {
        let next = tokio::select! {
            biased;
            _ = &mut stop => return Ok(()),
            next = Msg::read_from(reader) => next,
        };
        match next {
            Ok(Some(msg)) => {
                debug!(
                    msg_id = msg.head.msg_id,
                    route = %msg.head.addrs,
                    event = msg.head.is_event(),
                    "frame received"
                );
                if let Err(e) = sender.send_msg(msg).await {
                    return ignore_closing(Err(e));
                }
            }
            Ok(None) => return Ok(()),
            Err(e) => return ignore_closing(Err(e)),
        }
    }
}

/// Exposes a local device over a stream.
pub struct StreamBusPort {
    reader: BoxedReader,
    streamer: Arc<MsgStreamer>,
}

impl StreamBusPort {
    pub fn new(
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        Self {
            reader: Box::new(reader),
            streamer: Arc::new(MsgStreamer::new(writer)),
        }
    }

    pub fn streamer(&self) -> &Arc<MsgStreamer> {
        &self.streamer
    }

    /// Read one frame directly, outside the pumping loop. Used by the
    /// handshake.
    pub async fn read_msg(&mut self) -> Result<Option<Msg>, TbusError> {
        Msg::read_from(&mut self.reader).await
    }

    /// Attach `device` at `addr` with the stream as its bus port, deliver
    /// inbound frames to it until the stream closes, then detach it.
    pub async fn run(
        mut self,
        device: Arc<dyn Device>,
        addr: u8,
        shutdown: Option<watch::Receiver<bool>>,
    ) -> Result<(), TbusError> {
        device.attach(self.streamer.clone(), addr).await?;
        let result = decode_stream(&mut self.reader, device.as_ref(), shutdown).await;
        let detached = device.detach().await;
        self.streamer.shutdown().await?;
        result.and(detached)
    }
}
