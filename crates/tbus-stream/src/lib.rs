//! `tbus-stream` – tbus over byte streams.
//!
//! - [`streamer`] – [`MsgStreamer`], [`decode_stream`] and [`StreamBusPort`]:
//!   framing over any `AsyncRead`/`AsyncWrite` pair.
//! - [`remote`] – TCP transport: [`RemoteDeviceHost`] accepts remote devices
//!   into a local bus, [`RemoteBusPort`] exposes a local device to a host.
//!
//! A remote device is plugged like any other device, so a bus on one machine
//! shows up as a nested bus on another and routes resolve across the link.

pub mod remote;
pub mod streamer;

pub use remote::{HANDSHAKE_TIMEOUT, HostEvent, RemoteBusPort, RemoteDevice, RemoteDeviceHost};
pub use streamer::{MsgStreamer, StreamBusPort, decode_stream};
