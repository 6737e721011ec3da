//! `tbus-protocol` – the tbus wire format.
//!
//! A message on the wire is:
//!
//! ```text
//! [routing-prefix?] [addr]* [flags] [msg-id varint] [body-len varint] [body-flag] [body...]
//! ```
//!
//! # Modules
//!
//! - [`varint`] – little-endian base-128 integers with a bounded width.
//! - [`route`] – [`RouteAddr`], the address chain consumed one byte per bus hop.
//! - [`wire`] – [`Msg`] and its sync/async codec.
//! - [`builder`] – [`MsgBuilder`] for composing calls, replies and events.
//! - [`payload`] – serde + postcard encoding of message bodies.

pub mod builder;
pub mod payload;
pub mod route;
pub mod varint;
pub mod wire;

pub use builder::MsgBuilder;
pub use route::RouteAddr;
pub use wire::{Msg, MsgBody, MsgHead};
