//! `tbus-types` – shared vocabulary of the tbus workspace.
//!
//! Every other crate speaks in these types: the identity record a device
//! reports about itself ([`DeviceInfo`]), the reply of the built-in bus
//! enumeration ([`BusEnumeration`]), the error record carried inside error
//! replies ([`RemoteError`]) and the workspace-wide error enum
//! ([`TbusError`]).

use std::collections::BTreeMap;
use std::io;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Class id of the built-in bus device.
pub const BUS_CLASS_ID: u32 = 0x0001;

/// Method index of the built-in bus enumeration call.
pub const BUS_METHOD_ENUMERATE: u8 = 1;

/// Address reported by a device that is not plugged into any bus, and the
/// reflexive slot of a bus itself.
pub const UNATTACHED_ADDRESS: u8 = 0;

/// Identity of a device: what it is, which instance it is, and where it is
/// currently plugged.
///
/// Also the payload of both handshake frames exchanged over a stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Slot assigned by the bus the device is plugged into (0 = unattached).
    pub address: u8,
    /// Compiled-in schema/type identifier.
    pub class_id: u32,
    /// Operator-assigned instance tag.
    pub device_id: u32,
    /// Free-form operator labels, e.g. `name = "led"`.
    pub labels: BTreeMap<String, String>,
}

impl DeviceInfo {
    /// Identity of an unattached device of the given class.
    pub fn new(class_id: u32) -> Self {
        Self {
            class_id,
            ..Self::default()
        }
    }

    /// Builder-style device id.
    pub fn with_device_id(mut self, device_id: u32) -> Self {
        self.device_id = device_id;
        self
    }

    /// Builder-style label.
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// The label stored under `key`, if any.
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }
}

/// Reply of the bus enumeration call: the directly plugged devices, sorted by
/// address ascending.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusEnumeration {
    pub devices: Vec<DeviceInfo>,
}

/// Classification of an error carried inside an error reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Failure raised by device logic.
    Application,
    /// The method index has no entry in the device's dispatch table.
    InvalidMethod,
    /// No device is plugged at the routed address.
    InvalidAddress,
    /// A leaf device received a message that still carries routing addresses.
    RouteNotSupported,
}

/// Error record serialized into the body of an error reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    pub code: ErrorCode,
    pub message: String,
}

impl RemoteError {
    /// An application-level failure.
    pub fn application(message: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::Application,
            message: message.into(),
        }
    }

    pub fn invalid_method(index: u8) -> Self {
        Self {
            code: ErrorCode::InvalidMethod,
            message: format!("invalid method index {index}"),
        }
    }

    pub fn invalid_address(addr: u8) -> Self {
        Self {
            code: ErrorCode::InvalidAddress,
            message: format!("invalid address {addr}"),
        }
    }

    pub fn route_not_supported() -> Self {
        Self {
            code: ErrorCode::RouteNotSupported,
            message: "route not supported".to_string(),
        }
    }
}

impl From<RemoteError> for TbusError {
    fn from(err: RemoteError) -> Self {
        match err.code {
            ErrorCode::Application => TbusError::Remote(err.message),
            ErrorCode::InvalidMethod => TbusError::InvalidMethod,
            ErrorCode::InvalidAddress => TbusError::InvalidAddress,
            ErrorCode::RouteNotSupported => TbusError::RouteNotSupported,
        }
    }
}

impl From<&TbusError> for RemoteError {
    fn from(err: &TbusError) -> Self {
        let code = match err {
            TbusError::InvalidMethod => ErrorCode::InvalidMethod,
            TbusError::InvalidAddress => ErrorCode::InvalidAddress,
            TbusError::RouteNotSupported => ErrorCode::RouteNotSupported,
            _ => ErrorCode::Application,
        };
        let message = match err {
            TbusError::Remote(message) => message.clone(),
            other => other.to_string(),
        };
        Self { code, message }
    }
}

/// Error type shared by every tbus crate.
#[derive(Error, Debug)]
pub enum TbusError {
    #[error("invalid method index")]
    InvalidMethod,

    #[error("invalid address")]
    InvalidAddress,

    #[error("route not supported")]
    RouteNotSupported,

    #[error("address not available")]
    AddressNotAvailable,

    #[error("device already attached to a bus")]
    AlreadyAttached,

    #[error("device not attached to a bus")]
    NotAttached,

    #[error("receiving timed out")]
    RecvTimeout,

    #[error("receiving aborted")]
    RecvAborted,

    #[error("receiving ended")]
    RecvEnd,

    #[error("framing error: {0}")]
    Framing(String),

    #[error("{0} routing addresses exceed the protocol limit")]
    TooManyAddresses(usize),

    #[error("payload error: {0}")]
    Payload(String),

    /// Application error carried back in a reply.
    #[error("{0}")]
    Remote(String),

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl TbusError {
    /// Whether this error only reports that the underlying stream was closed
    /// by either end.
    pub fn is_closing(&self) -> bool {
        match self {
            TbusError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::NotConnected
            ),
            _ => false,
        }
    }
}

/// Map connection-closed errors to success; every other error is kept.
pub fn ignore_closing(result: Result<(), TbusError>) -> Result<(), TbusError> {
    match result {
        Err(e) if e.is_closing() => Ok(()),
        other => other,
    }
}
