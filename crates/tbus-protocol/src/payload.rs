//! Body payload encoding.
//!
//! The protocol treats payloads as opaque bytes; the built-in payloads and the
//! typed helpers in `tbus-core` use serde with `postcard`. The unit value `()`
//! encodes to zero bytes and stands for "no payload".

use serde::Serialize;
use serde::de::DeserializeOwned;
use tbus_types::TbusError;

pub fn encode<T>(value: &T) -> Result<Vec<u8>, TbusError>
where
    T: Serialize + ?Sized,
{
    postcard::to_allocvec(value).map_err(|e| TbusError::Payload(e.to_string()))
}

pub fn decode<T>(data: &[u8]) -> Result<T, TbusError>
where
    T: DeserializeOwned,
{
    postcard::from_bytes(data).map_err(|e| TbusError::Payload(e.to_string()))
}
