#![forbid(unsafe_code)]

use std::fmt;
use std::marker::PhantomData;

use serde::{de::DeserializeOwned, Serialize};

use crate::types::{Result, StoreError};

/// Strategy turning resource values into record bytes and back.
///
/// A codec is handed to the loader when a resource is registered; its
/// [`format`](Codec::format) tag is persisted so a store reopened with a
/// different codec is rejected instead of misreading records.
pub trait Codec: Send + Sync + 'static {
    /// Value type stored in the resource.
    type Item;

    /// Stable tag identifying the wire format.
    fn format(&self) -> &'static str;

    /// Encodes a value into record bytes.
    fn encode(&self, item: &Self::Item) -> Result<Vec<u8>>;

    /// Decodes record bytes into a value.
    fn decode(&self, bytes: &[u8]) -> Result<Self::Item>;
}

/// Bincode encoding for any serde type.
pub struct BincodeCodec<T>(PhantomData<fn() -> T>);

impl<T> Default for BincodeCodec<T> {
    fn default() -> Self {
        Self(PhantomData)
    }
}

impl<T> Clone for BincodeCodec<T> {
    fn clone(&self) -> Self {
        Self::default()
    }
}

impl<T> fmt::Debug for BincodeCodec<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BincodeCodec")
    }
}

impl<T> Codec for BincodeCodec<T>
where
    T: Serialize + DeserializeOwned + 'static,
{
    type Item = T;

    fn format(&self) -> &'static str {
        "bincode"
    }

    fn encode(&self, item: &T) -> Result<Vec<u8>> {
        bincode::serialize(item).map_err(|source| StoreError::BincodeSer { source })
    }

    fn decode(&self, bytes: &[u8]) -> Result<T> {
        bincode::deserialize(bytes).map_err(|source| StoreError::BincodeDe { source })
    }
}

/// JSON encoding for any serde type; handy when records should stay human readable.
pub struct JsonCodec<T>(PhantomData<fn() -> T>);

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self(PhantomData)
    }
}

impl<T> Clone for JsonCodec<T> {
    fn clone(&self) -> Self {
        Self::default()
    }
}

impl<T> fmt::Debug for JsonCodec<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("JsonCodec")
    }
}

impl<T> Codec for JsonCodec<T>
where
    T: Serialize + DeserializeOwned + 'static,
{
    type Item = T;

    fn format(&self) -> &'static str {
        "json"
    }

    fn encode(&self, item: &T) -> Result<Vec<u8>> {
        serde_json::to_vec(item).map_err(|source| StoreError::JsonSer { source })
    }

    fn decode(&self, bytes: &[u8]) -> Result<T> {
        serde_json::from_slice(bytes).map_err(|source| StoreError::JsonDe { source })
    }
}

/// Identity codec for callers that manage their own bytes.
#[derive(Clone, Copy, Debug, Default)]
pub struct BytesCodec;

impl Codec for BytesCodec {
    type Item = Vec<u8>;

    fn format(&self) -> &'static str {
        "bytes"
    }

    fn encode(&self, item: &Vec<u8>) -> Result<Vec<u8>> {
        Ok(item.clone())
    }

    fn decode(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        Ok(bytes.to_vec())
    }
}
