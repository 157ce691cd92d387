//! Value encoding for cache tiers.
//!
//! Caches store opaque bytes. A [`Codec`] turns caller values into those bytes
//! and back; JSON is the default, MessagePack is available for denser payloads.

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{CacheError, CacheResult};

/// Serialization contract shared by every tier.
pub trait Codec: Clone + Send + Sync + 'static {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> CacheResult<Vec<u8>>;

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> CacheResult<T>;
}

/// JSON encoding via `serde_json`.
///
/// Numbers encode as their decimal text, so values written by native Redis
/// counters (`INCRBY`, `HINCRBY`) decode cleanly as integers.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn name(&self) -> &'static str {
        "json"
    }

    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> CacheResult<Vec<u8>> {
        serde_json::to_vec(value).map_err(|e| CacheError::serialization(e.to_string()))
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> CacheResult<T> {
        serde_json::from_slice(bytes).map_err(|e| CacheError::serialization(e.to_string()))
    }
}

/// MessagePack encoding via `rmp-serde`, with named struct fields.
#[derive(Debug, Clone, Copy, Default)]
pub struct MsgPackCodec;

impl Codec for MsgPackCodec {
    fn name(&self) -> &'static str {
        "msgpack"
    }

    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> CacheResult<Vec<u8>> {
        rmp_serde::to_vec_named(value).map_err(|e| CacheError::serialization(e.to_string()))
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> CacheResult<T> {
        rmp_serde::from_slice(bytes).map_err(|e| CacheError::serialization(e.to_string()))
    }
}
