//! The encode/decode pair the core treats as an opaque collaborator.
//!
//! The core never inspects encoded bytes except through [`Codec`], so swapping the
//! default JSON codec out for another format never touches the log, reader or
//! replication layers.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::wal::error::{Error, Result};

pub trait Codec: Send + Sync + 'static {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>>;
    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T>;
}

/// Default codec, backed by `serde_json`. Per-codec quirks (field naming, HTML
/// escaping, time formats) live here, never in the core.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        serde_json::to_vec(value).map_err(|e| Error::Codec(e.to_string()))
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        serde_json::from_slice(bytes).map_err(|e| Error::Codec(e.to_string()))
    }
}
