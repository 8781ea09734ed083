//! The codec abstraction (spec.md §4.1): frame and encode/decode one
//! header + one body per message, and a process-wide registry mapping a
//! codec name to its constructor.

pub mod binary;

use std::collections::HashMap;

use async_trait::async_trait;
use lazy_static::lazy_static;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::message::{Header, DEFAULT_CODEC};
use crate::transport::Stream;
use crate::Error;

/// An encoded body, still opaque at the codec layer. The type it decodes
/// to is known only to the caller (a `MethodDescriptor` on the server, or
/// the original caller's expected reply type on the client) — this is
/// the type-erasure boundary spec.md's Design Notes (§9) call for,
/// realized as an owned byte buffer rather than a boxed deserializer
/// trait object (see DESIGN.md for why).
#[derive(Debug, Clone, Default)]
pub struct OwnedBody(pub Vec<u8>);

impl OwnedBody {
    pub fn encode<T: Serialize>(value: &T) -> Result<Self, Error> {
        binary::bincode_serialize(value).map(OwnedBody)
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, Error> {
        binary::bincode_deserialize(&self.0)
    }

    /// Used on the "unknown service" path where the body must still be
    /// consumed to preserve framing (spec.md §9). A no-op: unlike the
    /// reference's self-describing Gob stream, this codec's length-framed
    /// bytes were already lifted off the wire whole by `read_body` before
    /// `OwnedBody` existed, so dropping them here (rather than decoding
    /// into a throwaway type) is all "discard" requires — and bincode
    /// has no self-describing `deserialize_any` to decode into a
    /// throwaway type with in the first place.
    pub fn discard(&self) {}
}

/// Reading half of a codec. Used by exactly one task per connection (the
/// server's dispatch loop, or the client's receive loop).
#[async_trait]
pub trait CodecReader: Send {
    /// Decodes the next header frame. `Ok(None)` signals a clean EOF.
    async fn read_header(&mut self) -> Result<Option<Header>, Error>;

    /// Reads the body frame immediately following the most recently read
    /// header. Must be called even when the body will be discarded (see
    /// spec.md §9 "body-discard on error-resolution path") — call
    /// [`OwnedBody::discard`] to do exactly that without losing frame
    /// sync.
    async fn read_body(&mut self) -> Result<OwnedBody, Error>;

    async fn close(&mut self) -> Result<(), Error>;
}

/// Writing half of a codec. May be called concurrently by many workers;
/// callers are responsible for serializing access (spec.md §4.3 "Response
/// writes on a connection are serialized by a per-connection lock").
#[async_trait]
pub trait CodecWriter: Send {
    /// Encodes header then body and flushes both before returning, so
    /// that two interleaved callers (each holding the lock in turn)
    /// cannot produce interleaved bytes on the wire.
    async fn write(&mut self, header: &Header, body: &OwnedBody) -> Result<(), Error>;

    async fn close(&mut self) -> Result<(), Error>;
}

/// Constructs a reader/writer pair over a freshly accepted or dialed
/// stream for one codec implementation.
pub type CodecFactory = fn(Box<dyn Stream>) -> (Box<dyn CodecReader>, Box<dyn CodecWriter>);

lazy_static! {
    static ref CODEC_REGISTRY: HashMap<&'static str, CodecFactory> = {
        let mut m: HashMap<&'static str, CodecFactory> = HashMap::new();
        m.insert(DEFAULT_CODEC, binary::new as CodecFactory);
        m
    };
}

/// Looks up a codec constructor by name. `application/json` is a
/// recognized, reserved name with no constructor registered (spec.md
/// §4.1: "need not be implemented").
pub fn lookup(name: &str) -> Result<CodecFactory, Error> {
    CODEC_REGISTRY
        .get(name)
        .copied()
        .ok_or_else(|| Error::Handshake(format!("unknown codec {:?}", name)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_codec_is_registered() {
        assert!(lookup(DEFAULT_CODEC).is_ok());
    }

    #[test]
    fn json_codec_is_reserved_but_not_registered() {
        let err = lookup(crate::message::JSON_CODEC).unwrap_err();
        assert!(err.to_string().contains("unknown codec"));
    }

    #[test]
    fn unknown_codec_name_errors() {
        assert!(lookup("application/carrier-pigeon").is_err());
    }

    #[test]
    fn owned_body_round_trips() {
        let body = OwnedBody::encode(&42i64).unwrap();
        let value: i64 = body.decode().unwrap();
        assert_eq!(value, 42);
    }
}
