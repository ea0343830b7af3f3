//! Pluggable encode/decode for keys and values exchanged between processes.
//!
//! The engine treats encoded bytes as entirely opaque: the only contract it
//! relies on is round-trip identity, `decode(encode(x)) == x`. [`BincodeCodec`]
//! is the default, built on `serde` + `bincode` the same way the pack's other
//! keyed-storage crates (the pointer-hash key/value store, and risingwave's
//! wire types) encode their records.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{HpmapError, Result};

/// Encodes and decodes a single type to/from an opaque byte representation.
pub trait Codec<T> {
    /// Appends the encoded form of `value` to `out`.
    fn encode(&self, value: &T, out: &mut Vec<u8>);

    /// Decodes one value from the *front* of `bytes`, returning it together
    /// with the number of bytes it consumed. `bytes` may hold trailing data
    /// belonging to subsequently encoded values -- callers that frame several
    /// encoded values back to back (as `DistMap`'s wire format does) use this
    /// to advance past each one in turn.
    fn decode_prefix(&self, bytes: &[u8]) -> Result<(T, usize)>;

    /// Decodes a value from `bytes`, which must hold exactly one encoded
    /// value (no trailing bytes). The default implementation is
    /// [`decode_prefix`](Self::decode_prefix) plus a check that it consumed
    /// everything.
    fn decode(&self, bytes: &[u8]) -> Result<T> {
        let (value, consumed) = self.decode_prefix(bytes)?;
        if consumed != bytes.len() {
            return Err(HpmapError::CodecDecode(format!(
                "{} trailing byte(s) after decoded value",
                bytes.len() - consumed
            )));
        }
        Ok(value)
    }
}

/// The default codec: `bincode`'s fixed-width little-endian encoding over
/// any `Serialize + DeserializeOwned` type.
#[derive(Debug, Clone, Copy, Default)]
pub struct BincodeCodec;

impl<T> Codec<T> for BincodeCodec
where
    T: Serialize + DeserializeOwned,
{
    fn encode(&self, value: &T, out: &mut Vec<u8>) {
        let bytes = bincode::serialize(value).expect("in-memory bincode serialization is infallible for well-formed types");
        out.extend_from_slice(&bytes);
    }

    fn decode_prefix(&self, bytes: &[u8]) -> Result<(T, usize)> {
        let mut cursor = std::io::Cursor::new(bytes);
        let value = bincode::deserialize_from(&mut cursor).map_err(|e| HpmapError::CodecDecode(e.to_string()))?;
        Ok((value, cursor.position() as usize))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_primitives() {
        let codec = BincodeCodec;
        let mut buf = Vec::new();
        codec.encode(&42u64, &mut buf);
        let back: u64 = codec.decode(&buf).unwrap();
        assert_eq!(back, 42);
    }

    #[test]
    fn round_trips_strings() {
        let codec = BincodeCodec;
        let mut buf = Vec::new();
        let s = String::from("hyperbolic paraboloid");
        codec.encode(&s, &mut buf);
        let back: String = codec.decode(&buf).unwrap();
        assert_eq!(back, s);
    }
}
