//! Object encoders.
//!
//! Object records carry a tag string in their body so the payload can be
//! routed back to the encoder that produced it on the next load. Stores
//! hold a registry of type-erased encoders keyed by tag; typed access
//! happens at the API boundary via [`ObjectEncoder`].

use crate::error::{CodecError, CodecResult};
use std::any::Any;
use std::collections::HashSet;
use std::sync::Arc;

/// Typed total codec between a value and its byte payload.
///
/// Implementors advertise a non-empty tag (at most
/// [`MAX_TAG_SIZE`](crate::MAX_TAG_SIZE) characters, unique within a
/// store). The tag is written into every object record, so changing it
/// orphans previously stored payloads.
pub trait ObjectEncoder: Send + Sync + 'static {
    /// The value type this encoder handles.
    type Value: Send + Sync + 'static;

    /// The tag identifying this encoder on disk.
    fn tag(&self) -> &'static str;

    /// Encodes a value to its payload bytes.
    fn encode(&self, value: &Self::Value) -> CodecResult<Vec<u8>>;

    /// Decodes payload bytes back into a value.
    fn decode(&self, bytes: &[u8]) -> CodecResult<Self::Value>;
}

/// Object-safe view of an [`ObjectEncoder`], used by the registry.
///
/// Encoding stays on the typed path (the caller has the concrete value in
/// hand); only decoding needs type erasure, because the parser discovers
/// the tag from the record body.
pub trait DynEncoder: Send + Sync {
    /// The tag identifying this encoder on disk.
    fn tag(&self) -> &'static str;

    /// Decodes payload bytes into a type-erased value.
    fn decode_any(&self, bytes: &[u8]) -> CodecResult<Arc<dyn Any + Send + Sync>>;
}

impl<E: ObjectEncoder> DynEncoder for E {
    fn tag(&self) -> &'static str {
        ObjectEncoder::tag(self)
    }

    fn decode_any(&self, bytes: &[u8]) -> CodecResult<Arc<dyn Any + Send + Sync>> {
        Ok(Arc::new(self.decode(bytes)?))
    }
}

/// Tag of the built-in string-set encoder.
pub const STRING_SET_TAG: &str = "StringSet";

/// Built-in encoder for sets of strings; always registered.
///
/// Wire format: a sequence of `(u32 little-endian length, UTF-8 bytes)`
/// entries. Entries are written in sorted order so equal sets encode to
/// equal bytes.
#[derive(Debug, Default, Clone, Copy)]
pub struct StringSetEncoder;

impl ObjectEncoder for StringSetEncoder {
    type Value = HashSet<String>;

    fn tag(&self) -> &'static str {
        STRING_SET_TAG
    }

    fn encode(&self, value: &Self::Value) -> CodecResult<Vec<u8>> {
        let mut entries: Vec<&String> = value.iter().collect();
        entries.sort();
        let mut out = Vec::with_capacity(entries.iter().map(|s| 4 + s.len()).sum());
        for entry in entries {
            let len = u32::try_from(entry.len())
                .map_err(|_| CodecError::encoding_failed("string entry too long"))?;
            out.extend_from_slice(&len.to_le_bytes());
            out.extend_from_slice(entry.as_bytes());
        }
        Ok(out)
    }

    fn decode(&self, bytes: &[u8]) -> CodecResult<Self::Value> {
        let mut set = HashSet::new();
        let mut pos = 0usize;
        while pos < bytes.len() {
            if pos + 4 > bytes.len() {
                return Err(CodecError::UnexpectedEof { offset: pos });
            }
            let len =
                u32::from_le_bytes([bytes[pos], bytes[pos + 1], bytes[pos + 2], bytes[pos + 3]])
                    as usize;
            pos += 4;
            if pos + len > bytes.len() {
                return Err(CodecError::UnexpectedEof { offset: pos });
            }
            let entry = std::str::from_utf8(&bytes[pos..pos + len])
                .map_err(|_| CodecError::InvalidUtf8)?;
            set.insert(entry.to_owned());
            pos += len;
        }
        Ok(set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_set_roundtrip() {
        let encoder = StringSetEncoder;
        let mut set = HashSet::new();
        set.insert("alpha".to_string());
        set.insert(String::new());
        set.insert("héllo".to_string());

        let bytes = encoder.encode(&set).unwrap();
        let decoded = encoder.decode(&bytes).unwrap();
        assert_eq!(decoded, set);
    }

    #[test]
    fn string_set_encoding_is_deterministic() {
        let encoder = StringSetEncoder;
        let a: HashSet<String> = ["x", "y", "z"].iter().map(|s| s.to_string()).collect();
        let b: HashSet<String> = ["z", "x", "y"].iter().map(|s| s.to_string()).collect();
        assert_eq!(encoder.encode(&a).unwrap(), encoder.encode(&b).unwrap());
    }

    #[test]
    fn string_set_rejects_truncated_payload() {
        let encoder = StringSetEncoder;
        let set: HashSet<String> = ["abc".to_string()].into_iter().collect();
        let bytes = encoder.encode(&set).unwrap();
        assert!(encoder.decode(&bytes[..bytes.len() - 1]).is_err());
        assert!(encoder.decode(&bytes[..2]).is_err());
    }

    #[test]
    fn decode_any_yields_downcastable_value() {
        let encoder = StringSetEncoder;
        let set: HashSet<String> = ["k".to_string()].into_iter().collect();
        let bytes = encoder.encode(&set).unwrap();
        let erased = DynEncoder::decode_any(&encoder, &bytes).unwrap();
        let typed = erased.downcast::<HashSet<String>>().unwrap();
        assert_eq!(*typed, set);
    }
}
