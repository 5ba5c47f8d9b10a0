use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::errors::{Result, ShmemError};

/// Leading byte of every message encoded by [`PostcardCodec`].
pub const WIRE_VERSION: u8 = 1;

/// Turns values into channel payloads and back.
pub trait Codec {
    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>>;

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T>;
}

/// postcard, behind a one-byte wire version.
#[derive(Debug, Default, Clone, Copy)]
pub struct PostcardCodec;

impl Codec for PostcardCodec {
    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>> {
        let body = postcard::to_allocvec(value)?;
        let mut bytes = Vec::with_capacity(1 + body.len());
        bytes.push(WIRE_VERSION);
        bytes.extend_from_slice(&body);
        Ok(bytes)
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        match bytes.split_first() {
            Some((&WIRE_VERSION, body)) => Ok(postcard::from_bytes(body)?),
            Some((version, _)) => Err(ShmemError::Codec(format!(
                "unsupported wire version {}, expected {}",
                version, WIRE_VERSION
            ))),
            None => Err(ShmemError::Codec("empty message".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    #[test]
    fn versioned_encoding() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let bytes = PostcardCodec.encode(&42u32)?;
        assert_eq!(bytes[0], WIRE_VERSION);
        assert_eq!(PostcardCodec.decode::<u32>(&bytes)?, 42);

        let mut map = BTreeMap::new();
        map.insert("a".to_string(), vec![Some(1i8), None]);
        let bytes = PostcardCodec.encode(&map)?;
        assert_eq!(PostcardCodec.decode::<BTreeMap<String, Vec<Option<i8>>>>(&bytes)?, map);
        Ok(())
    }

    #[test]
    fn rejects_other_versions_and_garbage() {
        assert!(matches!(PostcardCodec.decode::<u8>(&[]), Err(ShmemError::Codec(_))));
        assert!(matches!(PostcardCodec.decode::<u8>(&[0, 1]), Err(ShmemError::Codec(_))));
        assert!(matches!(PostcardCodec.decode::<String>(&[WIRE_VERSION, 200]), Err(ShmemError::Codec(_))));
    }
}
