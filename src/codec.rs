// src/codec.rs

use std::sync::Arc;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Error, Result};
use crate::transport::{Connection, WriteCallback};

/// Encode a typed message to its wire blob (postcard).
pub fn encode<T: Serialize>(message: &T) -> Result<Bytes> {
    postcard::to_allocvec(message)
        .map(Bytes::from)
        .map_err(|e| Error::ProtocolViolation(format!("encode failed: {e}")))
}

/// Decode a typed message from a wire blob.
pub fn decode<T: DeserializeOwned>(blob: &[u8]) -> Result<T> {
    postcard::from_bytes(blob).map_err(|e| Error::ProtocolViolation(format!("decode failed: {e}")))
}

/// Write a typed message as one length-framed blob on a connection.
///
/// Encoding happens before submission; an encode failure reaches the
/// callback without touching the connection.
pub fn write_framed<T: Serialize>(
    connection: &Arc<dyn Connection>,
    message: &T,
    callback: WriteCallback,
) {
    match encode(message) {
        Ok(blob) => connection.write(blob, callback),
        Err(e) => callback(Err(e)),
    }
}

/// Read one length-framed blob from a connection and decode it.
pub fn read_framed<T, F>(connection: &Arc<dyn Connection>, callback: F)
where
    T: DeserializeOwned + Send + 'static,
    F: FnOnce(Result<T>) + Send + 'static,
{
    connection.read(Box::new(move |result| {
        callback(result.and_then(|blob| decode(&blob)))
    }));
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    enum Probe {
        Ping { seq: u64 },
        Pong { seq: u64 },
    }

    #[test]
    fn roundtrip() {
        let blob = encode(&Probe::Ping { seq: 42 }).unwrap();
        let back: Probe = decode(&blob).unwrap();
        assert_eq!(back, Probe::Ping { seq: 42 });
    }

    #[test]
    fn truncated_blob_is_a_protocol_violation() {
        let blob = encode(&Probe::Pong { seq: u64::MAX }).unwrap();
        let err = decode::<Probe>(&blob[..blob.len() - 1]).unwrap_err();
        assert!(matches!(err, Error::ProtocolViolation(_)));
    }
}
