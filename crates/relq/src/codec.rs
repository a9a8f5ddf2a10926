//! Payload encoding.
//!
//! The queue treats payloads as opaque bytes. A [`PayloadCodec`] turns structured bodies into
//! those bytes for [`Queue::send_json`](crate::Queue::send_json) and back again for
//! [`ReceivedMessage::body`](crate::types::ReceivedMessage::body).

use crate::error::{Error, Result};
use serde_json::Value;

pub trait PayloadCodec: Send + Sync + std::fmt::Debug {
    fn encode(&self, value: &Value) -> Result<Vec<u8>>;

    /// Failures are poison errors.
    fn decode(&self, bytes: &[u8]) -> Result<Value>;
}

/// UTF-8 JSON payloads.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl PayloadCodec for JsonCodec {
    fn encode(&self, value: &Value) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value> {
        serde_json::from_slice(bytes).map_err(|e| Error::Poison {
            reason: format!("payload is not valid JSON: {}", e),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_codec() {
        let codec = JsonCodec;
        let bytes = codec.encode(&json!({"to": "a@b.c"})).unwrap();
        assert_eq!(codec.decode(&bytes).unwrap()["to"], "a@b.c");
        assert!(codec.decode(&[0xff, 0x00]).unwrap_err().is_poison());
    }
}
