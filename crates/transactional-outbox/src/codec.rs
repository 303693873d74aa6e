//! Payload codec: the engine treats a record's payload as an opaque byte string end to end, but
//! exposes this trait so callers don't have to hand-roll `serde_json::to_vec`/`from_slice` at
//! every `schedule()` call site. Concrete non-JSON codecs (Protobuf, Avro, ...) are the caller's
//! business; only the JSON default ships here.

use crate::error::{OutboxError, OutboxResult};
use serde::{de::DeserializeOwned, Serialize};

/// Encodes/decodes a typed payload to/from the opaque bytes stored on an [`crate::record::OutboxRecord`].
pub trait Codec: Send + Sync {
    fn encode<T: Serialize>(&self, value: &T) -> OutboxResult<Vec<u8>>;
    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> OutboxResult<T>;
}

/// Default codec: `serde_json`, matching every other wire boundary in this engine (context map,
/// config file overlay).
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode<T: Serialize>(&self, value: &T) -> OutboxResult<Vec<u8>> {
        serde_json::to_vec(value).map_err(OutboxError::from)
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> OutboxResult<T> {
        serde_json::from_slice(bytes).map_err(OutboxError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct OrderCreated {
        order_id: String,
    }

    #[test]
    fn json_codec_round_trips() {
        let codec = JsonCodec;
        let value = OrderCreated { order_id: "ord-1".to_string() };
        let bytes = codec.encode(&value).unwrap();
        let decoded: OrderCreated = codec.decode(&bytes).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn decode_rejects_malformed_payload() {
        let codec = JsonCodec;
        let result: OutboxResult<OrderCreated> = codec.decode(b"not json");
        assert!(result.is_err());
    }
}
