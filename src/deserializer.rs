//! The two external collaborators the core depends on but does not
//! implement: key and value deserialization.

/// Turns the raw bytes of a Kafka key or value into `T`. Implementations are
/// expected to be cheap to invoke per record; the actor calls this
/// synchronously on the hot poll path.
pub trait Deserializer<T>: Send + Sync {
    fn deserialize(&self, topic: &str, bytes: &[u8]) -> Result<T, String>;
}

/// A deserializer for payloads that are already plain bytes, i.e. no
/// deserialization at all. Useful for tests and for callers that want to
/// defer parsing until after the committable handle has been produced.
pub struct BytesDeserializer;

impl Deserializer<Vec<u8>> for BytesDeserializer {
    fn deserialize(&self, _topic: &str, bytes: &[u8]) -> Result<Vec<u8>, String> {
        Ok(bytes.to_vec())
    }
}

/// A deserializer for UTF-8 text payloads.
pub struct StringDeserializer;

impl Deserializer<String> for StringDeserializer {
    fn deserialize(&self, _topic: &str, bytes: &[u8]) -> Result<String, String> {
        String::from_utf8(bytes.to_vec()).map_err(|e| e.to_string())
    }
}
