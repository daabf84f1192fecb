//! Serialization protocol for on-disk records

use crate::error::Result;
use serde::{Deserialize, Serialize};

/// Protocol for encoding checkpoints and registry entries to bytes
///
/// File-backed stores are generic over this trait so deployments can pick a
/// compact or a human-readable encoding.
pub trait SerializerProtocol: Send + Sync {
    /// Serialize a value to bytes
    fn dumps<T: Serialize>(&self, value: &T) -> Result<Vec<u8>>;

    /// Deserialize a value from bytes
    fn loads<T: for<'de> Deserialize<'de>>(&self, data: &[u8]) -> Result<T>;

    /// File extension used for records written with this serializer
    fn extension(&self) -> &'static str {
        "json"
    }
}

/// Compact JSON serializer (default)
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl JsonSerializer {
    pub fn new() -> Self {
        Self
    }
}

impl SerializerProtocol for JsonSerializer {
    fn dumps<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    fn loads<T: for<'de> Deserialize<'de>>(&self, data: &[u8]) -> Result<T> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// Indented JSON, convenient when operators inspect the data directory
#[derive(Debug, Clone, Copy, Default)]
pub struct PrettyJsonSerializer;

impl SerializerProtocol for PrettyJsonSerializer {
    fn dumps<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(value)?)
    }

    fn loads<T: for<'de> Deserialize<'de>>(&self, data: &[u8]) -> Result<T> {
        Ok(serde_json::from_slice(data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Checkpoint;

    #[test]
    fn test_json_serializer_restores_checkpoint() {
        let serializer = JsonSerializer::new();
        let checkpoint = Checkpoint::new("task-1", "extract_text", 35)
            .with_data("extract_text", serde_json::json!({"text": "clause 1"}));

        let bytes = serializer.dumps(&checkpoint).unwrap();
        let restored: Checkpoint = serializer.loads(&bytes).unwrap();

        assert_eq!(checkpoint, restored);
    }

    #[test]
    fn test_pretty_serializer_is_multiline() {
        let bytes = PrettyJsonSerializer.dumps(&serde_json::json!({"a": 1})).unwrap();
        assert!(String::from_utf8(bytes).unwrap().contains('\n'));
    }

    #[test]
    fn test_corrupt_data_is_an_error() {
        let result: Result<Checkpoint> = JsonSerializer.loads(b"{not json");
        assert!(result.is_err());
    }
}
