//! Conversion between [`Message`] payloads and the opaque `content` column.

use crate::{error::Error, message::Message};

pub trait Serializer: Send + Sync + 'static {
    fn serialize(&self, message: &Message) -> Result<String, Error>;

    fn deserialize(&self, content: &str) -> Result<Message, Error>;
}

/// Stores messages as a JSON object `{"headers": {...}, "value": ...}`.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn serialize(&self, message: &Message) -> Result<String, Error> {
        Ok(serde_json::to_string(message)?)
    }

    fn deserialize(&self, content: &str) -> Result<Message, Error> {
        Ok(serde_json::from_str(content)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_layout() {
        let message = Message::new(serde_json::json!([1, 2]))
            .unwrap()
            .with_header("k", "v");

        let content = JsonSerializer.serialize(&message).unwrap();
        assert_eq!(content, r#"{"headers":{"k":"v"},"value":[1,2]}"#);
        assert_eq!(JsonSerializer.deserialize(&content).unwrap(), message);
    }

    #[test]
    fn test_garbage_is_a_serialization_error() {
        assert!(matches!(
            JsonSerializer.deserialize("{not json"),
            Err(Error::Serialization { .. })
        ));
    }
}
