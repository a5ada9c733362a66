use crate::message::{Payload, JSON_CONTENT_TYPE};
use crate::rabbitmq::errors::{RabbitMQError, Result};
use serde_json::Value;

/// Turns a payload into wire bytes and back.
pub trait Serializer: Send + Sync {
    fn serialize(&self, data: &Payload) -> Result<Vec<u8>>;

    fn deserialize(&self, bytes: &[u8]) -> Result<Payload>;

    fn content_type(&self) -> &'static str;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn serialize(&self, data: &Payload) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(data)?)
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Payload> {
        let value: Value = serde_json::from_slice(bytes)
            .map_err(|e| RabbitMQError::DeserializationError(e.to_string()))?;

        match value {
            Value::Object(map) => Ok(map),
            other => Err(RabbitMQError::DeserializationError(format!(
                "expected a JSON object, got {}",
                json_kind(&other)
            ))),
        }
    }

    fn content_type(&self) -> &'static str {
        JSON_CONTENT_TYPE
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
