//! Pluggable serialization of application data.
//!
//! The store itself only moves bytes. A [`Serializer`] turns application values
//! into those bytes and back. Serializers work on [`serde_json::Value`] so they
//! stay object safe; [`encode`] and [`decode`] bridge typed values.
//!
//! An empty byte string means "no data yet" and decodes to `None`.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Byte-stable serializer for session and state data.
pub trait Serializer: Send + Sync {
    /// Short name used in errors and logs.
    fn name(&self) -> &'static str;

    /// Serialize a value. `Null` becomes an empty byte string.
    fn serialize(&self, value: &Value) -> Result<Vec<u8>>;

    /// Deserialize bytes. An empty byte string becomes `Null`.
    fn deserialize(&self, bytes: &[u8]) -> Result<Value>;
}

/// Compact JSON.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn name(&self) -> &'static str {
        "json"
    }

    fn serialize(&self, value: &Value) -> Result<Vec<u8>> {
        if value.is_null() {
            return Ok(Vec::new());
        }
        Ok(serde_json::to_vec(value)?)
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Value> {
        if bytes.is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// TOML document with the value stored under a `value` key.
///
/// TOML has no null, so nested nulls fail to serialize.
#[derive(Debug, Clone, Copy, Default)]
pub struct TomlSerializer;

#[derive(Serialize, Deserialize)]
struct TomlEnvelope {
    value: Value,
}

impl Serializer for TomlSerializer {
    fn name(&self) -> &'static str {
        "toml"
    }

    fn serialize(&self, value: &Value) -> Result<Vec<u8>> {
        if value.is_null() {
            return Ok(Vec::new());
        }
        let envelope = TomlEnvelope {
            value: value.clone(),
        };
        let text = toml::to_string(&envelope).map_err(|e| Error::serialization(self.name(), e))?;
        Ok(text.into_bytes())
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Value> {
        if bytes.is_empty() {
            return Ok(Value::Null);
        }
        let text = std::str::from_utf8(bytes).map_err(|e| Error::serialization(self.name(), e))?;
        let envelope: TomlEnvelope =
            toml::from_str(text).map_err(|e| Error::serialization(self.name(), e))?;
        Ok(envelope.value)
    }
}

/// Selector for the serialization collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SerializerKind {
    #[default]
    Json,
    Toml,
}

impl SerializerKind {
    /// Instantiate the selected serializer.
    pub fn build(self) -> Arc<dyn Serializer> {
        match self {
            SerializerKind::Json => Arc::new(JsonSerializer),
            SerializerKind::Toml => Arc::new(TomlSerializer),
        }
    }
}

/// Serialize a typed value. `None`-like values produce empty bytes.
pub fn encode<T: Serialize + ?Sized>(serializer: &dyn Serializer, value: &T) -> Result<Vec<u8>> {
    let value = serde_json::to_value(value)?;
    serializer.serialize(&value)
}

/// Deserialize into a typed value, `None` when there is no data yet.
pub fn decode<T: DeserializeOwned>(serializer: &dyn Serializer, bytes: &[u8]) -> Result<Option<T>> {
    let value = serializer.deserialize(bytes)?;
    if value.is_null() {
        return Ok(None);
    }
    Ok(Some(serde_json::from_value(value)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Cart {
        items: Vec<String>,
        total_cents: u64,
    }

    fn cart() -> Cart {
        Cart {
            items: vec!["apple".to_string(), "pear:ripe".to_string()],
            total_cents: 420,
        }
    }

    #[test]
    fn test_json_round_trip() {
        let serializer = JsonSerializer;
        let bytes = encode(&serializer, &cart()).unwrap();
        let back: Option<Cart> = decode(&serializer, &bytes).unwrap();
        assert_eq!(back, Some(cart()));
    }

    #[test]
    fn test_toml_round_trip() {
        let serializer = TomlSerializer;
        let bytes = encode(&serializer, &cart()).unwrap();
        let back: Option<Cart> = decode(&serializer, &bytes).unwrap();
        assert_eq!(back, Some(cart()));
    }

    #[test]
    fn test_empty_bytes_mean_no_data() {
        for kind in [SerializerKind::Json, SerializerKind::Toml] {
            let serializer = kind.build();
            let back: Option<Cart> = decode(serializer.as_ref(), b"").unwrap();
            assert!(back.is_none());
            assert!(serializer.serialize(&Value::Null).unwrap().is_empty());
        }
    }

    #[test]
    fn test_none_encodes_to_empty() {
        let none: Option<Cart> = None;
        let bytes = encode(&JsonSerializer, &none).unwrap();
        assert!(bytes.is_empty());
    }

    #[test]
    fn test_toml_rejects_garbage() {
        let err = TomlSerializer.deserialize(b"value = [").unwrap_err();
        assert!(matches!(err, Error::Serialization { serializer: "toml", .. }));
    }

    #[test]
    fn test_json_is_byte_stable() {
        let value = json!({"b": 1, "a": [true, "x"]});
        let first = JsonSerializer.serialize(&value).unwrap();
        let second = JsonSerializer
            .serialize(&JsonSerializer.deserialize(&first).unwrap())
            .unwrap();
        assert_eq!(first, second);
    }
}
