use crate::errors::LabError;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

/// Serializer for computation return values.
pub trait ResultCodec: Send + Sync {
    fn name(&self) -> &'static str;
    fn encode(&self, value: &Value) -> Result<Vec<u8>, LabError>;
    fn decode(&self, bytes: &[u8]) -> Result<Value, LabError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl ResultCodec for JsonCodec {
    fn name(&self) -> &'static str {
        "json"
    }

    fn encode(&self, value: &Value) -> Result<Vec<u8>, LabError> {
        serde_json::to_vec(value).map_err(|e| LabError::Serialization(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value, LabError> {
        serde_json::from_slice(bytes).map_err(|e| LabError::Serialization(e.to_string()))
    }
}

/// Codecs that records can name in their metadata and be decoded with later.
pub fn builtin_codec(name: &str) -> Option<Arc<dyn ResultCodec>> {
    match name {
        "json" => Some(Arc::new(JsonCodec)),
        _ => None,
    }
}

/// Named codecs known to a store. Starts with the builtins; codecs an engine
/// writes with are added so their records decode on read.
#[derive(Clone)]
pub struct CodecRegistry {
    codecs: Arc<RwLock<HashMap<String, Arc<dyn ResultCodec>>>>,
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl CodecRegistry {
    pub fn with_builtins() -> Self {
        let mut codecs: HashMap<String, Arc<dyn ResultCodec>> = HashMap::new();
        codecs.insert(JsonCodec.name().to_string(), Arc::new(JsonCodec));
        Self {
            codecs: Arc::new(RwLock::new(codecs)),
        }
    }

    /// Adds `codec` under its name, replacing any codec already registered
    /// with that name.
    pub fn register(&self, codec: Arc<dyn ResultCodec>) {
        self.codecs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(codec.name().to_string(), codec);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ResultCodec>> {
        self.codecs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names = self
            .codecs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect::<Vec<_>>();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_codec_round_trips_nested_values() {
        let value = json!({"distance": 3.5, "path": [0, 1, -1], "label": "walk"});
        let codec = JsonCodec;
        let bytes = codec.encode(&value).expect("encode");
        assert_eq!(codec.decode(&bytes).expect("decode"), value);
    }

    #[test]
    fn decoding_garbage_is_a_serialization_error() {
        assert!(matches!(
            JsonCodec.decode(b"{not json"),
            Err(LabError::Serialization(_))
        ));
    }

    #[test]
    fn builtin_lookup_knows_json_only() {
        assert_eq!(builtin_codec("json").map(|c| c.name()), Some("json"));
        assert!(builtin_codec("pickle").is_none());
    }

    struct ShoutCodec;

    impl ResultCodec for ShoutCodec {
        fn name(&self) -> &'static str {
            "shout"
        }

        fn encode(&self, value: &Value) -> Result<Vec<u8>, LabError> {
            Ok(value.to_string().to_uppercase().into_bytes())
        }

        fn decode(&self, bytes: &[u8]) -> Result<Value, LabError> {
            JsonCodec.decode(&bytes.to_ascii_lowercase())
        }
    }

    #[test]
    fn registry_clones_share_registered_codecs() {
        let registry = CodecRegistry::with_builtins();
        let shared = registry.clone();
        assert!(shared.get("shout").is_none());

        registry.register(Arc::new(ShoutCodec));
        assert_eq!(shared.names(), vec!["json".to_string(), "shout".to_string()]);
        let codec = shared.get("shout").expect("registered codec");
        let bytes = codec.encode(&json!("walk")).expect("encode");
        assert_eq!(bytes, b"\"WALK\"".to_vec());
        assert_eq!(codec.decode(&bytes).expect("decode"), json!("walk"));
    }
}
