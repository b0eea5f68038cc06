use serde::Deserialize;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value;

/// Microformats 2 JSON.
///
/// See <http://microformats.org/wiki/microformats2-json>.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Microformats2 {
    #[serde(rename = "type")]
    pub type_: Vec<String>,
    /// Property values are always arrays; items are strings or nested
    /// objects (`{"html": ..., "value": ...}`, embedded h-cards, etc).
    #[serde(default)]
    pub properties: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<Microformats2>,
}

impl Microformats2 {
    pub fn new(type_: &str) -> Self {
        Self {
            type_: vec![type_.to_string()],
            properties: Map::new(),
            children: Vec::new(),
        }
    }

    pub fn is_type(&self, type_: &str) -> bool { self.type_.iter().any(|t| t == type_) }

    /// First value of a property, if any.
    pub fn property(&self, name: &str) -> Option<&Value> {
        self.properties.get(name)?.as_array()?.first()
    }

    /// First value of a property, when it is a plain string.
    pub fn property_str(&self, name: &str) -> Option<&str> { self.property(name)?.as_str() }

    /// Set a property to a single-element array.
    pub fn set_property(&mut self, name: &str, value: Value) {
        self.properties.insert(name.to_string(), Value::Array(vec![value]));
    }
}
