use serde::{Serialize, Deserialize};
use std::collections::HashMap;
use chrono::{DateTime, Utc};

/// Entity primary key. Kept at 32 bits so the whole key space fits the
/// roaring bitmap domain used by the formula algebra.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityId(pub u32);

impl EntityId {
    pub fn new(id: u32) -> Self {
        EntityId(id)
    }

    pub fn value(&self) -> u32 {
        self.0
    }
}

impl From<u32> for EntityId {
    fn from(id: u32) -> Self {
        EntityId(id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttributeValue {
    Text(String),
    Number(f64),
    Date(DateTime<Utc>),
    Boolean(bool),
}

impl AttributeValue {
    /// Canonical index token for this value. Attribute indexes are keyed
    /// by (attribute name, token); two values that render to the same
    /// token land in the same posting bitmap.
    pub fn token(&self) -> String {
        match self {
            AttributeValue::Text(s) => s.clone(),
            AttributeValue::Number(n) => format!("{}", n),
            AttributeValue::Date(d) => d.to_rfc3339(),
            AttributeValue::Boolean(b) => format!("{}", b),
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            AttributeValue::Number(n) => Some(*n),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    pub entity_type: String,
    pub attributes: HashMap<String, AttributeValue>,
}

impl Entity {
    pub fn new(id: EntityId, entity_type: impl Into<String>) -> Self {
        Entity {
            id,
            entity_type: entity_type.into(),
            attributes: HashMap::new(),
        }
    }

    pub fn add_attribute(&mut self, name: String, value: AttributeValue) {
        self.attributes.insert(name, value);
    }

    pub fn get_attribute(&self, name: &str) -> Option<&AttributeValue> {
        self.attributes.get(name)
    }
}
