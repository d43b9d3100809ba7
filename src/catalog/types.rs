use crate::error::KindbError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Location string that designates the local node.
pub const LOCAL_LOCATION: &str = "localhost";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Kind {
    Action,
    Thing,
}

impl std::fmt::Display for Kind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Kind::Action => write!(f, "action"),
            Kind::Thing => write!(f, "thing"),
        }
    }
}

/// Where a referenced object lives.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Location {
    Local,
    Peer(String),
}

impl Location {
    pub fn peer(name: impl Into<String>) -> Self {
        Location::Peer(name.into())
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Location::Local)
    }

    pub fn peer_name(&self) -> Option<&str> {
        match self {
            Location::Local => None,
            Location::Peer(name) => Some(name),
        }
    }
}

impl From<String> for Location {
    fn from(value: String) -> Self {
        if value.is_empty() || value == LOCAL_LOCATION {
            Location::Local
        } else {
            Location::Peer(value)
        }
    }
}

impl From<Location> for String {
    fn from(value: Location) -> Self {
        match value {
            Location::Local => LOCAL_LOCATION.to_string(),
            Location::Peer(name) => name,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum RefType {
    Thing,
    Action,
    Key,
}

impl RefType {
    /// Object kind addressed by this reference type; keys are not objects.
    pub fn object_kind(self) -> Option<Kind> {
        match self {
            RefType::Thing => Some(Kind::Thing),
            RefType::Action => Some(Kind::Action),
            RefType::Key => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Reference {
    #[serde(rename = "$cref")]
    pub target: Uuid,
    #[serde(rename = "locationUrl")]
    pub location: Location,
    #[serde(rename = "type")]
    pub ref_type: RefType,
}

impl Reference {
    pub fn local(target: Uuid, ref_type: RefType) -> Self {
        Self {
            target,
            location: Location::Local,
            ref_type,
        }
    }

    pub fn network(peer: impl Into<String>, target: Uuid, ref_type: RefType) -> Self {
        Self {
            target,
            location: Location::peer(peer),
            ref_type,
        }
    }

    pub fn is_network(&self) -> bool {
        !self.location.is_local()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Boolean(bool),
    Int(i64),
    Number(f64),
    Text(String),
}

impl Scalar {
    pub fn type_name(&self) -> &'static str {
        match self {
            Scalar::Boolean(_) => "boolean",
            Scalar::Int(_) => "int",
            Scalar::Number(_) => "number",
            Scalar::Text(_) => "string",
        }
    }
}

/// A schema property value. Variant order matters for decoding: reference
/// shapes are tried before primitives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    SingleRef(Reference),
    RefList(Vec<Reference>),
    Primitive(Scalar),
}

impl PropertyValue {
    pub fn from_json(value: serde_json::Value) -> Result<Self, KindbError> {
        if value.is_null() {
            return Err(KindbError::Validation("null property values are not allowed".into()));
        }
        serde_json::from_value(value).map_err(|e| {
            KindbError::Validation(format!(
                "value is neither a primitive nor a reference shape: {e}"
            ))
        })
    }

    pub fn references(&self) -> &[Reference] {
        match self {
            PropertyValue::SingleRef(reference) => std::slice::from_ref(reference),
            PropertyValue::RefList(list) => list,
            PropertyValue::Primitive(_) => &[],
        }
    }

    pub fn shape_name(&self) -> &'static str {
        match self {
            PropertyValue::SingleRef(_) => "single reference",
            PropertyValue::RefList(_) => "reference list",
            PropertyValue::Primitive(scalar) => scalar.type_name(),
        }
    }

    /// Removes the first entry equal on target, location and type.
    /// Returns whether an entry was removed.
    pub fn remove_first_match(list: &mut Vec<Reference>, needle: &Reference) -> bool {
        match list.iter().position(|r| r == needle) {
            Some(idx) => {
                list.remove(idx);
                true
            }
            None => false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Payload(BTreeMap<String, PropertyValue>);

impl Payload {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decodes a free-form property map. Anything but a JSON object (or null,
    /// meaning empty) is rejected.
    pub fn from_json(value: serde_json::Value) -> Result<Self, KindbError> {
        match value {
            serde_json::Value::Null => Ok(Self::default()),
            serde_json::Value::Object(map) => {
                let mut out = BTreeMap::new();
                for (name, raw) in map {
                    let value = PropertyValue::from_json(raw).map_err(|e| match e {
                        KindbError::Validation(msg) => {
                            KindbError::Validation(format!("property '{name}': {msg}"))
                        }
                        other => other,
                    })?;
                    out.insert(name, value);
                }
                Ok(Self(out))
            }
            other => Err(KindbError::Validation(format!(
                "schema must be an object, got {other}"
            ))),
        }
    }

    pub fn with(mut self, name: impl Into<String>, value: PropertyValue) -> Self {
        self.0.insert(name.into(), value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&PropertyValue> {
        self.0.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut PropertyValue> {
        self.0.get_mut(name)
    }

    pub fn insert(&mut self, name: impl Into<String>, value: PropertyValue) {
        self.0.insert(name.into(), value);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &PropertyValue)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn network_references(&self) -> impl Iterator<Item = (&String, &Reference)> {
        self.0.iter().flat_map(|(name, value)| {
            value
                .references()
                .iter()
                .filter(|r| r.is_network())
                .map(move |r| (name, r))
        })
    }
}

/// A schema-typed record. Identity (the UUID) is carried alongside, not inside.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Object {
    #[serde(rename = "@class")]
    pub class: String,
    #[serde(rename = "@context", default)]
    pub context: String,
    #[serde(default)]
    pub schema: Payload,
    #[serde(rename = "creationTimeUnix", default)]
    pub creation_time_unix: i64,
    #[serde(rename = "lastUpdateTimeUnix", default)]
    pub last_update_time_unix: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<Reference>,
}

impl Object {
    pub fn owner(&self) -> Option<&Reference> {
        self.key.as_ref()
    }
}
