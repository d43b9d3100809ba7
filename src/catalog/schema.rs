use crate::catalog::types::Kind;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum Cardinality {
    #[default]
    #[serde(rename = "atMostOne")]
    AtMostOne,
    #[serde(rename = "many")]
    Many,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum PrimitiveType {
    String,
    Text,
    Int,
    Number,
    Boolean,
    Date,
}

impl PrimitiveType {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "string" => Some(PrimitiveType::String),
            "text" => Some(PrimitiveType::Text),
            "int" => Some(PrimitiveType::Int),
            "number" => Some(PrimitiveType::Number),
            "boolean" => Some(PrimitiveType::Boolean),
            "date" => Some(PrimitiveType::Date),
            _ => None,
        }
    }
}

/// One entry of a property's declared data type set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataType {
    Primitive(PrimitiveType),
    /// A class on this node.
    Class(String),
    /// A class hosted on a peer, declared as `Peer/Class`.
    NetworkClass { peer: String, class: String },
}

impl DataType {
    pub fn parse(raw: &str) -> Option<Self> {
        if let Some(primitive) = PrimitiveType::parse(raw) {
            return Some(DataType::Primitive(primitive));
        }
        if let Some((peer, class)) = raw.split_once('/') {
            if !is_peer_name(peer) || !is_class_name(class) {
                return None;
            }
            return Some(DataType::NetworkClass {
                peer: peer.to_string(),
                class: class.to_string(),
            });
        }
        is_class_name(raw).then(|| DataType::Class(raw.to_string()))
    }

    pub fn network(peer: &str, class: &str) -> String {
        format!("{peer}/{class}")
    }

    pub fn is_primitive(&self) -> bool {
        matches!(self, DataType::Primitive(_))
    }
}

fn is_class_name(raw: &str) -> bool {
    raw.chars().next().is_some_and(char::is_uppercase) && raw.chars().all(char::is_alphanumeric)
}

fn is_peer_name(raw: &str) -> bool {
    !raw.is_empty()
        && raw
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'))
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PropertyDescriptor {
    pub name: String,
    #[serde(rename = "@dataType")]
    pub data_types: Vec<String>,
    #[serde(default)]
    pub cardinality: Cardinality,
    #[serde(default)]
    pub description: String,
}

/// Resolved shape of a property's declared data types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyDataType {
    Primitive(PrimitiveType),
    References(Vec<DataType>),
}

impl PropertyDescriptor {
    pub fn primitive(name: impl Into<String>, primitive: &str) -> Self {
        Self {
            name: name.into(),
            data_types: vec![primitive.to_string()],
            cardinality: Cardinality::AtMostOne,
            description: String::new(),
        }
    }

    pub fn reference(
        name: impl Into<String>,
        classes: &[&str],
        cardinality: Cardinality,
    ) -> Self {
        Self {
            name: name.into(),
            data_types: classes.iter().map(|c| c.to_string()).collect(),
            cardinality,
            description: String::new(),
        }
    }

    pub fn declares(&self, data_type: &str) -> bool {
        self.data_types.iter().any(|d| d == data_type)
    }

    /// A property is either a single primitive or a set of class references;
    /// mixing the two is a schema error.
    pub fn find_data_type(&self) -> Result<PropertyDataType, String> {
        let parsed = self
            .data_types
            .iter()
            .map(|raw| {
                DataType::parse(raw)
                    .ok_or_else(|| format!("property '{}': invalid data type '{raw}'", self.name))
            })
            .collect::<Result<Vec<_>, _>>()?;
        match parsed.as_slice() {
            [] => Err(format!("property '{}' declares no data type", self.name)),
            [DataType::Primitive(p)] => Ok(PropertyDataType::Primitive(*p)),
            many if many.iter().any(DataType::is_primitive) => Err(format!(
                "property '{}' mixes primitive and reference data types",
                self.name
            )),
            _ => Ok(PropertyDataType::References(parsed)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClassDef {
    pub class: String,
    pub kind: Kind,
    #[serde(default)]
    pub properties: Vec<PropertyDescriptor>,
}

impl ClassDef {
    pub fn new(kind: Kind, class: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            kind,
            properties: Vec::new(),
        }
    }

    pub fn with_property(mut self, property: PropertyDescriptor) -> Self {
        self.properties.push(property);
        self
    }

    pub fn property(&self, name: &str) -> Option<&PropertyDescriptor> {
        self.properties.iter().find(|p| p.name == name)
    }

    pub fn property_mut(&mut self, name: &str) -> Option<&mut PropertyDescriptor> {
        self.properties.iter_mut().find(|p| p.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_data_type_forms() {
        assert_eq!(
            DataType::parse("int"),
            Some(DataType::Primitive(PrimitiveType::Int))
        );
        assert_eq!(DataType::parse("City"), Some(DataType::Class("City".into())));
        assert_eq!(
            DataType::parse("peerA/City"),
            Some(DataType::NetworkClass {
                peer: "peerA".into(),
                class: "City".into()
            })
        );
        assert_eq!(DataType::parse("city"), None);
        assert_eq!(DataType::parse("a/b/c"), None);
        assert_eq!(DataType::parse("peerA/town"), None);
        assert_eq!(DataType::parse("peer A/Town"), None);
        assert_eq!(DataType::parse("/Town"), None);
        assert_eq!(DataType::network("peerA", "City"), "peerA/City");
    }

    #[test]
    fn find_data_type_rejects_mixed_sets() {
        let prop = PropertyDescriptor::reference("x", &["City", "int"], Cardinality::Many);
        assert!(prop.find_data_type().is_err());
        let prop = PropertyDescriptor::reference("x", &["City", "peerA/Town"], Cardinality::Many);
        assert!(matches!(
            prop.find_data_type(),
            Ok(PropertyDataType::References(types)) if types.len() == 2
        ));
        let prop = PropertyDescriptor::primitive("y", "boolean");
        assert_eq!(
            prop.find_data_type(),
            Ok(PropertyDataType::Primitive(PrimitiveType::Boolean))
        );
    }
}
