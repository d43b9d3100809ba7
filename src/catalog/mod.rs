pub mod schema;
pub mod types;
pub mod validation;

use crate::catalog::schema::{ClassDef, PropertyDescriptor};
use crate::catalog::types::Kind;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SchemaError {
    #[error("{kind} class '{class}' not found")]
    ClassNotFound { kind: Kind, class: String },
    #[error("{kind} class '{class}' already exists")]
    ClassAlreadyExists { kind: Kind, class: String },
    #[error("property '{property}' not found on class '{class}'")]
    PropertyNotFound { class: String, property: String },
    #[error("data types of '{class}.{property}' may only be extended; '{removed}' would be dropped")]
    NonMonotonicDataTypes {
        class: String,
        property: String,
        removed: String,
    },
    #[error("invalid data type: {0}")]
    InvalidDataType(String),
}

/// Access to the class/property descriptors governing object shapes.
///
/// Callers mutate the schema only while holding the schema lock; the accessor
/// itself is not required to serialize read-modify-write sequences.
#[async_trait]
pub trait SchemaAccessor: Send + Sync {
    async fn get_class(&self, kind: Kind, class: &str) -> Result<ClassDef, SchemaError>;

    async fn get_property(
        &self,
        kind: Kind,
        class: &str,
        property: &str,
    ) -> Result<PropertyDescriptor, SchemaError> {
        let class_def = self.get_class(kind, class).await?;
        class_def
            .property(property)
            .cloned()
            .ok_or_else(|| SchemaError::PropertyNotFound {
                class: class.to_string(),
                property: property.to_string(),
            })
    }

    async fn set_property_data_types(
        &self,
        kind: Kind,
        class: &str,
        property: &str,
        data_types: Vec<String>,
    ) -> Result<(), SchemaError>;
}

/// In-process schema store.
#[derive(Debug, Default)]
pub struct MemorySchema {
    classes: RwLock<BTreeMap<(Kind, String), ClassDef>>,
    data_type_writes: AtomicU64,
}

impl MemorySchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_class(self, class: ClassDef) -> Result<Self, SchemaError> {
        self.add_class(class)?;
        Ok(self)
    }

    pub fn add_class(&self, class: ClassDef) -> Result<(), SchemaError> {
        for property in &class.properties {
            property
                .find_data_type()
                .map_err(SchemaError::InvalidDataType)?;
        }
        let mut classes = self.classes.write();
        let key = (class.kind, class.class.clone());
        if classes.contains_key(&key) {
            return Err(SchemaError::ClassAlreadyExists {
                kind: class.kind,
                class: class.class,
            });
        }
        classes.insert(key, class);
        Ok(())
    }

    /// Number of persisted data type changes; reconciliation tests use this to
    /// check convergence happened exactly once.
    pub fn data_type_writes(&self) -> u64 {
        self.data_type_writes.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl SchemaAccessor for MemorySchema {
    async fn get_class(&self, kind: Kind, class: &str) -> Result<ClassDef, SchemaError> {
        self.classes
            .read()
            .get(&(kind, class.to_string()))
            .cloned()
            .ok_or_else(|| SchemaError::ClassNotFound {
                kind,
                class: class.to_string(),
            })
    }

    async fn set_property_data_types(
        &self,
        kind: Kind,
        class: &str,
        property: &str,
        data_types: Vec<String>,
    ) -> Result<(), SchemaError> {
        let mut classes = self.classes.write();
        let class_def =
            classes
                .get_mut(&(kind, class.to_string()))
                .ok_or_else(|| SchemaError::ClassNotFound {
                    kind,
                    class: class.to_string(),
                })?;
        let descriptor =
            class_def
                .property_mut(property)
                .ok_or_else(|| SchemaError::PropertyNotFound {
                    class: class.to_string(),
                    property: property.to_string(),
                })?;
        if let Some(removed) = descriptor
            .data_types
            .iter()
            .find(|existing| !data_types.contains(existing))
        {
            return Err(SchemaError::NonMonotonicDataTypes {
                class: class.to_string(),
                property: property.to_string(),
                removed: removed.clone(),
            });
        }
        descriptor.data_types = data_types;
        self.data_type_writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::schema::Cardinality;

    fn city_schema() -> MemorySchema {
        MemorySchema::new()
            .with_class(
                ClassDef::new(Kind::Thing, "City")
                    .with_property(PropertyDescriptor::primitive("name", "string"))
                    .with_property(PropertyDescriptor::reference(
                        "sisters",
                        &["City"],
                        Cardinality::Many,
                    )),
            )
            .expect("schema")
    }

    #[tokio::test]
    async fn get_property_reports_missing_class_and_property() {
        let schema = city_schema();
        assert!(schema.get_property(Kind::Thing, "City", "name").await.is_ok());
        assert!(matches!(
            schema.get_property(Kind::Action, "City", "name").await,
            Err(SchemaError::ClassNotFound { .. })
        ));
        assert!(matches!(
            schema.get_property(Kind::Thing, "City", "mayor").await,
            Err(SchemaError::PropertyNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn data_types_can_only_grow() {
        let schema = city_schema();
        schema
            .set_property_data_types(
                Kind::Thing,
                "City",
                "sisters",
                vec!["City".into(), "peerA/Town".into()],
            )
            .await
            .expect("extend");
        let err = schema
            .set_property_data_types(Kind::Thing, "City", "sisters", vec!["peerA/Town".into()])
            .await
            .expect_err("shrink");
        assert!(matches!(err, SchemaError::NonMonotonicDataTypes { removed, .. } if removed == "City"));
        assert_eq!(schema.data_type_writes(), 1);
    }

    #[test]
    fn add_class_rejects_duplicates_and_bad_types() {
        let schema = city_schema();
        assert!(matches!(
            schema.add_class(ClassDef::new(Kind::Thing, "City")),
            Err(SchemaError::ClassAlreadyExists { .. })
        ));
        let bad = ClassDef::new(Kind::Action, "Move")
            .with_property(PropertyDescriptor::primitive("when", "timestamp"));
        assert!(matches!(
            schema.add_class(bad),
            Err(SchemaError::InvalidDataType(_))
        ));
    }
}
