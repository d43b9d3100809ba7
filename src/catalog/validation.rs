//! Payload validation against the schema.
//!
//! Local checks (class, property, primitive type, cardinality, local reference
//! targets) read the object store and run under the object-store lock. Peer
//! checks go over the network and run before that lock is taken.

use crate::catalog::SchemaAccessor;
use crate::catalog::schema::{
    Cardinality, DataType, PrimitiveType, PropertyDataType, PropertyDescriptor,
};
use crate::catalog::types::{Kind, Payload, PropertyValue, RefType, Reference, Scalar};
use crate::error::KindbError;
use crate::network::PeerClient;
use crate::permission::Principal;
use crate::storage::{Connector, ConnectorError};
use tracing::debug;

/// Checks every property of `payload` against the class definition.
pub async fn validate_payload(
    schema: &dyn SchemaAccessor,
    connector: &dyn Connector,
    kind: Kind,
    class: &str,
    payload: &Payload,
) -> Result<(), KindbError> {
    let class_def = schema.get_class(kind, class).await?;
    for (name, value) in payload.iter() {
        let descriptor = class_def.property(name).ok_or_else(|| {
            KindbError::Validation(format!("class '{class}' has no property '{name}'"))
        })?;
        validate_property(connector, descriptor, value).await?;
    }
    Ok(())
}

async fn validate_property(
    connector: &dyn Connector,
    descriptor: &PropertyDescriptor,
    value: &PropertyValue,
) -> Result<(), KindbError> {
    let data_type = descriptor
        .find_data_type()
        .map_err(KindbError::Validation)?;
    match (data_type, value) {
        (PropertyDataType::Primitive(expected), PropertyValue::Primitive(scalar)) => {
            if primitive_accepts(expected, scalar) {
                Ok(())
            } else {
                Err(KindbError::Validation(format!(
                    "property '{}' expects {expected:?}, got {}",
                    descriptor.name,
                    scalar.type_name()
                )))
            }
        }
        (PropertyDataType::Primitive(expected), other) => Err(KindbError::Validation(format!(
            "property '{}' expects {expected:?}, got a {}",
            descriptor.name,
            other.shape_name()
        ))),
        (PropertyDataType::References(types), PropertyValue::Primitive(scalar)) => {
            Err(KindbError::Validation(format!(
                "property '{}' expects a reference to one of {:?}, got {}",
                descriptor.name,
                declared_names(&types),
                scalar.type_name()
            )))
        }
        (PropertyDataType::References(types), PropertyValue::SingleRef(reference)) => {
            if descriptor.cardinality != Cardinality::AtMostOne {
                return Err(cardinality_error(descriptor, value));
            }
            validate_local_reference(connector, descriptor, &types, reference).await
        }
        (PropertyDataType::References(types), PropertyValue::RefList(list)) => {
            if descriptor.cardinality != Cardinality::Many {
                return Err(cardinality_error(descriptor, value));
            }
            validate_references(connector, descriptor, &types, list).await
        }
    }
}

fn primitive_accepts(expected: PrimitiveType, scalar: &Scalar) -> bool {
    match (expected, scalar) {
        (PrimitiveType::String | PrimitiveType::Text | PrimitiveType::Date, Scalar::Text(_)) => {
            true
        }
        (PrimitiveType::Int, Scalar::Int(_)) => true,
        (PrimitiveType::Number, Scalar::Int(_) | Scalar::Number(_)) => true,
        (PrimitiveType::Boolean, Scalar::Boolean(_)) => true,
        _ => false,
    }
}

fn declared_names(types: &[DataType]) -> Vec<String> {
    types
        .iter()
        .map(|t| match t {
            DataType::Primitive(p) => format!("{p:?}"),
            DataType::Class(class) => class.clone(),
            DataType::NetworkClass { peer, class } => DataType::network(peer, class),
        })
        .collect()
}

fn cardinality_error(descriptor: &PropertyDescriptor, value: &PropertyValue) -> KindbError {
    let expected = match descriptor.cardinality {
        Cardinality::AtMostOne => "a single reference",
        Cardinality::Many => "a reference list",
    };
    KindbError::Validation(format!(
        "property '{}' expects {expected}, got a {}",
        descriptor.name,
        value.shape_name()
    ))
}

/// Resolves a reference property's declared class set. Reference edits are
/// only permitted on `many` reference properties.
pub fn many_reference_types(descriptor: &PropertyDescriptor) -> Result<Vec<DataType>, KindbError> {
    let types = match descriptor.find_data_type().map_err(KindbError::Validation)? {
        PropertyDataType::Primitive(p) => {
            return Err(KindbError::Validation(format!(
                "property '{}' is primitive ({p:?}); references cannot be edited",
                descriptor.name
            )));
        }
        PropertyDataType::References(types) => types,
    };
    if descriptor.cardinality != Cardinality::Many {
        return Err(KindbError::Validation(format!(
            "property '{}' has cardinality atMostOne; only 'many' properties accept reference edits",
            descriptor.name
        )));
    }
    Ok(types)
}

pub async fn validate_references(
    connector: &dyn Connector,
    descriptor: &PropertyDescriptor,
    types: &[DataType],
    references: &[Reference],
) -> Result<(), KindbError> {
    for reference in references {
        validate_local_reference(connector, descriptor, types, reference).await?;
    }
    Ok(())
}

/// Local references must point at an existing object of a declared class.
/// Network references were already checked against their peer; their class
/// is reconciled into the schema afterwards by the resolver.
async fn validate_local_reference(
    connector: &dyn Connector,
    descriptor: &PropertyDescriptor,
    types: &[DataType],
    reference: &Reference,
) -> Result<(), KindbError> {
    let Some(target_kind) = reference.ref_type.object_kind() else {
        return Err(KindbError::Validation(format!(
            "property '{}': key references cannot be stored in a schema",
            descriptor.name
        )));
    };
    if reference.is_network() {
        return Ok(());
    }
    let target = match connector.get(target_kind, reference.target).await {
        Ok(target) => target,
        Err(ConnectorError::NotFound { kind, id }) => {
            return Err(KindbError::Validation(format!(
                "property '{}' references {kind} '{id}' which does not exist",
                descriptor.name
            )));
        }
        Err(other) => return Err(other.into()),
    };
    let declared = types
        .iter()
        .any(|t| matches!(t, DataType::Class(class) if *class == target.class));
    if !declared {
        return Err(KindbError::Validation(format!(
            "property '{}' does not accept class '{}' (declared: {:?})",
            descriptor.name,
            target.class,
            declared_names(types)
        )));
    }
    Ok(())
}

/// Asks each reference's peer whether the target exists and is visible to
/// `principal`. Must not be called while holding the object-store lock.
pub async fn validate_network_references<'a>(
    peers: &dyn PeerClient,
    principal: &Principal,
    references: impl IntoIterator<Item = &'a Reference>,
) -> Result<(), KindbError> {
    for reference in references {
        if !reference.is_network() {
            continue;
        }
        if reference.ref_type == RefType::Key {
            return Err(KindbError::Validation(
                "key references cannot point at a peer".into(),
            ));
        }
        peers.validate_reference(reference, principal).await?;
        debug!(target = %reference.target, location = ?reference.location, "network reference validated");
    }
    Ok(())
}

/// Network references present in `next` but not in `prior`. A patch may
/// introduce one anywhere in the document, including by rewriting the
/// location or target of a reference that was already stored.
pub fn introduced_network_references(prior: &Payload, next: &Payload) -> Vec<Reference> {
    let known: Vec<&Reference> = prior.network_references().map(|(_, r)| r).collect();
    let mut introduced: Vec<Reference> = Vec::new();
    for (_, reference) in next.network_references() {
        if !known.contains(&reference) && !introduced.contains(reference) {
            introduced.push(reference.clone());
        }
    }
    introduced
}
