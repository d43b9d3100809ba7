//! Reconciles peer-hosted reference classes into the local schema.
//!
//! A pass runs on the worker pool after a successful write, holding the
//! exclusive schema lock for its whole duration, so passes are strictly
//! serialized. The data type set of a property only ever grows.

use crate::catalog::SchemaAccessor;
use crate::catalog::schema::DataType;
use crate::catalog::types::{Kind, Payload};
use crate::error::KindbError;
use crate::lock::LockManager;
use crate::network::PeerClient;
use crate::tasks::{BackgroundTasks, TaskHandle};
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolutionReport {
    /// `(property, peer-qualified data type)` pairs appended by this pass.
    pub added: Vec<(String, String)>,
    pub already_declared: usize,
}

#[derive(Clone)]
pub struct ReferenceSchemaUpdater {
    schema: Arc<dyn SchemaAccessor>,
    peers: Arc<dyn PeerClient>,
    kind: Kind,
    class: String,
}

impl ReferenceSchemaUpdater {
    pub fn new(
        schema: Arc<dyn SchemaAccessor>,
        peers: Arc<dyn PeerClient>,
        kind: Kind,
        class: impl Into<String>,
    ) -> Self {
        Self {
            schema,
            peers,
            kind,
            class: class.into(),
        }
    }

    /// Appends every peer-qualified class referenced by `payload` that the
    /// owning property does not declare yet. The caller holds the schema lock.
    ///
    /// Stops at the first failure; earlier additions stay in place.
    pub async fn add_network_data_types(
        &self,
        payload: &Payload,
    ) -> Result<ResolutionReport, KindbError> {
        let mut report = ResolutionReport::default();
        for (property, reference) in payload.network_references() {
            let data_type = self.peers.resolve_class(reference).await?.data_type();
            if !matches!(DataType::parse(&data_type), Some(DataType::NetworkClass { .. })) {
                return Err(KindbError::Validation(format!(
                    "peer resolved '{}' to '{data_type}', which is not a valid network data type",
                    reference.target
                )));
            }
            // Re-read per reference: an earlier iteration may have extended it.
            let descriptor = self
                .schema
                .get_property(self.kind, &self.class, property)
                .await?;
            if descriptor.declares(&data_type) {
                report.already_declared += 1;
                continue;
            }
            let mut data_types = descriptor.data_types;
            data_types.push(data_type.clone());
            self.schema
                .set_property_data_types(self.kind, &self.class, property, data_types)
                .await?;
            info!(
                kind = %self.kind,
                class = %self.class,
                property = %property,
                data_type = %data_type,
                "schema extended with network data type"
            );
            report.added.push((property.clone(), data_type));
        }
        Ok(report)
    }
}

/// Schedules a resolver pass for `payload`. The outcome is only observable
/// through the returned handle; a failed pass is logged and dropped.
pub fn spawn_reference_resolution(
    locks: Arc<LockManager>,
    tasks: &BackgroundTasks,
    updater: ReferenceSchemaUpdater,
    payload: Payload,
) -> TaskHandle {
    tasks.spawn(
        "reference_resolution",
        run_resolution_pass(locks, updater, payload),
    )
}

async fn run_resolution_pass(
    locks: Arc<LockManager>,
    updater: ReferenceSchemaUpdater,
    payload: Payload,
) -> Result<(), KindbError> {
    if payload.network_references().next().is_none() {
        return Ok(());
    }
    let schema_lock = locks.schema_write().await?;
    let report = updater.add_network_data_types(&payload).await;
    schema_lock.unlock()?;
    let report = report?;
    debug!(
        class = %updater.class,
        added = report.added.len(),
        already_declared = report.already_declared,
        "reference resolution pass finished"
    );
    Ok(())
}
