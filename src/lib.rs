pub mod catalog;
pub mod config;
pub mod error;
pub mod history;
mod lib_helpers;
pub mod lock;
pub mod network;
pub mod permission;
pub mod query;
pub mod resolver;
pub mod storage;
pub mod tasks;

use crate::catalog::SchemaAccessor;
use crate::catalog::types::{Kind, Object, Payload, PropertyValue, RefType, Reference};
use crate::catalog::validation::{
    introduced_network_references, many_reference_types, validate_network_references,
    validate_payload, validate_references,
};
use crate::config::KindbConfig;
use crate::error::{KindbError, MutationStatus};
use crate::history::{HistoryEntry, HistoryKind, HistoryTrail, ObjectHistory};
use crate::lib_helpers::*;
use crate::lock::{DeferredCompletion, DeferredUnlock, LockManager, LockMetrics};
use crate::network::{NoPeers, PeerClient};
use crate::permission::{AllowAll, AuthAction, Authorizer, Principal};
use crate::query::{
    Aggregator, AnalyticsCache, LruAnalyticsCache, MetaQuery, MetaQueryRunner, MetaResult,
};
use crate::resolver::{ReferenceSchemaUpdater, spawn_reference_resolution};
use crate::storage::{Connector, ListRequest, WhereFilter};
use crate::tasks::{BackgroundTasks, TaskHandle, TaskMetrics, TaskOutcome};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};
use uuid::Uuid;

/// Body of a create (and of a body-only validation).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectCreate {
    #[serde(rename = "@class")]
    pub class: String,
    #[serde(rename = "@context", default)]
    pub context: String,
    #[serde(default)]
    pub schema: serde_json::Value,
    /// Accept the write and persist it as a deferred step.
    #[serde(rename = "async", default)]
    pub async_write: bool,
}

/// Full replacement body. The class must match the stored object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectUpdate {
    #[serde(rename = "@class")]
    pub class: String,
    #[serde(rename = "@context", default)]
    pub context: String,
    #[serde(default)]
    pub schema: serde_json::Value,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListParams {
    pub limit: Option<usize>,
    /// 1-based.
    pub page: Option<usize>,
    pub filters: Vec<WhereFilter>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ObjectResponse {
    pub id: Uuid,
    pub kind: Kind,
    #[serde(flatten)]
    pub object: Object,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ObjectList {
    pub objects: Vec<ObjectResponse>,
    #[serde(rename = "totalResults")]
    pub total_results: usize,
}

/// Result of a mutation as handed to the transport layer.
///
/// The status is final. Deferred steps and the resolver pass may still be
/// running; `completion` resolves once the object-store lock is released.
#[derive(Debug)]
pub struct MutationOutcome {
    pub status: MutationStatus,
    pub response: Option<ObjectResponse>,
    pub completion: DeferredCompletion,
    pub steps: Vec<TaskHandle>,
    pub resolution: Option<TaskHandle>,
}

impl MutationOutcome {
    fn new(
        status: MutationStatus,
        response: Option<ObjectResponse>,
        deferred: DeferredUnlock,
        steps: Vec<TaskHandle>,
        resolution: Option<TaskHandle>,
    ) -> Self {
        let completion = deferred.completion();
        deferred.unlock();
        Self {
            status,
            response,
            completion,
            steps,
            resolution,
        }
    }

    pub fn id(&self) -> Option<Uuid> {
        self.response.as_ref().map(|r| r.id)
    }

    /// Waits for every deferred step, the lock release and the resolver pass.
    pub async fn settle(&mut self) -> Vec<(&'static str, TaskOutcome)> {
        let mut outcomes = Vec::new();
        for step in std::mem::take(&mut self.steps) {
            let label = step.label();
            outcomes.push((label, step.join().await));
        }
        self.completion.clone().wait().await;
        if let Some(resolution) = self.resolution.take() {
            let label = resolution.label();
            outcomes.push((label, resolution.join().await));
        }
        outcomes
    }
}

/// External collaborators injected at open time.
#[derive(Clone)]
pub struct Collaborators {
    pub connector: Arc<dyn Connector>,
    pub schema: Arc<dyn SchemaAccessor>,
    pub peers: Arc<dyn PeerClient>,
    pub authorizer: Arc<dyn Authorizer>,
    /// Defaults to an LRU sized by `analytics_cache_capacity`.
    pub analytics_cache: Option<Arc<dyn AnalyticsCache>>,
}

impl Collaborators {
    /// Stand-alone node: no peers, every caller authorized.
    pub fn new(connector: Arc<dyn Connector>, schema: Arc<dyn SchemaAccessor>) -> Self {
        Self {
            connector,
            schema,
            peers: Arc::new(NoPeers),
            authorizer: Arc::new(AllowAll),
            analytics_cache: None,
        }
    }

    pub fn with_peers(mut self, peers: Arc<dyn PeerClient>) -> Self {
        self.peers = peers;
        self
    }

    pub fn with_authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = authorizer;
        self
    }

    pub fn with_analytics_cache(mut self, cache: Arc<dyn AnalyticsCache>) -> Self {
        self.analytics_cache = Some(cache);
        self
    }
}

pub struct KindbInstance {
    config: KindbConfig,
    locks: Arc<LockManager>,
    connector: Arc<dyn Connector>,
    schema: Arc<dyn SchemaAccessor>,
    peers: Arc<dyn PeerClient>,
    authorizer: Arc<dyn Authorizer>,
    history: HistoryTrail,
    tasks: BackgroundTasks,
    analytics: MetaQueryRunner,
    shutting_down: AtomicBool,
}

impl KindbInstance {
    pub fn open(config: KindbConfig, collaborators: Collaborators) -> Result<Self, KindbError> {
        config.validate()?;
        info!(
            max_background_tasks = config.max_background_tasks,
            lock_acquire_timeout_ms = ?config.lock_acquire_timeout_ms,
            reference_resolution_enabled = config.reference_resolution_enabled,
            analytics_cache_capacity = config.analytics_cache_capacity,
            "opening kindb instance"
        );
        let analytics_cache: Arc<dyn AnalyticsCache> = match collaborators.analytics_cache {
            Some(cache) => cache,
            None => Arc::new(LruAnalyticsCache::new(config.analytics_cache_capacity)),
        };
        Ok(Self {
            locks: Arc::new(LockManager::new(config.lock_timeout())),
            history: HistoryTrail::new(Arc::clone(&collaborators.connector)),
            tasks: BackgroundTasks::new(config.max_background_tasks),
            analytics: MetaQueryRunner::new(analytics_cache),
            connector: collaborators.connector,
            schema: collaborators.schema,
            peers: collaborators.peers,
            authorizer: collaborators.authorizer,
            shutting_down: AtomicBool::new(false),
            config,
        })
    }

    pub fn config(&self) -> &KindbConfig {
        &self.config
    }

    pub fn lock_metrics(&self) -> LockMetrics {
        self.locks.metrics()
    }

    pub fn task_metrics(&self) -> TaskMetrics {
        self.tasks.metrics()
    }

    pub async fn get(
        &self,
        principal: &Principal,
        kind: Kind,
        id: Uuid,
    ) -> Result<ObjectResponse, KindbError> {
        let lock = self.locks.object_store_read().await?;
        let object = self.connector.get(kind, id).await?;
        lock.unlock()?;
        self.authorize(principal, AuthAction::Read, object.owner())
            .await?;
        Ok(ObjectResponse { id, kind, object })
    }

    /// Live state plus archived prior states, oldest first. `deleted` is set
    /// when the live lookup fails but history exists.
    pub async fn history(
        &self,
        principal: &Principal,
        kind: Kind,
        id: Uuid,
    ) -> Result<ObjectHistory, KindbError> {
        let lock = self.locks.object_store_read().await?;
        let history = self.history.lookup(kind, id).await?;
        lock.unlock()?;
        self.authorize(principal, AuthAction::Read, history.owner())
            .await?;
        Ok(history)
    }

    /// Objects owned by the caller's key. Root keys see every owner.
    pub async fn list(
        &self,
        principal: &Principal,
        kind: Kind,
        params: ListParams,
    ) -> Result<ObjectList, KindbError> {
        let own_key = Reference::local(principal.key_id, RefType::Key);
        self.authorize(principal, AuthAction::Read, Some(&own_key))
            .await?;
        let limit = effective_limit(&self.config, params.limit);
        let offset = page_offset(limit, params.page)?;
        let request = ListRequest {
            limit,
            offset,
            owner: (!principal.is_root()).then_some(principal.key_id),
            filters: params.filters,
        };
        let lock = self.locks.object_store_read().await?;
        let page = self.connector.list(kind, request).await?;
        lock.unlock()?;
        Ok(ObjectList {
            objects: page
                .objects
                .into_iter()
                .map(|(id, object)| ObjectResponse { id, kind, object })
                .collect(),
            total_results: page.total_results,
        })
    }

    /// Runs every check a create would run without writing anything.
    pub async fn validate(
        &self,
        principal: &Principal,
        kind: Kind,
        body: &ObjectCreate,
    ) -> Result<(), KindbError> {
        let payload = Payload::from_json(body.schema.clone())?;
        validate_network_references(
            self.peers.as_ref(),
            principal,
            payload.network_references().map(|(_, r)| r).collect::<Vec<_>>(),
        )
        .await?;
        let lock = self.locks.object_store_read().await?;
        self.validate_locally(kind, &body.class, &payload).await?;
        lock.unlock()?;
        Ok(())
    }

    pub async fn create(
        &self,
        principal: &Principal,
        kind: Kind,
        body: ObjectCreate,
    ) -> Result<MutationOutcome, KindbError> {
        self.ensure_open()?;
        let payload = Payload::from_json(body.schema)?;
        validate_network_references(
            self.peers.as_ref(),
            principal,
            payload.network_references().map(|(_, r)| r).collect::<Vec<_>>(),
        )
        .await?;

        let deferred = DeferredUnlock::new(self.locks.object_store_write().await?);
        self.authorize(principal, AuthAction::Write, None).await?;
        self.validate_locally(kind, &body.class, &payload).await?;

        let id = Uuid::new_v4();
        let now = now_millis();
        let object = Object {
            class: body.class,
            context: body.context,
            schema: payload.clone(),
            creation_time_unix: now,
            last_update_time_unix: now,
            key: Some(Reference::local(principal.key_id, RefType::Key)),
        };
        let (status, steps) = if body.async_write {
            let put = self.spawn_put(&deferred, kind, id, object.clone())?;
            (MutationStatus::Accepted, vec![put])
        } else {
            self.connector.put(kind, id, object.clone()).await?;
            (MutationStatus::Ok, Vec::new())
        };
        let resolution = self.schedule_resolution(kind, &object.class, payload);
        debug!(%kind, %id, class = %object.class, ?status, "object created");
        Ok(MutationOutcome::new(
            status,
            Some(ObjectResponse { id, kind, object }),
            deferred,
            steps,
            resolution,
        ))
    }

    /// Replaces the payload. Always accepted: archival of the prior state and
    /// persistence of the new one run as deferred steps under the lock.
    pub async fn update(
        &self,
        principal: &Principal,
        kind: Kind,
        id: Uuid,
        body: ObjectUpdate,
    ) -> Result<MutationOutcome, KindbError> {
        self.ensure_open()?;
        let payload = Payload::from_json(body.schema)?;
        validate_network_references(
            self.peers.as_ref(),
            principal,
            payload.network_references().map(|(_, r)| r).collect::<Vec<_>>(),
        )
        .await?;

        let deferred = DeferredUnlock::new(self.locks.object_store_write().await?);
        let prior = self.connector.get(kind, id).await?;
        self.authorize(principal, AuthAction::Write, prior.owner())
            .await?;
        ensure_same_class(&prior, &body.class)?;
        self.validate_locally(kind, &prior.class, &payload).await?;

        let object = Object {
            class: prior.class.clone(),
            context: body.context,
            schema: payload.clone(),
            creation_time_unix: prior.creation_time_unix,
            last_update_time_unix: next_update_time(&prior),
            key: prior.key.clone(),
        };
        let entry = self.history.capture(&prior, HistoryKind::Update);
        let steps = vec![
            self.spawn_archive(&deferred, kind, id, entry)?,
            self.spawn_put(&deferred, kind, id, object.clone())?,
        ];
        let resolution = self.schedule_resolution(kind, &object.class, payload);
        debug!(%kind, %id, "object update accepted");
        Ok(MutationOutcome::new(
            MutationStatus::Accepted,
            Some(ObjectResponse { id, kind, object }),
            deferred,
            steps,
            resolution,
        ))
    }

    /// Applies an RFC 6902 patch to the JSON form of the object.
    ///
    /// The patch is first applied to a snapshot so that every peer reference
    /// it introduces can be checked before the object-store lock is taken.
    /// Under the lock it is re-applied to the current state; a result carrying
    /// a peer reference that was not checked is rejected.
    pub async fn patch(
        &self,
        principal: &Principal,
        kind: Kind,
        id: Uuid,
        patch: serde_json::Value,
        async_write: bool,
    ) -> Result<MutationOutcome, KindbError> {
        self.ensure_open()?;
        let operations: json_patch::Patch = serde_json::from_value(patch)
            .map_err(|e| KindbError::BadRequest(format!("patch does not decode: {e}")))?;

        let snapshot = {
            let lock = self.locks.object_store_read().await?;
            let snapshot = self.connector.get(kind, id).await;
            lock.unlock()?;
            snapshot?
        };
        self.authorize(principal, AuthAction::Write, snapshot.owner())
            .await?;
        let preview = apply_patch(&snapshot, &operations)?;
        let checked = introduced_network_references(&snapshot.schema, &preview.schema);
        validate_network_references(self.peers.as_ref(), principal, &checked).await?;

        let deferred = DeferredUnlock::new(self.locks.object_store_write().await?);
        let prior = self.connector.get(kind, id).await?;
        self.authorize(principal, AuthAction::Write, prior.owner())
            .await?;
        let object = apply_patch(&prior, &operations)?;
        if let Some(unchecked) = introduced_network_references(&prior.schema, &object.schema)
            .into_iter()
            .find(|r| !checked.contains(r))
        {
            return Err(KindbError::Validation(format!(
                "reference to '{}' appeared after peer validation; retry the patch",
                unchecked.target
            )));
        }
        self.validate_locally(kind, &object.class, &object.schema)
            .await?;

        let (status, steps) = if async_write {
            let entry = self.history.capture(&prior, HistoryKind::Update);
            let steps = vec![
                self.spawn_archive(&deferred, kind, id, entry)?,
                self.spawn_put(&deferred, kind, id, object.clone())?,
            ];
            (MutationStatus::Accepted, steps)
        } else {
            self.history
                .record(kind, id, &prior, HistoryKind::Update)
                .await?;
            self.connector.put(kind, id, object.clone()).await?;
            (MutationStatus::Ok, Vec::new())
        };
        let resolution = self.schedule_resolution(kind, &object.class, object.schema.clone());
        debug!(%kind, %id, ?status, "object patched");
        Ok(MutationOutcome::new(
            status,
            Some(ObjectResponse { id, kind, object }),
            deferred,
            steps,
            resolution,
        ))
    }

    pub async fn delete(
        &self,
        principal: &Principal,
        kind: Kind,
        id: Uuid,
    ) -> Result<MutationOutcome, KindbError> {
        self.ensure_open()?;
        let deferred = DeferredUnlock::new(self.locks.object_store_write().await?);
        let prior = self.connector.get(kind, id).await?;
        self.authorize(principal, AuthAction::Delete, prior.owner())
            .await?;
        let entry = self.history.capture(&prior, HistoryKind::Delete);
        let connector = Arc::clone(&self.connector);
        let steps = vec![
            self.spawn_archive(&deferred, kind, id, entry)?,
            deferred.spawn_step(&self.tasks, "delete_object", async move {
                connector.delete(kind, id).await.map_err(KindbError::from)
            })?,
        ];
        debug!(%kind, %id, "object delete accepted");
        Ok(MutationOutcome::new(
            MutationStatus::Accepted,
            None,
            deferred,
            steps,
            None,
        ))
    }

    /// Appends a reference to a `many` reference property.
    pub async fn add_reference(
        &self,
        principal: &Principal,
        kind: Kind,
        id: Uuid,
        property: &str,
        reference: Reference,
    ) -> Result<MutationOutcome, KindbError> {
        let added = std::slice::from_ref(&reference);
        self.edit_references(principal, kind, id, property, Some(added), |list| {
            list.push(reference.clone());
        })
        .await
    }

    /// Removes the first entry equal on target, location and type. The
    /// reference is not validated, so dangling references can be removed.
    pub async fn remove_reference(
        &self,
        principal: &Principal,
        kind: Kind,
        id: Uuid,
        property: &str,
        reference: Reference,
    ) -> Result<MutationOutcome, KindbError> {
        self.edit_references(principal, kind, id, property, None, |list| {
            if !PropertyValue::remove_first_match(list, &reference) {
                debug!(%id, property, target = %reference.target, "no matching reference to remove");
            }
        })
        .await
    }

    pub async fn replace_references(
        &self,
        principal: &Principal,
        kind: Kind,
        id: Uuid,
        property: &str,
        references: Vec<Reference>,
    ) -> Result<MutationOutcome, KindbError> {
        let replacement = references.clone();
        self.edit_references(principal, kind, id, property, Some(references.as_slice()), |list| {
            *list = replacement;
        })
        .await
    }

    pub async fn get_meta(
        &self,
        principal: &Principal,
        query: &MetaQuery,
        aggregator: &dyn Aggregator,
    ) -> Result<MetaResult, KindbError> {
        self.authorize(principal, AuthAction::Read, None).await?;
        self.analytics.run(query, aggregator).await
    }

    /// Rejects further mutations and waits for deferred work to finish.
    pub async fn shutdown(&self) -> Result<(), KindbError> {
        self.shutting_down.store(true, Ordering::Release);
        self.tasks.drain().await;
        let locks = self.locks.metrics();
        let tasks = self.tasks.metrics();
        info!(
            locks_held = locks.held(),
            tasks_spawned = tasks.spawned,
            tasks_failed = tasks.failed,
            tasks_panicked = tasks.panicked,
            "kindb instance shut down"
        );
        Ok(())
    }

    async fn edit_references<F>(
        &self,
        principal: &Principal,
        kind: Kind,
        id: Uuid,
        property: &str,
        validate: Option<&[Reference]>,
        edit: F,
    ) -> Result<MutationOutcome, KindbError>
    where
        F: FnOnce(&mut Vec<Reference>),
    {
        self.ensure_open()?;
        if let Some(references) = validate {
            validate_network_references(self.peers.as_ref(), principal, references).await?;
        }

        let deferred = DeferredUnlock::new(self.locks.object_store_write().await?);
        let prior = self.connector.get(kind, id).await?;
        self.authorize(principal, AuthAction::Write, prior.owner())
            .await?;

        let schema_lock = self.locks.schema_read().await?;
        let descriptor = self.schema.get_property(kind, &prior.class, property).await?;
        let types = many_reference_types(&descriptor)?;
        if let Some(references) = validate {
            validate_references(self.connector.as_ref(), &descriptor, &types, references).await?;
        }
        schema_lock.unlock()?;

        let mut object = prior.clone();
        let mut list = stored_reference_list(&object.schema, property)?;
        edit(&mut list);
        object
            .schema
            .insert(property, PropertyValue::RefList(list));
        object.last_update_time_unix = next_update_time(&prior);

        self.history
            .record(kind, id, &prior, HistoryKind::Update)
            .await?;
        self.connector.put(kind, id, object.clone()).await?;

        let resolution = match validate {
            Some(_) => self.schedule_resolution(kind, &object.class, object.schema.clone()),
            None => None,
        };
        debug!(%kind, %id, property, "references edited");
        Ok(MutationOutcome::new(
            MutationStatus::Ok,
            Some(ObjectResponse { id, kind, object }),
            deferred,
            Vec::new(),
            resolution,
        ))
    }

    fn ensure_open(&self) -> Result<(), KindbError> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(KindbError::Unavailable {
                message: "instance is shutting down".into(),
            });
        }
        Ok(())
    }

    async fn authorize(
        &self,
        principal: &Principal,
        action: AuthAction,
        owner: Option<&Reference>,
    ) -> Result<(), KindbError> {
        match self.authorizer.allowed(principal, action, owner).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(KindbError::Forbidden(format!(
                "key {} may not {action} this object",
                principal.key_id
            ))),
            Err(err) => Err(KindbError::Forbidden(format!(
                "authorization failed: {err}"
            ))),
        }
    }

    // Object-store lock is held by the caller; schema is read under its own
    // shared lock, taken second.
    async fn validate_locally(
        &self,
        kind: Kind,
        class: &str,
        payload: &Payload,
    ) -> Result<(), KindbError> {
        let schema_lock = self.locks.schema_read().await?;
        let result = validate_payload(
            self.schema.as_ref(),
            self.connector.as_ref(),
            kind,
            class,
            payload,
        )
        .await;
        schema_lock.unlock()?;
        result
    }

    fn spawn_archive(
        &self,
        deferred: &DeferredUnlock,
        kind: Kind,
        id: Uuid,
        entry: HistoryEntry,
    ) -> Result<TaskHandle, KindbError> {
        let history = self.history.clone();
        deferred.spawn_step(&self.tasks, "archive_prior_state", async move {
            history.archive(kind, id, entry).await
        })
    }

    fn spawn_put(
        &self,
        deferred: &DeferredUnlock,
        kind: Kind,
        id: Uuid,
        object: Object,
    ) -> Result<TaskHandle, KindbError> {
        let connector = Arc::clone(&self.connector);
        deferred.spawn_step(&self.tasks, "persist_object", async move {
            connector.put(kind, id, object).await.map_err(KindbError::from)
        })
    }

    fn schedule_resolution(&self, kind: Kind, class: &str, payload: Payload) -> Option<TaskHandle> {
        if !self.config.reference_resolution_enabled {
            return None;
        }
        let updater = ReferenceSchemaUpdater::new(
            Arc::clone(&self.schema),
            Arc::clone(&self.peers),
            kind,
            class,
        );
        Some(spawn_reference_resolution(
            Arc::clone(&self.locks),
            &self.tasks,
            updater,
            payload,
        ))
    }
}
