//! Append-only archive of prior object states.
//!
//! A prior state is captured synchronously, while the mutation still holds the
//! object-store lock, and archived either inline or as a deferred step of the
//! same mutation. Either way the lock is not released before the entry lands,
//! so entries for one identifier are ordered by lock acquisition.

use crate::catalog::types::{Kind, Object};
use crate::error::KindbError;
use crate::lib_helpers::now_millis;
use crate::storage::{Connector, ConnectorError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum HistoryKind {
    #[serde(rename = "update")]
    Update,
    #[serde(rename = "delete")]
    Delete,
}

/// Immutable snapshot of an object as it was before a mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub object: Object,
    pub kind: HistoryKind,
    #[serde(rename = "archivedAtUnix")]
    pub archived_at_unix: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ObjectHistory {
    pub id: Uuid,
    pub kind: Kind,
    /// Oldest first.
    pub entries: Vec<HistoryEntry>,
    /// Live lookup failed but history exists.
    pub deleted: bool,
    pub live: Option<Object>,
}

impl ObjectHistory {
    /// Owner key of the most recent known state.
    pub fn owner(&self) -> Option<&crate::catalog::types::Reference> {
        self.live
            .as_ref()
            .and_then(Object::owner)
            .or_else(|| self.entries.last().and_then(|e| e.object.owner()))
    }
}

#[derive(Clone)]
pub struct HistoryTrail {
    connector: Arc<dyn Connector>,
}

impl HistoryTrail {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self { connector }
    }

    pub fn capture(&self, prior: &Object, kind: HistoryKind) -> HistoryEntry {
        HistoryEntry {
            object: prior.clone(),
            kind,
            archived_at_unix: now_millis(),
        }
    }

    pub async fn archive(
        &self,
        kind: Kind,
        id: Uuid,
        entry: HistoryEntry,
    ) -> Result<(), KindbError> {
        self.connector.archive(kind, id, entry).await?;
        Ok(())
    }

    /// Captures and archives in one go, for mutations that commit inline.
    pub async fn record(
        &self,
        kind: Kind,
        id: Uuid,
        prior: &Object,
        mutation: HistoryKind,
    ) -> Result<HistoryEntry, KindbError> {
        let entry = self.capture(prior, mutation);
        self.archive(kind, id, entry.clone()).await?;
        Ok(entry)
    }

    /// Distinguishes live, deleted and never-existed identifiers.
    pub async fn lookup(&self, kind: Kind, id: Uuid) -> Result<ObjectHistory, KindbError> {
        let live = match self.connector.get(kind, id).await {
            Ok(object) => Some(object),
            Err(ConnectorError::NotFound { .. }) => None,
            Err(e) => return Err(e.into()),
        };
        let entries = self.connector.history(kind, id).await?;
        if live.is_none() && entries.is_empty() {
            return Err(KindbError::NotFound { kind, id });
        }
        Ok(ObjectHistory {
            id,
            kind,
            deleted: live.is_none(),
            entries,
            live,
        })
    }
}
