use super::{Connector, ConnectorError, FilterOperator, ListPage, ListRequest, WhereFilter};
use crate::catalog::types::{Kind, Object, PropertyValue};
use crate::history::HistoryEntry;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectorOp {
    Put,
    Delete,
    Archive,
}

#[derive(Debug, Default)]
struct MemoryState {
    live: BTreeMap<(Kind, Uuid), Object>,
    history: HashMap<(Kind, Uuid), Vec<HistoryEntry>>,
}

#[derive(Debug, Default)]
struct WriteCounters {
    puts: AtomicU64,
    deletes: AtomicU64,
    archives: AtomicU64,
}

/// In-memory persistence used by tests, benches and the demo binary.
///
/// Writes can be slowed down or made to fail per operation, which is how the
/// partial-failure and interleaving behaviour of deferred steps is exercised.
#[derive(Debug, Default)]
pub struct MemoryConnector {
    state: Mutex<MemoryState>,
    failing: Mutex<HashSet<ConnectorOp>>,
    write_delay: Mutex<Option<Duration>>,
    counters: WriteCounters,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_write_delay(self, delay: Duration) -> Self {
        *self.write_delay.lock() = Some(delay);
        self
    }

    pub fn fail_on(&self, op: ConnectorOp) {
        self.failing.lock().insert(op);
    }

    pub fn clear_failures(&self) {
        self.failing.lock().clear();
    }

    pub fn put_count(&self) -> u64 {
        self.counters.puts.load(Ordering::Relaxed)
    }

    pub fn archive_count(&self) -> u64 {
        self.counters.archives.load(Ordering::Relaxed)
    }

    pub fn delete_count(&self) -> u64 {
        self.counters.deletes.load(Ordering::Relaxed)
    }

    pub fn live_count(&self, kind: Kind) -> usize {
        self.state.lock().live.keys().filter(|(k, _)| *k == kind).count()
    }

    async fn before_write(&self, op: ConnectorOp) -> Result<(), ConnectorError> {
        let delay = *self.write_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.lock().contains(&op) {
            return Err(ConnectorError::Unavailable(format!(
                "injected failure on {op:?}"
            )));
        }
        Ok(())
    }
}

fn matches_filters(object: &Object, filters: &[WhereFilter]) -> bool {
    filters.iter().all(|filter| {
        let current = match object.schema.get(&filter.property) {
            Some(PropertyValue::Primitive(scalar)) => Some(scalar),
            _ => None,
        };
        match filter.operator {
            FilterOperator::Equal => current == Some(&filter.value),
            FilterOperator::NotEqual => current != Some(&filter.value),
        }
    })
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn get(&self, kind: Kind, id: Uuid) -> Result<Object, ConnectorError> {
        self.state
            .lock()
            .live
            .get(&(kind, id))
            .cloned()
            .ok_or(ConnectorError::NotFound { kind, id })
    }

    async fn put(&self, kind: Kind, id: Uuid, object: Object) -> Result<(), ConnectorError> {
        self.before_write(ConnectorOp::Put).await?;
        self.state.lock().live.insert((kind, id), object);
        self.counters.puts.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn delete(&self, kind: Kind, id: Uuid) -> Result<(), ConnectorError> {
        self.before_write(ConnectorOp::Delete).await?;
        self.state
            .lock()
            .live
            .remove(&(kind, id))
            .ok_or(ConnectorError::NotFound { kind, id })?;
        self.counters.deletes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn archive(
        &self,
        kind: Kind,
        id: Uuid,
        entry: HistoryEntry,
    ) -> Result<(), ConnectorError> {
        self.before_write(ConnectorOp::Archive).await?;
        self.state
            .lock()
            .history
            .entry((kind, id))
            .or_default()
            .push(entry);
        self.counters.archives.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn history(&self, kind: Kind, id: Uuid) -> Result<Vec<HistoryEntry>, ConnectorError> {
        Ok(self
            .state
            .lock()
            .history
            .get(&(kind, id))
            .cloned()
            .unwrap_or_default())
    }

    async fn list(&self, kind: Kind, request: ListRequest) -> Result<ListPage, ConnectorError> {
        let state = self.state.lock();
        let matching: Vec<(Uuid, &Object)> = state
            .live
            .iter()
            .filter(|((k, _), _)| *k == kind)
            .filter(|(_, object)| match request.owner {
                Some(owner) => object.key.as_ref().is_some_and(|key| key.target == owner),
                None => true,
            })
            .filter(|(_, object)| matches_filters(object, &request.filters))
            .map(|((_, id), object)| (*id, object))
            .collect();
        let total_results = matching.len();
        let objects = matching
            .into_iter()
            .skip(request.offset)
            .take(request.limit)
            .map(|(id, object)| (id, object.clone()))
            .collect();
        Ok(ListPage {
            objects,
            total_results,
        })
    }
}
