pub mod memory;

use crate::catalog::types::{Kind, Object, Scalar};
use crate::history::HistoryEntry;
use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

pub use memory::MemoryConnector;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectorError {
    /// The distinguished "no such object" signal.
    #[error("{kind} '{id}' not found")]
    NotFound { kind: Kind, id: Uuid },
    #[error("connector unavailable: {0}")]
    Unavailable(String),
    #[error("connector rejected write: {0}")]
    Rejected(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOperator {
    Equal,
    NotEqual,
}

/// Equality filter on a primitive schema property.
#[derive(Debug, Clone, PartialEq)]
pub struct WhereFilter {
    pub property: String,
    pub operator: FilterOperator,
    pub value: Scalar,
}

impl WhereFilter {
    pub fn equal(property: impl Into<String>, value: Scalar) -> Self {
        Self {
            property: property.into(),
            operator: FilterOperator::Equal,
            value,
        }
    }

    pub fn not_equal(property: impl Into<String>, value: Scalar) -> Self {
        Self {
            property: property.into(),
            operator: FilterOperator::NotEqual,
            value,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ListRequest {
    pub limit: usize,
    pub offset: usize,
    pub owner: Option<Uuid>,
    pub filters: Vec<WhereFilter>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ListPage {
    pub objects: Vec<(Uuid, Object)>,
    pub total_results: usize,
}

/// Persistence engine seam. Implementations own the storage format; callers
/// serialize access through the object-store lock.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn get(&self, kind: Kind, id: Uuid) -> Result<Object, ConnectorError>;

    /// Inserts or replaces the live object.
    async fn put(&self, kind: Kind, id: Uuid, object: Object) -> Result<(), ConnectorError>;

    async fn delete(&self, kind: Kind, id: Uuid) -> Result<(), ConnectorError>;

    /// Appends a prior state to the object's history.
    async fn archive(&self, kind: Kind, id: Uuid, entry: HistoryEntry)
    -> Result<(), ConnectorError>;

    /// History entries in archival order, oldest first.
    async fn history(&self, kind: Kind, id: Uuid) -> Result<Vec<HistoryEntry>, ConnectorError>;

    async fn list(&self, kind: Kind, request: ListRequest) -> Result<ListPage, ConnectorError>;
}
