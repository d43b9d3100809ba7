use crate::catalog::SchemaError;
use crate::catalog::types::Kind;
use crate::lock::LockDomain;
use crate::network::PeerError;
use crate::storage::ConnectorError;
use thiserror::Error;
use uuid::Uuid;

/// Transport-facing outcome of an operation.
///
/// `Accepted` means the object is committed in its new state but deferred
/// side effects (archival, persistence steps, schema reconciliation) may still
/// be running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationStatus {
    Ok,
    Accepted,
    NotFound,
    Forbidden,
    BadRequest,
    UnprocessableEntity,
    InternalError,
}

impl MutationStatus {
    pub fn http_code(self) -> u16 {
        match self {
            MutationStatus::Ok => 200,
            MutationStatus::Accepted => 202,
            MutationStatus::BadRequest => 400,
            MutationStatus::Forbidden => 403,
            MutationStatus::NotFound => 404,
            MutationStatus::UnprocessableEntity => 422,
            MutationStatus::InternalError => 500,
        }
    }

    pub fn is_success(self) -> bool {
        matches!(self, MutationStatus::Ok | MutationStatus::Accepted)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KindbErrorCode {
    Validation,
    BadRequest,
    InvalidConfig,
    NotFound,
    Forbidden,
    Schema,
    Storage,
    Peer,
    LockAlreadyReleased,
    LockTimeout,
    CoordinatorReleased,
    Encode,
    Decode,
    TaskPanicked,
    Unavailable,
}

impl KindbErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            KindbErrorCode::Validation => "validation",
            KindbErrorCode::BadRequest => "bad_request",
            KindbErrorCode::InvalidConfig => "invalid_config",
            KindbErrorCode::NotFound => "not_found",
            KindbErrorCode::Forbidden => "forbidden",
            KindbErrorCode::Schema => "schema",
            KindbErrorCode::Storage => "storage",
            KindbErrorCode::Peer => "peer",
            KindbErrorCode::LockAlreadyReleased => "lock_already_released",
            KindbErrorCode::LockTimeout => "lock_timeout",
            KindbErrorCode::CoordinatorReleased => "coordinator_released",
            KindbErrorCode::Encode => "encode",
            KindbErrorCode::Decode => "decode",
            KindbErrorCode::TaskPanicked => "task_panicked",
            KindbErrorCode::Unavailable => "unavailable",
        }
    }
}

#[derive(Debug, Error)]
pub enum KindbError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("invalid config: {message}")]
    InvalidConfig { message: String },
    #[error("{kind} '{id}' not found")]
    NotFound { kind: Kind, id: Uuid },
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("schema error: {0}")]
    Schema(#[from] SchemaError),
    #[error("storage error: {0}")]
    Storage(ConnectorError),
    #[error("peer error: {0}")]
    Peer(#[from] PeerError),
    #[error("{domain} lock handle already released")]
    LockAlreadyReleased { domain: LockDomain },
    #[error("timed out acquiring {domain} lock")]
    LockTimeout { domain: LockDomain },
    #[error("deferred unlock already released; cannot register more steps")]
    CoordinatorReleased,
    #[error("encode error: {0}")]
    Encode(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("background task '{0}' panicked")]
    TaskPanicked(String),
    #[error("resource unavailable: {message}")]
    Unavailable { message: String },
}

impl From<ConnectorError> for KindbError {
    fn from(err: ConnectorError) -> Self {
        match err {
            ConnectorError::NotFound { kind, id } => KindbError::NotFound { kind, id },
            other => KindbError::Storage(other),
        }
    }
}

impl KindbError {
    pub fn code(&self) -> KindbErrorCode {
        match self {
            KindbError::Validation(_) => KindbErrorCode::Validation,
            KindbError::BadRequest(_) => KindbErrorCode::BadRequest,
            KindbError::InvalidConfig { .. } => KindbErrorCode::InvalidConfig,
            KindbError::NotFound { .. } => KindbErrorCode::NotFound,
            KindbError::Forbidden(_) => KindbErrorCode::Forbidden,
            KindbError::Schema(_) => KindbErrorCode::Schema,
            KindbError::Storage(_) => KindbErrorCode::Storage,
            KindbError::Peer(_) => KindbErrorCode::Peer,
            KindbError::LockAlreadyReleased { .. } => KindbErrorCode::LockAlreadyReleased,
            KindbError::LockTimeout { .. } => KindbErrorCode::LockTimeout,
            KindbError::CoordinatorReleased => KindbErrorCode::CoordinatorReleased,
            KindbError::Encode(_) => KindbErrorCode::Encode,
            KindbError::Decode(_) => KindbErrorCode::Decode,
            KindbError::TaskPanicked(_) => KindbErrorCode::TaskPanicked,
            KindbError::Unavailable { .. } => KindbErrorCode::Unavailable,
        }
    }

    pub fn code_str(&self) -> &'static str {
        self.code().as_str()
    }

    /// Maps the error onto the status reported to the transport layer.
    pub fn status(&self) -> MutationStatus {
        match self {
            KindbError::Validation(_) | KindbError::Schema(_) | KindbError::Peer(_) => {
                MutationStatus::UnprocessableEntity
            }
            KindbError::BadRequest(_) => MutationStatus::BadRequest,
            KindbError::NotFound { .. } => MutationStatus::NotFound,
            KindbError::Forbidden(_) => MutationStatus::Forbidden,
            KindbError::InvalidConfig { .. }
            | KindbError::Storage(_)
            | KindbError::LockAlreadyReleased { .. }
            | KindbError::LockTimeout { .. }
            | KindbError::CoordinatorReleased
            | KindbError::Encode(_)
            | KindbError::Decode(_)
            | KindbError::TaskPanicked(_)
            | KindbError::Unavailable { .. } => MutationStatus::InternalError,
        }
    }
}
