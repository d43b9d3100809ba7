use crate::catalog::types::Reference;
use crate::error::KindbError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum AuthAction {
    Read,
    Write,
    Delete,
}

impl std::fmt::Display for AuthAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthAction::Read => write!(f, "read"),
            AuthAction::Write => write!(f, "write"),
            AuthAction::Delete => write!(f, "delete"),
        }
    }
}

/// The authenticated caller, identified by its key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Principal {
    pub key_id: Uuid,
    // Root keys bypass ownership checks; never deserialize from untrusted input.
    #[serde(default, skip_deserializing)]
    root: bool,
}

impl Principal {
    pub fn new(key_id: Uuid) -> Self {
        Self {
            key_id,
            root: false,
        }
    }

    pub fn root(key_id: Uuid) -> Self {
        Self {
            key_id,
            root: true,
        }
    }

    pub fn is_root(&self) -> bool {
        self.root
    }
}

/// Yes/no authorization decision. `owner` is the key reference stored on the
/// object being accessed, or `None` when no object exists yet (create).
#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn allowed(
        &self,
        principal: &Principal,
        action: AuthAction,
        owner: Option<&Reference>,
    ) -> Result<bool, KindbError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

#[async_trait]
impl Authorizer for AllowAll {
    async fn allowed(
        &self,
        _principal: &Principal,
        _action: AuthAction,
        _owner: Option<&Reference>,
    ) -> Result<bool, KindbError> {
        Ok(true)
    }
}

/// Keys may act on the objects they own; root keys may act on everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct OwnerOnly;

#[async_trait]
impl Authorizer for OwnerOnly {
    async fn allowed(
        &self,
        principal: &Principal,
        _action: AuthAction,
        owner: Option<&Reference>,
    ) -> Result<bool, KindbError> {
        if principal.is_root() {
            return Ok(true);
        }
        Ok(match owner {
            None => true,
            Some(owner) => owner.target == principal.key_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::types::RefType;

    #[tokio::test]
    async fn owner_only_allows_owner_and_root() {
        let owner_key = Uuid::new_v4();
        let owner_ref = Reference::local(owner_key, RefType::Key);
        let auth = OwnerOnly;

        let owner = Principal::new(owner_key);
        let stranger = Principal::new(Uuid::new_v4());
        let root = Principal::root(Uuid::new_v4());

        assert!(auth.allowed(&owner, AuthAction::Write, Some(&owner_ref)).await.expect("ok"));
        assert!(!auth.allowed(&stranger, AuthAction::Delete, Some(&owner_ref)).await.expect("ok"));
        assert!(auth.allowed(&root, AuthAction::Delete, Some(&owner_ref)).await.expect("ok"));
        assert!(auth.allowed(&stranger, AuthAction::Write, None).await.expect("ok"));
    }

    #[test]
    fn root_flag_is_not_deserialized() {
        let json = format!(r#"{{"key_id":"{}","root":true}}"#, Uuid::new_v4());
        let principal: Principal = serde_json::from_str(&json).expect("decode");
        assert!(!principal.is_root());
    }
}
