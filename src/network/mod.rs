use crate::catalog::schema::DataType;
use crate::catalog::types::{Kind, Reference};
use crate::permission::Principal;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PeerError {
    #[error("reference is local; no peer to ask")]
    NotNetworkReference,
    #[error("unknown peer '{0}'")]
    UnknownPeer(String),
    #[error("reference {target} not found on peer '{peer}'")]
    ReferenceNotFound { peer: String, target: Uuid },
    #[error("peer '{peer}' unavailable: {message}")]
    Unavailable { peer: String, message: String },
}

/// A class as known on a remote peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NetworkClass {
    pub peer: String,
    pub class: String,
}

impl NetworkClass {
    /// Peer-qualified data type name, as stored in property descriptors.
    pub fn data_type(&self) -> String {
        DataType::network(&self.peer, &self.class)
    }
}

/// Client for the network of peer nodes. Calls may block on I/O and must not
/// be made while the object-store lock is held.
#[async_trait]
pub trait PeerClient: Send + Sync {
    async fn validate_reference(
        &self,
        reference: &Reference,
        principal: &Principal,
    ) -> Result<(), PeerError>;

    async fn resolve_class(&self, reference: &Reference) -> Result<NetworkClass, PeerError>;
}

/// Stand-alone node: every network reference is rejected.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPeers;

#[async_trait]
impl PeerClient for NoPeers {
    async fn validate_reference(
        &self,
        reference: &Reference,
        _principal: &Principal,
    ) -> Result<(), PeerError> {
        Err(unknown_peer(reference))
    }

    async fn resolve_class(&self, reference: &Reference) -> Result<NetworkClass, PeerError> {
        Err(unknown_peer(reference))
    }
}

fn unknown_peer(reference: &Reference) -> PeerError {
    match reference.location.peer_name() {
        Some(peer) => PeerError::UnknownPeer(peer.to_string()),
        None => PeerError::NotNetworkReference,
    }
}

#[derive(Debug, Clone)]
struct RemoteObject {
    kind: Kind,
    class: String,
}

/// Directory of peers and the objects they host, kept in memory.
#[derive(Debug, Default)]
pub struct InMemoryPeers {
    peers: RwLock<HashMap<String, HashMap<Uuid, RemoteObject>>>,
    latency: RwLock<Option<Duration>>,
    calls: AtomicU64,
}

impl InMemoryPeers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_latency(self, latency: Duration) -> Self {
        *self.latency.write() = Some(latency);
        self
    }

    pub fn add_peer(&self, peer: impl Into<String>) {
        self.peers.write().entry(peer.into()).or_default();
    }

    pub fn host(&self, peer: &str, id: Uuid, kind: Kind, class: impl Into<String>) {
        self.peers.write().entry(peer.to_string()).or_default().insert(
            id,
            RemoteObject {
                kind,
                class: class.into(),
            },
        );
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    async fn lookup(&self, reference: &Reference) -> Result<NetworkClass, PeerError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let latency = *self.latency.read();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        let peer = reference
            .location
            .peer_name()
            .ok_or(PeerError::NotNetworkReference)?;
        let peers = self.peers.read();
        let objects = peers
            .get(peer)
            .ok_or_else(|| PeerError::UnknownPeer(peer.to_string()))?;
        let remote = objects
            .get(&reference.target)
            .filter(|remote| reference.ref_type.object_kind() == Some(remote.kind))
            .ok_or_else(|| PeerError::ReferenceNotFound {
                peer: peer.to_string(),
                target: reference.target,
            })?;
        Ok(NetworkClass {
            peer: peer.to_string(),
            class: remote.class.clone(),
        })
    }
}

#[async_trait]
impl PeerClient for InMemoryPeers {
    async fn validate_reference(
        &self,
        reference: &Reference,
        _principal: &Principal,
    ) -> Result<(), PeerError> {
        self.lookup(reference).await.map(|_| ())
    }

    async fn resolve_class(&self, reference: &Reference) -> Result<NetworkClass, PeerError> {
        self.lookup(reference).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::types::RefType;

    #[tokio::test]
    async fn resolves_hosted_objects_and_rejects_the_rest() {
        let peers = InMemoryPeers::new();
        let id = Uuid::new_v4();
        peers.host("peerA", id, Kind::Thing, "Town");

        let found = peers
            .resolve_class(&Reference::network("peerA", id, RefType::Thing))
            .await
            .expect("hosted");
        assert_eq!(found.data_type(), "peerA/Town");

        let wrong_kind = peers
            .resolve_class(&Reference::network("peerA", id, RefType::Action))
            .await;
        assert!(matches!(wrong_kind, Err(PeerError::ReferenceNotFound { .. })));

        let unknown = peers
            .resolve_class(&Reference::network("peerB", id, RefType::Thing))
            .await;
        assert_eq!(unknown, Err(PeerError::UnknownPeer("peerB".into())));

        let local = peers
            .resolve_class(&Reference::local(id, RefType::Thing))
            .await;
        assert_eq!(local, Err(PeerError::NotNetworkReference));
        assert_eq!(peers.calls(), 4);
    }

    #[tokio::test]
    async fn no_peers_rejects_everything() {
        let reference = Reference::network("peerA", Uuid::new_v4(), RefType::Thing);
        let principal = Principal::new(Uuid::new_v4());
        assert_eq!(
            NoPeers.validate_reference(&reference, &principal).await,
            Err(PeerError::UnknownPeer("peerA".into()))
        );
    }
}
