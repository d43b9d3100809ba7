pub mod deferred;

use crate::error::KindbError;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tracing::{error, trace};

pub use deferred::{DeferredCompletion, DeferredUnlock, StepGuard};

/// The two independently protected resources.
///
/// When a call path needs both, it acquires `ObjectStore` before `Schema`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockDomain {
    ObjectStore,
    Schema,
}

impl std::fmt::Display for LockDomain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockDomain::ObjectStore => write!(f, "object-store"),
            LockDomain::Schema => write!(f, "schema"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

enum HeldGuard {
    Shared(OwnedRwLockReadGuard<()>),
    Exclusive(OwnedRwLockWriteGuard<()>),
}

#[derive(Debug, Default)]
struct LockTelemetry {
    shared_acquired: AtomicU64,
    exclusive_acquired: AtomicU64,
    released: AtomicU64,
    timeouts: AtomicU64,
    double_releases: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LockMetrics {
    pub shared_acquired: u64,
    pub exclusive_acquired: u64,
    pub released: u64,
    pub timeouts: u64,
    pub double_releases: u64,
}

impl LockMetrics {
    pub fn held(&self) -> u64 {
        (self.shared_acquired + self.exclusive_acquired).saturating_sub(self.released)
    }
}

/// Readers-writer gates over the object store and the schema.
pub struct LockManager {
    object_store: Arc<RwLock<()>>,
    schema: Arc<RwLock<()>>,
    timeout: Option<Duration>,
    telemetry: Arc<LockTelemetry>,
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new(None)
    }
}

impl LockManager {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self {
            object_store: Arc::new(RwLock::new(())),
            schema: Arc::new(RwLock::new(())),
            timeout,
            telemetry: Arc::new(LockTelemetry::default()),
        }
    }

    fn gate(&self, domain: LockDomain) -> Arc<RwLock<()>> {
        match domain {
            LockDomain::ObjectStore => Arc::clone(&self.object_store),
            LockDomain::Schema => Arc::clone(&self.schema),
        }
    }

    /// Waits for the lock. Without a configured timeout this never fails.
    pub async fn acquire(
        &self,
        domain: LockDomain,
        mode: LockMode,
    ) -> Result<LockHandle, KindbError> {
        let gate = self.gate(domain);
        let acquire = async move {
            match mode {
                LockMode::Shared => HeldGuard::Shared(gate.read_owned().await),
                LockMode::Exclusive => HeldGuard::Exclusive(gate.write_owned().await),
            }
        };
        let guard = match self.timeout {
            None => acquire.await,
            Some(limit) => match tokio::time::timeout(limit, acquire).await {
                Ok(guard) => guard,
                Err(_) => {
                    self.telemetry.timeouts.fetch_add(1, Ordering::Relaxed);
                    return Err(KindbError::LockTimeout { domain });
                }
            },
        };
        Ok(self.wrap(domain, mode, guard))
    }

    /// Non-blocking variant; `None` when the lock is contended.
    pub fn try_acquire(&self, domain: LockDomain, mode: LockMode) -> Option<LockHandle> {
        let gate = self.gate(domain);
        let guard = match mode {
            LockMode::Shared => HeldGuard::Shared(gate.try_read_owned().ok()?),
            LockMode::Exclusive => HeldGuard::Exclusive(gate.try_write_owned().ok()?),
        };
        Some(self.wrap(domain, mode, guard))
    }

    pub async fn object_store_read(&self) -> Result<LockHandle, KindbError> {
        self.acquire(LockDomain::ObjectStore, LockMode::Shared).await
    }

    pub async fn object_store_write(&self) -> Result<LockHandle, KindbError> {
        self.acquire(LockDomain::ObjectStore, LockMode::Exclusive).await
    }

    pub async fn schema_read(&self) -> Result<LockHandle, KindbError> {
        self.acquire(LockDomain::Schema, LockMode::Shared).await
    }

    pub async fn schema_write(&self) -> Result<LockHandle, KindbError> {
        self.acquire(LockDomain::Schema, LockMode::Exclusive).await
    }

    pub fn metrics(&self) -> LockMetrics {
        LockMetrics {
            shared_acquired: self.telemetry.shared_acquired.load(Ordering::Relaxed),
            exclusive_acquired: self.telemetry.exclusive_acquired.load(Ordering::Relaxed),
            released: self.telemetry.released.load(Ordering::Relaxed),
            timeouts: self.telemetry.timeouts.load(Ordering::Relaxed),
            double_releases: self.telemetry.double_releases.load(Ordering::Relaxed),
        }
    }

    fn wrap(&self, domain: LockDomain, mode: LockMode, guard: HeldGuard) -> LockHandle {
        let counter = match mode {
            LockMode::Shared => &self.telemetry.shared_acquired,
            LockMode::Exclusive => &self.telemetry.exclusive_acquired,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        trace!(%domain, ?mode, "lock acquired");
        LockHandle {
            domain,
            mode,
            guard: Mutex::new(Some(guard)),
            telemetry: Arc::clone(&self.telemetry),
        }
    }
}

/// A held lock. Released exactly once: explicitly through [`LockHandle::unlock`]
/// or implicitly on drop, which also covers unwinding.
pub struct LockHandle {
    domain: LockDomain,
    mode: LockMode,
    guard: Mutex<Option<HeldGuard>>,
    telemetry: Arc<LockTelemetry>,
}

impl std::fmt::Debug for LockHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockHandle")
            .field("domain", &self.domain)
            .field("mode", &self.mode)
            .field("held", &self.is_held())
            .finish()
    }
}

impl LockHandle {
    pub fn domain(&self) -> LockDomain {
        self.domain
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }

    pub fn is_held(&self) -> bool {
        self.guard.lock().is_some()
    }

    pub fn unlock(&self) -> Result<(), KindbError> {
        let taken = self.guard.lock().take();
        match taken {
            Some(guard) => {
                drop(guard);
                self.telemetry.released.fetch_add(1, Ordering::Relaxed);
                trace!(domain = %self.domain, mode = ?self.mode, "lock released");
                Ok(())
            }
            None => {
                self.telemetry.double_releases.fetch_add(1, Ordering::Relaxed);
                error!(domain = %self.domain, "release of an already released lock handle");
                Err(KindbError::LockAlreadyReleased {
                    domain: self.domain,
                })
            }
        }
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        if self.guard.get_mut().take().is_some() {
            self.telemetry.released.fetch_add(1, Ordering::Relaxed);
        }
    }
}
