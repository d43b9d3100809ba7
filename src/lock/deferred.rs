//! Deferred unlock: keeps a lock held across the detached steps of one
//! mutation and releases it when the last of them finishes.
//!
//! The count starts at one for the orchestrating call path. Every step adds
//! one before it starts and removes one when it finishes, whatever the
//! outcome. The lock is released when the count reaches zero and the count
//! can never be revived after that.

use super::LockHandle;
use crate::error::KindbError;
use crate::tasks::{BackgroundTasks, TaskHandle};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::watch;
use tracing::error;

struct Shared {
    handle: LockHandle,
    pending: AtomicUsize,
    released_tx: watch::Sender<bool>,
}

impl Shared {
    fn finish_one(&self) {
        let previous = self.pending.fetch_sub(1, Ordering::AcqRel);
        if previous == 1 {
            if let Err(err) = self.handle.unlock() {
                error!(error = %err, "deferred unlock found its lock already released");
            }
            self.released_tx.send_replace(true);
        }
    }
}

/// Owned by the orchestrating call path. Dropping it counts as the
/// orchestrator's own `unlock`.
pub struct DeferredUnlock {
    shared: Arc<Shared>,
    caller_done: AtomicBool,
}

impl DeferredUnlock {
    pub fn new(handle: LockHandle) -> Self {
        let (released_tx, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                handle,
                pending: AtomicUsize::new(1),
                released_tx,
            }),
            caller_done: AtomicBool::new(false),
        }
    }

    /// Registers one more pending step. Fails once the lock has been released.
    pub fn inc_steps(&self) -> Result<StepGuard, KindbError> {
        let mut current = self.shared.pending.load(Ordering::Acquire);
        loop {
            if current == 0 {
                return Err(KindbError::CoordinatorReleased);
            }
            match self.shared.pending.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Ok(StepGuard {
                        shared: Some(Arc::clone(&self.shared)),
                    });
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Registers a step and runs it on the worker pool. The step is marked
    /// done when the future finishes, fails or unwinds.
    pub fn spawn_step<F>(
        &self,
        tasks: &BackgroundTasks,
        label: &'static str,
        step: F,
    ) -> Result<TaskHandle, KindbError>
    where
        F: Future<Output = Result<(), KindbError>> + Send + 'static,
    {
        let guard = self.inc_steps()?;
        Ok(tasks.spawn(label, async move {
            let result = step.await;
            guard.done();
            result
        }))
    }

    /// Releases the orchestrator's share. Idempotent.
    pub fn unlock(&self) {
        if !self.caller_done.swap(true, Ordering::AcqRel) {
            self.shared.finish_one();
        }
    }

    pub fn pending_steps(&self) -> usize {
        self.shared.pending.load(Ordering::Acquire)
    }

    pub fn is_released(&self) -> bool {
        *self.shared.released_tx.borrow()
    }

    pub fn completion(&self) -> DeferredCompletion {
        DeferredCompletion {
            rx: self.shared.released_tx.subscribe(),
        }
    }
}

impl Drop for DeferredUnlock {
    fn drop(&mut self) {
        self.unlock();
    }
}

/// One registered step. Finishing (or dropping) it decrements the count.
pub struct StepGuard {
    shared: Option<Arc<Shared>>,
}

impl StepGuard {
    pub fn done(mut self) {
        if let Some(shared) = self.shared.take() {
            shared.finish_one();
        }
    }
}

impl Drop for StepGuard {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            shared.finish_one();
        }
    }
}

/// Observes the release of a deferred lock.
#[derive(Clone)]
pub struct DeferredCompletion {
    rx: watch::Receiver<bool>,
}

impl DeferredCompletion {
    pub fn is_complete(&self) -> bool {
        *self.rx.borrow()
    }

    pub async fn wait(mut self) {
        let _ = self.rx.wait_for(|released| *released).await;
    }
}

impl std::fmt::Debug for DeferredCompletion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeferredCompletion")
            .field("complete", &self.is_complete())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::{LockDomain, LockManager, LockMode};
    use std::time::Duration;
    use tokio::task::JoinSet;

    #[tokio::test]
    async fn releases_after_caller_and_all_steps() {
        let locks = LockManager::default();
        let deferred = DeferredUnlock::new(locks.object_store_write().await.expect("lock"));
        let a = deferred.inc_steps().expect("a");
        let b = deferred.inc_steps().expect("b");
        assert_eq!(deferred.pending_steps(), 3);

        deferred.unlock();
        deferred.unlock();
        assert_eq!(deferred.pending_steps(), 2);
        assert!(!deferred.is_released());

        b.done();
        assert!(!deferred.is_released());
        drop(a);
        assert!(deferred.is_released());
        assert!(matches!(
            deferred.inc_steps(),
            Err(KindbError::CoordinatorReleased)
        ));
        assert!(
            locks
                .try_acquire(LockDomain::ObjectStore, LockMode::Exclusive)
                .is_some()
        );
        let metrics = locks.metrics();
        assert_eq!(metrics.released, 1);
        assert_eq!(metrics.double_releases, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_steps_release_exactly_once() {
        let locks = LockManager::default();
        let deferred = DeferredUnlock::new(locks.object_store_write().await.expect("lock"));
        let completion = deferred.completion();
        let mut steps = JoinSet::new();
        for i in 0..64u64 {
            let guard = deferred.inc_steps().expect("register");
            steps.spawn(async move {
                tokio::time::sleep(Duration::from_millis(i % 7)).await;
                guard.done();
            });
        }
        drop(deferred);
        completion.clone().wait().await;
        while steps.join_next().await.is_some() {}
        assert!(completion.is_complete());
        let metrics = locks.metrics();
        assert_eq!(metrics.exclusive_acquired, 1);
        assert_eq!(metrics.released, 1);
        assert_eq!(metrics.double_releases, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failing_and_panicking_steps_still_count_down() {
        let locks = LockManager::default();
        let tasks = BackgroundTasks::new(8);
        let deferred = DeferredUnlock::new(locks.object_store_write().await.expect("lock"));
        let completion = deferred.completion();
        let failed = deferred
            .spawn_step(&tasks, "failing_step", async {
                Err(KindbError::Unavailable {
                    message: "disk gone".into(),
                })
            })
            .expect("spawn");
        let panicked = deferred
            .spawn_step(&tasks, "panicking_step", async {
                panic!("step exploded");
            })
            .expect("spawn");
        deferred.unlock();

        tokio::time::timeout(Duration::from_secs(2), completion.wait())
            .await
            .expect("lock released");
        assert!(matches!(
            failed.join().await,
            crate::tasks::TaskOutcome::Failed(_)
        ));
        assert_eq!(panicked.join().await, crate::tasks::TaskOutcome::Panicked);
        assert_eq!(locks.metrics().released, 1);
    }
}
