//! Worker pool for detached side effects.
//!
//! Callers never wait on these tasks, but every task hands back a
//! [`TaskHandle`] so tests (and shutdown) can observe how it ended.

use crate::error::KindbError;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Semaphore, oneshot};
use tokio::task::JoinHandle;
use tracing::{error, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed,
    Failed(String),
    Panicked,
    /// Aborted before finishing, e.g. because the pool was dropped.
    Cancelled,
}

pub struct TaskHandle {
    label: &'static str,
    rx: oneshot::Receiver<TaskOutcome>,
}

impl TaskHandle {
    pub fn label(&self) -> &'static str {
        self.label
    }

    pub async fn join(self) -> TaskOutcome {
        self.rx.await.unwrap_or(TaskOutcome::Cancelled)
    }
}

impl std::fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("label", &self.label)
            .finish()
    }
}

#[derive(Debug, Default)]
struct TaskTelemetry {
    spawned: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    panicked: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TaskMetrics {
    pub spawned: u64,
    pub completed: u64,
    pub failed: u64,
    pub panicked: u64,
}

// Reports the outcome from inside the task. If the future unwinds or is
// aborted the report happens on drop instead.
struct OutcomeReporter {
    label: &'static str,
    tx: Option<oneshot::Sender<TaskOutcome>>,
    telemetry: Arc<TaskTelemetry>,
}

impl OutcomeReporter {
    fn finish(mut self, result: Result<(), KindbError>) {
        let outcome = match result {
            Ok(()) => {
                self.telemetry.completed.fetch_add(1, Ordering::Relaxed);
                TaskOutcome::Completed
            }
            Err(err) => {
                self.telemetry.failed.fetch_add(1, Ordering::Relaxed);
                warn!(task = self.label, error = %err, code = err.code_str(), "background task failed");
                TaskOutcome::Failed(err.to_string())
            }
        };
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(outcome);
        }
    }
}

impl Drop for OutcomeReporter {
    fn drop(&mut self) {
        let Some(tx) = self.tx.take() else {
            return;
        };
        let outcome = if std::thread::panicking() {
            self.telemetry.panicked.fetch_add(1, Ordering::Relaxed);
            error!(task = self.label, "background task panicked");
            TaskOutcome::Panicked
        } else {
            TaskOutcome::Cancelled
        };
        let _ = tx.send(outcome);
    }
}

pub struct BackgroundTasks {
    permits: Arc<Semaphore>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    telemetry: Arc<TaskTelemetry>,
}

impl BackgroundTasks {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            handles: Mutex::new(Vec::new()),
            telemetry: Arc::new(TaskTelemetry::default()),
        }
    }

    /// Spawns `work` on the runtime. At most `max_concurrent` tasks run at a
    /// time; the rest queue for a permit.
    pub fn spawn<F>(&self, label: &'static str, work: F) -> TaskHandle
    where
        F: Future<Output = Result<(), KindbError>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let reporter = OutcomeReporter {
            label,
            tx: Some(tx),
            telemetry: Arc::clone(&self.telemetry),
        };
        let permits = Arc::clone(&self.permits);
        self.telemetry.spawned.fetch_add(1, Ordering::Relaxed);
        let join = tokio::spawn(async move {
            let _permit = permits.acquire_owned().await.ok();
            let result = work.await;
            reporter.finish(result);
        });
        let mut handles = self.handles.lock();
        handles.retain(|handle| !handle.is_finished());
        handles.push(join);
        TaskHandle { label, rx }
    }

    pub fn in_flight(&self) -> usize {
        self.handles
            .lock()
            .iter()
            .filter(|handle| !handle.is_finished())
            .count()
    }

    /// Waits until every task spawned so far, and any spawned meanwhile, ends.
    pub async fn drain(&self) {
        loop {
            let pending = std::mem::take(&mut *self.handles.lock());
            if pending.is_empty() {
                return;
            }
            for handle in pending {
                let _ = handle.await;
            }
        }
    }

    pub fn metrics(&self) -> TaskMetrics {
        TaskMetrics {
            spawned: self.telemetry.spawned.load(Ordering::Relaxed),
            completed: self.telemetry.completed.load(Ordering::Relaxed),
            failed: self.telemetry.failed.load(Ordering::Relaxed),
            panicked: self.telemetry.panicked.load(Ordering::Relaxed),
        }
    }
}

impl Drop for BackgroundTasks {
    fn drop(&mut self) {
        for handle in self.handles.get_mut().drain(..) {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[tokio::test]
    async fn reports_each_terminal_state() {
        let tasks = BackgroundTasks::new(4);
        let ok = tasks.spawn("ok", async { Ok(()) });
        let failed = tasks.spawn("failed", async {
            Err(KindbError::Validation("nope".into()))
        });
        let panicked = tasks.spawn("panicked", async { panic!("boom") });

        assert_eq!(ok.join().await, TaskOutcome::Completed);
        assert!(matches!(failed.join().await, TaskOutcome::Failed(msg) if msg.contains("nope")));
        assert_eq!(panicked.join().await, TaskOutcome::Panicked);
        tasks.drain().await;
        let metrics = tasks.metrics();
        assert_eq!(metrics.spawned, 3);
        assert_eq!(metrics.completed, 1);
        assert_eq!(metrics.failed, 1);
        assert_eq!(metrics.panicked, 1);
        assert_eq!(tasks.in_flight(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrency_is_bounded_by_permits() {
        let tasks = BackgroundTasks::new(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        for _ in 0..8 {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            tasks.spawn("bounded", async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            });
        }
        tasks.drain().await;
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(tasks.metrics().completed, 8);
    }

    #[tokio::test]
    async fn dropping_the_pool_cancels_pending_work() {
        let tasks = BackgroundTasks::new(1);
        let handle = tasks.spawn("slow", async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        });
        drop(tasks);
        assert_eq!(handle.join().await, TaskOutcome::Cancelled);
    }
}
