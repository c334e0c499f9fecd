//! Bounded concurrency queue for ingestion work.
//!
//! Tasks start in FIFO order with at most `workers` running at once. A task
//! that fails (or panics) is logged and frees its slot; nothing is retried.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;
use tracing::warn;
use wagate_core::error::GatewayError;

type Task = Pin<Box<dyn Future<Output = Result<(), GatewayError>> + Send>>;

/// Snapshot for observability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: usize,
    pub active: usize,
}

#[derive(Clone)]
pub struct IngestQueue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    workers: usize,
    state: Mutex<QueueState>,
    idle: Notify,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<(String, Task)>,
    active: usize,
}

/// Releases a worker slot when the task finishes, even by panic.
struct Slot(IngestQueue);

impl Drop for Slot {
    fn drop(&mut self) {
        {
            let mut state = self.0.state();
            state.active = state.active.saturating_sub(1);
        }
        self.0.pump();
    }
}

impl IngestQueue {
    pub fn new(workers: usize) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                workers: workers.max(1),
                state: Mutex::new(QueueState::default()),
                idle: Notify::new(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append a task and start it right away if a slot is free.
    pub fn enqueue<F>(&self, label: impl Into<String>, task: F)
    where
        F: Future<Output = Result<(), GatewayError>> + Send + 'static,
    {
        self.state()
            .pending
            .push_back((label.into(), Box::pin(task)));
        self.pump();
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.state();
        QueueStats {
            pending: state.pending.len(),
            active: state.active,
        }
    }

    /// Wait until nothing is pending or running.
    pub async fn drained(&self) {
        loop {
            let notified = self.inner.idle.notified();
            let stats = self.stats();
            if stats.pending == 0 && stats.active == 0 {
                return;
            }
            notified.await;
        }
    }

    fn pump(&self) {
        loop {
            let next = {
                let mut state = self.state();
                if state.active >= self.inner.workers {
                    None
                } else if let Some(task) = state.pending.pop_front() {
                    state.active += 1;
                    Some(task)
                } else {
                    if state.active == 0 {
                        self.inner.idle.notify_waiters();
                    }
                    None
                }
            };
            let Some((label, task)) = next else {
                return;
            };
            let slot = Slot(self.clone());
            tokio::spawn(async move {
                let _slot = slot;
                if let Err(e) = task.await {
                    warn!("queued task '{label}' failed: {e}");
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_never_exceeds_worker_budget() {
        let queue = IngestQueue::new(3);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        for i in 0..10 {
            let running = running.clone();
            let peak = peak.clone();
            queue.enqueue(format!("task-{i}"), async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            });
        }

        assert_eq!(queue.stats(), QueueStats { pending: 7, active: 3 });
        queue.drained().await;
        assert_eq!(peak.load(Ordering::SeqCst), 3);
        assert_eq!(queue.stats(), QueueStats { pending: 0, active: 0 });
    }

    #[tokio::test]
    async fn test_failing_task_does_not_block_later_ones() {
        let queue = IngestQueue::new(1);
        let done = Arc::new(AtomicUsize::new(0));

        queue.enqueue("bad", async { Err(GatewayError::Store("boom".into())) });
        let d = done.clone();
        queue.enqueue("good", async move {
            d.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        queue.drained().await;
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fifo_start_order_with_one_worker() {
        let queue = IngestQueue::new(1);
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..5 {
            let order = order.clone();
            queue.enqueue(format!("t{i}"), async move {
                order.lock().unwrap().push(i);
                Ok(())
            });
        }
        queue.drained().await;
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_panicking_task_frees_its_slot() {
        let queue = IngestQueue::new(1);
        queue.enqueue("panics", async {
            if true {
                panic!("task blew up");
            }
            Ok(())
        });
        let done = Arc::new(AtomicUsize::new(0));
        let d = done.clone();
        queue.enqueue("after", async move {
            d.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        queue.drained().await;
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }
}
