//! The reconcile queue.
//!
//! Watch handlers enqueue tasks from many tasks; a single worker drains them. A task that is
//! already waiting is not queued again. A task enqueued while it is being processed is queued
//! once more when processing completes, since the pass may have read state older than the
//! event that triggered it.

use crate::metrics::QueueMetrics;
use ahash::AHashSet as HashSet;
use ingress_controller_core::Task;
use parking_lot::Mutex;
use std::{collections::VecDeque, sync::Arc};
use tokio::sync::Notify;

#[derive(Clone, Debug)]
pub struct Queue {
    inner: Arc<Inner>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum QueueState {
    Idle,
    ItemQueued,
    Processing,
}

#[derive(Debug)]
struct Inner {
    state: Mutex<State>,
    notify: Notify,
    metrics: QueueMetrics,
}

#[derive(Debug, Default)]
struct State {
    pending: VecDeque<Task>,
    queued: HashSet<Task>,
    in_flight: Option<Task>,
    /// Set when the in-flight task was enqueued again.
    dirty: bool,
    closed: bool,
}

// === impl Queue ===

impl Default for Queue {
    fn default() -> Self {
        Self::new(QueueMetrics::default())
    }
}

impl Queue {
    pub fn new(metrics: QueueMetrics) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                notify: Notify::new(),
                metrics,
            }),
        }
    }

    /// Adds a task unless it is already waiting. Tasks added after shutdown are dropped.
    pub fn enqueue(&self, task: Task) {
        let mut state = self.inner.state.lock();
        if state.closed {
            tracing::debug!(?task, "Queue is shut down; dropping task");
            return;
        }

        self.inner.metrics.adds.inc();
        if state.queued.contains(&task) {
            self.inner.metrics.coalesced.inc();
            return;
        }
        if state.in_flight.as_ref() == Some(&task) {
            if state.dirty {
                self.inner.metrics.coalesced.inc();
            }
            state.dirty = true;
            return;
        }

        state.queued.insert(task.clone());
        state.pending.push_back(task);
        drop(state);
        self.inner.notify.notify_one();
    }

    /// Waits for the next task. Returns `None` once the queue is shut down, even if tasks are
    /// still waiting.
    ///
    /// The returned task must be passed to [`Queue::done`] before another task is taken.
    pub async fn next(&self) -> Option<Task> {
        loop {
            let notified = self.inner.notify.notified();
            {
                let mut state = self.inner.state.lock();
                if state.closed {
                    return None;
                }
                if state.in_flight.is_none() {
                    if let Some(task) = state.pending.pop_front() {
                        state.queued.remove(&task);
                        state.in_flight = Some(task.clone());
                        self.inner.metrics.passes.inc();
                        return Some(task);
                    }
                }
            }
            notified.await;
        }
    }

    /// Completes the in-flight task, queueing it again if it was enqueued while processing.
    pub fn done(&self, task: &Task) {
        let mut state = self.inner.state.lock();
        if state.in_flight.as_ref() != Some(task) {
            tracing::warn!(?task, "Completed a task that was not in flight");
            return;
        }
        state.in_flight = None;

        if std::mem::take(&mut state.dirty) && !state.closed && !state.queued.contains(task) {
            state.queued.insert(task.clone());
            state.pending.push_back(task.clone());
        }
        let wake = !state.pending.is_empty();
        drop(state);
        if wake {
            self.inner.notify.notify_one();
        }
    }

    /// Stops handing out tasks. A task that is already being processed is unaffected.
    pub fn shutdown(&self) {
        self.inner.state.lock().closed = true;
        self.inner.notify.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn state(&self) -> QueueState {
        let state = self.inner.state.lock();
        if state.in_flight.is_some() {
            QueueState::Processing
        } else if state.pending.is_empty() {
            QueueState::Idle
        } else {
            QueueState::ItemQueued
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ingress_controller_core::{Kind, KindedKey, ResourceId};
    use std::time::Duration;
    use tokio::time;
    use tokio_test::{assert_pending, assert_ready_eq, task};

    fn vs(name: &str) -> Task {
        Task::Resource(KindedKey::new(
            Kind::VirtualServer,
            ResourceId::new("default", name),
        ))
    }

    #[tokio::test]
    async fn coalesces_queued_tasks() {
        let metrics = QueueMetrics::default();
        let queue = Queue::new(metrics.clone());
        for _ in 0..5 {
            queue.enqueue(vs("cafe"));
        }
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.state(), QueueState::ItemQueued);

        let task = queue.next().await.expect("task must be queued");
        assert_eq!(task, vs("cafe"));
        assert_eq!(queue.state(), QueueState::Processing);
        queue.done(&task);
        assert_eq!(queue.state(), QueueState::Idle);

        assert_eq!(metrics.adds.get(), 5);
        assert_eq!(metrics.coalesced.get(), 4);
        assert_eq!(metrics.passes.get(), 1);
    }

    #[tokio::test]
    async fn preserves_order() {
        let queue = Queue::default();
        queue.enqueue(vs("a"));
        queue.enqueue(Task::Resync);
        queue.enqueue(vs("b"));
        queue.enqueue(vs("a"));

        let mut seen = Vec::new();
        while !queue.is_empty() {
            let task = queue.next().await.expect("task must be queued");
            queue.done(&task);
            seen.push(task);
        }
        assert_eq!(seen, vec![vs("a"), Task::Resync, vs("b")]);
    }

    #[tokio::test]
    async fn requeues_tasks_enqueued_while_processing() {
        let queue = Queue::default();
        queue.enqueue(vs("cafe"));
        let task = queue.next().await.expect("task must be queued");

        queue.enqueue(vs("cafe"));
        queue.enqueue(vs("cafe"));
        assert!(queue.is_empty(), "in-flight tasks are not queued twice");

        queue.done(&task);
        assert_eq!(queue.len(), 1);
        let again = queue.next().await.expect("task must be requeued");
        assert_eq!(again, vs("cafe"));
        queue.done(&again);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn one_task_in_flight() {
        let queue = Queue::default();
        queue.enqueue(vs("a"));
        queue.enqueue(vs("b"));
        let a = queue.next().await.expect("task must be queued");

        let mut next = task::spawn(queue.next());
        assert_pending!(next.poll());

        queue.done(&a);
        assert!(next.is_woken());
        assert_ready_eq!(next.poll(), Some(vs("b")));
    }

    #[tokio::test]
    async fn wakes_waiting_worker() {
        let queue = Queue::default();
        let worker = tokio::spawn({
            let queue = queue.clone();
            async move { queue.next().await }
        });
        tokio::task::yield_now().await;
        queue.enqueue(Task::Resync);

        let task = time::timeout(Duration::from_secs(1), worker)
            .await
            .expect("worker must be woken")
            .expect("worker must not panic");
        assert_eq!(task, Some(Task::Resync));
    }

    #[tokio::test]
    async fn shutdown_is_observed_between_tasks() {
        let queue = Queue::default();
        queue.enqueue(vs("a"));
        queue.enqueue(vs("b"));
        let a = queue.next().await.expect("task must be queued");

        queue.shutdown();
        queue.enqueue(vs("c"));
        assert_eq!(queue.len(), 1, "tasks are dropped after shutdown");

        // The in-flight task completes normally, but no further tasks are handed out.
        queue.done(&a);
        assert_eq!(queue.next().await, None);
    }

    #[tokio::test]
    async fn shutdown_wakes_idle_worker() {
        let queue = Queue::default();
        let mut next = task::spawn(queue.next());
        assert_pending!(next.poll());
        queue.shutdown();
        assert!(next.is_woken());
        assert_ready_eq!(next.poll(), None);
    }
}
