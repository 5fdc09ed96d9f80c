//! Per-context queue state
//!
//! A [`QueueState`] couples a pending queue, a running queue, a completion
//! counter and a rate tracker under a single read-write lock. Tasks enter via
//! [`QueueState::push`], move to running on [`QueueState::pop`] (which
//! assigns an expiration and counts the delivery attempt), and leave on
//! [`QueueState::completed`]. A task whose expiration passes becomes
//! eligible for re-delivery; `pop` prefers pending tasks and only then dips
//! into the expired ones.
//!
//! Operations take the write side of the lock; [`QueueState::counts`] and
//! [`QueueState::cleared`] take the read side. Nothing here blocks or does
//! I/O while holding the lock.

use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::pending::{EncodedPendingQueue, PendingQueue};
use crate::ratetrack::{EncodedRateTracker, RateTracker};
use crate::running::{EncodedRunningQueue, RunningQueue};
use crate::task::{TaskId, TaskView};

/// Queue state for one context.
pub struct QueueState {
    inner: RwLock<StateInner>,
}

struct StateInner {
    pending: PendingQueue,
    running: RunningQueue,
    completion_counter: u64,
    rate_tracker: RateTracker,
    modtime: DateTime<Utc>,
}

impl StateInner {
    fn touch(&mut self) {
        self.modtime = Utc::now();
    }
}

/// Snapshot of a context's task counts, serialized for `/counts`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueCounts {
    pub pending: u64,
    /// Running tasks net of the expired ones.
    pub running: u64,
    pub expired: u64,
    pub completed: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modtime: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes: Option<u64>,
}

/// Serializable form of a whole context, one snapshot archive entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EncodedQueueState {
    pub pending: EncodedPendingQueue,
    pub running: EncodedRunningQueue,
    pub completed: u64,
    pub rate_tracker: EncodedRateTracker,
}

impl QueueState {
    /// Creates empty queues with the given default task timeout.
    pub fn new(timeout: Duration) -> Self {
        Self {
            inner: RwLock::new(StateInner {
                pending: PendingQueue::new(),
                running: RunningQueue::new(timeout),
                completion_counter: 0,
                rate_tracker: RateTracker::new(0),
                modtime: Utc::now(),
            }),
        }
    }

    pub fn decode(obj: EncodedQueueState) -> Self {
        Self {
            inner: RwLock::new(StateInner {
                pending: PendingQueue::decode(obj.pending),
                running: RunningQueue::decode(obj.running),
                completion_counter: obj.completed,
                rate_tracker: RateTracker::decode(obj.rate_tracker),
                modtime: Utc::now(),
            }),
        }
    }

    pub fn encode(&self) -> EncodedQueueState {
        let inner = self.inner.read();
        EncodedQueueState {
            pending: inner.pending.encode(),
            running: inner.running.encode(),
            completed: inner.completion_counter,
            rate_tracker: inner.rate_tracker.encode(),
        }
    }

    /// Creates a task, returning its new ID, or `None` when `limit` is
    /// nonzero and the pending queue is already that long.
    pub fn push(&self, contents: &str, limit: usize) -> Option<TaskId> {
        let mut inner = self.inner.write();
        let id = inner.pending.add_task(contents, limit)?;
        inner.touch();
        Some(id)
    }

    /// Pushes each item individually, subject to `limit` at the moment of
    /// each attempt. The result aligns positionally with `contents`.
    pub fn push_batch(&self, contents: &[String], limit: usize) -> Vec<Option<TaskId>> {
        let mut inner = self.inner.write();
        let ids: Vec<_> = contents
            .iter()
            .map(|c| inner.pending.add_task(c, limit))
            .collect();
        if ids.iter().any(Option::is_some) {
            inner.touch();
        }
        ids
    }

    /// Delivers a task, preferring pending over expired running tasks.
    ///
    /// On a hit the task moves to (or re-enters) the running queue with a
    /// fresh expiration and its attempt count incremented. On a miss the
    /// second value is when the next running task expires, if any.
    pub fn pop(&self, timeout_override: Option<Duration>) -> (Option<TaskView>, Option<DateTime<Utc>>) {
        let mut inner = self.inner.write();

        if let Some(mut task) = inner.pending.pop_task() {
            task.num_attempts += 1;
            let view = task.view();
            inner.running.started_task(task, timeout_override);
            inner.touch();
            return (Some(view), None);
        }

        let (expired, next_try) = inner.running.pop_expired();
        if let Some(mut task) = expired {
            task.num_attempts += 1;
            let view = task.view();
            inner.running.started_task(task, timeout_override);
            inner.touch();
            return (Some(view), None);
        }

        (None, next_try)
    }

    /// Atomically pops at most `n` tasks.
    ///
    /// If fewer than `n` are returned, the second value is when the next
    /// running task expires, or `None` if nothing was running beforehand.
    pub fn pop_batch(
        &self,
        n: usize,
        timeout_override: Option<Duration>,
    ) -> (Vec<TaskView>, Option<DateTime<Utc>>) {
        let mut inner = self.inner.write();

        let mut tasks = Vec::new();
        while tasks.len() < n {
            match inner.pending.pop_task() {
                Some(task) => tasks.push(task),
                None => break,
            }
        }
        let mut next_try = None;
        while tasks.len() < n {
            let (expired, nt) = inner.running.pop_expired();
            next_try = nt;
            match expired {
                Some(task) => tasks.push(task),
                None => break,
            }
        }

        let mut views = Vec::with_capacity(tasks.len());
        for mut task in tasks {
            task.num_attempts += 1;
            views.push(task.view());
            inner.running.started_task(task, timeout_override);
        }
        if !views.is_empty() {
            inner.touch();
        }

        (views, next_try)
    }

    /// Next task a pop would deliver, without delivering it.
    ///
    /// Returns `(ready, next, next_expiry)`: a detached copy of the head
    /// pending or expired task, or the next running task to expire with its
    /// expiration time.
    pub fn peek(&self) -> (Option<TaskView>, Option<TaskView>, Option<DateTime<Utc>>) {
        let inner = self.inner.write();
        if let Some(view) = inner.pending.peek_task() {
            return (Some(view), None, None);
        }
        inner.running.peek_expired()
    }

    /// Marks the identified running task complete. Returns false if no such
    /// task was in the running queue.
    pub fn completed(&self, id: &str) -> bool {
        let mut inner = self.inner.write();
        if inner.running.completed(id).is_none() {
            return false;
        }
        inner.completion_counter += 1;
        inner.rate_tracker.add(1);
        inner.touch();
        true
    }

    /// Restarts the timeout period for the identified running task without
    /// counting a new delivery attempt.
    pub fn keepalive(&self, id: &str, timeout_override: Option<Duration>) -> bool {
        let mut inner = self.inner.write();
        if !inner.running.keepalive(id, timeout_override) {
            return false;
        }
        inner.touch();
        true
    }

    /// Forces a single running task's expiration into the past.
    pub fn expire(&self, id: &str) -> bool {
        let mut inner = self.inner.write();
        if !inner.running.expire(id) {
            return false;
        }
        inner.touch();
        true
    }

    /// Marks all running tasks expired so they can be popped immediately.
    /// The tasks stay in the running queue; see [`QueueState::queue_expired`]
    /// to move them back to pending.
    pub fn expire_all(&self) -> usize {
        let mut inner = self.inner.write();
        let n = inner.running.expire_all();
        inner.touch();
        n
    }

    /// Moves every expired task from the running queue back to pending,
    /// without counting delivery attempts. Returns how many moved.
    pub fn queue_expired(&self) -> usize {
        let mut inner = self.inner.write();
        let mut n = 0;
        while let (Some(task), _) = inner.running.pop_expired() {
            inner.pending.push_task(task);
            n += 1;
        }
        if n > 0 {
            inner.touch();
        }
        n
    }

    /// Empties both queues and resets the completion counter and rate
    /// tracker. The pending queue's ID counter is preserved, so IDs stay
    /// unique across clears.
    pub fn clear(&self) {
        let mut inner = self.inner.write();
        inner.pending.clear();
        inner.running.clear();
        inner.completion_counter = 0;
        inner.rate_tracker.reset();
        inner.touch();
    }

    /// Current number of tasks in each delivery state.
    ///
    /// `rate_window` of zero omits the rate; otherwise it is clamped to the
    /// tracker history and the rate is completions per second over that
    /// window.
    pub fn counts(&self, rate_window: usize, include_modtime: bool, include_bytes: bool) -> QueueCounts {
        let inner = self.inner.read();
        let running_total = inner.running.len();
        let running_expired = inner.running.num_expired();
        let rate = if rate_window > 0 {
            let window = rate_window.min(inner.rate_tracker.history_size());
            Some(inner.rate_tracker.count(window) as f64 / window as f64)
        } else {
            None
        };
        QueueCounts {
            pending: inner.pending.len() as u64,
            running: (running_total - running_expired) as u64,
            expired: running_expired as u64,
            completed: inner.completion_counter,
            rate,
            modtime: include_modtime.then_some(inner.modtime),
            bytes: include_bytes.then(|| inner.pending.bytes() + inner.running.bytes()),
        }
    }

    /// True when this state is indistinguishable from a fresh one: both
    /// queues empty and nothing completed since the last clear. Such states
    /// are eligible for garbage collection by the multiplexer.
    pub fn cleared(&self) -> bool {
        let inner = self.inner.read();
        inner.pending.is_empty() && inner.running.is_empty() && inner.completion_counter == 0
    }
}
