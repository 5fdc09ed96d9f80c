//! Running queue: tasks delivered to a worker and awaiting completion
//!
//! Ordered by ascending expiration, with an id index for O(1) completion and
//! keepalive. The head of the deque is always the next task to expire, so
//! expiry checks never scan.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::task::{EncodedTask, Task, TaskDeque, TaskId, TaskView};

/// Tasks currently delivered to workers, each carrying an expiration.
///
/// Invariant: the deque and the id index hold exactly the same set of tasks,
/// and the deque is non-decreasing in expiration from head to tail.
#[derive(Debug)]
pub struct RunningQueue {
    id_to_slot: HashMap<TaskId, usize>,
    deque: TaskDeque,
    timeout: Duration,
}

/// Serializable form of a running queue. `Timeout` is the default task
/// timeout in nanoseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EncodedRunningQueue {
    pub deque: Vec<EncodedTask>,
    pub timeout: u64,
}

fn expiration_after(timeout: Duration) -> DateTime<Utc> {
    Utc::now() + TimeDelta::from_std(timeout).unwrap_or(TimeDelta::MAX)
}

impl RunningQueue {
    pub fn new(timeout: Duration) -> Self {
        Self {
            id_to_slot: HashMap::new(),
            deque: TaskDeque::new(),
            timeout,
        }
    }

    pub fn decode(obj: EncodedRunningQueue) -> Self {
        let timeout = Duration::from_nanos(obj.timeout);
        let mut queue = Self::new(timeout);
        for et in obj.deque {
            let mut task = Task::new(et.id, et.contents);
            task.expiration = et.expiration;
            task.num_attempts = et.attempts;
            let slot = queue.deque.push_last(task);
            queue
                .id_to_slot
                .insert(queue.deque.task(slot).id.clone(), slot);
        }
        queue
    }

    pub fn encode(&self) -> EncodedRunningQueue {
        EncodedRunningQueue {
            deque: self.deque.encode(),
            timeout: self.timeout.as_nanos() as u64,
        }
    }

    /// Adds the task to the queue with a fresh expiration.
    ///
    /// Attempt counting happens in the pop paths, not here: keepalive also
    /// reinserts through this method and must not register a new delivery.
    pub fn started_task(&mut self, mut task: Task, timeout_override: Option<Duration>) {
        task.expiration = Some(expiration_after(timeout_override.unwrap_or(self.timeout)));
        let id = task.id.clone();
        let slot = self.deque.push_by_expiration(task);
        self.id_to_slot.insert(id, slot);
    }

    /// Removes and returns the first timed-out task.
    ///
    /// If nothing has timed out, the second value is when the next task will
    /// expire (none if the queue is empty).
    pub fn pop_expired(&mut self) -> (Option<Task>, Option<DateTime<Utc>>) {
        let Some(slot) = self.deque.first_slot() else {
            return (None, None);
        };
        let expiration = self.deque.task(slot).expiration;
        if expiration > Some(Utc::now()) {
            return (None, expiration);
        }
        let task = self.deque.remove(slot);
        self.id_to_slot.remove(&task.id);
        (Some(task), None)
    }

    /// Like [`RunningQueue::pop_expired`] but returns detached copies and
    /// leaves the queue untouched.
    ///
    /// Returns `(expired, next, next_expiry)`: either the first expired task,
    /// or the next task to expire along with its expiration time.
    pub fn peek_expired(&self) -> (Option<TaskView>, Option<TaskView>, Option<DateTime<Utc>>) {
        let Some(task) = self.deque.peek_first() else {
            return (None, None, None);
        };
        if task.expiration > Some(Utc::now()) {
            (None, Some(task.view()), task.expiration)
        } else {
            (Some(task.view()), None, None)
        }
    }

    /// Removes a task from the queue, returning it if it was present.
    pub fn completed(&mut self, id: &str) -> Option<Task> {
        let slot = self.id_to_slot.remove(id)?;
        Some(self.deque.remove(slot))
    }

    /// Restarts the timeout period for the identified task.
    ///
    /// Implemented as remove-then-reinsert so the head-is-earliest invariant
    /// holds without any scan. Does not count as a new delivery.
    pub fn keepalive(&mut self, id: &str, timeout_override: Option<Duration>) -> bool {
        let Some(slot) = self.id_to_slot.remove(id) else {
            return false;
        };
        let task = self.deque.remove(slot);
        self.started_task(task, timeout_override);
        true
    }

    /// Forces a single task's expiration into the past.
    pub fn expire(&mut self, id: &str) -> bool {
        let Some(slot) = self.id_to_slot.remove(id) else {
            return false;
        };
        let mut task = self.deque.remove(slot);
        task.expiration = Some(DateTime::UNIX_EPOCH);
        let id = task.id.clone();
        let slot = self.deque.push_by_expiration(task);
        self.id_to_slot.insert(id, slot);
        true
    }

    /// Marks every task expired. The ordering invariant survives because all
    /// expirations become equal. Returns the number of tasks affected.
    pub fn expire_all(&mut self) -> usize {
        let slots: Vec<usize> = self.id_to_slot.values().copied().collect();
        for slot in &slots {
            self.deque.task_mut(*slot).expiration = Some(DateTime::UNIX_EPOCH);
        }
        slots.len()
    }

    /// Counts the expired prefix of the deque. O(k) in the expired count.
    pub fn num_expired(&self) -> usize {
        let now = Some(Utc::now());
        self.deque.iter().take_while(|t| t.expiration <= now).count()
    }

    pub fn len(&self) -> usize {
        self.deque.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deque.is_empty()
    }

    pub fn bytes(&self) -> u64 {
        self.deque.bytes()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Drops all running tasks.
    pub fn clear(&mut self) {
        self.id_to_slot.clear();
        self.deque.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minute_queue() -> RunningQueue {
        RunningQueue::new(Duration::from_secs(60))
    }

    fn task(id: &str) -> Task {
        Task::new(id.to_string(), format!("contents-{id}"))
    }

    #[test]
    fn test_started_task_sets_expiration() {
        let mut q = minute_queue();
        q.started_task(task("a"), None);

        assert_eq!(q.len(), 1);
        let (expired, next, next_expiry) = q.peek_expired();
        assert!(expired.is_none());
        assert_eq!(next.unwrap().id, "a");
        assert!(next_expiry.unwrap() > Utc::now());
    }

    #[test]
    fn test_pop_expired_returns_nothing_before_timeout() {
        let mut q = minute_queue();
        q.started_task(task("a"), None);

        let (popped, next_expiry) = q.pop_expired();
        assert!(popped.is_none());
        assert!(next_expiry.is_some());
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn test_pop_expired_after_expire() {
        let mut q = minute_queue();
        q.started_task(task("a"), None);
        assert!(q.expire("a"));

        let (popped, next_expiry) = q.pop_expired();
        assert_eq!(popped.unwrap().id, "a");
        assert!(next_expiry.is_none());
        assert_eq!(q.len(), 0);

        let (popped, next_expiry) = q.pop_expired();
        assert!(popped.is_none());
        assert!(next_expiry.is_none());
    }

    #[test]
    fn test_timeout_override_expires_naturally() {
        let mut q = minute_queue();
        q.started_task(task("a"), Some(Duration::from_millis(5)));

        std::thread::sleep(Duration::from_millis(15));
        let (popped, _) = q.pop_expired();
        assert_eq!(popped.unwrap().id, "a");
    }

    #[test]
    fn test_completed_removes_from_both_structures() {
        let mut q = minute_queue();
        q.started_task(task("a"), None);
        q.started_task(task("b"), None);

        let done = q.completed("a").unwrap();
        assert_eq!(done.id, "a");
        assert_eq!(q.len(), 1);

        assert!(q.completed("a").is_none());
        assert!(q.completed("missing").is_none());
    }

    #[test]
    fn test_keepalive_reorders_to_tail() {
        let mut q = minute_queue();
        q.started_task(task("a"), Some(Duration::from_secs(10)));
        q.started_task(task("b"), Some(Duration::from_secs(20)));

        // "a" expires first; a keepalive with a longer timeout moves it last.
        assert!(q.keepalive("a", Some(Duration::from_secs(60))));
        let order: Vec<_> = q.encode().deque.into_iter().map(|t| t.id).collect();
        assert_eq!(order, vec!["b", "a"]);

        assert!(!q.keepalive("missing", None));
    }

    #[test]
    fn test_expire_moves_task_to_head() {
        let mut q = minute_queue();
        q.started_task(task("a"), Some(Duration::from_secs(10)));
        q.started_task(task("b"), Some(Duration::from_secs(20)));

        assert!(q.expire("b"));
        let (popped, _) = q.pop_expired();
        assert_eq!(popped.unwrap().id, "b");
        assert_eq!(q.num_expired(), 0);
    }

    #[test]
    fn test_expire_all_counts_and_expires() {
        let mut q = minute_queue();
        for id in ["a", "b", "c"] {
            q.started_task(task(id), None);
        }

        assert_eq!(q.expire_all(), 3);
        assert_eq!(q.num_expired(), 3);
        assert_eq!(q.len(), 3);

        let mut popped = Vec::new();
        while let (Some(t), _) = q.pop_expired() {
            popped.push(t.id);
        }
        assert_eq!(popped.len(), 3);
        assert!(q.is_empty());
    }

    #[test]
    fn test_num_expired_counts_prefix_only() {
        let mut q = minute_queue();
        q.started_task(task("a"), None);
        q.started_task(task("b"), None);
        q.expire("a");

        assert_eq!(q.num_expired(), 1);
    }

    #[test]
    fn test_clear_drops_everything() {
        let mut q = minute_queue();
        q.started_task(task("a"), None);
        q.clear();

        assert!(q.is_empty());
        assert!(q.completed("a").is_none());
        assert_eq!(q.bytes(), 0);
    }

    #[test]
    fn test_encode_decode_preserves_order_and_timeout() {
        let mut q = RunningQueue::new(Duration::from_secs(30));
        q.started_task(task("a"), Some(Duration::from_secs(5)));
        q.started_task(task("b"), Some(Duration::from_secs(10)));

        let decoded = RunningQueue::decode(q.encode());
        assert_eq!(decoded.timeout(), Duration::from_secs(30));
        assert_eq!(decoded.len(), 2);

        // The id index must be rebuilt, so completion still works.
        let mut decoded = decoded;
        assert!(decoded.completed("a").is_some());
        assert!(decoded.completed("b").is_some());
    }
}
