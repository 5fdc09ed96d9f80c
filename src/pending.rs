//! Pending queue: pushed tasks waiting for their first delivery
//!
//! IDs are minted from a monotonically increasing counter formatted as
//! lowercase hex. The counter is never rewound, not even by `clear`, so a
//! completion that arrives for a long-gone task can never hit a recycled ID.

use serde::{Deserialize, Serialize};

use crate::task::{EncodedTask, Task, TaskDeque, TaskId, TaskView};

/// FIFO queue of not-yet-delivered tasks.
#[derive(Debug, Default)]
pub struct PendingQueue {
    deque: TaskDeque,
    cur_id: u64,
}

/// Serializable form of a pending queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EncodedPendingQueue {
    pub deque: Vec<EncodedTask>,
    #[serde(rename = "CurID")]
    pub cur_id: u64,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decode(obj: EncodedPendingQueue) -> Self {
        Self {
            deque: TaskDeque::decode(obj.deque),
            cur_id: obj.cur_id,
        }
    }

    pub fn encode(&self) -> EncodedPendingQueue {
        EncodedPendingQueue {
            deque: self.deque.encode(),
            cur_id: self.cur_id,
        }
    }

    /// Creates a task with the given contents and enqueues it at the tail.
    ///
    /// When `limit` is nonzero and the queue already holds that many tasks
    /// the push is refused and no ID is minted.
    pub fn add_task(&mut self, contents: &str, limit: usize) -> Option<TaskId> {
        if limit > 0 && self.deque.len() >= limit {
            return None;
        }
        let id = format!("{:x}", self.cur_id);
        self.cur_id += 1;
        self.deque.push_last(Task::new(id.clone(), contents.to_string()));
        Some(id)
    }

    /// Re-enqueues an existing task (used when requeueing expired tasks).
    pub fn push_task(&mut self, task: Task) {
        self.deque.push_last(task);
    }

    /// Next task in FIFO order.
    pub fn pop_task(&mut self) -> Option<Task> {
        self.deque.pop_first()
    }

    /// Detached copy of the next task, with no connection to the queue.
    pub fn peek_task(&self) -> Option<TaskView> {
        self.deque.peek_first().map(Task::view)
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

    /// Drops all pending tasks. The ID counter is deliberately preserved.
    pub fn clear(&mut self) {
        self.deque.clear();
    }
}
