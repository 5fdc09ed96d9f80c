//! Task records and the deque they queue in
//!
//! A [`TaskDeque`] is a doubly-linked list whose nodes live in a slot pool:
//! links are indices into `slots` rather than pointers, so a task is owned by
//! exactly one deque at a time and moves between the pending and running
//! queues by value. Push, pop and removal are O(1);
//! [`TaskDeque::push_by_expiration`] walks backwards from the tail, which is
//! O(1) in the common case where fresh deliveries and keepalives carry the
//! latest expiration.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Task identifier: a lowercase hexadecimal string, unique within a context.
pub type TaskId = String;

/// A queued unit of work. The payload is an opaque UTF-8 string.
#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    pub id: TaskId,
    pub contents: String,

    /// Set while the task sits in the running queue; pending tasks have none.
    pub(crate) expiration: Option<DateTime<Utc>>,

    /// Number of delivery episodes so far. Bumped by the pop paths only;
    /// keepalive and queue-expired moves leave it alone.
    pub(crate) num_attempts: u32,
}

impl Task {
    pub(crate) fn new(id: TaskId, contents: String) -> Self {
        Self {
            id,
            contents,
            expiration: None,
            num_attempts: 0,
        }
    }

    /// A copy of the externally visible fields, detached from any queue.
    pub fn view(&self) -> TaskView {
        TaskView {
            id: self.id.clone(),
            contents: self.contents.clone(),
            num_attempts: self.num_attempts,
        }
    }
}

/// Detached copy of a task's visible metadata. Returned by pops and peeks;
/// never carries queue linkage.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskView {
    pub id: TaskId,
    pub contents: String,
    pub num_attempts: u32,
}

/// Serializable form of a task, used by the snapshot codec.
///
/// `Expiration` is meaningful only for running tasks. `Attempts` defaults to
/// zero so snapshots written without the field still load.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EncodedTask {
    #[serde(rename = "ID")]
    pub id: TaskId,
    pub contents: String,
    pub expiration: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "attempts_is_zero")]
    pub attempts: u32,
}

fn attempts_is_zero(n: &u32) -> bool {
    *n == 0
}

#[derive(Debug)]
struct Node {
    task: Task,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Doubly-linked task list over a slot pool.
///
/// Slot indices stay valid for as long as the task remains in the deque; the
/// running queue's id index stores them. Removing a slot that is not occupied
/// is a structural invariant violation and panics.
#[derive(Debug, Default)]
pub struct TaskDeque {
    slots: Vec<Option<Node>>,
    free: Vec<usize>,
    first: Option<usize>,
    last: Option<usize>,
    count: usize,
    bytes: u64,
}

impl TaskDeque {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds a deque from its encoded task sequence, preserving order.
    pub fn decode(tasks: Vec<EncodedTask>) -> Self {
        let mut deque = Self::new();
        for et in tasks {
            let mut task = Task::new(et.id, et.contents);
            task.expiration = et.expiration;
            task.num_attempts = et.attempts;
            deque.push_last(task);
        }
        deque
    }

    /// Encodes the task sequence head-to-tail.
    pub fn encode(&self) -> Vec<EncodedTask> {
        self.iter()
            .map(|task| EncodedTask {
                id: task.id.clone(),
                contents: task.contents.clone(),
                expiration: task.expiration,
                attempts: task.num_attempts,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Sum of `contents` lengths over all members.
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    fn alloc(&mut self, task: Task) -> usize {
        self.count += 1;
        self.bytes += task.contents.len() as u64;
        let node = Node {
            task,
            prev: None,
            next: None,
        };
        match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = Some(node);
                slot
            }
            None => {
                self.slots.push(Some(node));
                self.slots.len() - 1
            }
        }
    }

    fn node(&self, slot: usize) -> &Node {
        self.slots
            .get(slot)
            .and_then(Option::as_ref)
            .expect("task not in deque")
    }

    fn node_mut(&mut self, slot: usize) -> &mut Node {
        self.slots
            .get_mut(slot)
            .and_then(Option::as_mut)
            .expect("task not in deque")
    }

    pub fn push_first(&mut self, task: Task) -> usize {
        let slot = self.alloc(task);
        match self.first {
            Some(old) => {
                self.node_mut(old).prev = Some(slot);
                self.node_mut(slot).next = Some(old);
                self.first = Some(slot);
            }
            None => {
                self.first = Some(slot);
                self.last = Some(slot);
            }
        }
        slot
    }

    pub fn push_last(&mut self, task: Task) -> usize {
        let slot = self.alloc(task);
        match self.last {
            Some(old) => {
                self.node_mut(old).next = Some(slot);
                self.node_mut(slot).prev = Some(old);
                self.last = Some(slot);
            }
            None => {
                self.first = Some(slot);
                self.last = Some(slot);
            }
        }
        slot
    }

    /// Splices the task in so expirations are non-decreasing head to tail.
    ///
    /// Scans from the tail backwards; a task whose expiration is the newest
    /// (the usual case for fresh deliveries and keepalives) lands in O(1).
    pub fn push_by_expiration(&mut self, task: Task) -> usize {
        let mut prev = self.last;
        while let Some(p) = prev {
            if self.node(p).task.expiration > task.expiration {
                prev = self.node(p).prev;
            } else {
                break;
            }
        }
        match prev {
            None => self.push_first(task),
            Some(p) if self.node(p).next.is_none() => self.push_last(task),
            Some(p) => {
                let slot = self.alloc(task);
                let next = self.node(p).next;
                self.node_mut(p).next = Some(slot);
                if let Some(n) = next {
                    self.node_mut(n).prev = Some(slot);
                }
                let node = self.node_mut(slot);
                node.prev = Some(p);
                node.next = next;
                slot
            }
        }
    }

    pub fn pop_first(&mut self) -> Option<Task> {
        self.first.map(|slot| self.remove(slot))
    }

    pub fn pop_last(&mut self) -> Option<Task> {
        self.last.map(|slot| self.remove(slot))
    }

    pub fn peek_first(&self) -> Option<&Task> {
        self.first.map(|slot| &self.node(slot).task)
    }

    pub(crate) fn first_slot(&self) -> Option<usize> {
        self.first
    }

    pub(crate) fn task(&self, slot: usize) -> &Task {
        &self.node(slot).task
    }

    pub(crate) fn task_mut(&mut self, slot: usize) -> &mut Task {
        &mut self.node_mut(slot).task
    }

    /// Unlinks and returns the task in `slot`. Panics if the slot is vacant:
    /// removing a non-member is a programmer bug.
    pub fn remove(&mut self, slot: usize) -> Task {
        let node = self
            .slots
            .get_mut(slot)
            .and_then(Option::take)
            .expect("task not in deque");
        match node.prev {
            Some(p) => self.node_mut(p).next = node.next,
            None => self.first = node.next,
        }
        match node.next {
            Some(n) => self.node_mut(n).prev = node.prev,
            None => self.last = node.prev,
        }
        self.free.push(slot);
        self.count -= 1;
        self.bytes -= node.task.contents.len() as u64;
        node.task
    }

    /// Iterates head to tail.
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            deque: self,
            cursor: self.first,
        }
    }

    pub fn clear(&mut self) {
        *self = Self::new();
    }
}

pub struct Iter<'a> {
    deque: &'a TaskDeque,
    cursor: Option<usize>,
}

impl<'a> Iterator for Iter<'a> {
    type Item = &'a Task;

    fn next(&mut self) -> Option<Self::Item> {
        let slot = self.cursor?;
        let node = self.deque.node(slot);
        self.cursor = node.next;
        Some(&node.task)
    }
}
