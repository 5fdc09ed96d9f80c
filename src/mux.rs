//! Queue-state multiplexer: one queue state per context name
//!
//! Contexts are created lazily on first use and garbage-collected once they
//! are back to a fresh state (no users, nothing queued, nothing completed).
//! Two locks coordinate everything: an outer reader/writer gate that normal
//! operations share and the snapshot writer holds exclusively, and an inner
//! mutex held only around the brief map lookups. The gate gives the snapshot
//! a consistent point-in-time image across all contexts without stopping
//! individual operations the rest of the time.

use std::collections::HashMap;
use std::io::{Read, Seek, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use crate::error::{HopperError, Result};
use crate::snapshot::{read_archive, write_archive, ContextState};
use crate::state::QueueState;

/// Manages multiple named [`QueueState`]s.
pub struct QueueStateMux {
    save_lock: RwLock<()>,
    inner: Mutex<MuxInner>,
    timeout: Duration,
    shutting_down: AtomicBool,
}

struct MuxInner {
    queues: HashMap<String, Arc<QueueState>>,
    users: HashMap<String, usize>,
}

impl QueueStateMux {
    /// Creates an empty multiplexer with the given default task timeout.
    pub fn new(timeout: Duration) -> Self {
        Self {
            save_lock: RwLock::new(()),
            inner: Mutex::new(MuxInner {
                queues: HashMap::new(),
                users: HashMap::new(),
            }),
            timeout,
            shutting_down: AtomicBool::new(false),
        }
    }

    /// True once a shutdown save has started; all further operations are
    /// refused.
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Calls `f` with the queue state for `name`, creating one if necessary.
    ///
    /// The state must not be used outside of `f`; once every caller is done
    /// with a cleared queue the multiplexer destroys it. The empty string is
    /// the default context.
    pub fn get<R>(&self, name: &str, f: impl FnOnce(&QueueState) -> R) -> Result<R> {
        let _gate = self.save_lock.read();
        // Checked under the gate: the flag is only ever set while the
        // exclusive side is held, so a reader cannot miss it.
        if self.is_shutting_down() {
            return Err(HopperError::ShutdownInProgress);
        }
        Ok(self.with_queue(name, f))
    }

    /// Visits every active context in lexicographic name order.
    ///
    /// Operations on other contexts may proceed between visits, but each
    /// queue is visited under its own checkout like [`QueueStateMux::get`].
    pub fn iterate(&self, mut f: impl FnMut(&str, &QueueState)) -> Result<()> {
        let _gate = self.save_lock.read();
        if self.is_shutting_down() {
            return Err(HopperError::ShutdownInProgress);
        }

        let mut names: Vec<String> = {
            let inner = self.inner.lock();
            inner.queues.keys().cloned().collect()
        };
        names.sort();

        for name in names {
            self.with_queue(&name, |qs| f(&name, qs));
        }
        Ok(())
    }

    /// Checks a queue out of the map, runs `f`, and garbage-collects the
    /// queue afterwards if it ended up cleared with no other users. The
    /// inner lock is never held while `f` runs.
    fn with_queue<R>(&self, name: &str, f: impl FnOnce(&QueueState) -> R) -> R {
        let qs = {
            let mut inner = self.inner.lock();
            let qs = inner
                .queues
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(QueueState::new(self.timeout)))
                .clone();
            *inner.users.entry(name.to_string()).or_insert(0) += 1;
            qs
        };
        let _checkout = Checkout { mux: self, name, qs: &qs };
        f(&qs)
    }

    /// Serializes every context to `w` as a snapshot archive.
    ///
    /// The exclusive side of the save gate is held while the states are
    /// encoded, so the image is consistent across all contexts; the archive
    /// itself is written after the gate is released. With `shutdown` set the
    /// multiplexer additionally stops accepting operations, so the saved
    /// image stays final.
    pub fn serialize<W: Write + Seek>(&self, w: W, shutdown: bool) -> Result<()> {
        let states = {
            let _gate = self.save_lock.write();
            if shutdown {
                self.shutting_down.store(true, Ordering::SeqCst);
            }
            let inner = self.inner.lock();
            let mut names: Vec<&String> = inner.queues.keys().collect();
            names.sort();
            names
                .into_iter()
                .map(|name| ContextState {
                    name: name.clone(),
                    encoded: inner.queues[name].encode(),
                })
                .collect::<Vec<_>>()
        };
        write_archive(&states, w)
    }

    /// Reads an archive written by [`QueueStateMux::serialize`] and rebuilds
    /// the multiplexer. Newly created contexts use `timeout`; restored
    /// running queues keep the timeout they were saved with.
    pub fn deserialize<R: Read + Seek>(r: R, timeout: Duration) -> Result<Self> {
        let mux = Self::new(timeout);
        {
            let mut inner = mux.inner.lock();
            for state in read_archive(r)? {
                inner
                    .queues
                    .insert(state.name.clone(), Arc::new(QueueState::decode(state.encoded)));
                inner.users.insert(state.name, 0);
            }
        }
        Ok(mux)
    }
}

/// Returns a checked-out queue on drop, even if the caller panicked.
struct Checkout<'a> {
    mux: &'a QueueStateMux,
    name: &'a str,
    qs: &'a Arc<QueueState>,
}

impl Drop for Checkout<'_> {
    fn drop(&mut self) {
        let mut inner = self.mux.inner.lock();
        let users = inner
            .users
            .get_mut(self.name)
            .expect("queue user count missing");
        *users -= 1;
        if *users == 0 && self.qs.cleared() {
            inner.users.remove(self.name);
            inner.queues.remove(self.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn mux() -> QueueStateMux {
        QueueStateMux::new(Duration::from_secs(60))
    }

    fn context_names(m: &QueueStateMux) -> Vec<String> {
        let mut names = Vec::new();
        m.iterate(|name, _| names.push(name.to_string())).unwrap();
        names
    }

    #[test]
    fn test_get_creates_lazily_and_gcs_cleared() {
        let m = mux();
        m.get("jobs", |qs| assert!(qs.cleared())).unwrap();
        // Nothing was queued, so the context is gone again.
        assert!(context_names(&m).is_empty());
    }

    #[test]
    fn test_nonempty_queue_survives() {
        let m = mux();
        m.get("jobs", |qs| {
            qs.push("a", 0);
        })
        .unwrap();
        assert_eq!(context_names(&m), vec!["jobs"]);
    }

    #[test]
    fn test_completed_counter_keeps_queue_alive() {
        let m = mux();
        m.get("jobs", |qs| {
            let id = qs.push("a", 0).unwrap();
            qs.pop(None);
            qs.completed(&id);
        })
        .unwrap();
        // Queues are empty but the completion counter is nonzero.
        assert_eq!(context_names(&m), vec!["jobs"]);

        m.get("jobs", |qs| qs.clear()).unwrap();
        assert!(context_names(&m).is_empty());
    }

    #[test]
    fn test_empty_name_is_valid_context() {
        let m = mux();
        m.get("", |qs| {
            qs.push("a", 0);
        })
        .unwrap();
        assert_eq!(context_names(&m), vec![""]);
    }

    #[test]
    fn test_contexts_are_independent() {
        let m = mux();
        m.get("a", |qs| {
            qs.push("task-a", 0);
        })
        .unwrap();
        m.get("b", |qs| {
            qs.push("task-b", 0);
        })
        .unwrap();

        let popped = m.get("b", |qs| qs.pop(None).0.unwrap()).unwrap();
        assert_eq!(popped.contents, "task-b");

        let a_counts = m.get("a", |qs| qs.counts(0, false, false)).unwrap();
        assert_eq!(a_counts.pending, 1);
    }

    #[test]
    fn test_iterate_sorted() {
        let m = mux();
        for name in ["zeta", "alpha", "mid"] {
            m.get(name, |qs| {
                qs.push("x", 0);
            })
            .unwrap();
        }
        assert_eq!(context_names(&m), vec!["alpha", "mid", "zeta"]);
    }

    #[test]
    fn test_serialize_round_trip() {
        let m = mux();
        m.get("jobs", |qs| {
            qs.push("a", 0);
            qs.push("b", 0);
        })
        .unwrap();
        m.get("other", |qs| {
            qs.push("c", 0);
        })
        .unwrap();

        let mut buf = Cursor::new(Vec::new());
        m.serialize(&mut buf, false).unwrap();
        buf.set_position(0);

        let restored = QueueStateMux::deserialize(buf, Duration::from_secs(60)).unwrap();
        assert_eq!(context_names(&restored), vec!["jobs", "other"]);

        let popped = restored.get("jobs", |qs| qs.pop(None).0.unwrap()).unwrap();
        assert_eq!(popped.contents, "a");
    }

    #[test]
    fn test_serialize_without_shutdown_keeps_serving() {
        let m = mux();
        m.get("jobs", |qs| {
            qs.push("a", 0);
        })
        .unwrap();

        m.serialize(Cursor::new(Vec::new()), false).unwrap();
        assert!(!m.is_shutting_down());
        assert!(m.get("jobs", |_| ()).is_ok());
    }

    #[test]
    fn test_shutdown_refuses_operations() {
        let m = mux();
        m.get("jobs", |qs| {
            qs.push("a", 0);
        })
        .unwrap();

        m.serialize(Cursor::new(Vec::new()), true).unwrap();
        assert!(m.is_shutting_down());
        assert!(matches!(
            m.get("jobs", |_| ()),
            Err(HopperError::ShutdownInProgress)
        ));
        assert!(matches!(
            m.iterate(|_, _| ()),
            Err(HopperError::ShutdownInProgress)
        ));
    }

    #[test]
    fn test_concurrent_pops_never_share_a_task() {
        let m = Arc::new(mux());
        m.get("jobs", |qs| {
            for i in 0..200 {
                qs.push(&format!("task-{i}"), 0);
            }
        })
        .unwrap();

        let mut handles = Vec::new();
        for _ in 0..4 {
            let m = Arc::clone(&m);
            handles.push(std::thread::spawn(move || {
                let mut seen = Vec::new();
                loop {
                    let task = m.get("jobs", |qs| qs.pop(None).0).unwrap();
                    match task {
                        Some(view) => seen.push(view.id),
                        None => break,
                    }
                }
                seen
            }));
        }

        let mut all: Vec<String> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        assert_eq!(all.len(), 200);
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 200, "a task was delivered twice");
    }
}
