//! # hopper
//!
//! Lightweight, in-memory, HTTP-accessible task broker.
//!
//! Producers push opaque string payloads onto named queues ("contexts");
//! workers pop tasks, optionally send keepalives while processing them, and
//! report completion. A task that is not completed within its timeout
//! becomes eligible for re-delivery. All state snapshots periodically to a
//! single archive file and is restored on startup.
//!
//! ## Features
//!
//! - **Timeout-based redelivery**: popped tasks re-enter circulation when
//!   their expiration passes without a completion
//! - **Named contexts**: independent queues created lazily per name and
//!   garbage-collected when back to a fresh state
//! - **Batched operations**: push, pop and complete many tasks atomically
//! - **Throughput stats**: sliding-window completion rates per context
//! - **Durable snapshots**: periodic atomic saves of every context
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::time::Duration;
//! use hopper::QueueStateMux;
//!
//! let queues = QueueStateMux::new(Duration::from_secs(900));
//!
//! queues.get("renders", |qs| {
//!     let id = qs.push("frame-001", 0).unwrap();
//!     let (task, _) = qs.pop(None);
//!     assert_eq!(task.unwrap().id, id);
//!     assert!(qs.completed(&id));
//! })?;
//! # Ok::<(), hopper::HopperError>(())
//! ```
//!
//! The `hopper` binary wraps the engine in an HTTP API; see
//! [`server::router`] for the endpoint surface.

pub mod config;
pub mod error;
pub mod mux;
pub mod pending;
pub mod ratetrack;
pub mod running;
pub mod server;
pub mod snapshot;
pub mod state;
pub mod task;

// Re-export main types
pub use config::Config;
pub use error::{HopperError, Result};
pub use mux::QueueStateMux;
pub use pending::PendingQueue;
pub use ratetrack::{RateTracker, DEFAULT_RATE_TRACKER_BINS};
pub use running::RunningQueue;
pub use server::{router, AppState, SharedState};
pub use snapshot::{load_from_path, save_to_path, ContextState};
pub use state::{QueueCounts, QueueState};
pub use task::{Task, TaskDeque, TaskId, TaskView};

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_engine_smoke() {
        let queues = QueueStateMux::new(Duration::from_secs(60));

        let id = queues
            .get("smoke", |qs| qs.push("payload", 0).unwrap())
            .unwrap();
        let popped = queues
            .get("smoke", |qs| qs.pop(None).0.unwrap())
            .unwrap();
        assert_eq!(popped.id, id);
        assert_eq!(popped.num_attempts, 1);

        assert!(queues.get("smoke", |qs| qs.completed(&id)).unwrap());
        let counts = queues
            .get("smoke", |qs| qs.counts(0, false, false))
            .unwrap();
        assert_eq!(counts.completed, 1);
    }
}
