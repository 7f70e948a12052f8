//! Job scheduling: admission queues, process launching and status tracking.
//!
//! ```text
//! submit ──> store ──> QueueManager ──> ProcessLauncher ──mpsc──> StatusTracker ──> store
//!                            ^                                         │
//!                            └────────────── Notify (slot released) ───┘
//! ```

pub mod events;
pub mod launcher;
pub mod queue;
pub mod service;
pub mod tracker;

pub use events::{CompletionEvent, ExecutionOutcome, JobEvent, LauncherEvent};
pub use launcher::{ProcessHandle, ProcessLauncher};
pub use queue::{QueueEntry, QueueManager};
pub use service::Scheduler;
pub use tracker::StatusTracker;
