//! Task scheduling.
//!
//! The scheduler owns tasks. Each task runs as its own actor; the
//! service supervises them, validates and subscribes metrics at
//! creation, and fans task events out to watchers.

pub mod actor;
pub mod schedule;
pub mod service;
pub mod task;
pub mod watcher;

pub use actor::{TaskActor, TaskCommand, TaskHandle};
pub use schedule::{format_duration, parse_duration, Schedule, SchedulePoint};
pub use service::{CreateTask, Scheduler};
pub use task::{Task, TaskState, DEFAULT_DEADLINE_MS, DEFAULT_STOP_ON_FAILURE};
pub use watcher::{TaskWatch, TaskWatchEvent, TaskWatcher, DEFAULT_RING_CAPACITY};
