//! Taskwarden Library
//!
//! Active task supervisor: runs untrusted worker processes in numbered slot
//! directories, talks to them over a small shared-memory segment, and keeps
//! them inside their CPU, memory and disk bounds.

pub mod active_task;
pub mod app_msg;
pub mod clock;
pub mod commands;
pub mod config;
pub mod context;
pub mod core;
pub mod descriptor;
pub mod error;
pub mod logging;
pub mod platform;
pub mod process;
pub mod resource;
pub mod storage;
pub mod task_record;
pub mod task_set;
pub mod worker;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Re-export commonly used types for convenience
pub use active_task::{ActiveTask, SchedulerState, TaskState};
pub use config::{ClientPrefs, SupervisorConfig};
pub use context::{SupervisorContext, TaskEvent};
pub use descriptor::{DataDirLayout, PathLayout, TaskDescriptor};
pub use error::{ErrorCode, TaskwardenError, TaskwardenResult};
pub use storage::StateFile;
pub use task_record::{ActiveTaskRecord, ActiveTaskStatus};
pub use task_set::ActiveTaskSet;
pub use worker::WorkerSession;
