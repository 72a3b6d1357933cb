//! Unified error handling for taskwarden
//!
//! Per-layer error enums plus the numeric codes attached to failures that are
//! reported against a task's project.

use std::fmt;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the library
#[derive(Error, Debug)]
pub enum TaskwardenError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Task start failed: {0}")]
    Start(#[from] StartError),
    #[error("Shared memory error: {0}")]
    Segment(#[from] SegmentError),
    #[error("State file error: {0}")]
    StateFile(#[from] StateFileError),
    #[error("Resource sampling error: {0}")]
    Sample(#[from] SampleError),
    #[error("No active task in slot {0}")]
    SlotNotFound(u32),
    #[error("Invalid operation on task {task}: {message}")]
    InvalidState { task: String, message: String },
}

pub type TaskwardenResult<T> = Result<T, TaskwardenError>;

/// Shared memory attach failures.
///
/// `Exhausted` means the OS is out of segments right now; the caller parks
/// the task as "needs shared memory" and tries again on a later pass.
#[derive(Error, Debug)]
pub enum SegmentError {
    #[error("shared memory exhausted ({name}): {message}")]
    Exhausted { name: String, message: String },
    #[error("shared memory failure ({name}): {message}")]
    Failed { name: String, message: String },
    #[error("shared memory region too small: {actual} < {required}")]
    RegionTooSmall { required: usize, actual: usize },
}

impl SegmentError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, SegmentError::Exhausted { .. })
    }
}

/// One variant per step of the start pipeline, so the reason reported to the
/// project names the step that failed.
#[derive(Error, Debug)]
pub enum StartError {
    #[error("main program {0} is missing")]
    MissingExecutable(PathBuf),
    #[error("input files not present: {}", .0.join(", "))]
    MissingInputs(Vec<String>),
    #[error("can't write init file {path}: {source}")]
    WriteInitFile { path: PathBuf, source: io::Error },
    #[error("can't link input file {name}: {source}")]
    LinkFiles { name: String, source: io::Error },
    #[error("can't create slot directory {path}: {source}")]
    SlotDirectory { path: PathBuf, source: io::Error },
    #[error("couldn't start {executable} after {attempts} attempts: {source}")]
    CreateProcess {
        executable: PathBuf,
        attempts: u32,
        source: io::Error,
    },
    #[error("{executable} is not executable: {source}")]
    NotExecutable { executable: PathBuf, source: io::Error },
    #[error(transparent)]
    SharedMemory(#[from] SegmentError),
}

impl StartError {
    /// Missing inputs and exhausted shared memory leave the task waiting in
    /// `uninitialized`; every other variant parks it in `couldnt_start`.
    pub fn is_transient(&self) -> bool {
        match self {
            StartError::MissingInputs(_) => true,
            StartError::SharedMemory(err) => err.is_retryable(),
            _ => false,
        }
    }
}

#[derive(Error, Debug)]
pub enum StateFileError {
    #[error("state file IO error ({path}): {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("state file parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("state file persist failed: {0}")]
    Persist(#[from] tempfile::PersistError),
}

#[derive(Error, Debug)]
pub enum SampleError {
    #[error("process table unavailable: {0}")]
    Unavailable(String),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Numeric error codes carried by failure reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    AbortedByClient,
    AbortedByUser,
    ResourceLimitExceeded,
    TooManyExits,
    NonzeroExit,
    Signaled,
    ExitUnknown,
    CouldntStart,
}

impl ErrorCode {
    pub fn code(&self) -> i32 {
        match self {
            ErrorCode::AbortedByClient => -187,
            ErrorCode::AbortedByUser => -197,
            ErrorCode::ResourceLimitExceeded => -177,
            ErrorCode::TooManyExits => -226,
            ErrorCode::NonzeroExit => -186,
            ErrorCode::Signaled => -188,
            ErrorCode::ExitUnknown => -189,
            ErrorCode::CouldntStart => -185,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::AbortedByClient => "aborted by client",
            ErrorCode::AbortedByUser => "aborted by user",
            ErrorCode::ResourceLimitExceeded => "resource limit exceeded",
            ErrorCode::TooManyExits => "too many exits",
            ErrorCode::NonzeroExit => "nonzero exit",
            ErrorCode::Signaled => "signaled",
            ErrorCode::ExitUnknown => "exit unknown",
            ErrorCode::CouldntStart => "couldn't start",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.as_str(), self.code())
    }
}
