//! Platform capabilities: process creation and exit interpretation.
//!
//! The rest of the crate talks to `ProcessLauncher`/`ChildProcess` and sees
//! exits only as `ExitOutcome`; the per-OS details stay in `unix`/`windows`.

#[cfg(unix)]
pub mod unix;
#[cfg(windows)]
pub mod windows;

#[cfg(unix)]
pub use unix::{classify_exit, is_benign_signal, prepare_command, process_alive};
#[cfg(windows)]
pub use windows::{classify_exit, is_benign_signal, prepare_command, process_alive};

use std::fs::OpenOptions;
use std::io;
use std::path::Path;
use std::process::{Child, Command, Stdio};

/// How a worker process ended, as resolved by the OS adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    /// Normal exit with a status code.
    Clean(i32),
    /// Killed by a signal.
    Signaled(i32),
    /// An OS-specific status with its own restart policy.
    PlatformSpecial { tag: &'static str, restartable: bool },
}

impl ExitOutcome {
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            ExitOutcome::Clean(code) => Some(*code),
            _ => None,
        }
    }

    pub fn signal(&self) -> Option<i32> {
        match self {
            ExitOutcome::Signaled(sig) => Some(*sig),
            _ => None,
        }
    }
}

/// Everything needed to create one worker process.
#[derive(Debug, Clone)]
pub struct LaunchSpec<'a> {
    pub executable: &'a Path,
    pub args: &'a [String],
    pub working_dir: &'a Path,
    pub env: &'a [(String, String)],
    pub stderr_path: &'a Path,
}

pub trait ProcessLauncher: Send + Sync {
    fn launch(&self, spec: &LaunchSpec<'_>) -> io::Result<Box<dyn ChildProcess>>;
}

pub trait ChildProcess: Send {
    fn pid(&self) -> u32;

    /// Non-blocking; `Ok(None)` while the process is still running.
    fn try_exit(&mut self) -> io::Result<Option<ExitOutcome>>;

    /// Unconditional kill (SIGKILL / TerminateProcess), then reap.
    fn kill(&mut self) -> io::Result<()>;
}

/// Launcher backed by `std::process`.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsLauncher;

impl ProcessLauncher for OsLauncher {
    fn launch(&self, spec: &LaunchSpec<'_>) -> io::Result<Box<dyn ChildProcess>> {
        let stderr = OpenOptions::new()
            .create(true)
            .append(true)
            .open(spec.stderr_path)?;

        let mut command = Command::new(spec.executable);
        command
            .args(spec.args)
            .current_dir(spec.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::from(stderr));
        for (key, value) in spec.env {
            command.env(key, value);
        }
        prepare_command(&mut command)?;

        let child = command.spawn()?;
        Ok(Box::new(OsChild { child }))
    }
}

pub struct OsChild {
    child: Child,
}

impl ChildProcess for OsChild {
    fn pid(&self) -> u32 {
        self.child.id()
    }

    fn try_exit(&mut self) -> io::Result<Option<ExitOutcome>> {
        Ok(self.child.try_wait()?.map(classify_exit))
    }

    fn kill(&mut self) -> io::Result<()> {
        match self.child.kill() {
            Ok(()) => {}
            // already exited; still reap below
            Err(err) if err.kind() == io::ErrorKind::InvalidInput => {}
            Err(err) => return Err(err),
        }
        self.child.wait().map(|_| ())
    }
}
