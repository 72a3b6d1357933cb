use crate::clock::Clock;
use crate::config::{EXIT_WAIT_POLL, MAX_START_ATTEMPTS, START_RETRY_JITTER_MS};
use crate::core::{SegmentFactory, SharedSegment};
use crate::error::{SegmentError, StartError};
use crate::logging::{debug, warn};
use crate::platform::{ChildProcess, ExitOutcome, LaunchSpec, ProcessLauncher};
use rand::Rng;
use std::io;
use std::time::Duration;

/// One worker process and the segment it talks through.
#[derive(Default)]
pub struct ProcessHandle {
    child: Option<Box<dyn ChildProcess>>,
    segment: Option<Box<dyn SharedSegment>>,
    pid: u32,
    exit: Option<ExitOutcome>,
}

impl ProcessHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// 0 until started.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn is_running(&self) -> bool {
        self.child.is_some() && self.exit.is_none()
    }

    /// Create the process. Transient failures are retried a few times with
    /// random jitter; a missing or non-executable program fails at once.
    pub fn start(
        &mut self,
        launcher: &dyn ProcessLauncher,
        spec: &LaunchSpec<'_>,
        clock: &dyn Clock,
    ) -> Result<u32, StartError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match launcher.launch(spec) {
                Ok(child) => {
                    self.pid = child.pid();
                    self.child = Some(child);
                    self.exit = None;
                    debug(format!(
                        "started {} pid={} attempt={}",
                        spec.executable.display(),
                        self.pid,
                        attempt
                    ));
                    return Ok(self.pid);
                }
                Err(err) if err.kind() == io::ErrorKind::NotFound => {
                    return Err(StartError::MissingExecutable(spec.executable.to_path_buf()));
                }
                Err(err) if err.kind() == io::ErrorKind::PermissionDenied => {
                    return Err(StartError::NotExecutable {
                        executable: spec.executable.to_path_buf(),
                        source: err,
                    });
                }
                Err(err) if attempt >= MAX_START_ATTEMPTS => {
                    return Err(StartError::CreateProcess {
                        executable: spec.executable.to_path_buf(),
                        attempts: attempt,
                        source: err,
                    });
                }
                Err(err) => {
                    let jitter = rand::thread_rng().gen_range(1..=START_RETRY_JITTER_MS);
                    warn(format!(
                        "start of {} failed (attempt {}): {}; retrying in {}ms",
                        spec.executable.display(),
                        attempt,
                        err,
                        jitter
                    ));
                    clock.sleep(Duration::from_millis(jitter));
                }
            }
        }
    }

    /// Non-blocking exit check. The outcome is remembered once seen.
    pub fn has_exited(&mut self) -> Option<ExitOutcome> {
        if self.exit.is_some() {
            return self.exit;
        }
        let child = self.child.as_mut()?;
        match child.try_exit() {
            Ok(Some(outcome)) => {
                self.exit = Some(outcome);
                self.exit
            }
            Ok(None) => None,
            Err(err) => {
                warn(format!("exit check for pid {} failed: {}", self.pid, err));
                None
            }
        }
    }

    /// Poll for exit in short steps until `timeout` has passed.
    pub fn wait_until_exited(&mut self, timeout: Duration, clock: &dyn Clock) -> Option<ExitOutcome> {
        let deadline = clock.now() + timeout.as_secs_f64();
        loop {
            if let Some(outcome) = self.has_exited() {
                return Some(outcome);
            }
            if self.child.is_none() || clock.now() >= deadline {
                return None;
            }
            clock.sleep(EXIT_WAIT_POLL);
        }
    }

    /// Kill the process and always release the segment.
    pub fn terminate(&mut self) -> io::Result<()> {
        let result = match self.child.as_mut() {
            Some(child) if self.exit.is_none() => child.kill(),
            _ => Ok(()),
        };
        if self.child.is_some() && self.exit.is_none() {
            self.exit = Some(ExitOutcome::Signaled(KILL_SIGNAL));
        }
        self.detach();
        if let Err(err) = &result {
            warn(format!("kill of pid {} failed: {}", self.pid, err));
        }
        result
    }

    /// Forget the finished process so the handle can start another one.
    pub fn clear(&mut self) {
        self.child = None;
        self.exit = None;
        self.pid = 0;
    }

    pub fn has_segment(&self) -> bool {
        self.segment.is_some()
    }

    pub fn attach_or_create_shared_segment(
        &mut self,
        factory: &dyn SegmentFactory,
        name: &str,
        size: usize,
    ) -> Result<(), SegmentError> {
        if self.segment.is_some() {
            return Ok(());
        }
        self.segment = Some(factory.attach_or_create(name, size)?);
        Ok(())
    }

    /// Idempotent.
    pub fn detach(&mut self) {
        if let Some(segment) = self.segment.take() {
            debug(format!("detached segment {}", segment.name()));
        }
    }

    pub fn segment_mut(&mut self) -> Option<&mut dyn SharedSegment> {
        match self.segment.as_mut() {
            Some(segment) => Some(segment.as_mut()),
            None => None,
        }
    }
}

#[cfg(unix)]
const KILL_SIGNAL: i32 = libc::SIGKILL;
#[cfg(not(unix))]
const KILL_SIGNAL: i32 = 9;
