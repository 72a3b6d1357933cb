//! Deterministic stand-ins for the clock and the process launcher.

use crate::active_task::ActiveTask;
use crate::clock::Clock;
use crate::config::ClientPrefs;
use crate::context::SupervisorContext;
use crate::core::{HeapSegment, HeapSegments};
use crate::descriptor::{DataDirLayout, FileRef, TaskDescriptor};
use crate::error::SampleError;
use crate::platform::{ChildProcess, ExitOutcome, LaunchSpec, ProcessLauncher};
use crate::resource::{ProcSample, ProcessSampler};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// A clock that only moves when told to (or when somebody sleeps on it).
#[derive(Clone)]
pub struct ManualClock {
    now: Arc<Mutex<f64>>,
}

impl ManualClock {
    pub fn new(start: f64) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn advance(&self, seconds: f64) {
        *self.now.lock() += seconds;
    }

    pub fn set(&self, now: f64) {
        *self.now.lock() = now;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> f64 {
        *self.now.lock()
    }

    fn sleep(&self, duration: Duration) {
        self.advance(duration.as_secs_f64());
    }
}

#[derive(Default)]
struct FakeChildState {
    exit: Option<(f64, ExitOutcome)>,
    killed: bool,
}

/// Test-side control of a fake worker.
#[derive(Clone)]
pub struct FakeChildHandle {
    state: Arc<Mutex<FakeChildState>>,
    pub working_dir: PathBuf,
    pub env: Vec<(String, String)>,
}

impl FakeChildHandle {
    /// Make the process exit with `outcome` once the clock reaches `at`.
    pub fn exit_at(&self, at: f64, outcome: ExitOutcome) {
        self.state.lock().exit = Some((at, outcome));
    }

    pub fn exit_now(&self, outcome: ExitOutcome) {
        self.exit_at(f64::MIN, outcome);
    }

    pub fn was_killed(&self) -> bool {
        self.state.lock().killed
    }
}

struct FakeChild {
    pid: u32,
    clock: Arc<dyn Clock>,
    state: Arc<Mutex<FakeChildState>>,
}

impl ChildProcess for FakeChild {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn try_exit(&mut self) -> io::Result<Option<ExitOutcome>> {
        let state = self.state.lock();
        if state.killed {
            return Ok(Some(ExitOutcome::Signaled(9)));
        }
        Ok(match state.exit {
            Some((at, outcome)) if self.clock.now() >= at => Some(outcome),
            _ => None,
        })
    }

    fn kill(&mut self) -> io::Result<()> {
        self.state.lock().killed = true;
        Ok(())
    }
}

/// Launcher that hands out fake children with increasing pids.
#[derive(Clone)]
pub struct FakeLauncher {
    clock: Arc<dyn Clock>,
    children: Arc<Mutex<HashMap<u32, FakeChildHandle>>>,
    failures: Arc<Mutex<VecDeque<io::ErrorKind>>>,
    launches: Arc<Mutex<usize>>,
    next_pid: Arc<Mutex<u32>>,
}

impl FakeLauncher {
    pub fn new(clock: impl Clock + 'static) -> Self {
        Self {
            clock: Arc::new(clock),
            children: Arc::new(Mutex::new(HashMap::new())),
            failures: Arc::new(Mutex::new(VecDeque::new())),
            launches: Arc::new(Mutex::new(0)),
            next_pid: Arc::new(Mutex::new(1000)),
        }
    }

    /// The next `count` launches fail with `kind`.
    pub fn fail_next(&self, count: usize, kind: io::ErrorKind) {
        let mut failures = self.failures.lock();
        for _ in 0..count {
            failures.push_back(kind);
        }
    }

    pub fn launch_count(&self) -> usize {
        *self.launches.lock()
    }

    pub fn child(&self, pid: u32) -> Option<FakeChildHandle> {
        self.children.lock().get(&pid).cloned()
    }

    pub fn last_child(&self) -> Option<FakeChildHandle> {
        let children = self.children.lock();
        children
            .keys()
            .max()
            .and_then(|pid| children.get(pid).cloned())
    }
}

impl ProcessLauncher for FakeLauncher {
    fn launch(&self, spec: &LaunchSpec<'_>) -> io::Result<Box<dyn ChildProcess>> {
        *self.launches.lock() += 1;
        if let Some(kind) = self.failures.lock().pop_front() {
            return Err(io::Error::new(kind, "injected launch failure"));
        }
        let pid = {
            let mut next = self.next_pid.lock();
            *next += 1;
            *next
        };
        let state = Arc::new(Mutex::new(FakeChildState::default()));
        self.children.lock().insert(
            pid,
            FakeChildHandle {
                state: state.clone(),
                working_dir: spec.working_dir.to_path_buf(),
                env: spec.env.to_vec(),
            },
        );
        Ok(Box::new(FakeChild {
            pid,
            clock: self.clock.clone(),
            state,
        }))
    }
}

/// Sampler returning preset readings; pids without one get zeros.
#[derive(Clone, Default)]
pub struct StaticSampler {
    samples: Arc<Mutex<HashMap<u32, ProcSample>>>,
}

impl StaticSampler {
    pub fn set(&self, pid: u32, sample: ProcSample) {
        self.samples.lock().insert(pid, sample);
    }
}

impl ProcessSampler for StaticSampler {
    fn sample(&mut self, pids: &[u32]) -> Result<HashMap<u32, ProcSample>, SampleError> {
        let samples = self.samples.lock();
        Ok(pids
            .iter()
            .map(|pid| (*pid, samples.get(pid).copied().unwrap_or_default()))
            .collect())
    }
}

/// A temp data directory wired to fake processes and heap segments.
pub struct TestBed {
    pub dir: TempDir,
    pub clock: ManualClock,
    pub launcher: FakeLauncher,
    pub segments: HeapSegments,
    pub sampler: StaticSampler,
    pub layout: DataDirLayout,
}

impl TestBed {
    pub fn new() -> io::Result<Self> {
        let dir = tempfile::tempdir()?;
        let clock = ManualClock::new(1000.0);
        let layout = DataDirLayout::new(dir.path());
        fs::create_dir_all(layout.slots_dir())?;
        Ok(Self {
            launcher: FakeLauncher::new(clock.clone()),
            clock,
            segments: HeapSegments::new(),
            sampler: StaticSampler::default(),
            layout,
            dir,
        })
    }

    pub fn context(&self) -> SupervisorContext {
        self.context_with_sampler(Box::new(self.sampler.clone()))
    }

    pub fn context_with_sampler(&self, sampler: Box<dyn ProcessSampler>) -> SupervisorContext {
        SupervisorContext::new(
            Arc::new(self.clock.clone()),
            Arc::new(self.launcher.clone()),
            Arc::new(self.segments.clone()),
            sampler,
            Arc::new(self.layout.clone()),
            ClientPrefs::default(),
        )
    }

    /// A runnable descriptor with one input and one output file.
    pub fn descriptor(&self, name: &str) -> io::Result<TaskDescriptor> {
        let project = self.dir.path().join("projects").join("p.org");
        fs::create_dir_all(&project)?;
        let executable = project.join("app");
        fs::write(&executable, "#!/bin/sh\n")?;
        let input = project.join(format!("{name}.in"));
        fs::write(&input, "input")?;

        let mut descriptor = TaskDescriptor::new("http://p.org/", name, executable);
        descriptor.input_files.push(FileRef {
            open_name: "in".to_string(),
            path: input,
        });
        descriptor.output_files.push(FileRef {
            open_name: "out".to_string(),
            path: project.join(format!("{name}.out")),
        });
        Ok(descriptor)
    }

    /// The worker's end of a task's segment.
    pub fn worker_end(&self, task: &ActiveTask) -> Option<HeapSegment> {
        self.segments.peer(&task.segment_name())
    }

    pub fn child(&self, task: &ActiveTask) -> Option<FakeChildHandle> {
        self.launcher.child(task.pid())
    }
}
