use crate::clock::{Clock, SystemClock};
use crate::config::ClientPrefs;
use crate::core::{SegmentFactory, ShmemFactory};
use crate::descriptor::{DataDirLayout, PathLayout};
use crate::error::ErrorCode;
use crate::platform::{OsLauncher, ProcessLauncher};
use crate::resource::{host_total_ram, OsSampler, ProcessSampler};
use std::sync::Arc;

/// Reports flowing up to project bookkeeping. The caller drains them with
/// `SupervisorContext::drain_events` after each pass.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskEvent {
    Started {
        project_url: String,
        task_name: String,
        slot: u32,
        pid: u32,
    },
    Finished {
        project_url: String,
        task_name: String,
        exit_code: i32,
        final_cpu_time: f64,
        stderr_tail: String,
    },
    Failed {
        project_url: String,
        task_name: String,
        code: ErrorCode,
        reason: String,
        final_cpu_time: f64,
        stderr_tail: String,
    },
    /// Inputs vanished; bookkeeping should fetch them again.
    InputsMissing {
        project_url: String,
        task_name: String,
        files: Vec<String>,
    },
    Checkpointed {
        project_url: String,
        task_name: String,
        checkpoint_cpu_time: f64,
    },
    TrickleUp {
        project_url: String,
        task_name: String,
    },
    RescheduleRequested {
        reason: String,
    },
}

/// Everything the supervisor needs from the outside, passed explicitly.
pub struct SupervisorContext {
    pub clock: Arc<dyn Clock>,
    pub launcher: Arc<dyn ProcessLauncher>,
    pub segments: Arc<dyn SegmentFactory>,
    pub sampler: Box<dyn ProcessSampler>,
    pub layout: Arc<dyn PathLayout>,
    pub prefs: ClientPrefs,
    /// RAM the running tasks may use together, in bytes. 0 disables the check.
    pub available_ram: f64,
    events: Vec<TaskEvent>,
}

impl SupervisorContext {
    pub fn new(
        clock: Arc<dyn Clock>,
        launcher: Arc<dyn ProcessLauncher>,
        segments: Arc<dyn SegmentFactory>,
        sampler: Box<dyn ProcessSampler>,
        layout: Arc<dyn PathLayout>,
        prefs: ClientPrefs,
    ) -> Self {
        Self {
            clock,
            launcher,
            segments,
            sampler,
            layout,
            prefs,
            available_ram: 0.0,
            events: Vec::new(),
        }
    }

    /// Real clock, real processes, OS shared memory, rooted at `layout`.
    pub fn system(layout: DataDirLayout, prefs: ClientPrefs) -> Self {
        let available_ram = prefs.available_ram(host_total_ram());
        let mut ctx = Self::new(
            Arc::new(SystemClock),
            Arc::new(OsLauncher),
            Arc::new(ShmemFactory),
            Box::new(OsSampler),
            Arc::new(layout),
            prefs,
        );
        ctx.available_ram = available_ram;
        ctx
    }

    pub fn now(&self) -> f64 {
        self.clock.now()
    }

    pub fn emit(&mut self, event: TaskEvent) {
        self.events.push(event);
    }

    pub fn drain_events(&mut self) -> Vec<TaskEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn events(&self) -> &[TaskEvent] {
        &self.events
    }
}
