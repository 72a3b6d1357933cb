//! One task's lifecycle: start, suspend/resume, quit/abort with deadlines,
//! and interpretation of the worker's exit.

use crate::app_msg::{
    heartbeat_msg, has_tag, AppStatus, GraphicsMode, MSG_ABORT, MSG_HAVE_TRICKLE_DOWN, MSG_QUIT,
    MSG_RESUME, MSG_SUSPEND,
};
use crate::config::{
    ABORT_TIMEOUT, ENV_SHM_NAME, ENV_SLOT, FINISH_FILE, LOCK_FILE, MAX_PREMATURE_EXITS,
    QUIT_TIMEOUT, SHARED_SEGMENT_SIZE, STDERR_FILE, STDERR_MAX_BYTES, TEMPORARY_EXIT_FILE,
};
use crate::context::{SupervisorContext, TaskEvent};
use crate::core::{segment_name, ChannelId, DeferredQueue};
use crate::descriptor::{PathLayout, TaskDescriptor};
use crate::error::{ErrorCode, StartError};
use crate::logging::{debug, internal_error, warn};
use crate::platform::{is_benign_signal, ExitOutcome, LaunchSpec};
use crate::process::ProcessHandle;
use crate::resource::{dir_size, ResourceSnapshot};
use crate::task_record::{ActiveTaskRecord, ActiveTaskStatus, InitData, SlotCheckpoint};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Uninitialized,
    Executing,
    Suspended,
    AbortPending,
    QuitPending,
    Exited,
    WasSignaled,
    ExitUnknown,
    Aborted,
    CouldntStart,
}

impl TaskState {
    /// States in which a worker process exists.
    pub fn has_process(&self) -> bool {
        matches!(
            self,
            TaskState::Executing
                | TaskState::Suspended
                | TaskState::AbortPending
                | TaskState::QuitPending
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Exited
                | TaskState::WasSignaled
                | TaskState::ExitUnknown
                | TaskState::Aborted
                | TaskState::CouldntStart
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Uninitialized => "uninitialized",
            TaskState::Executing => "executing",
            TaskState::Suspended => "suspended",
            TaskState::AbortPending => "abort_pending",
            TaskState::QuitPending => "quit_pending",
            TaskState::Exited => "exited",
            TaskState::WasSignaled => "signaled",
            TaskState::ExitUnknown => "exit_unknown",
            TaskState::Aborted => "aborted",
            TaskState::CouldntStart => "couldnt_start",
        }
    }
}

/// The supervisor's intent for a task, independent of its process state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerState {
    #[default]
    Uninitialized,
    Preempted,
    Scheduled,
}

/// Peak usage seen so far. Reported, never used to preempt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Watermarks {
    pub peak_working_set_size: f64,
    pub peak_swap_size: f64,
    pub peak_page_fault_rate: f64,
    pub peak_disk_usage: f64,
    pub checkpoint_count: u32,
}

impl Watermarks {
    fn observe(&mut self, snapshot: &ResourceSnapshot) {
        self.peak_working_set_size = self.peak_working_set_size.max(snapshot.working_set_size);
        self.peak_swap_size = self.peak_swap_size.max(snapshot.swap_size);
        self.peak_page_fault_rate = self.peak_page_fault_rate.max(snapshot.page_fault_rate);
    }
}

enum ExitDisposition {
    Restart,
    Finished { exit_code: i32 },
    Failed { code: ErrorCode, reason: String },
}

pub struct ActiveTask {
    descriptor: Arc<TaskDescriptor>,
    slot: u32,
    slot_dir: PathBuf,
    state: TaskState,
    pub scheduler_state: SchedulerState,
    process: ProcessHandle,
    graphics_queue: DeferredQueue,
    control_queue: DeferredQueue,
    pub snapshot: ResourceSnapshot,

    pub current_cpu_time: f64,
    pub checkpoint_cpu_time: f64,
    pub checkpoint_wall_time: f64,
    pub run_interval_start_wall_time: f64,
    pub elapsed_time: f64,
    pub fraction_done: f64,
    pub premature_exit_count: u32,
    pub watermarks: Watermarks,

    pub max_cpu_time: f64,
    pub max_disk_usage: f64,
    pub max_mem_usage: f64,

    pub full_init_done: bool,
    pub want_network: bool,
    pub needs_shmem: bool,
    pub too_large: bool,
    pub trickle_down_pending: bool,
    pub graphics_mode_acked: GraphicsMode,
    pub supports_graphics: bool,

    // abort or quit deadline, whichever is pending
    deadline: Option<f64>,
    restart_after_kill: bool,
    pending_abort: Option<(ErrorCode, String)>,
}

impl ActiveTask {
    pub fn new(descriptor: Arc<TaskDescriptor>, slot: u32, layout: &dyn PathLayout) -> Self {
        let bounds = descriptor.bounds;
        Self {
            slot_dir: layout.slot_dir(slot),
            descriptor,
            slot,
            state: TaskState::Uninitialized,
            scheduler_state: SchedulerState::Uninitialized,
            process: ProcessHandle::new(),
            graphics_queue: DeferredQueue::new(ChannelId::GraphicsRequest),
            control_queue: DeferredQueue::new(ChannelId::ProcessControlRequest),
            snapshot: ResourceSnapshot::default(),
            current_cpu_time: 0.0,
            checkpoint_cpu_time: 0.0,
            checkpoint_wall_time: 0.0,
            run_interval_start_wall_time: 0.0,
            elapsed_time: 0.0,
            fraction_done: 0.0,
            premature_exit_count: 0,
            watermarks: Watermarks::default(),
            max_cpu_time: bounds.max_cpu_time,
            max_disk_usage: bounds.max_disk_usage,
            max_mem_usage: bounds.max_mem_usage,
            full_init_done: false,
            want_network: false,
            needs_shmem: false,
            too_large: false,
            trickle_down_pending: false,
            graphics_mode_acked: GraphicsMode::Unsupported,
            supports_graphics: false,
            deadline: None,
            restart_after_kill: true,
            pending_abort: None,
        }
    }

    /// Rebuild a task from its persisted record. Whatever was running before
    /// the client stopped is gone, so the task comes back `uninitialized`
    /// and, unless it had already ended, scheduled to run again.
    pub fn from_record(
        record: &ActiveTaskRecord,
        descriptor: Arc<TaskDescriptor>,
        layout: &dyn PathLayout,
    ) -> Self {
        let mut task = Self::new(descriptor, record.slot, layout);
        task.full_init_done = record.full_init_done;
        task.checkpoint_cpu_time = record.checkpoint_cpu_time;
        task.current_cpu_time = record.current_cpu_time.max(record.checkpoint_cpu_time);
        task.fraction_done = record.fraction_done;
        task.watermarks = record.watermarks;
        task.snapshot.swap_size = record.swap_size;
        task.snapshot.working_set_size = record.working_set_size;
        task.snapshot.working_set_size_smoothed = record.working_set_size_smoothed;
        task.snapshot.page_fault_rate = record.page_fault_rate;
        if record.task_state == TaskState::Uninitialized || record.task_state.has_process() {
            task.scheduler_state = SchedulerState::Scheduled;
        }

        // the slot copy may be newer than the main state file
        if let Some(checkpoint) = SlotCheckpoint::read(&task.slot_dir) {
            if checkpoint.project_url == record.project_url
                && checkpoint.task_name == record.task_name
                && checkpoint.checkpoint_cpu_time > task.checkpoint_cpu_time
            {
                debug(format!(
                    "slot {}: recovered checkpoint {:.2}s from slot record",
                    task.slot, checkpoint.checkpoint_cpu_time
                ));
                task.checkpoint_cpu_time = checkpoint.checkpoint_cpu_time;
                task.current_cpu_time = task.current_cpu_time.max(checkpoint.checkpoint_cpu_time);
            }
        }
        task
    }

    pub fn descriptor(&self) -> &Arc<TaskDescriptor> {
        &self.descriptor
    }

    pub fn project_url(&self) -> &str {
        &self.descriptor.project_url
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn slot(&self) -> u32 {
        self.slot
    }

    pub fn slot_dir(&self) -> &Path {
        &self.slot_dir
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn pid(&self) -> u32 {
        self.process.pid()
    }

    pub fn has_process(&self) -> bool {
        self.state.has_process()
    }

    pub fn deadline(&self) -> Option<f64> {
        self.deadline
    }

    pub fn control_queue(&self) -> &DeferredQueue {
        &self.control_queue
    }

    pub fn graphics_queue(&self) -> &DeferredQueue {
        &self.graphics_queue
    }

    pub fn segment_name(&self) -> String {
        segment_name(&self.slot_dir)
    }

    fn set_state(&mut self, state: TaskState, why: &str) {
        if self.state != state {
            tracing::info!(
                slot = self.slot,
                task = %self.descriptor.name,
                from = self.state.as_str(),
                to = state.as_str(),
                "{why}"
            );
        }
        self.state = state;
    }

    fn event_ids(&self) -> (String, String) {
        (self.descriptor.project_url.clone(), self.descriptor.name.clone())
    }

    // ---------------------------------------------------------------- start

    /// Start the worker, parking the task on failure.
    ///
    /// Missing inputs and exhausted shared memory leave it `uninitialized`
    /// to be retried; anything else moves it to `couldnt_start` and reports
    /// the reason. Returns true if a process was created.
    pub fn try_start(&mut self, ctx: &mut SupervisorContext) -> bool {
        let err = match self.start(ctx) {
            Ok(_) => return true,
            Err(err) => err,
        };
        if err.is_transient() {
            match err {
                StartError::MissingInputs(files) => {
                    debug(format!(
                        "slot {}: waiting for input files {:?}",
                        self.slot, files
                    ));
                    let (project_url, task_name) = self.event_ids();
                    ctx.emit(TaskEvent::InputsMissing {
                        project_url,
                        task_name,
                        files,
                    });
                }
                err => {
                    warn(format!("slot {}: {}; will retry", self.slot, err));
                    self.needs_shmem = true;
                }
            }
            return false;
        }
        self.process.detach();
        let reason = err.to_string();
        self.set_state(TaskState::CouldntStart, &reason);
        let (project_url, task_name) = self.event_ids();
        ctx.emit(TaskEvent::Failed {
            project_url,
            task_name,
            code: ErrorCode::CouldntStart,
            reason,
            final_cpu_time: self.current_cpu_time,
            stderr_tail: String::new(),
        });
        false
    }

    /// Each step either succeeds or returns the error naming it.
    pub fn start(&mut self, ctx: &mut SupervisorContext) -> Result<u32, StartError> {
        if self.state != TaskState::Uninitialized {
            internal_error(format!(
                "start of slot {} in state {}",
                self.slot,
                self.state.as_str()
            ));
            return Ok(self.process.pid());
        }
        if !self.descriptor.executable.exists() {
            return Err(StartError::MissingExecutable(self.descriptor.executable.clone()));
        }
        let missing = self.descriptor.missing_inputs();
        if !missing.is_empty() {
            return Err(StartError::MissingInputs(missing));
        }

        fs::create_dir_all(&self.slot_dir).map_err(|source| StartError::SlotDirectory {
            path: self.slot_dir.clone(),
            source,
        })?;
        if !self.full_init_done {
            self.link_input_files()?;
            self.full_init_done = true;
        }

        let shm_name = self.segment_name();
        self.process
            .attach_or_create_shared_segment(ctx.segments.as_ref(), &shm_name, SHARED_SEGMENT_SIZE)?;
        self.needs_shmem = false;

        if let Err(err) = self.write_init_data(&shm_name, ctx) {
            self.process.detach();
            return Err(err);
        }
        let _ = fs::remove_file(self.slot_dir.join(FINISH_FILE));
        let _ = fs::remove_file(self.slot_dir.join(TEMPORARY_EXIT_FILE));

        let args = self.descriptor.args();
        let env = vec![
            (ENV_SHM_NAME.to_string(), shm_name),
            (ENV_SLOT.to_string(), self.slot.to_string()),
        ];
        let stderr_path = self.slot_dir.join(STDERR_FILE);
        let spec = LaunchSpec {
            executable: &self.descriptor.executable,
            args: &args,
            working_dir: &self.slot_dir,
            env: &env,
            stderr_path: &stderr_path,
        };
        let pid = match self
            .process
            .start(ctx.launcher.as_ref(), &spec, ctx.clock.as_ref())
        {
            Ok(pid) => pid,
            Err(err) => {
                self.process.detach();
                return Err(err);
            }
        };

        if let Err(err) = fs::write(self.slot_dir.join(LOCK_FILE), pid.to_string()) {
            warn(format!("slot {}: can't write lock file: {}", self.slot, err));
        }

        let now = ctx.now();
        self.run_interval_start_wall_time = now;
        self.snapshot.reset();
        self.deadline = None;
        self.pending_abort = None;
        self.control_queue.clear();
        self.graphics_queue.clear();
        self.set_state(TaskState::Executing, "process started");
        let (project_url, task_name) = self.event_ids();
        ctx.emit(TaskEvent::Started {
            project_url,
            task_name,
            slot: self.slot,
            pid,
        });
        Ok(pid)
    }

    fn link_input_files(&self) -> Result<(), StartError> {
        for file in &self.descriptor.input_files {
            let link = self.slot_dir.join(&file.open_name);
            let _ = fs::remove_file(&link);
            link_file(&file.path, &link).map_err(|source| StartError::LinkFiles {
                name: file.open_name.clone(),
                source,
            })?;
        }
        Ok(())
    }

    fn write_init_data(&self, shm_name: &str, ctx: &SupervisorContext) -> Result<(), StartError> {
        let init = InitData {
            project_url: self.descriptor.project_url.clone(),
            task_name: self.descriptor.name.clone(),
            app_name: self.descriptor.app_name.clone(),
            slot: self.slot,
            shm_name: shm_name.to_string(),
            bounds: self.descriptor.bounds,
            checkpoint_cpu_time: self.checkpoint_cpu_time,
            network_available: ctx.prefs.network_available,
        };
        init.write(&self.slot_dir)
    }

    // ------------------------------------------------------------ commands

    pub fn suspend(&mut self, ctx: &SupervisorContext) -> bool {
        if self.state != TaskState::Executing {
            debug(format!("slot {}: suspend ignored in {}", self.slot, self.state.as_str()));
            return false;
        }
        let now = ctx.now();
        if !self.control_queue.purge_if_tail_equals(MSG_RESUME) {
            self.control_queue
                .enqueue_and_try_send(MSG_SUSPEND, self.process.segment_mut(), now);
        }
        self.elapsed_time += (now - self.run_interval_start_wall_time).max(0.0);
        self.set_state(TaskState::Suspended, "suspended");
        true
    }

    pub fn unsuspend(&mut self, ctx: &SupervisorContext) -> bool {
        if self.state != TaskState::Suspended {
            debug(format!("slot {}: resume ignored in {}", self.slot, self.state.as_str()));
            return false;
        }
        let now = ctx.now();
        if !self.control_queue.purge_if_tail_equals(MSG_SUSPEND) {
            self.control_queue
                .enqueue_and_try_send(MSG_RESUME, self.process.segment_mut(), now);
        }
        self.run_interval_start_wall_time = now;
        self.set_state(TaskState::Executing, "resumed");
        true
    }

    /// Ask the worker to quit. If it hasn't after `QUIT_TIMEOUT` it is
    /// killed, and `restart` decides whether it comes back.
    pub fn request_exit(&mut self, ctx: &SupervisorContext, restart: bool) -> bool {
        if !matches!(self.state, TaskState::Executing | TaskState::Suspended) {
            return false;
        }
        let now = ctx.now();
        if self.state == TaskState::Executing {
            self.elapsed_time += (now - self.run_interval_start_wall_time).max(0.0);
        }
        self.control_queue
            .enqueue_and_try_send(MSG_QUIT, self.process.segment_mut(), now);
        self.deadline = Some(now + QUIT_TIMEOUT.as_secs_f64());
        self.restart_after_kill = restart;
        self.set_state(TaskState::QuitPending, "quit requested");
        true
    }

    /// Abort with a reason reported to the project once the task is gone.
    pub fn abort_task(&mut self, ctx: &mut SupervisorContext, code: ErrorCode, reason: &str) {
        match self.state {
            TaskState::AbortPending => {}
            state @ (TaskState::Exited
            | TaskState::WasSignaled
            | TaskState::ExitUnknown
            | TaskState::Aborted
            | TaskState::CouldntStart) => {
                internal_error(format!(
                    "abort of slot {} in state {}",
                    self.slot,
                    state.as_str()
                ));
            }
            TaskState::Executing | TaskState::Suspended | TaskState::QuitPending => {
                let now = ctx.now();
                if self.state == TaskState::Executing {
                    self.elapsed_time += (now - self.run_interval_start_wall_time).max(0.0);
                }
                warn(format!("slot {}: aborting task {}: {}", self.slot, self.name(), reason));
                self.control_queue
                    .enqueue_and_try_send(MSG_ABORT, self.process.segment_mut(), now);
                self.deadline = Some(now + ABORT_TIMEOUT.as_secs_f64());
                self.pending_abort = Some((code, reason.to_string()));
                self.set_state(TaskState::AbortPending, "abort requested");
            }
            TaskState::Uninitialized => {
                self.set_state(TaskState::Aborted, reason);
                let stderr_tail = self.finalize_slot(ctx);
                let (project_url, task_name) = self.event_ids();
                ctx.emit(TaskEvent::Failed {
                    project_url,
                    task_name,
                    code,
                    reason: reason.to_string(),
                    final_cpu_time: self.current_cpu_time,
                    stderr_tail,
                });
            }
        }
    }

    /// Kill the worker outright. A pending abort is reported rather than
    /// restarted.
    pub fn kill_task(&mut self, ctx: &mut SupervisorContext, restart: bool) {
        if !self.has_process() {
            return;
        }
        let restart = restart && self.pending_abort.is_none();
        self.get_app_status_msg(ctx);
        let _ = self.process.terminate();
        if self.state == TaskState::Executing {
            self.elapsed_time += (ctx.now() - self.run_interval_start_wall_time).max(0.0);
        }
        self.process.clear();
        self.deadline = None;
        self.control_queue.clear();
        self.graphics_queue.clear();
        self.remove_lock_file();

        if restart {
            self.set_state(TaskState::Uninitialized, "killed; will restart");
            return;
        }
        let (code, reason) = self
            .pending_abort
            .take()
            .unwrap_or((ErrorCode::AbortedByClient, "aborted by client".to_string()));
        self.set_state(TaskState::Aborted, "killed");
        let stderr_tail = self.finalize_slot(ctx);
        let (project_url, task_name) = self.event_ids();
        ctx.emit(TaskEvent::Failed {
            project_url,
            task_name,
            code,
            reason,
            final_cpu_time: self.current_cpu_time,
            stderr_tail,
        });
    }

    /// Step aside for another task: quit (and restart later) or suspend.
    pub fn preempt(&mut self, ctx: &SupervisorContext, remove: bool) -> bool {
        self.scheduler_state = SchedulerState::Preempted;
        if remove {
            self.request_exit(ctx, true)
        } else {
            self.suspend(ctx)
        }
    }

    pub fn resume_or_start(&mut self, ctx: &mut SupervisorContext) -> bool {
        self.scheduler_state = SchedulerState::Scheduled;
        match self.state {
            TaskState::Uninitialized => self.try_start(ctx),
            TaskState::Suspended => self.unsuspend(ctx),
            _ => false,
        }
    }

    // ------------------------------------------------------------ messages

    pub fn send_heartbeat(&mut self, ctx: &SupervisorContext) -> bool {
        let max_wss = if self.max_mem_usage > 0.0 {
            self.max_mem_usage
        } else {
            ctx.available_ram
        };
        let msg = heartbeat_msg(
            self.snapshot.working_set_size,
            max_wss,
            ctx.prefs.network_available && self.want_network,
        );
        match self.process.segment_mut() {
            Some(segment) => segment.send(ChannelId::Heartbeat, &msg),
            None => false,
        }
    }

    pub fn send_trickle_down(&mut self) -> bool {
        if !self.trickle_down_pending {
            return false;
        }
        let Some(segment) = self.process.segment_mut() else {
            return false;
        };
        if segment.send(ChannelId::TrickleDown, MSG_HAVE_TRICKLE_DOWN) {
            self.trickle_down_pending = false;
            return true;
        }
        false
    }

    pub fn request_graphics_mode(&mut self, mode: GraphicsMode, now: f64) {
        self.graphics_queue
            .enqueue_and_try_send(&mode.as_msg(), self.process.segment_mut(), now);
    }

    /// Push queued graphics requests and pick up the worker's reply.
    pub fn poll_graphics(&mut self, now: f64) -> bool {
        let Some(segment) = self.process.segment_mut() else {
            return false;
        };
        self.graphics_queue.poll(segment, now);
        let Some(reply) = segment.recv(ChannelId::GraphicsReply) else {
            return false;
        };
        match GraphicsMode::parse(&reply) {
            Some(mode) => {
                self.graphics_mode_acked = mode;
                self.supports_graphics = true;
                true
            }
            None => false,
        }
    }

    pub fn poll_control_queue(&mut self, now: f64) -> bool {
        match self.process.segment_mut() {
            Some(segment) => self.control_queue.poll(segment, now),
            None => false,
        }
    }

    /// Read status and trickle-up messages the worker left for us.
    pub fn get_app_status_msg(&mut self, ctx: &mut SupervisorContext) -> bool {
        let Some(segment) = self.process.segment_mut() else {
            return false;
        };
        let status_msg = segment.recv(ChannelId::AppStatus);
        let trickle_msg = segment.recv(ChannelId::TrickleUp);

        let mut trickle_up = trickle_msg
            .map(|msg| has_tag(&msg, "have_new_trickle_up"))
            .unwrap_or(false);
        let got_status = status_msg.is_some();
        if let Some(msg) = status_msg {
            let status = AppStatus::parse(&msg);
            trickle_up |= status.trickle_up;
            self.apply_status(ctx, &status);
        }
        if trickle_up {
            let (project_url, task_name) = self.event_ids();
            ctx.emit(TaskEvent::TrickleUp {
                project_url,
                task_name,
            });
        }
        got_status || trickle_up
    }

    pub fn apply_status(&mut self, ctx: &mut SupervisorContext, status: &AppStatus) {
        if let Some(cpu) = status.current_cpu_time {
            self.current_cpu_time = cpu;
        }
        if let Some(fraction) = status.fraction_done {
            self.fraction_done = fraction.clamp(0.0, 1.0);
        }
        if let Some(want) = status.want_network {
            self.want_network = want;
        }
        if let Some(checkpoint) = status.checkpoint_cpu_time {
            if checkpoint > 0.0 && checkpoint != self.checkpoint_cpu_time {
                self.on_checkpoint(ctx, checkpoint);
            }
        }
    }

    fn on_checkpoint(&mut self, ctx: &mut SupervisorContext, checkpoint_cpu_time: f64) {
        self.checkpoint_cpu_time = checkpoint_cpu_time;
        self.checkpoint_wall_time = ctx.now();
        self.premature_exit_count = 0;
        self.watermarks.checkpoint_count += 1;
        let record = SlotCheckpoint {
            project_url: self.descriptor.project_url.clone(),
            task_name: self.descriptor.name.clone(),
            checkpoint_cpu_time,
        };
        if let Err(err) = record.write(&self.slot_dir) {
            warn(format!("slot {}: can't write checkpoint record: {}", self.slot, err));
        }
        let (project_url, task_name) = self.event_ids();
        ctx.emit(TaskEvent::Checkpointed {
            project_url,
            task_name,
            checkpoint_cpu_time,
        });
    }

    // ---------------------------------------------------------- supervision

    pub fn observe_snapshot(&mut self) {
        self.watermarks.observe(&self.snapshot);
    }

    pub fn current_disk_usage(&mut self) -> f64 {
        let usage = dir_size(&self.slot_dir);
        self.watermarks.peak_disk_usage = self.watermarks.peak_disk_usage.max(usage);
        usage
    }

    /// Handle a worker that exited on its own. Returns true if it had.
    pub fn check_exited(&mut self, ctx: &mut SupervisorContext) -> bool {
        if !self.has_process() {
            return false;
        }
        match self.process.has_exited() {
            Some(outcome) => {
                self.handle_exited_app(ctx, outcome);
                true
            }
            None => false,
        }
    }

    /// Kill a worker that ignored its quit/abort deadline.
    pub fn check_deadline(&mut self, ctx: &mut SupervisorContext) -> bool {
        let Some(deadline) = self.deadline else {
            return false;
        };
        if !matches!(self.state, TaskState::AbortPending | TaskState::QuitPending) {
            return false;
        }
        if ctx.now() <= deadline {
            return false;
        }
        if self.check_exited(ctx) {
            return true;
        }
        let restart = self.state == TaskState::QuitPending && self.restart_after_kill;
        warn(format!(
            "slot {}: task {} did not exit after {}; killing",
            self.slot,
            self.name(),
            if self.state == TaskState::QuitPending { "quit" } else { "abort" }
        ));
        self.kill_task(ctx, restart);
        true
    }

    pub fn handle_exited_app(&mut self, ctx: &mut SupervisorContext, outcome: ExitOutcome) {
        self.get_app_status_msg(ctx);
        if self.state == TaskState::Executing {
            self.elapsed_time += (ctx.now() - self.run_interval_start_wall_time).max(0.0);
        }

        let disposition = match self.state {
            TaskState::QuitPending => {
                self.set_state(TaskState::Uninitialized, "exited after quit");
                ExitDisposition::Restart
            }
            TaskState::AbortPending => {
                let (code, reason) = self
                    .pending_abort
                    .take()
                    .unwrap_or((ErrorCode::AbortedByClient, "aborted by client".to_string()));
                self.set_state(TaskState::Aborted, "exited after abort");
                ExitDisposition::Failed { code, reason }
            }
            _ => self.classify_exit(outcome),
        };

        self.process.detach();
        self.process.clear();
        self.deadline = None;
        self.control_queue.clear();
        self.graphics_queue.clear();
        self.remove_lock_file();

        match disposition {
            ExitDisposition::Restart => {}
            ExitDisposition::Finished { exit_code } => {
                let stderr_tail = self.finalize_slot(ctx);
                let (project_url, task_name) = self.event_ids();
                ctx.emit(TaskEvent::Finished {
                    project_url,
                    task_name,
                    exit_code,
                    final_cpu_time: self.current_cpu_time,
                    stderr_tail,
                });
            }
            ExitDisposition::Failed { code, reason } => {
                let stderr_tail = self.finalize_slot(ctx);
                let (project_url, task_name) = self.event_ids();
                ctx.emit(TaskEvent::Failed {
                    project_url,
                    task_name,
                    code,
                    reason,
                    final_cpu_time: self.current_cpu_time,
                    stderr_tail,
                });
            }
        }
    }

    fn classify_exit(&mut self, outcome: ExitOutcome) -> ExitDisposition {
        match outcome {
            ExitOutcome::Clean(0) => {
                if self.slot_dir.join(FINISH_FILE).exists() {
                    self.set_state(TaskState::Exited, "finished");
                    return ExitDisposition::Finished { exit_code: 0 };
                }
                if self.slot_dir.join(TEMPORARY_EXIT_FILE).exists() {
                    let _ = fs::remove_file(self.slot_dir.join(TEMPORARY_EXIT_FILE));
                    self.set_state(TaskState::Uninitialized, "temporary exit");
                    return ExitDisposition::Restart;
                }
                self.premature_exit_count += 1;
                if self.premature_exit_count > MAX_PREMATURE_EXITS {
                    let reason = format!(
                        "too many exits: {} exits without finishing or checkpointing",
                        self.premature_exit_count
                    );
                    self.set_state(TaskState::Aborted, &reason);
                    return ExitDisposition::Failed {
                        code: ErrorCode::TooManyExits,
                        reason,
                    };
                }
                warn(format!(
                    "slot {}: task {} exited prematurely ({} so far); restarting",
                    self.slot,
                    self.name(),
                    self.premature_exit_count
                ));
                self.set_state(TaskState::Uninitialized, "premature exit");
                ExitDisposition::Restart
            }
            ExitOutcome::Clean(code) => {
                let reason = format!("process exited with code {code}");
                self.set_state(TaskState::Exited, &reason);
                ExitDisposition::Failed {
                    code: ErrorCode::NonzeroExit,
                    reason,
                }
            }
            ExitOutcome::Signaled(sig) if is_benign_signal(sig) => {
                self.set_state(TaskState::Uninitialized, "stopped by signal; will restart");
                ExitDisposition::Restart
            }
            ExitOutcome::Signaled(sig) => {
                let reason = format!("process got signal {sig}");
                self.set_state(TaskState::WasSignaled, &reason);
                ExitDisposition::Failed {
                    code: ErrorCode::Signaled,
                    reason,
                }
            }
            ExitOutcome::PlatformSpecial { tag, restartable: true } => {
                self.set_state(TaskState::Uninitialized, tag);
                ExitDisposition::Restart
            }
            ExitOutcome::PlatformSpecial { tag, .. } => {
                let reason = format!("process exit status unknown ({tag})");
                self.set_state(TaskState::ExitUnknown, &reason);
                ExitDisposition::Failed {
                    code: ErrorCode::ExitUnknown,
                    reason,
                }
            }
        }
    }

    /// Copy outputs out, keep the stderr tail, and empty the slot.
    fn finalize_slot(&mut self, ctx: &SupervisorContext) -> String {
        if !self.slot_dir.exists() {
            return String::new();
        }
        for file in &self.descriptor.output_files {
            let source = self.slot_dir.join(&file.open_name);
            if !source.exists() {
                continue;
            }
            let result = file
                .path
                .parent()
                .map(fs::create_dir_all)
                .unwrap_or(Ok(()))
                .and_then(|_| fs::copy(&source, &file.path));
            if let Err(err) = result {
                warn(format!(
                    "slot {}: can't copy output {} to {}: {}",
                    self.slot,
                    file.open_name,
                    file.path.display(),
                    err
                ));
            }
        }
        let stderr_tail = read_tail(&self.slot_dir.join(STDERR_FILE), STDERR_MAX_BYTES)
            .unwrap_or_default();
        if let Err(err) = clear_dir(&self.slot_dir) {
            warn(format!("slot {}: can't clean slot directory: {}", self.slot, err));
        }
        self.full_init_done = false;
        debug(format!(
            "slot {} released by {} ({})",
            self.slot,
            self.name(),
            ctx.layout.project_dir(&self.descriptor.project_url).display()
        ));
        stderr_tail
    }

    fn remove_lock_file(&self) {
        let _ = fs::remove_file(self.slot_dir.join(LOCK_FILE));
    }

    // ------------------------------------------------------------- records

    pub fn to_record(&self) -> ActiveTaskRecord {
        ActiveTaskRecord {
            project_url: self.descriptor.project_url.clone(),
            task_name: self.descriptor.name.clone(),
            task_state: self.state,
            app_version_num: self.descriptor.app_version_num,
            slot: self.slot,
            full_init_done: self.full_init_done,
            checkpoint_cpu_time: self.checkpoint_cpu_time,
            fraction_done: self.fraction_done,
            current_cpu_time: self.current_cpu_time,
            swap_size: self.snapshot.swap_size,
            working_set_size: self.snapshot.working_set_size,
            working_set_size_smoothed: self.snapshot.working_set_size_smoothed,
            page_fault_rate: self.snapshot.page_fault_rate,
            watermarks: self.watermarks,
        }
    }

    pub fn status(&self) -> ActiveTaskStatus {
        ActiveTaskStatus {
            record: self.to_record(),
            scheduler_state: self.scheduler_state,
            pid: self.process.pid(),
            elapsed_time: self.elapsed_time,
            premature_exit_count: self.premature_exit_count,
            too_large: self.too_large,
            needs_shmem: self.needs_shmem,
            want_network: self.want_network,
            supports_graphics: self.supports_graphics,
            graphics_mode_acked: self.graphics_mode_acked,
        }
    }

    /// Drop queued commands and the segment without touching the process.
    /// Used on teardown after the process is already gone.
    pub fn release(&mut self) {
        self.process.detach();
        self.control_queue.clear();
        self.graphics_queue.clear();
    }
}

#[cfg(unix)]
fn link_file(target: &Path, link: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(not(unix))]
fn link_file(target: &Path, link: &Path) -> io::Result<()> {
    fs::copy(target, link).map(|_| ())
}

fn read_tail(path: &Path, max_bytes: u64) -> io::Result<String> {
    let mut file = fs::File::open(path)?;
    let len = file.metadata()?.len();
    if len > max_bytes {
        file.seek(SeekFrom::Start(len - max_bytes))?;
    }
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

fn clear_dir(dir: &Path) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        // symlinks are removed, not followed
        if path.is_dir() && !path.is_symlink() {
            fs::remove_dir_all(&path)?;
        } else {
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}

pub(crate) fn clear_slot_dir(dir: &Path) -> io::Result<()> {
    clear_dir(dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app_msg::MSG_HAVE_TRICKLE_UP;
    use crate::config::{INIT_DATA_FILE, TASK_STATE_FILE};
    use crate::core::SharedSegment;
    use crate::testing::TestBed;
    use test_case::test_case;

    fn started(bed: &TestBed, ctx: &mut SupervisorContext, name: &str) -> ActiveTask {
        let descriptor = Arc::new(bed.descriptor(name).unwrap());
        let mut task = ActiveTask::new(descriptor, 0, &bed.layout);
        assert!(task.try_start(ctx));
        task
    }

    fn exit_with(bed: &TestBed, ctx: &mut SupervisorContext, task: &mut ActiveTask, outcome: ExitOutcome) {
        bed.child(task).unwrap().exit_now(outcome);
        assert!(task.check_exited(ctx));
    }

    #[test]
    fn start_prepares_slot_and_reports() {
        let bed = TestBed::new().unwrap();
        let mut ctx = bed.context();
        let task = started(&bed, &mut ctx, "wu_1");

        assert_eq!(task.state(), TaskState::Executing);
        let slot_dir = bed.layout.slot_dir(0);
        assert!(slot_dir.join(INIT_DATA_FILE).exists());
        assert!(slot_dir.join("in").exists());
        assert_eq!(
            fs::read_to_string(slot_dir.join(LOCK_FILE)).unwrap(),
            task.pid().to_string()
        );
        let child = bed.child(&task).unwrap();
        assert!(child
            .env
            .iter()
            .any(|(key, value)| key == ENV_SHM_NAME && *value == task.segment_name()));
        assert!(matches!(
            ctx.events(),
            [TaskEvent::Started { slot: 0, .. }]
        ));
    }

    #[test]
    fn missing_inputs_wait_without_error() {
        let bed = TestBed::new().unwrap();
        let mut ctx = bed.context();
        let descriptor = bed.descriptor("wu_1").unwrap();
        fs::remove_file(&descriptor.input_files[0].path).unwrap();
        let mut task = ActiveTask::new(Arc::new(descriptor), 0, &bed.layout);

        assert!(!task.try_start(&mut ctx));
        assert_eq!(task.state(), TaskState::Uninitialized);
        assert_eq!(bed.launcher.launch_count(), 0);
        assert!(matches!(
            ctx.events(),
            [TaskEvent::InputsMissing { files, .. }] if files == &vec!["in".to_string()]
        ));
    }

    #[test]
    fn missing_executable_parks_task() {
        let bed = TestBed::new().unwrap();
        let mut ctx = bed.context();
        let mut descriptor = bed.descriptor("wu_1").unwrap();
        descriptor.executable = bed.dir.path().join("nope");
        let mut task = ActiveTask::new(Arc::new(descriptor), 0, &bed.layout);

        assert!(!task.try_start(&mut ctx));
        assert_eq!(task.state(), TaskState::CouldntStart);
        assert!(matches!(
            ctx.events(),
            [TaskEvent::Failed { code: ErrorCode::CouldntStart, reason, .. }] if reason.contains("missing")
        ));
    }

    #[test]
    fn exhausted_shared_memory_is_retried() {
        let bed = TestBed::new().unwrap();
        let mut ctx = bed.context();
        bed.segments.set_exhausted(true);
        let descriptor = Arc::new(bed.descriptor("wu_1").unwrap());
        let mut task = ActiveTask::new(descriptor, 0, &bed.layout);

        assert!(!task.try_start(&mut ctx));
        assert_eq!(task.state(), TaskState::Uninitialized);
        assert!(task.needs_shmem);
        assert!(ctx.events().is_empty());

        bed.segments.set_exhausted(false);
        assert!(task.try_start(&mut ctx));
        assert!(!task.needs_shmem);
    }

    #[test]
    fn opposite_command_is_purged_before_delivery() {
        let bed = TestBed::new().unwrap();
        let mut ctx = bed.context();
        let mut task = started(&bed, &mut ctx, "wu_1");
        let mut worker = bed.worker_end(&task).unwrap();

        // delivered at once, the worker has not read it yet
        assert!(task.suspend(&ctx));
        assert!(task.control_queue().is_empty());
        // channel busy, so resume queues
        assert!(task.unsuspend(&ctx));
        assert_eq!(task.control_queue().len(), 1);
        // and a new suspend cancels the queued resume
        assert!(task.suspend(&ctx));
        assert!(task.control_queue().is_empty());
        assert_eq!(task.state(), TaskState::Suspended);

        assert_eq!(
            worker.recv(ChannelId::ProcessControlRequest).as_deref(),
            Some(MSG_SUSPEND)
        );
        assert!(!task.poll_control_queue(ctx.now()));
        assert_eq!(worker.recv(ChannelId::ProcessControlRequest), None);
    }

    #[test]
    fn premature_exit_budget() {
        let bed = TestBed::new().unwrap();
        let mut ctx = bed.context();
        let mut task = started(&bed, &mut ctx, "wu_1");

        for n in 1..=MAX_PREMATURE_EXITS {
            exit_with(&bed, &mut ctx, &mut task, ExitOutcome::Clean(0));
            assert_eq!(task.state(), TaskState::Uninitialized, "exit {n}");
            assert_eq!(task.premature_exit_count, n);
            assert!(task.try_start(&mut ctx));
        }
        exit_with(&bed, &mut ctx, &mut task, ExitOutcome::Clean(0));
        assert_eq!(task.state(), TaskState::Aborted);
        assert!(matches!(
            ctx.events().last(),
            Some(TaskEvent::Failed { code: ErrorCode::TooManyExits, .. })
        ));
    }

    #[test]
    fn checkpoint_resets_premature_counter() {
        let bed = TestBed::new().unwrap();
        let mut ctx = bed.context();
        let mut task = started(&bed, &mut ctx, "wu_1");
        let mut worker = bed.worker_end(&task).unwrap();
        task.premature_exit_count = 7;

        let status = AppStatus {
            current_cpu_time: Some(12.0),
            checkpoint_cpu_time: Some(10.0),
            fraction_done: Some(0.2),
            ..AppStatus::default()
        };
        assert!(worker.send(ChannelId::AppStatus, &status.to_msg()));
        assert!(task.get_app_status_msg(&mut ctx));

        assert_eq!(task.premature_exit_count, 0);
        assert_eq!(task.watermarks.checkpoint_count, 1);
        assert_eq!(task.checkpoint_wall_time, ctx.now());
        assert!(bed.layout.slot_dir(0).join(TASK_STATE_FILE).exists());

        // same checkpoint again is not a new one
        assert!(worker.send(ChannelId::AppStatus, &status.to_msg()));
        assert!(task.get_app_status_msg(&mut ctx));
        assert_eq!(task.watermarks.checkpoint_count, 1);
        let checkpoints = ctx
            .events()
            .iter()
            .filter(|event| matches!(event, TaskEvent::Checkpointed { .. }))
            .count();
        assert_eq!(checkpoints, 1);
    }

    #[test]
    fn quit_deadline_kills_and_restarts() {
        let bed = TestBed::new().unwrap();
        let mut ctx = bed.context();
        let mut task = started(&bed, &mut ctx, "wu_1");
        let child = bed.child(&task).unwrap();

        assert!(task.request_exit(&ctx, true));
        assert_eq!(task.state(), TaskState::QuitPending);
        bed.clock.advance(5.0);
        assert!(!task.check_deadline(&mut ctx));
        bed.clock.advance(5.5);
        assert!(task.check_deadline(&mut ctx));

        assert!(child.was_killed());
        assert_eq!(task.state(), TaskState::Uninitialized);
        assert!(!bed.segments.is_attached(&task.segment_name()));
    }

    #[test]
    fn abort_deadline_kills_and_reports() {
        let bed = TestBed::new().unwrap();
        let mut ctx = bed.context();
        let mut task = started(&bed, &mut ctx, "wu_1");
        let child = bed.child(&task).unwrap();

        task.abort_task(&mut ctx, ErrorCode::AbortedByUser, "aborted by user");
        assert_eq!(task.state(), TaskState::AbortPending);
        bed.clock.advance(ABORT_TIMEOUT.as_secs_f64() + 1.0);
        assert!(task.check_deadline(&mut ctx));

        assert!(child.was_killed());
        assert_eq!(task.state(), TaskState::Aborted);
        assert!(matches!(
            ctx.events().last(),
            Some(TaskEvent::Failed { code: ErrorCode::AbortedByUser, .. })
        ));
    }

    #[test]
    fn exit_after_quit_restarts_whatever_the_code() {
        let bed = TestBed::new().unwrap();
        let mut ctx = bed.context();
        let mut task = started(&bed, &mut ctx, "wu_1");
        task.request_exit(&ctx, true);
        exit_with(&bed, &mut ctx, &mut task, ExitOutcome::Clean(1));
        assert_eq!(task.state(), TaskState::Uninitialized);
        assert_eq!(task.premature_exit_count, 0);
    }

    #[test_case(ExitOutcome::Clean(3), TaskState::Exited, Some(ErrorCode::NonzeroExit) ; "nonzero code")]
    #[test_case(ExitOutcome::Signaled(11), TaskState::WasSignaled, Some(ErrorCode::Signaled) ; "segfault")]
    #[test_case(
        ExitOutcome::PlatformSpecial { tag: "dll_init_failed", restartable: true },
        TaskState::Uninitialized,
        None ;
        "restartable platform status"
    )]
    #[test_case(
        ExitOutcome::PlatformSpecial { tag: "access_violation", restartable: false },
        TaskState::ExitUnknown,
        Some(ErrorCode::ExitUnknown) ;
        "unknown platform status"
    )]
    fn unrequested_exits(outcome: ExitOutcome, state: TaskState, code: Option<ErrorCode>) {
        let bed = TestBed::new().unwrap();
        let mut ctx = bed.context();
        let mut task = started(&bed, &mut ctx, "wu_1");
        exit_with(&bed, &mut ctx, &mut task, outcome);
        assert_eq!(task.state(), state);
        let reported = ctx.events().iter().find_map(|event| match event {
            TaskEvent::Failed { code, .. } => Some(*code),
            _ => None,
        });
        assert_eq!(reported, code);
    }

    #[cfg(unix)]
    #[test]
    fn benign_signal_restarts() {
        let bed = TestBed::new().unwrap();
        let mut ctx = bed.context();
        let mut task = started(&bed, &mut ctx, "wu_1");
        exit_with(&bed, &mut ctx, &mut task, ExitOutcome::Signaled(libc::SIGTERM));
        assert_eq!(task.state(), TaskState::Uninitialized);
        assert_eq!(task.premature_exit_count, 0);
    }

    #[test]
    fn finished_task_hands_back_outputs() {
        let bed = TestBed::new().unwrap();
        let mut ctx = bed.context();
        let mut task = started(&bed, &mut ctx, "wu_1");
        let slot_dir = bed.layout.slot_dir(0);
        fs::write(slot_dir.join("out"), "result").unwrap();
        fs::write(slot_dir.join(STDERR_FILE), "worker says bye\n").unwrap();
        fs::write(slot_dir.join(FINISH_FILE), "").unwrap();

        exit_with(&bed, &mut ctx, &mut task, ExitOutcome::Clean(0));

        assert_eq!(task.state(), TaskState::Exited);
        let output = &task.descriptor().output_files[0].path;
        assert_eq!(fs::read_to_string(output).unwrap(), "result");
        assert_eq!(fs::read_dir(&slot_dir).unwrap().count(), 0);
        assert!(matches!(
            ctx.events().last(),
            Some(TaskEvent::Finished { exit_code: 0, stderr_tail, .. }) if stderr_tail.contains("bye")
        ));
    }

    #[test]
    fn temporary_exit_is_not_premature() {
        let bed = TestBed::new().unwrap();
        let mut ctx = bed.context();
        let mut task = started(&bed, &mut ctx, "wu_1");
        fs::write(bed.layout.slot_dir(0).join(TEMPORARY_EXIT_FILE), "").unwrap();
        exit_with(&bed, &mut ctx, &mut task, ExitOutcome::Clean(0));
        assert_eq!(task.state(), TaskState::Uninitialized);
        assert_eq!(task.premature_exit_count, 0);
    }

    #[test]
    fn stderr_tail_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(STDERR_FILE);
        let mut content = "x".repeat(STDERR_MAX_BYTES as usize);
        content.insert_str(0, "head");
        fs::write(&path, &content).unwrap();
        let tail = read_tail(&path, STDERR_MAX_BYTES).unwrap();
        assert_eq!(tail.len() as u64, STDERR_MAX_BYTES);
        assert!(!tail.contains("head"));
    }

    #[test]
    fn heartbeat_and_trickles() {
        let bed = TestBed::new().unwrap();
        let mut ctx = bed.context();
        let mut task = started(&bed, &mut ctx, "wu_1");
        let mut worker = bed.worker_end(&task).unwrap();

        assert!(task.send_heartbeat(&ctx));
        assert!(!task.send_heartbeat(&ctx), "previous heartbeat unread");
        assert!(worker
            .recv(ChannelId::Heartbeat)
            .unwrap()
            .starts_with("<heartbeat/>"));

        task.trickle_down_pending = true;
        assert!(task.send_trickle_down());
        assert!(!task.trickle_down_pending);

        worker.send(ChannelId::TrickleUp, MSG_HAVE_TRICKLE_UP);
        assert!(task.get_app_status_msg(&mut ctx));
        assert!(matches!(ctx.events().last(), Some(TaskEvent::TrickleUp { .. })));
    }

    #[test]
    fn graphics_reply_marks_support() {
        let bed = TestBed::new().unwrap();
        let mut ctx = bed.context();
        let mut task = started(&bed, &mut ctx, "wu_1");
        let mut worker = bed.worker_end(&task).unwrap();

        task.request_graphics_mode(GraphicsMode::Window, ctx.now());
        assert_eq!(
            worker.recv(ChannelId::GraphicsRequest).as_deref(),
            Some("<mode_window/>")
        );
        worker.send(ChannelId::GraphicsReply, "<mode_window/>");
        assert!(task.poll_graphics(ctx.now()));
        assert!(task.supports_graphics);
        assert_eq!(task.graphics_mode_acked, GraphicsMode::Window);
    }

    #[test]
    fn record_restore_prefers_newer_slot_checkpoint() {
        let bed = TestBed::new().unwrap();
        let mut ctx = bed.context();
        let task = started(&bed, &mut ctx, "wu_1");
        let mut record = task.to_record();
        record.checkpoint_cpu_time = 5.0;
        SlotCheckpoint {
            project_url: record.project_url.clone(),
            task_name: record.task_name.clone(),
            checkpoint_cpu_time: 9.0,
        }
        .write(task.slot_dir())
        .unwrap();

        let restored = ActiveTask::from_record(&record, task.descriptor().clone(), &bed.layout);
        assert_eq!(restored.state(), TaskState::Uninitialized);
        assert_eq!(restored.scheduler_state, SchedulerState::Scheduled);
        assert_eq!(restored.slot(), 0);
        assert_eq!(restored.checkpoint_cpu_time, 9.0);
        assert!(restored.full_init_done);
    }
}
