//! The supervisory loop over all active tasks.
//!
//! `poll` is called about once a second by the owner. It never fails: every
//! per-task problem is logged and reported against that task's project.

use crate::active_task::{clear_slot_dir, ActiveTask, SchedulerState, TaskState};
use crate::app_msg::GraphicsMode;
use crate::config::{
    DISK_CHECK_PERIOD, EXIT_WAIT, EXIT_WAIT_POLL, LOCK_FILE, POLL_MIN_SPACING,
    PROCESS_CONTROL_STUCK_TIMEOUT, RESOURCE_SAMPLE_PERIOD,
};
use crate::context::{SupervisorContext, TaskEvent};
use crate::descriptor::{DescriptorState, TaskDescriptor};
use crate::error::{ErrorCode, StateFileError, TaskwardenError, TaskwardenResult};
use crate::logging::{debug, internal_error, warn};
use crate::platform::process_alive;
use crate::storage::StateFile;
use crate::task_record::{ActiveTaskRecord, ActiveTaskStatus};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

const MB: f64 = 1024.0 * 1024.0;

#[derive(Default)]
pub struct ActiveTaskSet {
    tasks: Vec<ActiveTask>,
    last_poll: Option<f64>,
    last_resource_sample: Option<f64>,
    last_disk_check: Option<f64>,
}

impl ActiveTaskSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn tasks(&self) -> &[ActiveTask] {
        &self.tasks
    }

    pub fn get(&self, slot: u32) -> Option<&ActiveTask> {
        self.tasks.iter().find(|task| task.slot() == slot)
    }

    pub fn get_mut(&mut self, slot: u32) -> Option<&mut ActiveTask> {
        self.tasks.iter_mut().find(|task| task.slot() == slot)
    }

    pub fn lookup(&self, project_url: &str, task_name: &str) -> Option<&ActiveTask> {
        self.tasks
            .iter()
            .find(|task| task.project_url() == project_url && task.name() == task_name)
    }

    fn task_mut(&mut self, slot: u32) -> TaskwardenResult<&mut ActiveTask> {
        self.get_mut(slot).ok_or(TaskwardenError::SlotNotFound(slot))
    }

    /// Tasks that still have a worker process.
    pub fn running_count(&self) -> usize {
        self.tasks.iter().filter(|task| task.has_process()).count()
    }

    // ------------------------------------------------------------- poll

    /// One supervisory pass. Returns true if anything changed that is
    /// worth persisting.
    pub fn poll(&mut self, ctx: &mut SupervisorContext) -> bool {
        let now = ctx.now();
        if let Some(last) = self.last_poll {
            if now - last < POLL_MIN_SPACING.as_secs_f64() {
                return false;
            }
        }
        self.last_poll = Some(now);

        let mut action = self.handle_exited_apps(ctx);
        self.send_heartbeats(ctx);
        action |= self.send_trickle_downs();
        self.graphics_poll(ctx);
        action |= self.process_control_poll(ctx);
        self.refresh_resource_usage(ctx);
        action |= self.check_rsc_limits_exceeded(ctx);
        action |= self.get_msgs(ctx);
        action |= self.check_deadlines(ctx);
        action
    }

    pub fn handle_exited_apps(&mut self, ctx: &mut SupervisorContext) -> bool {
        let mut action = false;
        for task in self.tasks.iter_mut() {
            action |= task.check_exited(ctx);
        }
        action
    }

    pub fn send_heartbeats(&mut self, ctx: &SupervisorContext) {
        for task in self.tasks.iter_mut().filter(|task| task.has_process()) {
            task.send_heartbeat(ctx);
        }
    }

    pub fn send_trickle_downs(&mut self) -> bool {
        let mut action = false;
        for task in self.tasks.iter_mut().filter(|task| task.has_process()) {
            action |= task.send_trickle_down();
        }
        action
    }

    pub fn graphics_poll(&mut self, ctx: &SupervisorContext) {
        let now = ctx.now();
        for task in self.tasks.iter_mut().filter(|task| task.has_process()) {
            task.poll_graphics(now);
        }
    }

    /// Push queued commands; a worker that hasn't taken its head command
    /// for `PROCESS_CONTROL_STUCK_TIMEOUT` is killed and restarted.
    pub fn process_control_poll(&mut self, ctx: &mut SupervisorContext) -> bool {
        let now = ctx.now();
        let threshold = PROCESS_CONTROL_STUCK_TIMEOUT.as_secs_f64();
        let mut action = false;
        for task in self.tasks.iter_mut().filter(|task| task.has_process()) {
            task.poll_control_queue(now);
            if task.control_queue().is_stuck(now, threshold) {
                warn(format!(
                    "slot {}: task {} hasn't taken a control message for {}s; restarting",
                    task.slot(),
                    task.name(),
                    threshold
                ));
                task.kill_task(ctx, true);
                action = true;
            }
        }
        action
    }

    /// Sample every running worker at most once per `RESOURCE_SAMPLE_PERIOD`.
    /// A failed batch leaves the old snapshots alone.
    pub fn refresh_resource_usage(&mut self, ctx: &mut SupervisorContext) {
        let now = ctx.now();
        if let Some(last) = self.last_resource_sample {
            if now - last < RESOURCE_SAMPLE_PERIOD.as_secs_f64() {
                return;
            }
        }
        let pids: Vec<u32> = self
            .tasks
            .iter()
            .filter(|task| task.has_process() && task.pid() != 0)
            .map(ActiveTask::pid)
            .collect();
        if pids.is_empty() {
            self.last_resource_sample = Some(now);
            return;
        }
        let samples = match ctx.sampler.sample(&pids) {
            Ok(samples) => samples,
            Err(err) => {
                warn(format!("resource sampling failed, keeping old values: {err}"));
                return;
            }
        };
        let elapsed = self.last_resource_sample.map_or(0.0, |last| now - last);
        for task in self.tasks.iter_mut() {
            if let Some(sample) = samples.get(&task.pid()) {
                task.snapshot.update(sample, elapsed);
                task.observe_snapshot();
            }
        }
        self.last_resource_sample = Some(now);
    }

    /// Check executing tasks in order against their own limits and against
    /// the RAM left over by the tasks before them.
    pub fn check_rsc_limits_exceeded(&mut self, ctx: &mut SupervisorContext) -> bool {
        let now = ctx.now();
        let check_disk = self
            .last_disk_check
            .map_or(true, |last| now - last >= DISK_CHECK_PERIOD.as_secs_f64());
        if check_disk {
            self.last_disk_check = Some(now);
        }

        let mut ram_left = ctx.available_ram;
        let mut action = false;
        for task in self.tasks.iter_mut() {
            if task.state() != TaskState::Executing {
                continue;
            }
            if task.max_cpu_time > 0.0 && task.current_cpu_time > task.max_cpu_time {
                let reason = format!(
                    "Maximum CPU time exceeded: limit {:.2} s, used {:.2} s",
                    task.max_cpu_time, task.current_cpu_time
                );
                task.abort_task(ctx, ErrorCode::ResourceLimitExceeded, &reason);
                action = true;
                continue;
            }
            let wss = task.snapshot.working_set_size_smoothed;
            if task.max_mem_usage > 0.0 && wss > task.max_mem_usage {
                let reason = format!(
                    "Working set size exceeded: limit {:.2} MB, used {:.2} MB",
                    task.max_mem_usage / MB,
                    wss / MB
                );
                task.abort_task(ctx, ErrorCode::ResourceLimitExceeded, &reason);
                action = true;
                continue;
            }
            if check_disk && task.max_disk_usage > 0.0 {
                let usage = task.current_disk_usage();
                if usage > task.max_disk_usage {
                    let reason = format!(
                        "Maximum disk usage exceeded: limit {:.2} MB, used {:.2} MB",
                        task.max_disk_usage / MB,
                        usage / MB
                    );
                    task.abort_task(ctx, ErrorCode::ResourceLimitExceeded, &reason);
                    action = true;
                    continue;
                }
            }
            if ctx.available_ram > 0.0 {
                if wss > ram_left {
                    if !task.too_large {
                        debug(format!(
                            "slot {}: working set {:.1} MB exceeds remaining {:.1} MB",
                            task.slot(),
                            wss / MB,
                            ram_left.max(0.0) / MB
                        ));
                        task.too_large = true;
                        ctx.emit(TaskEvent::RescheduleRequested {
                            reason: format!("{} is too large for available RAM", task.name()),
                        });
                        action = true;
                    }
                } else {
                    task.too_large = false;
                }
                ram_left -= wss;
            }
        }
        action
    }

    pub fn get_msgs(&mut self, ctx: &mut SupervisorContext) -> bool {
        let mut action = false;
        for task in self.tasks.iter_mut().filter(|task| task.has_process()) {
            action |= task.get_app_status_msg(ctx);
        }
        action
    }

    pub fn check_deadlines(&mut self, ctx: &mut SupervisorContext) -> bool {
        let mut action = false;
        for task in self.tasks.iter_mut() {
            action |= task.check_deadline(ctx);
        }
        action
    }

    // ------------------------------------------------------------ slots

    /// Lowest slot no task holds whose directory can be emptied.
    pub fn get_free_slot(&self, ctx: &SupervisorContext) -> TaskwardenResult<u32> {
        let mut slot = 0;
        loop {
            if !self.tasks.iter().any(|task| task.slot() == slot) {
                let dir = ctx.layout.slot_dir(slot);
                if prepare_slot_dir(&dir)? {
                    return Ok(slot);
                }
            }
            slot += 1;
        }
    }

    /// False (and an internal error logged) if two tasks share a slot.
    pub fn check_slot_uniqueness(&self) -> bool {
        let mut seen = HashSet::new();
        let mut unique = true;
        for task in &self.tasks {
            if !seen.insert(task.slot()) {
                internal_error(format!("slot {} is used by more than one task", task.slot()));
                unique = false;
            }
        }
        unique
    }

    // -------------------------------------------------------- operations

    /// Put a descriptor into a fresh slot and start it.
    pub fn start_task(
        &mut self,
        ctx: &mut SupervisorContext,
        descriptor: Arc<TaskDescriptor>,
    ) -> TaskwardenResult<u32> {
        if self.lookup(&descriptor.project_url, &descriptor.name).is_some() {
            return Err(TaskwardenError::InvalidState {
                task: descriptor.name.clone(),
                message: "already active".to_string(),
            });
        }
        let slot = self.get_free_slot(ctx)?;
        let mut task = ActiveTask::new(descriptor, slot, ctx.layout.as_ref());
        task.scheduler_state = SchedulerState::Scheduled;
        task.try_start(ctx);
        self.tasks.push(task);
        self.check_slot_uniqueness();
        Ok(slot)
    }

    /// Start tasks that should be running but aren't: restart-eligible
    /// exits and tasks waiting for shared memory.
    pub fn start_scheduled(&mut self, ctx: &mut SupervisorContext) -> bool {
        let mut action = false;
        for task in self.tasks.iter_mut() {
            if task.state() == TaskState::Uninitialized
                && task.scheduler_state == SchedulerState::Scheduled
            {
                action |= task.try_start(ctx);
            }
        }
        action
    }

    pub fn suspend_task(&mut self, ctx: &SupervisorContext, slot: u32) -> TaskwardenResult<bool> {
        let task = self.task_mut(slot)?;
        task.scheduler_state = SchedulerState::Preempted;
        Ok(task.suspend(ctx))
    }

    pub fn resume_task(&mut self, ctx: &mut SupervisorContext, slot: u32) -> TaskwardenResult<bool> {
        Ok(self.task_mut(slot)?.resume_or_start(ctx))
    }

    /// Operator abort.
    pub fn abort_task(&mut self, ctx: &mut SupervisorContext, slot: u32) -> TaskwardenResult<()> {
        let task = self.task_mut(slot)?;
        task.abort_task(ctx, ErrorCode::AbortedByUser, "aborted by user");
        Ok(())
    }

    /// Suspend every executing task. CPU throttling skips tasks that gain
    /// nothing from it and always leaves the rest in memory.
    pub fn suspend_all(&mut self, ctx: &SupervisorContext, cpu_throttle: bool) {
        for task in self.tasks.iter_mut() {
            if task.state() != TaskState::Executing {
                continue;
            }
            if cpu_throttle {
                let descriptor = task.descriptor();
                if !descriptor.cpu_intensive || descriptor.avg_ncpus < 1.0 {
                    continue;
                }
                task.preempt(ctx, false);
            } else {
                // nothing to lose by keeping a task that never checkpointed
                let remove = !ctx.prefs.leave_apps_in_memory && task.checkpoint_cpu_time > 0.0;
                task.preempt(ctx, remove);
            }
        }
    }

    pub fn unsuspend_all(&mut self, ctx: &mut SupervisorContext) -> bool {
        let mut action = false;
        for task in self.tasks.iter_mut() {
            if task.scheduler_state == SchedulerState::Preempted {
                action |= task.resume_or_start(ctx);
            }
        }
        action
    }

    pub fn trickle_down_ready(&mut self, project_url: &str) {
        for task in self
            .tasks
            .iter_mut()
            .filter(|task| task.project_url() == project_url)
        {
            task.trickle_down_pending = true;
        }
    }

    pub fn request_graphics_mode(
        &mut self,
        ctx: &SupervisorContext,
        slot: u32,
        mode: GraphicsMode,
    ) -> TaskwardenResult<()> {
        let now = ctx.now();
        self.task_mut(slot)?.request_graphics_mode(mode, now);
        Ok(())
    }

    // --------------------------------------------------------- shutdown

    /// Ask the tasks to quit, wait, kill the stragglers, wait again.
    pub fn exit_tasks(&mut self, ctx: &mut SupervisorContext, project_url: Option<&str>) {
        for task in self.tasks.iter_mut() {
            if matches_project(task, project_url) {
                task.request_exit(ctx, true);
            }
        }
        if !self.wait_for_exit(ctx, EXIT_WAIT, project_url) {
            self.kill_tasks(ctx, project_url);
            self.wait_for_exit(ctx, EXIT_WAIT, project_url);
        }
        self.get_msgs(ctx);
    }

    /// Force-kill every matching task that still has a process.
    pub fn kill_tasks(&mut self, ctx: &mut SupervisorContext, project_url: Option<&str>) {
        for task in self.tasks.iter_mut() {
            if matches_project(task, project_url) && task.has_process() {
                task.kill_task(ctx, true);
            }
        }
    }

    /// Poll in short steps until no matching task has a process.
    pub fn wait_for_exit(
        &mut self,
        ctx: &mut SupervisorContext,
        timeout: Duration,
        project_url: Option<&str>,
    ) -> bool {
        let deadline = ctx.now() + timeout.as_secs_f64();
        loop {
            let mut remaining = 0;
            for task in self.tasks.iter_mut() {
                if !matches_project(task, project_url) || !task.has_process() {
                    continue;
                }
                if !task.check_exited(ctx) {
                    remaining += 1;
                }
            }
            if remaining == 0 {
                return true;
            }
            if ctx.now() >= deadline {
                debug(format!("{remaining} tasks still running after {timeout:?}"));
                return false;
            }
            ctx.clock.sleep(EXIT_WAIT_POLL);
        }
    }

    /// Detach or reset: stop the project's tasks and forget them.
    pub fn remove_project(&mut self, ctx: &mut SupervisorContext, project_url: &str) -> usize {
        self.exit_tasks(ctx, Some(project_url));
        let before = self.tasks.len();
        self.tasks.retain_mut(|task| {
            if task.project_url() != project_url {
                return true;
            }
            task.release();
            if let Err(err) = clear_slot_dir(task.slot_dir()) {
                warn(format!("slot {}: can't clean slot directory: {}", task.slot(), err));
            }
            false
        });
        before - self.tasks.len()
    }

    /// Drop tasks in a terminal state. Their reports went out when they ended.
    pub fn purge_terminal(&mut self) -> usize {
        let before = self.tasks.len();
        self.tasks.retain(|task| !task.state().is_terminal());
        before - self.tasks.len()
    }

    // ------------------------------------------------------ persistence

    pub fn write_records(&self) -> Vec<ActiveTaskRecord> {
        self.tasks.iter().map(ActiveTask::to_record).collect()
    }

    pub fn status(&self) -> Vec<ActiveTaskStatus> {
        self.tasks.iter().map(ActiveTask::status).collect()
    }

    pub fn save(&self, file: &StateFile) -> Result<(), StateFileError> {
        file.save(&self.write_records())
    }

    /// Rebuild tasks from persisted records. Records naming an unknown task,
    /// a task that isn't ready to run, or a slot already taken are logged
    /// and skipped. Returns how many were restored.
    pub fn parse_records<F>(
        &mut self,
        ctx: &SupervisorContext,
        records: &[ActiveTaskRecord],
        find_descriptor: F,
    ) -> usize
    where
        F: Fn(&str, &str) -> Option<Arc<TaskDescriptor>>,
    {
        let mut restored = 0;
        for record in records {
            let Some(descriptor) = find_descriptor(&record.project_url, &record.task_name) else {
                internal_error(format!(
                    "state file names unknown task {} of {}",
                    record.task_name, record.project_url
                ));
                continue;
            };
            if descriptor.state != DescriptorState::FilesDownloaded {
                internal_error(format!(
                    "task {} is in state {:?}, not ready to run",
                    record.task_name, descriptor.state
                ));
                continue;
            }
            if self.get(record.slot).is_some() {
                internal_error(format!(
                    "task {} claims slot {} which is already taken",
                    record.task_name, record.slot
                ));
                continue;
            }
            if self.lookup(&record.project_url, &record.task_name).is_some() {
                internal_error(format!("task {} listed twice", record.task_name));
                continue;
            }
            let task = ActiveTask::from_record(record, descriptor, ctx.layout.as_ref());
            self.tasks.push(task);
            restored += 1;
        }
        self.check_slot_uniqueness();
        restored
    }

    /// Load and parse in one go. A missing file restores nothing.
    pub fn load<F>(
        &mut self,
        ctx: &SupervisorContext,
        file: &StateFile,
        find_descriptor: F,
    ) -> Result<usize, StateFileError>
    where
        F: Fn(&str, &str) -> Option<Arc<TaskDescriptor>>,
    {
        let records = file.load()?;
        Ok(self.parse_records(ctx, &records, find_descriptor))
    }
}

fn matches_project(task: &ActiveTask, project_url: Option<&str>) -> bool {
    project_url.map_or(true, |url| task.project_url() == url)
}

/// Ok(true) if `dir` is now an empty directory we may use. A directory
/// whose lock names a live process belongs to a worker from an earlier run.
fn prepare_slot_dir(dir: &Path) -> TaskwardenResult<bool> {
    if !dir.exists() {
        fs::create_dir_all(dir)?;
        return Ok(true);
    }
    if let Some(pid) = read_lock_pid(dir) {
        if process_alive(pid) {
            debug(format!("{} is held by live pid {}", dir.display(), pid));
            return Ok(false);
        }
    }
    match clear_slot_dir(dir) {
        Ok(()) => Ok(true),
        Err(err) => {
            warn(format!("can't clean {}: {}", dir.display(), err));
            Ok(false)
        }
    }
}

/// Pid recorded in a slot's lock file, if any.
pub fn read_lock_pid(dir: &Path) -> Option<u32> {
    fs::read_to_string(dir.join(LOCK_FILE))
        .ok()?
        .trim()
        .parse()
        .ok()
}
