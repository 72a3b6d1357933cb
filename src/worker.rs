//! Worker side of the slot protocol.
//!
//! A worker finds its segment through `TASKWARDEN_SHM` (or `init_data.json`
//! in its working directory), takes commands from process_control_request,
//! reports on app_status and leaves `finish_called` behind when it is done.

use crate::app_msg::{has_tag, AppStatus, ControlCommand, MSG_HAVE_TRICKLE_UP};
use crate::config::{ENV_SHM_NAME, FINISH_FILE, TEMPORARY_EXIT_FILE};
use crate::core::{ChannelId, SharedSegment, ShmemSegment};
use crate::error::TaskwardenResult;
use crate::task_record::InitData;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

pub struct WorkerSession {
    segment: Box<dyn SharedSegment>,
    init: InitData,
    slot_dir: PathBuf,
    suspended: bool,
    quit_requested: bool,
    abort_requested: bool,
    network_available: bool,
    trickle_down_pending: bool,
    last_heartbeat_wss: Option<f64>,
}

impl WorkerSession {
    /// Attach from inside a slot directory started by the supervisor.
    pub fn from_env() -> TaskwardenResult<Self> {
        let slot_dir = std::env::current_dir()?;
        let init = InitData::read(&slot_dir)?;
        let name = std::env::var(ENV_SHM_NAME).unwrap_or_else(|_| init.shm_name.clone());
        let segment = ShmemSegment::open(&name)?;
        Ok(Self::with_segment(Box::new(segment), init, slot_dir))
    }

    pub fn with_segment(segment: Box<dyn SharedSegment>, init: InitData, slot_dir: PathBuf) -> Self {
        Self {
            network_available: init.network_available,
            segment,
            init,
            slot_dir,
            suspended: false,
            quit_requested: false,
            abort_requested: false,
            trickle_down_pending: false,
            last_heartbeat_wss: None,
        }
    }

    pub fn init(&self) -> &InitData {
        &self.init
    }

    pub fn slot_dir(&self) -> &Path {
        &self.slot_dir
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    pub fn quit_requested(&self) -> bool {
        self.quit_requested
    }

    pub fn abort_requested(&self) -> bool {
        self.abort_requested
    }

    pub fn network_available(&self) -> bool {
        self.network_available
    }

    pub fn last_heartbeat_wss(&self) -> Option<f64> {
        self.last_heartbeat_wss
    }

    /// Read one control command, if any, and apply it to the session flags.
    pub fn poll_control(&mut self) -> Option<ControlCommand> {
        let msg = self.segment.recv(ChannelId::ProcessControlRequest)?;
        let command = ControlCommand::parse(&msg)?;
        match command {
            ControlCommand::Suspend => self.suspended = true,
            ControlCommand::Resume => self.suspended = false,
            ControlCommand::Quit => self.quit_requested = true,
            ControlCommand::Abort => self.abort_requested = true,
        }
        Some(command)
    }

    /// Consume heartbeat and trickle-down notices.
    pub fn poll_client(&mut self) {
        if let Some(msg) = self.segment.recv(ChannelId::Heartbeat) {
            self.network_available = has_tag(&msg, "network_available");
            self.last_heartbeat_wss = crate::app_msg::parse_f64(&msg, "wss");
        }
        if let Some(msg) = self.segment.recv(ChannelId::TrickleDown) {
            self.trickle_down_pending |= has_tag(&msg, "have_trickle_down");
        }
    }

    /// Returns and clears the trickle-down flag.
    pub fn take_trickle_down(&mut self) -> bool {
        std::mem::take(&mut self.trickle_down_pending)
    }

    /// Send a status report. False if the last one is still unread.
    pub fn report_status(&mut self, status: &AppStatus) -> bool {
        self.segment.send(ChannelId::AppStatus, &status.to_msg())
    }

    /// Replace any unread report so the client sees the latest values.
    /// Used for the last report before exiting.
    pub fn force_status(&mut self, status: &AppStatus) {
        self.segment.force(ChannelId::AppStatus, &status.to_msg());
    }

    pub fn send_trickle_up(&mut self) -> bool {
        self.segment.send(ChannelId::TrickleUp, MSG_HAVE_TRICKLE_UP)
    }

    /// Leave the finish marker; the exit that follows counts as success.
    pub fn finish(&self) -> io::Result<()> {
        fs::write(self.slot_dir.join(FINISH_FILE), "")
    }

    /// Ask to be restarted later without counting as a premature exit.
    pub fn temporary_exit(&self) -> io::Result<()> {
        fs::write(self.slot_dir.join(TEMPORARY_EXIT_FILE), "")
    }
}
