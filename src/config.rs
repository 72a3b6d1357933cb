use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const SHARED_NAMESPACE: &str = "tw";
pub const ENV_SHM_NAME: &str = "TASKWARDEN_SHM";
pub const ENV_SLOT: &str = "TASKWARDEN_SLOT";
pub const ENV_CONFIG_PREFIX: &str = "TASKWARDEN";

// Message channel geometry. Byte 0 is the unread flag, the text is NUL-terminated.
pub const MSG_CHANNEL_SIZE: usize = 1024;
pub const MSG_CHANNEL_COUNT: usize = 8;
pub const SHARED_SEGMENT_SIZE: usize = MSG_CHANNEL_SIZE * MSG_CHANNEL_COUNT;

pub const ABORT_TIMEOUT: Duration = Duration::from_secs(60);
pub const QUIT_TIMEOUT: Duration = Duration::from_secs(10);
pub const PROCESS_CONTROL_STUCK_TIMEOUT: Duration = Duration::from_secs(180);
pub const EXIT_WAIT: Duration = Duration::from_secs(5);
pub const EXIT_WAIT_POLL: Duration = Duration::from_millis(100);

pub const POLL_MIN_SPACING: Duration = Duration::from_secs(1);
pub const RESOURCE_SAMPLE_PERIOD: Duration = Duration::from_secs(10);
pub const DISK_CHECK_PERIOD: Duration = Duration::from_secs(60);

pub const MAX_PREMATURE_EXITS: u32 = 100;
pub const MAX_START_ATTEMPTS: u32 = 5;
pub const START_RETRY_JITTER_MS: u64 = 200;

pub const STDERR_MAX_BYTES: u64 = 63 * 1024;

// Per-slot files
pub const INIT_DATA_FILE: &str = "init_data.json";
pub const FINISH_FILE: &str = "finish_called";
pub const TEMPORARY_EXIT_FILE: &str = "temporary_exit";
pub const STDERR_FILE: &str = "stderr.txt";
pub const TASK_STATE_FILE: &str = "task_state.json";
pub const LOCK_FILE: &str = "task.lock";

pub const SLOTS_DIR: &str = "slots";
pub const PROJECTS_DIR: &str = "projects";
pub const STATE_FILE: &str = "client_state.json";
pub const CONFIG_FILE: &str = "taskwarden.toml";

/// Preferences that shape how tasks are suspended and how much RAM they may use.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClientPrefs {
    /// Keep suspended workers resident instead of asking them to quit.
    pub leave_apps_in_memory: bool,
    /// Fraction of physical RAM that running tasks may use together.
    pub ram_max_used_frac: f64,
    /// Whether the host currently has network connectivity to offer workers.
    pub network_available: bool,
}

impl Default for ClientPrefs {
    fn default() -> Self {
        Self {
            leave_apps_in_memory: false,
            ram_max_used_frac: 0.9,
            network_available: true,
        }
    }
}

impl ClientPrefs {
    pub fn available_ram(&self, total_ram: f64) -> f64 {
        total_ram * self.ram_max_used_frac.clamp(0.0, 1.0)
    }
}

/// 运行配置（从 taskwarden.toml 与 TASKWARDEN_* 环境变量读取）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub data_dir: PathBuf,
    pub state_file: Option<PathBuf>,
    pub max_running_tasks: usize,
    pub log_level: Option<String>,
    pub log_file: Option<PathBuf>,
    pub prefs: ClientPrefs,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("taskwarden");
        Self {
            data_dir,
            state_file: None,
            max_running_tasks: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            log_level: None,
            log_file: None,
            prefs: ClientPrefs::default(),
        }
    }
}

impl SupervisorConfig {
    /// Defaults, then the TOML file (`path`, or `taskwarden.toml` in the
    /// default data directory if present), then `TASKWARDEN_*` variables.
    /// Nested keys use `__`, e.g. `TASKWARDEN_PREFS__LEAVE_APPS_IN_MEMORY`.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let defaults = Self::default();
        let file = match path {
            Some(path) => ::config::File::from(path).required(true),
            None => ::config::File::from(defaults.data_dir.join(CONFIG_FILE)).required(false),
        };
        let settings = ::config::Config::builder()
            .add_source(::config::Config::try_from(&defaults)?)
            .add_source(file)
            .add_source(
                ::config::Environment::with_prefix(ENV_CONFIG_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    pub fn state_file_path(&self) -> PathBuf {
        self.state_file
            .clone()
            .unwrap_or_else(|| self.data_dir.join(STATE_FILE))
    }
}
