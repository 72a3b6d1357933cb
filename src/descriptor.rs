//! Work descriptions handed to the supervisor and the directory layout it
//! runs them in. Both are owned by project bookkeeping; the core only reads
//! them.

use crate::config::{PROJECTS_DIR, SLOTS_DIR};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceBounds {
    /// CPU seconds; 0 means unlimited.
    pub max_cpu_time: f64,
    /// Bytes of working set; 0 means unlimited.
    pub max_mem_usage: f64,
    /// Bytes of slot directory; 0 means unlimited.
    pub max_disk_usage: f64,
}

/// A file the worker sees in its slot under `open_name`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRef {
    pub open_name: String,
    /// Location in the project directory.
    pub path: PathBuf,
}

/// Where the owning bookkeeping thinks the task is.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DescriptorState {
    New,
    Downloading,
    #[default]
    FilesDownloaded,
    ComputeError,
    FilesUploading,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDescriptor {
    pub project_url: String,
    pub name: String,
    #[serde(default)]
    pub app_name: String,
    #[serde(default)]
    pub app_version_num: u32,
    pub executable: PathBuf,
    #[serde(default)]
    pub command_line: String,
    #[serde(default)]
    pub input_files: Vec<FileRef>,
    #[serde(default)]
    pub output_files: Vec<FileRef>,
    #[serde(default)]
    pub bounds: ResourceBounds,
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
    /// Apps that mostly wait on the GPU or the network gain nothing from
    /// being throttled.
    #[serde(default = "default_true")]
    pub cpu_intensive: bool,
    #[serde(default = "default_ncpus")]
    pub avg_ncpus: f64,
    #[serde(default)]
    pub state: DescriptorState,
}

fn default_true() -> bool {
    true
}

fn default_ncpus() -> f64 {
    1.0
}

impl TaskDescriptor {
    pub fn new(project_url: &str, name: &str, executable: impl Into<PathBuf>) -> Self {
        Self {
            project_url: project_url.to_string(),
            name: name.to_string(),
            app_name: String::new(),
            app_version_num: 0,
            executable: executable.into(),
            command_line: String::new(),
            input_files: Vec::new(),
            output_files: Vec::new(),
            bounds: ResourceBounds::default(),
            deadline: None,
            cpu_intensive: true,
            avg_ncpus: 1.0,
            state: DescriptorState::FilesDownloaded,
        }
    }

    pub fn args(&self) -> Vec<String> {
        self.command_line
            .split_whitespace()
            .map(str::to_string)
            .collect()
    }

    pub fn missing_inputs(&self) -> Vec<String> {
        self.input_files
            .iter()
            .filter(|file| !file.path.exists())
            .map(|file| file.open_name.clone())
            .collect()
    }
}

/// Maps slots and projects to directories.
pub trait PathLayout: Send + Sync {
    fn slot_dir(&self, slot: u32) -> PathBuf;
    fn project_dir(&self, project_url: &str) -> PathBuf;
}

/// `<root>/slots/<n>` and `<root>/projects/<escaped url>`.
#[derive(Debug, Clone)]
pub struct DataDirLayout {
    root: PathBuf,
}

impl DataDirLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn slots_dir(&self) -> PathBuf {
        self.root.join(SLOTS_DIR)
    }
}

impl PathLayout for DataDirLayout {
    fn slot_dir(&self, slot: u32) -> PathBuf {
        self.slots_dir().join(slot.to_string())
    }

    fn project_dir(&self, project_url: &str) -> PathBuf {
        self.root.join(PROJECTS_DIR).join(escape_project_url(project_url))
    }
}

pub fn escape_project_url(url: &str) -> String {
    let trimmed = url
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .trim_end_matches('/');
    trimmed
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
        .collect()
}
