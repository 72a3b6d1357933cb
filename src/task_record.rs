//! Persisted forms of an active task, plus the small JSON files that live in
//! each slot directory.

use crate::active_task::{SchedulerState, TaskState, Watermarks};
use crate::app_msg::GraphicsMode;
use crate::config::{INIT_DATA_FILE, TASK_STATE_FILE};
use crate::descriptor::ResourceBounds;
use crate::error::{StartError, StateFileError};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;

/// What survives a client restart for one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveTaskRecord {
    pub project_url: String,
    pub task_name: String,
    pub task_state: TaskState,
    #[serde(default)]
    pub app_version_num: u32,
    pub slot: u32,
    #[serde(default)]
    pub full_init_done: bool,
    #[serde(default)]
    pub checkpoint_cpu_time: f64,
    #[serde(default)]
    pub fraction_done: f64,
    #[serde(default)]
    pub current_cpu_time: f64,
    #[serde(default)]
    pub swap_size: f64,
    #[serde(default)]
    pub working_set_size: f64,
    #[serde(default)]
    pub working_set_size_smoothed: f64,
    #[serde(default)]
    pub page_fault_rate: f64,
    #[serde(default)]
    pub watermarks: Watermarks,
}

/// The record plus live-only fields, for status output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveTaskStatus {
    #[serde(flatten)]
    pub record: ActiveTaskRecord,
    pub scheduler_state: SchedulerState,
    pub pid: u32,
    pub elapsed_time: f64,
    pub premature_exit_count: u32,
    pub too_large: bool,
    pub needs_shmem: bool,
    pub want_network: bool,
    pub supports_graphics: bool,
    pub graphics_mode_acked: GraphicsMode,
}

/// Written to the slot before every start; the worker reads it on startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitData {
    pub project_url: String,
    pub task_name: String,
    #[serde(default)]
    pub app_name: String,
    pub slot: u32,
    pub shm_name: String,
    #[serde(default)]
    pub bounds: ResourceBounds,
    #[serde(default)]
    pub checkpoint_cpu_time: f64,
    #[serde(default)]
    pub network_available: bool,
}

impl InitData {
    pub fn write(&self, slot_dir: &Path) -> Result<(), StartError> {
        let path = slot_dir.join(INIT_DATA_FILE);
        write_json_atomic(&path, self).map_err(|err| StartError::WriteInitFile {
            path: path.clone(),
            source: match err {
                StateFileError::Io { source, .. } => source,
                StateFileError::Persist(err) => err.error,
                StateFileError::Parse(err) => err.into(),
            },
        })
    }

    pub fn read(slot_dir: &Path) -> Result<Self, StateFileError> {
        read_json(&slot_dir.join(INIT_DATA_FILE))
    }
}

/// Checkpoint copy kept in the slot. Outlives a crash between the
/// checkpoint and the next full state write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotCheckpoint {
    pub project_url: String,
    pub task_name: String,
    pub checkpoint_cpu_time: f64,
}

impl SlotCheckpoint {
    pub fn write(&self, slot_dir: &Path) -> Result<(), StateFileError> {
        write_json_atomic(&slot_dir.join(TASK_STATE_FILE), self)
    }

    /// None if absent or unreadable.
    pub fn read(slot_dir: &Path) -> Option<Self> {
        read_json(&slot_dir.join(TASK_STATE_FILE)).ok()
    }
}

/// Write through a temp file in the same directory, then rename.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), StateFileError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let io_err = |source| StateFileError::Io {
        path: path.to_path_buf(),
        source,
    };
    fs::create_dir_all(dir).map_err(io_err)?;
    let mut tmp = NamedTempFile::new_in(dir).map_err(io_err)?;
    serde_json::to_writer_pretty(&mut tmp, value)?;
    tmp.flush().map_err(io_err)?;
    tmp.persist(path)?;
    Ok(())
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, StateFileError> {
    let content = fs::read_to_string(path).map_err(|source| StateFileError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(serde_json::from_str(&content)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn record() -> ActiveTaskRecord {
        ActiveTaskRecord {
            project_url: "http://p.org/".into(),
            task_name: "wu_7".into(),
            task_state: TaskState::Executing,
            app_version_num: 712,
            slot: 3,
            full_init_done: true,
            checkpoint_cpu_time: 41.5,
            fraction_done: 0.3,
            current_cpu_time: 44.0,
            swap_size: 1.0e8,
            working_set_size: 5.0e7,
            working_set_size_smoothed: 4.5e7,
            page_fault_rate: 2.0,
            watermarks: Watermarks {
                peak_working_set_size: 6.0e7,
                checkpoint_count: 4,
                ..Watermarks::default()
            },
        }
    }

    #[test]
    fn record_uses_snake_case_states() {
        let json = serde_json::to_string(&record()).unwrap();
        assert!(json.contains("\"task_state\":\"executing\""));
        let back: ActiveTaskRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record());
    }

    #[test]
    fn old_records_fill_defaults() {
        let json = r#"{"project_url":"u","task_name":"t","task_state":"suspended","slot":0}"#;
        let parsed: ActiveTaskRecord = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.checkpoint_cpu_time, 0.0);
        assert_eq!(parsed.watermarks, Watermarks::default());
    }

    #[test]
    fn slot_checkpoint_survives_rewrite() {
        let dir = tempfile::tempdir().unwrap();
        assert!(SlotCheckpoint::read(dir.path()).is_none());
        let mut checkpoint = SlotCheckpoint {
            project_url: "u".into(),
            task_name: "t".into(),
            checkpoint_cpu_time: 10.0,
        };
        checkpoint.write(dir.path()).unwrap();
        checkpoint.checkpoint_cpu_time = 20.0;
        checkpoint.write(dir.path()).unwrap();
        assert_eq!(SlotCheckpoint::read(dir.path()), Some(checkpoint));
    }

    #[test]
    fn init_data_lands_in_slot() {
        let dir = tempfile::tempdir().unwrap();
        let init = InitData {
            project_url: "u".into(),
            task_name: "t".into(),
            app_name: "app".into(),
            slot: 2,
            shm_name: "/tw_00".into(),
            bounds: ResourceBounds::default(),
            checkpoint_cpu_time: 0.0,
            network_available: true,
        };
        init.write(dir.path()).unwrap();
        assert!(dir.path().join(INIT_DATA_FILE).exists());
        assert_eq!(InitData::read(dir.path()).unwrap(), init);
    }
}
