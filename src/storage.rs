//! Client state file: the active task set across restarts.

use crate::error::StateFileError;
use crate::logging::debug;
use crate::task_record::{read_json, write_json_atomic, ActiveTaskRecord};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientState {
    pub saved_at: DateTime<Utc>,
    #[serde(default)]
    pub active_tasks: Vec<ActiveTaskRecord>,
}

/// Atomic load/save of `ClientState` at one path.
#[derive(Debug, Clone)]
pub struct StateFile {
    path: PathBuf,
}

impl StateFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A missing file is an empty set, not an error.
    pub fn load(&self) -> Result<Vec<ActiveTaskRecord>, StateFileError> {
        if !self.path.exists() {
            debug(format!("no state file at {}", self.path.display()));
            return Ok(Vec::new());
        }
        let state: ClientState = read_json(&self.path)?;
        Ok(state.active_tasks)
    }

    pub fn save(&self, records: &[ActiveTaskRecord]) -> Result<(), StateFileError> {
        let state = ClientState {
            saved_at: Utc::now(),
            active_tasks: records.to_vec(),
        };
        write_json_atomic(&self.path, &state)?;
        debug(format!(
            "saved {} task records to {}",
            records.len(),
            self.path.display()
        ));
        Ok(())
    }
}
