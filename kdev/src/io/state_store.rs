//! Persisted checkpoint of the kernel build pipeline.
//!
//! The record lives at `.state/kernel_state.json` as `{"state": "<NAME>"}`.
//! Reads never fail the caller: a missing or unreadable record means
//! `NOT_INIT`. Writes go through a temp file and a rename so a crash leaves
//! either the old record or the new one.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::types::BuildState;
use crate::error::{ProvisionError, Result};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct StateRecord {
    state: BuildState,
}

/// File-backed store for the current [`BuildState`].
#[derive(Debug, Clone)]
pub struct BuildStateStore {
    path: PathBuf,
}

impl BuildStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the raw record. `Ok(None)` when no record exists.
    pub fn load(&self) -> Result<Option<BuildState>> {
        debug!(path = %self.path.display(), "loading build state");
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(self.persistence_error(e.to_string())),
        };
        let record: StateRecord = serde_json::from_str(&contents)
            .map_err(|e| self.persistence_error(format!("parse: {e}")))?;
        Ok(Some(record.state))
    }

    /// Current state, degrading to `NOT_INIT` when the record is unusable.
    pub fn get_state(&self) -> BuildState {
        match self.load() {
            Ok(Some(state)) => state,
            Ok(None) => BuildState::default(),
            Err(err) => {
                warn!(err = %err, "discarding unusable build state, starting from NOT_INIT");
                BuildState::default()
            }
        }
    }

    /// Atomically replace the record (temp file + rename).
    pub fn set_state(&self, state: BuildState) -> Result<()> {
        debug!(path = %self.path.display(), state = %state, "writing build state");
        let mut buf = serde_json::to_string_pretty(&StateRecord { state })
            .map_err(|e| self.persistence_error(format!("serialize: {e}")))?;
        buf.push('\n');
        self.write_atomic(&buf)
            .map_err(|e| self.persistence_error(e.to_string()))
    }

    /// Remove the record; the next read yields `NOT_INIT`.
    pub fn clear(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(self.persistence_error(e.to_string())),
        }
    }

    fn write_atomic(&self, contents: &str) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp_path = self.path.with_extension("json.tmp");
        fs::write(&tmp_path, contents)?;
        fs::rename(&tmp_path, &self.path)
    }

    fn persistence_error(&self, reason: String) -> ProvisionError {
        ProvisionError::Persistence {
            path: self.path.clone(),
            reason,
        }
    }
}
