//! Advisory workflow state.
//!
//! `state.json` maps phase name -> last-run summary. Phase reports are kept
//! next to it as `<phase>_report.json`. Nothing here is ever consulted to
//! decide whether a file gets written.

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    sync::Mutex,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use tracing::{debug, warn};

use crate::{core::errors::EngineError, infra::io::write_json_atomic};

const STATE_FILE: &str = "state.json";

/// One phase entry in `state.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub updated_at: DateTime<Utc>,
    pub data: Value,
}

#[derive(Debug)]
pub struct StateTracker {
    state_dir: PathBuf,
    // serialises read-modify-write of state.json within the process
    lock: Mutex<()>,
}

impl StateTracker {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    fn state_path(&self) -> PathBuf {
        self.state_dir.join(STATE_FILE)
    }

    pub fn report_path(&self, phase: &str) -> PathBuf {
        self.state_dir.join(format!("{phase}_report.json"))
    }

    fn read_all(&self) -> Result<BTreeMap<String, PhaseRecord>, EngineError> {
        let path = self.state_path();
        let text = match fs::read_to_string(&path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(EngineError::State(format!("read {}: {e}", path.display()))),
        };
        serde_json::from_str(&text)
            .map_err(|e| EngineError::State(format!("parse {}: {e}", path.display())))
    }

    fn with_state<R>(
        &self,
        f: impl FnOnce(&mut BTreeMap<String, PhaseRecord>) -> R,
    ) -> Result<R, EngineError> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| EngineError::State("state lock poisoned".into()))?;
        let mut all = match self.read_all() {
            Ok(all) => all,
            Err(e) => {
                warn!(error = %e, "discarding unreadable state file");
                BTreeMap::new()
            }
        };
        let out = f(&mut all);
        write_json_atomic(&self.state_path(), &all)
            .map_err(|e| EngineError::State(e.to_string()))?;
        Ok(out)
    }

    /// Replace the record for `phase`.
    pub fn save_state(&self, phase: &str, data: Value) -> Result<(), EngineError> {
        debug!(phase, "saving state");
        self.with_state(|all| {
            all.insert(
                phase.to_string(),
                PhaseRecord {
                    updated_at: Utc::now(),
                    data,
                },
            );
        })
    }

    /// Data last saved for `phase`, if any.
    pub fn load_state(&self, phase: &str) -> Result<Option<Value>, EngineError> {
        Ok(self.read_all()?.remove(phase).map(|r| r.data))
    }

    /// Drop `phase`; returns whether it was present.
    pub fn clear_state(&self, phase: &str) -> Result<bool, EngineError> {
        self.with_state(|all| all.remove(phase).is_some())
    }

    /// Every known phase, for a single status view.
    pub fn workflow_status(&self) -> Result<BTreeMap<String, PhaseRecord>, EngineError> {
        self.read_all()
    }

    /// Persist a phase report as `<phase>_report.json`.
    pub fn save_report<T: Serialize + ?Sized>(&self, phase: &str, report: &T) -> Result<PathBuf, EngineError> {
        let path = self.report_path(phase);
        write_json_atomic(&path, report).map_err(|e| EngineError::State(e.to_string()))?;
        Ok(path)
    }

    pub fn load_report<T: DeserializeOwned>(&self, phase: &str) -> Result<Option<T>, EngineError> {
        let path = self.report_path(phase);
        let text = match fs::read_to_string(&path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(EngineError::State(format!("read {}: {e}", path.display()))),
        };
        serde_json::from_str(&text)
            .map(Some)
            .map_err(|e| EngineError::State(format!("parse {}: {e}", path.display())))
    }
}
