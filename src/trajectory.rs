//! Trajectory records and the skip/resume decision
//!
//! The trajectory file (`<output_dir>/<id>/<id>.traj`) is the resumability
//! checkpoint: it is trustworthy evidence of completion iff it parses as
//! JSON and `info.exit_status` is present and not the `early_exit`
//! sentinel. Anything else means "not complete" - the stale file is
//! deleted so it can never silently block re-execution.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info, warn};

use crate::error::Result;

/// Sentinel exit status written when an agent bails out before producing
/// a usable result. Never counts as completion evidence.
pub const EARLY_EXIT: &str = "early_exit";

/// Terminal metadata of one agent run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunInfo {
    /// Free-form classification of how the run ended (e.g. "submitted").
    /// Absent means the run is incomplete.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_status: Option<String>,

    /// Executor-specific extras (model stats, costs, ...)
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// Persisted record of one instance's execution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrajectoryRecord {
    /// Ordered, opaque history entries (messages, actions, observations)
    #[serde(default)]
    pub history: Vec<Value>,

    #[serde(default)]
    pub info: RunInfo,
}

impl TrajectoryRecord {
    /// Path of the trajectory file for an instance id.
    pub fn path_for(output_dir: &Path, instance_id: &str) -> PathBuf {
        output_dir
            .join(instance_id)
            .join(format!("{instance_id}.traj"))
    }

    /// Persist the record, creating the instance directory if needed.
    pub fn write(&self, output_dir: &Path, instance_id: &str) -> Result<PathBuf> {
        let path = Self::path_for(output_dir, instance_id);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, serde_json::to_string_pretty(self)?)?;
        Ok(path)
    }

    /// Whether this record is valid completion evidence.
    pub fn is_complete(&self) -> bool {
        match self.info.exit_status.as_deref() {
            None => false,
            Some(status) => status != EARLY_EXIT,
        }
    }
}

/// Outcome of the skip/resume check for one instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkipDecision {
    pub skip: bool,
    /// Exit status of the prior completed run, when skipping.
    pub prior_status: Option<String>,
}

impl SkipDecision {
    fn run() -> Self {
        Self {
            skip: false,
            prior_status: None,
        }
    }

    fn skip(prior_status: String) -> Self {
        Self {
            skip: true,
            prior_status: Some(prior_status),
        }
    }
}

/// Decide whether an instance already completed and can be skipped.
///
/// The only path that skips is a well-formed trajectory file with a real
/// exit status. Every unreliable state (empty file, unparsable content,
/// missing or sentinel exit status) deletes the file so the instance
/// re-runs from scratch.
pub fn should_skip(output_dir: &Path, instance_id: &str, redo_existing: bool) -> SkipDecision {
    if redo_existing {
        return SkipDecision::run();
    }

    let path = TrajectoryRecord::path_for(output_dir, instance_id);
    if !path.exists() {
        return SkipDecision::run();
    }

    let content = match std::fs::read_to_string(&path) {
        Ok(content) => content,
        Err(e) => {
            error!(path = %path.display(), error = %e, "Failed to read existing trajectory. Removing.");
            remove_stale(&path);
            return SkipDecision::run();
        }
    };

    if content.trim().is_empty() {
        warn!(path = %path.display(), "Found empty trajectory. Removing.");
        remove_stale(&path);
        return SkipDecision::run();
    }

    let record: TrajectoryRecord = match serde_json::from_str(&content) {
        Ok(record) => record,
        Err(e) => {
            error!(path = %path.display(), error = %e, "Failed to parse existing trajectory. Removing.");
            remove_stale(&path);
            return SkipDecision::run();
        }
    };

    match record.info.exit_status {
        Some(status) if status != EARLY_EXIT => {
            info!(path = %path.display(), exit_status = %status, "Skipping existing trajectory");
            SkipDecision::skip(status)
        }
        _ => {
            warn!(path = %path.display(), "Found existing trajectory with no exit status. Removing.");
            remove_stale(&path);
            SkipDecision::run()
        }
    }
}

/// Best-effort delete of an unreliable trajectory file. A failed delete is
/// logged and otherwise ignored; the skip decision already stands.
fn remove_stale(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        warn!(path = %path.display(), error = %e, "Could not remove stale trajectory");
    }
}
