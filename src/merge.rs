//! Result merging
//!
//! Each completed instance leaves a small prediction artifact in its own
//! directory; the merger folds them into one `preds.json` keyed by
//! instance id. Missing artifacts (skipped with no prior result, crashed
//! instances) are omitted, not an error. Output ordering is stable so
//! re-merging the same directory is byte-identical.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde_json::{json, Value};
use tracing::{debug, info};

use crate::error::{DroverError, Result};
use crate::executor::AgentRunResult;

/// Aggregate output file name, relative to the run's output dir.
pub const PREDS_FILE: &str = "preds.json";

/// Per-instance prediction artifact path (`<output_dir>/<id>/<id>.pred.json`).
pub fn prediction_path(output_dir: &Path, instance_id: &str) -> PathBuf {
    output_dir
        .join(instance_id)
        .join(format!("{instance_id}.pred.json"))
}

/// Persist one instance's prediction artifact.
pub fn save_predictions(output_dir: &Path, result: &AgentRunResult) -> Result<()> {
    let path = prediction_path(output_dir, &result.instance_id);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let prediction = json!({
        "instance_id": result.instance_id,
        "exit_status": result.info.exit_status,
        "model_patch": result.artifacts.get("model_patch").cloned().unwrap_or(Value::Null),
    });
    std::fs::write(&path, serde_json::to_string_pretty(&prediction)?)?;
    debug!(instance_id = %result.instance_id, "Saved prediction");
    Ok(())
}

/// Merge per-instance predictions into one aggregate file.
///
/// `instance_dirs` is consulted in order, but output keys are sorted by
/// instance id, so the result does not depend on input order and merging
/// twice produces byte-identical bytes.
pub fn merge_predictions(instance_dirs: &[PathBuf], out_path: &Path) -> Result<PathBuf> {
    let mut merged: BTreeMap<String, Value> = BTreeMap::new();

    for dir in instance_dirs {
        let Some(instance_id) = dir.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let path = dir.join(format!("{instance_id}.pred.json"));
        if !path.exists() {
            debug!(instance_id, "No prediction artifact; omitting from merge");
            continue;
        }
        let content = std::fs::read_to_string(&path)?;
        let prediction: Value =
            serde_json::from_str(&content).map_err(|e| DroverError::Merge {
                details: format!("unreadable prediction {}: {e}", path.display()),
            })?;
        merged.insert(instance_id.to_string(), prediction);
    }

    // Trailing newline keeps the file friendly to line-based tooling.
    let mut rendered = serde_json::to_string_pretty(&merged)?;
    rendered.push('\n');
    std::fs::write(out_path, rendered)?;
    info!(count = merged.len(), path = %out_path.display(), "Merged predictions");
    Ok(out_path.to_path_buf())
}
