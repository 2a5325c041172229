//! Batch instance descriptors and manifest loading
//!
//! An instance is one independent unit of batch work: a problem statement
//! plus the environment it runs in. Instances are immutable once loaded;
//! the id doubles as the per-instance directory name under the output dir,
//! so it is validated against path traversal the same way throughout.

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{DroverError, Result};

/// Sandbox/environment spec for one instance. Opaque to the engine: the
/// executor is the only component that interprets it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnvSpec {
    /// Container image the sandbox boots from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Repository to check out (local path or `owner/name`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo: Option<String>,

    /// Commit to check out before the agent starts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_commit: Option<String>,

    /// Anything else the executor understands
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// One independent unit of batch work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchInstance {
    /// Unique, stable id; used as the filesystem key for all per-instance
    /// artifacts (`<output_dir>/<id>/...`).
    pub id: String,

    #[serde(default)]
    pub env: EnvSpec,

    /// The problem the agent is asked to solve
    pub problem_statement: String,
}

impl BatchInstance {
    pub fn new(id: impl Into<String>, problem_statement: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            env: EnvSpec::default(),
            problem_statement: problem_statement.into(),
        }
    }

    /// Validate that an id is safe to use as a directory name.
    ///
    /// Only alphanumerics, hyphens, underscores and dots are allowed, and
    /// `..` is rejected outright.
    pub fn validate_id(id: &str) -> Result<()> {
        if id.is_empty() {
            return Err(DroverError::InvalidInstanceId {
                id: id.to_string(),
                reason: "id is empty".to_string(),
            });
        }
        if id.contains("..") {
            return Err(DroverError::InvalidInstanceId {
                id: id.to_string(),
                reason: "id must not contain '..'".to_string(),
            });
        }
        if !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        {
            return Err(DroverError::InvalidInstanceId {
                id: id.to_string(),
                reason: "id must be alphanumeric with '-', '_' or '.'".to_string(),
            });
        }
        Ok(())
    }
}

/// Load a batch manifest from disk.
///
/// Supported formats, chosen by extension:
/// - `.jsonl` - one JSON instance object per line (blank lines skipped)
/// - `.yaml` / `.yml` - a YAML list of instance objects
///
/// An empty or unreadable manifest is an error: a batch run over zero
/// instances is always an operator mistake.
pub fn load_manifest(path: &Path) -> Result<Vec<BatchInstance>> {
    if !path.exists() {
        return Err(DroverError::ManifestNotFound {
            path: path.display().to_string(),
        });
    }
    let content = std::fs::read_to_string(path)?;

    let instances = match path.extension().and_then(|e| e.to_str()) {
        Some("yaml") | Some("yml") => serde_yaml::from_str::<Vec<BatchInstance>>(&content)?,
        _ => parse_jsonl(&content)?,
    };

    if instances.is_empty() {
        return Err(DroverError::EmptyManifest {
            path: path.display().to_string(),
        });
    }

    let mut seen = HashSet::new();
    for instance in &instances {
        BatchInstance::validate_id(&instance.id)?;
        if !seen.insert(instance.id.as_str()) {
            return Err(DroverError::DuplicateInstanceId {
                id: instance.id.clone(),
            });
        }
    }

    info!(count = instances.len(), path = %path.display(), "Loaded instances");
    Ok(instances)
}

fn parse_jsonl(content: &str) -> Result<Vec<BatchInstance>> {
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| {
            serde_json::from_str(line).map_err(|e| DroverError::ManifestParse {
                line: i + 1,
                details: e.to_string(),
            })
        })
        .collect()
}
