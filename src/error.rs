//! Drover error types with error codes
//!
//! Error code ranges:
//! - DROVER-001-009: Configuration errors
//! - DROVER-010-019: Manifest/instance errors
//! - DROVER-020-029: Executor/environment errors
//! - DROVER-030-039: Budget/model errors (run-fatal class)
//! - DROVER-040-049: Hook errors
//! - DROVER-050-059: Merge/report errors
//! - DROVER-090-099: IO/serialization errors

use thiserror::Error;

pub type Result<T> = std::result::Result<T, DroverError>;

/// Trait for errors that provide fix suggestions
pub trait FixSuggestion {
    fn fix_suggestion(&self) -> Option<&str>;
}

/// All error variants are part of the public API.
#[derive(Error, Debug)]
pub enum DroverError {
    // ═══════════════════════════════════════════
    // CONFIGURATION ERRORS (001-009)
    // ═══════════════════════════════════════════
    #[error("[DROVER-001] Invalid configuration: {reason}")]
    Config { reason: String },

    // ═══════════════════════════════════════════
    // MANIFEST ERRORS (010-019)
    // ═══════════════════════════════════════════
    #[error("[DROVER-010] Manifest not found: {path}")]
    ManifestNotFound { path: String },

    #[error("[DROVER-011] Manifest has no instances: {path}")]
    EmptyManifest { path: String },

    #[error("[DROVER-012] Failed to parse manifest at line {line}: {details}")]
    ManifestParse { line: usize, details: String },

    #[error("[DROVER-013] Invalid instance id '{id}': {reason}")]
    InvalidInstanceId { id: String, reason: String },

    #[error("[DROVER-014] Duplicate instance id '{id}' in manifest")]
    DuplicateInstanceId { id: String },

    // ═══════════════════════════════════════════
    // EXECUTOR ERRORS (020-029) - instance-local
    // ═══════════════════════════════════════════
    #[error("[DROVER-020] Agent execution failed for '{instance_id}': {details}")]
    Execution { instance_id: String, details: String },

    #[error("[DROVER-021] Agent timed out for '{instance_id}' after {timeout_s}s")]
    Timeout { instance_id: String, timeout_s: u64 },

    #[error("[DROVER-022] Environment error for '{instance_id}': {details}")]
    Environment { instance_id: String, details: String },

    // ═══════════════════════════════════════════
    // RUN-FATAL ERRORS (030-039)
    // ═══════════════════════════════════════════
    #[error("[DROVER-030] Model configuration rejected: {details}")]
    ModelConfig { details: String },

    #[error("[DROVER-031] Total cost limit exceeded: {details}")]
    CostLimitExceeded { details: String },

    // ═══════════════════════════════════════════
    // HOOK ERRORS (040-049)
    // ═══════════════════════════════════════════
    #[error("[DROVER-040] Hook '{hook}' failed: {details}")]
    Hook { hook: String, details: String },

    // ═══════════════════════════════════════════
    // MERGE ERRORS (050-059)
    // ═══════════════════════════════════════════
    #[error("[DROVER-050] Failed to merge predictions: {details}")]
    Merge { details: String },

    // ═══════════════════════════════════════════
    // IO/SERIALIZATION (090-099)
    // ═══════════════════════════════════════════
    #[error("[DROVER-090] IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("[DROVER-091] JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("[DROVER-092] YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl DroverError {
    /// Errors that invalidate the whole batch run, not just one instance.
    ///
    /// A run-fatal error stops scheduling of further instances; in-flight
    /// instances are still drained. Everything else is contained to the
    /// instance that raised it.
    pub fn is_run_fatal(&self) -> bool {
        matches!(
            self,
            DroverError::ModelConfig { .. } | DroverError::CostLimitExceeded { .. }
        )
    }

    /// Short variant name, used in `uncaught_exception:<kind>` exit statuses.
    pub fn kind(&self) -> &'static str {
        match self {
            DroverError::Config { .. } => "Config",
            DroverError::ManifestNotFound { .. } => "ManifestNotFound",
            DroverError::EmptyManifest { .. } => "EmptyManifest",
            DroverError::ManifestParse { .. } => "ManifestParse",
            DroverError::InvalidInstanceId { .. } => "InvalidInstanceId",
            DroverError::DuplicateInstanceId { .. } => "DuplicateInstanceId",
            DroverError::Execution { .. } => "Execution",
            DroverError::Timeout { .. } => "Timeout",
            DroverError::Environment { .. } => "Environment",
            DroverError::ModelConfig { .. } => "ModelConfig",
            DroverError::CostLimitExceeded { .. } => "CostLimitExceeded",
            DroverError::Hook { .. } => "Hook",
            DroverError::Merge { .. } => "Merge",
            DroverError::Io(_) => "Io",
            DroverError::Json(_) => "Json",
            DroverError::Yaml(_) => "Yaml",
        }
    }
}

impl FixSuggestion for DroverError {
    fn fix_suggestion(&self) -> Option<&str> {
        match self {
            DroverError::Config { .. } => {
                Some("Check the run configuration (workers, output dir, agent command)")
            }
            DroverError::ManifestNotFound { .. } => Some("Check the manifest path exists"),
            DroverError::EmptyManifest { .. } => {
                Some("Add at least one instance to the manifest (.jsonl: one JSON object per line)")
            }
            DroverError::ManifestParse { .. } => {
                Some("Each manifest entry needs 'id' and 'problem_statement' fields")
            }
            DroverError::InvalidInstanceId { .. } => {
                Some("Instance ids may only contain alphanumerics, '-', '_' and '.'")
            }
            DroverError::DuplicateInstanceId { .. } => {
                Some("Instance ids must be unique within a manifest")
            }
            DroverError::ModelConfig { .. } => {
                Some("Check API key env vars and the agent's model configuration")
            }
            DroverError::CostLimitExceeded { .. } => {
                Some("Raise the cost budget or resume later: completed instances are skipped")
            }
            DroverError::Timeout { .. } => Some("Raise the agent timeout for long-running instances"),
            _ => None,
        }
    }
}
