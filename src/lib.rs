//! Drover - batch harness for autonomous agent runs
//!
//! Runs a manifest of independent agent instances with bounded
//! concurrency, skips work that already completed (trajectory files are
//! the checkpoint), contains per-instance failures, and merges everything
//! that finished into one predictions file.

pub mod batch;
pub mod error;
pub mod executor;
pub mod hooks;
pub mod instance;
pub mod merge;
pub mod progress;
pub mod trajectory;

pub use batch::{default_output_dir, BatchSummary, RunBatch, RunBatchConfig};
pub use error::{DroverError, FixSuggestion, Result};
pub use executor::{AgentRunResult, CommandExecutor, Environment, ProcessEnvironment, TaskExecutor};
pub use hooks::{CombinedHooks, RunContext, RunHook, SavePatchHook};
pub use instance::{load_manifest, BatchInstance, EnvSpec};
pub use merge::{merge_predictions, save_predictions, PREDS_FILE};
pub use progress::{InstanceStage, ProgressTracker};
pub use trajectory::{should_skip, RunInfo, SkipDecision, TrajectoryRecord, EARLY_EXIT};
