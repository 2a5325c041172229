//! Batch scheduler - runs a manifest of instances with bounded concurrency
//!
//! One state machine, two drivers: a sequential loop for `workers == 1`
//! and a semaphore-bounded worker pool on top of `JoinSet` otherwise.
//! Interruption and run-fatal errors both flow through one
//! `CancellationToken`: stop admitting new instances, let in-flight ones
//! drain, then always print the final report and merge whatever
//! completed.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, instrument, Instrument};

use crate::error::{DroverError, Result};
use crate::executor::{AgentRunResult, TaskExecutor};
use crate::hooks::{CombinedHooks, RunContext, RunHook, SavePatchHook};
use crate::instance::BatchInstance;
use crate::merge::{self, PREDS_FILE};
use crate::progress::ProgressTracker;
use crate::trajectory;

/// YAML tally of terminal statuses, rewritten as the run progresses.
pub const EXIT_STATUS_REPORT: &str = "run_batch_exit_statuses.yaml";
/// Snapshot of the resolved configuration, written at run start.
pub const CONFIG_SNAPSHOT: &str = "run_batch.config.yaml";
/// Run-level log file name.
pub const RUN_LOG: &str = "run_batch.log";

// ============================================================================
// CONFIG
// ============================================================================

/// Resolved configuration of one batch run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunBatchConfig {
    pub output_dir: PathBuf,

    /// Worker pool size; clamped to the instance count at startup
    pub workers: usize,

    /// Re-run instances even when a valid trajectory exists
    pub redo_existing: bool,

    /// Re-raise the first error instead of containing it (debugging aid)
    pub strict: bool,

    /// Print per-instance status lines as the run progresses
    pub progress: bool,

    /// Scales the jittered startup delay that desynchronizes sandbox
    /// boots during ramp-up: `uniform(0,1) * multiplier * (workers - 1)`
    /// seconds
    pub random_delay_multiplier: f64,
}

impl Default for RunBatchConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("trajectories"),
            workers: 1,
            redo_existing: false,
            strict: false,
            progress: true,
            random_delay_multiplier: 0.3,
        }
    }
}

/// Default output directory for a manifest: `trajectories/<stem>[__suffix]`.
pub fn default_output_dir(manifest: &Path, suffix: &str) -> PathBuf {
    let stem = manifest
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("batch");
    let name = if suffix.is_empty() {
        stem.to_string()
    } else {
        format!("{stem}__{suffix}")
    };
    PathBuf::from("trajectories").join(name)
}

// ============================================================================
// OUTCOME SENTINEL
// ============================================================================

/// What one instance's execution means for the rest of the run.
///
/// Explicit sentinel instead of control-flow exceptions: the drivers
/// inspect it between iterations (sequential) or as workers settle
/// (concurrent).
enum InstanceOutcome {
    Completed,
    Skipped,
    /// Cancelled before it started; never ran the executor
    Cancelled,
    /// Instance-local failure; the batch keeps going
    Failed(DroverError),
    /// Run-fatal failure; stop scheduling, drain in-flight work
    FatalStop(DroverError),
}

// ============================================================================
// RUN CORE
// ============================================================================

/// Everything a worker needs, shared once behind an `Arc` for the whole
/// run. Replaces process-global state: its lifetime is exactly the run's.
struct RunCore {
    executor: Arc<dyn TaskExecutor>,
    hooks: CombinedHooks,
    progress: ProgressTracker,
    cancel: CancellationToken,
    output_dir: PathBuf,
    redo_existing: bool,
    workers: usize,
    random_delay_multiplier: f64,
}

impl RunCore {
    async fn run_instance(&self, instance: &BatchInstance) -> InstanceOutcome {
        let span = info_span!("instance", id = %instance.id);
        self.run_instance_inner(instance).instrument(span).await
    }

    async fn run_instance_inner(&self, instance: &BatchInstance) -> InstanceOutcome {
        info!(instance_id = %instance.id, "Running instance");

        // Desynchronize simultaneous sandbox startups. Only during
        // ramp-up: once a worker's worth of instances has completed, the
        // pool is naturally staggered.
        if self.progress.completed_count() < self.workers && self.random_delay_multiplier > 0.0 {
            let delay =
                rand::random::<f64>() * self.random_delay_multiplier * (self.workers - 1) as f64;
            if delay > 0.0 {
                tokio::time::sleep(Duration::from_secs_f64(delay)).await;
            }
        }

        self.progress.on_instance_start(&instance.id);

        let decision = trajectory::should_skip(&self.output_dir, &instance.id, self.redo_existing);
        if decision.skip {
            let prior = decision.prior_status.as_deref().unwrap_or("unknown");
            self.progress
                .on_instance_end(&instance.id, &format!("skipped ({prior})"));
            return InstanceOutcome::Skipped;
        }

        match self.execute_instance(instance).await {
            Ok(result) => {
                self.progress
                    .on_instance_end(&instance.id, result.exit_status());
                InstanceOutcome::Completed
            }
            Err(err) if err.is_run_fatal() => {
                error!(instance_id = %instance.id, error = %err, "Fatal error; no further instances will be scheduled");
                self.progress.on_uncaught_exception(&instance.id, &err);
                InstanceOutcome::FatalStop(err)
            }
            Err(err) => {
                error!(instance_id = %instance.id, error = %err, "Instance failed");
                self.progress.on_uncaught_exception(&instance.id, &err);
                InstanceOutcome::Failed(err)
            }
        }
    }

    async fn execute_instance(&self, instance: &BatchInstance) -> Result<AgentRunResult> {
        let instance_dir = self.output_dir.join(&instance.id);
        std::fs::create_dir_all(&instance_dir)?;

        self.progress.update_status(&instance.id, "starting environment");
        self.hooks.on_instance_start(instance, &instance_dir).await?;

        self.progress.update_status(&instance.id, "running agent");
        let result = self.executor.execute(instance, &self.output_dir).await?;

        merge::save_predictions(&self.output_dir, &result)?;
        self.hooks.on_instance_completed(&result).await?;
        Ok(result)
    }
}

// ============================================================================
// RUN BATCH
// ============================================================================

/// Final counts of a finished run.
#[derive(Debug, Clone)]
pub struct BatchSummary {
    pub n_completed: usize,
    pub n_total: usize,
    /// Terminal status → sorted instance ids
    pub exit_statuses: BTreeMap<String, Vec<String>>,
    pub preds_path: PathBuf,
}

/// A batch run over a fixed list of instances.
pub struct RunBatch {
    instances: Vec<BatchInstance>,
    core: RunCore,
    run_context: RunContext,
    strict: bool,
    config: RunBatchConfig,
}

impl RunBatch {
    /// Build a run. Configuration errors (interactive executor with a
    /// worker pool, empty instance list) fail here, before anything runs.
    pub fn new(
        instances: Vec<BatchInstance>,
        executor: Arc<dyn TaskExecutor>,
        config: RunBatchConfig,
    ) -> Result<Self> {
        if instances.is_empty() {
            return Err(DroverError::Config {
                reason: "no instances to run".to_string(),
            });
        }
        if executor.is_interactive() && config.workers > 1 {
            return Err(DroverError::Config {
                reason: format!(
                    "interactive agents cannot run concurrently (workers = {})",
                    config.workers
                ),
            });
        }

        let workers = config.workers.clamp(1, instances.len());
        let progress =
            ProgressTracker::new(instances.iter().map(|i| i.id.as_str()), config.progress)
                .with_report_path(config.output_dir.join(EXIT_STATUS_REPORT));
        let run_context = RunContext {
            output_dir: config.output_dir.clone(),
            n_instances: instances.len(),
        };

        let mut batch = Self {
            core: RunCore {
                executor,
                hooks: CombinedHooks::new(),
                progress,
                cancel: CancellationToken::new(),
                output_dir: config.output_dir.clone(),
                redo_existing: config.redo_existing,
                workers,
                random_delay_multiplier: config.random_delay_multiplier,
            },
            run_context,
            strict: config.strict,
            instances,
            config,
        };
        batch.add_hook(Box::new(SavePatchHook::default()))?;
        Ok(batch)
    }

    /// Register a hook; its `on_init` may reject the run.
    pub fn add_hook(&mut self, hook: Box<dyn RunHook>) -> Result<()> {
        self.core.hooks.add(hook, &self.run_context)
    }

    /// Token that interrupts the run: stops admitting new instances and
    /// lets in-flight ones drain. The CLI wires ctrl-c to this.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.core.cancel.clone()
    }

    /// Run every instance, then merge results.
    #[instrument(skip(self), fields(n_instances = self.instances.len(), workers = self.core.workers))]
    pub async fn run(self) -> Result<BatchSummary> {
        std::fs::create_dir_all(&self.core.output_dir)?;
        self.write_config_snapshot()?;
        info!(output_dir = %self.core.output_dir.display(), "Starting batch run");

        self.core.hooks.on_start().await?;

        let strict = self.strict;
        let instances = self.instances;
        let core = Arc::new(self.core);

        let driver_result = if core.workers <= 1 {
            Self::run_sequential(&core, &instances, strict).await
        } else {
            Self::run_concurrent(&core, instances.clone(), strict).await
        };

        // Exactly once, on every path out of the drivers.
        core.progress.print_final_report();
        driver_result?;

        let instance_dirs: Vec<PathBuf> = instances
            .iter()
            .map(|i| core.output_dir.join(&i.id))
            .collect();
        let preds_path = merge::merge_predictions(&instance_dirs, &core.output_dir.join(PREDS_FILE))?;

        core.hooks.on_end().await?;

        Ok(BatchSummary {
            n_completed: core.progress.completed_count(),
            n_total: core.progress.total_count(),
            exit_statuses: core.progress.exit_status_tally(),
            preds_path,
        })
    }

    /// One instance at a time, in input order. Completion order equals
    /// input order by construction.
    async fn run_sequential(
        core: &Arc<RunCore>,
        instances: &[BatchInstance],
        strict: bool,
    ) -> Result<()> {
        for instance in instances {
            if core.cancel.is_cancelled() {
                info!("Stopping loop over instances");
                break;
            }
            match core.run_instance(instance).await {
                InstanceOutcome::FatalStop(err) => {
                    core.cancel.cancel();
                    if strict {
                        return Err(err);
                    }
                    break;
                }
                InstanceOutcome::Failed(err) if strict => return Err(err),
                InstanceOutcome::Completed
                | InstanceOutcome::Skipped
                | InstanceOutcome::Cancelled
                | InstanceOutcome::Failed(_) => {}
            }
        }
        Ok(())
    }

    /// Semaphore-bounded worker pool. Submission honors input order;
    /// completion order is unspecified. Cancellation stops queued work at
    /// the permit boundary and drains whatever already started.
    async fn run_concurrent(
        core: &Arc<RunCore>,
        instances: Vec<BatchInstance>,
        strict: bool,
    ) -> Result<()> {
        let semaphore = Arc::new(Semaphore::new(core.workers));
        let mut join_set = JoinSet::new();

        for instance in instances {
            let core = Arc::clone(core);
            let semaphore = Arc::clone(&semaphore);
            join_set.spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return InstanceOutcome::Cancelled,
                };
                // Queued work is dropped here; instances that already
                // hold a permit run to completion.
                if core.cancel.is_cancelled() {
                    return InstanceOutcome::Cancelled;
                }
                core.run_instance(&instance).await
            });
        }

        let mut first_error = None;
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(InstanceOutcome::FatalStop(err)) => {
                    core.cancel.cancel();
                    if strict && first_error.is_none() {
                        first_error = Some(err);
                    }
                }
                Ok(InstanceOutcome::Failed(err)) if strict => {
                    core.cancel.cancel();
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
                Ok(_) => {}
                Err(join_err) => {
                    // A panicked worker loses its instance but not the run.
                    error!(error = %join_err, "Worker task panicked");
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn write_config_snapshot(&self) -> Result<()> {
        #[derive(Serialize)]
        struct Snapshot<'a> {
            started_at: String,
            n_instances: usize,
            #[serde(flatten)]
            config: &'a RunBatchConfig,
        }
        let snapshot = Snapshot {
            started_at: chrono::Utc::now().to_rfc3339(),
            n_instances: self.instances.len(),
            config: &self.config,
        };
        std::fs::write(
            self.core.output_dir.join(CONFIG_SNAPSHOT),
            serde_yaml::to_string(&snapshot)?,
        )?;
        Ok(())
    }
}
