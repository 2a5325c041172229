//! End-to-end batch engine tests
//!
//! Drive the scheduler through a scripted executor: per-instance outcomes
//! are declared up front, and the executor records what actually ran so
//! ordering, concurrency and isolation can be asserted.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use serde_json::json;
use tempfile::TempDir;
use tokio::sync::Notify;

use drover::batch::EXIT_STATUS_REPORT;
use drover::{
    merge_predictions, AgentRunResult, BatchInstance, DroverError, Result, RunBatch,
    RunBatchConfig, RunInfo, TaskExecutor, TrajectoryRecord, PREDS_FILE,
};

// ============================================================================
// SCRIPTED EXECUTOR
// ============================================================================

#[derive(Clone, Copy)]
enum Script {
    Succeed,
    FailLocal,
    FailFatal,
    /// Start, then hold until the test releases all blocked instances
    Block,
}

struct ScriptedExecutor {
    scripts: HashMap<String, Script>,
    /// Invocation order, as observed by the executor
    calls: Mutex<Vec<String>>,
    running: AtomicUsize,
    max_running: AtomicUsize,
    blocked: AtomicUsize,
    release: Notify,
    delay: Duration,
}

impl ScriptedExecutor {
    fn new(scripts: impl IntoIterator<Item = (&'static str, Script)>) -> Arc<Self> {
        Arc::new(Self {
            scripts: scripts
                .into_iter()
                .map(|(id, s)| (id.to_string(), s))
                .collect(),
            calls: Mutex::new(Vec::new()),
            running: AtomicUsize::new(0),
            max_running: AtomicUsize::new(0),
            blocked: AtomicUsize::new(0),
            release: Notify::new(),
            delay: Duration::ZERO,
        })
    }

    fn with_delay(scripts: Vec<(&'static str, Script)>, delay: Duration) -> Arc<Self> {
        let mut executor = Self::new(scripts);
        Arc::get_mut(&mut executor).unwrap().delay = delay;
        executor
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    fn succeed(&self, instance: &BatchInstance, output_dir: &Path) -> Result<AgentRunResult> {
        let info = RunInfo {
            exit_status: Some("submitted".to_string()),
            extra: Default::default(),
        };
        TrajectoryRecord {
            history: vec![json!({"role": "agent", "content": "done"})],
            info: info.clone(),
        }
        .write(output_dir, &instance.id)?;

        Ok(AgentRunResult {
            instance_id: instance.id.clone(),
            info,
            artifacts: json!({ "model_patch": format!("patch for {}", instance.id) }),
        })
    }
}

#[async_trait]
impl TaskExecutor for ScriptedExecutor {
    async fn execute(
        &self,
        instance: &BatchInstance,
        output_dir: &Path,
    ) -> Result<AgentRunResult> {
        self.calls.lock().push(instance.id.clone());
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now, Ordering::SeqCst);

        let script = self
            .scripts
            .get(&instance.id)
            .copied()
            .unwrap_or(Script::Succeed);

        let result = match script {
            Script::Succeed => {
                if !self.delay.is_zero() {
                    tokio::time::sleep(self.delay).await;
                }
                self.succeed(instance, output_dir)
            }
            Script::FailLocal => Err(DroverError::Execution {
                instance_id: instance.id.clone(),
                details: "scripted failure".to_string(),
            }),
            Script::FailFatal => Err(DroverError::CostLimitExceeded {
                details: "scripted budget blowout".to_string(),
            }),
            Script::Block => {
                // Register for the release signal before announcing we
                // started, so the test cannot release in between.
                let released = self.release.notified();
                tokio::pin!(released);
                released.as_mut().enable();
                self.blocked.fetch_add(1, Ordering::SeqCst);
                released.await;
                self.succeed(instance, output_dir)
            }
        };

        self.running.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

// ============================================================================
// HELPERS
// ============================================================================

fn instances(ids: &[&str]) -> Vec<BatchInstance> {
    ids.iter()
        .map(|id| BatchInstance::new(*id, format!("problem for {id}")))
        .collect()
}

fn config(dir: &TempDir, workers: usize) -> RunBatchConfig {
    RunBatchConfig {
        output_dir: dir.path().to_path_buf(),
        workers,
        progress: false,
        random_delay_multiplier: 0.0,
        ..Default::default()
    }
}

fn write_completed_trajectory(dir: &Path, id: &str, exit_status: &str) {
    TrajectoryRecord {
        history: vec![json!({"role": "agent", "content": "previous run"})],
        info: RunInfo {
            exit_status: Some(exit_status.to_string()),
            extra: Default::default(),
        },
    }
    .write(dir, id)
    .unwrap();
}

// ============================================================================
// RESUMABILITY
// ============================================================================

#[tokio::test]
async fn completed_instances_are_skipped_on_rerun() {
    let dir = TempDir::new().unwrap();
    write_completed_trajectory(dir.path(), "inst-0", "submitted");

    let executor = ScriptedExecutor::new([]);
    let batch = RunBatch::new(
        instances(&["inst-0", "inst-1"]),
        Arc::clone(&executor) as Arc<dyn TaskExecutor>,
        config(&dir, 1),
    )
    .unwrap();
    let summary = batch.run().await.unwrap();

    // The executor never saw the already-completed instance.
    assert_eq!(executor.calls(), vec!["inst-1".to_string()]);
    assert_eq!(
        summary.exit_statuses["skipped (submitted)"],
        vec!["inst-0".to_string()]
    );
    assert_eq!(summary.exit_statuses["submitted"], vec!["inst-1".to_string()]);
}

#[tokio::test]
async fn redo_existing_reruns_completed_instances() {
    let dir = TempDir::new().unwrap();
    write_completed_trajectory(dir.path(), "inst-0", "submitted");

    let executor = ScriptedExecutor::new([]);
    let mut cfg = config(&dir, 1);
    cfg.redo_existing = true;
    let batch = RunBatch::new(
        instances(&["inst-0"]),
        Arc::clone(&executor) as Arc<dyn TaskExecutor>,
        cfg,
    )
    .unwrap();
    batch.run().await.unwrap();

    assert_eq!(executor.calls(), vec!["inst-0".to_string()]);
}

#[tokio::test]
async fn stale_trajectories_are_cleaned_and_rerun() {
    let dir = TempDir::new().unwrap();
    let stale = [
        ("inst-empty", "   "),
        ("inst-garbled", "{not json"),
        ("inst-early", r#"{"history": [], "info": {"exit_status": "early_exit"}}"#),
    ];
    for (id, content) in stale {
        let path = TrajectoryRecord::path_for(dir.path(), id);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    let executor = ScriptedExecutor::new([]);
    let batch = RunBatch::new(
        instances(&["inst-empty", "inst-garbled", "inst-early"]),
        Arc::clone(&executor) as Arc<dyn TaskExecutor>,
        config(&dir, 1),
    )
    .unwrap();
    let summary = batch.run().await.unwrap();

    assert_eq!(executor.calls().len(), 3, "every stale instance must re-run");
    assert_eq!(summary.exit_statuses["submitted"].len(), 3);

    // The re-run replaced each stale file with a valid record.
    for (id, _) in stale {
        let content =
            std::fs::read_to_string(TrajectoryRecord::path_for(dir.path(), id)).unwrap();
        let record: TrajectoryRecord = serde_json::from_str(&content).unwrap();
        assert!(record.is_complete());
    }
}

// ============================================================================
// CONCURRENCY & ORDERING
// ============================================================================

#[tokio::test]
async fn concurrency_never_exceeds_the_worker_limit() {
    let dir = TempDir::new().unwrap();
    let executor = ScriptedExecutor::with_delay(Vec::new(), Duration::from_millis(30));
    let ids: Vec<String> = (0..8).map(|i| format!("inst-{i}")).collect();
    let batch = RunBatch::new(
        ids.iter().map(|id| BatchInstance::new(id, "p")).collect(),
        Arc::clone(&executor) as Arc<dyn TaskExecutor>,
        config(&dir, 3),
    )
    .unwrap();
    let summary = batch.run().await.unwrap();

    assert_eq!(summary.n_completed, 8);
    assert!(
        executor.max_running.load(Ordering::SeqCst) <= 3,
        "observed {} concurrent instances with 3 workers",
        executor.max_running.load(Ordering::SeqCst)
    );
}

#[tokio::test]
async fn sequential_mode_completes_in_input_order() {
    let dir = TempDir::new().unwrap();
    let executor = ScriptedExecutor::new([]);
    let batch = RunBatch::new(
        instances(&["a", "b", "c"]),
        Arc::clone(&executor) as Arc<dyn TaskExecutor>,
        config(&dir, 1),
    )
    .unwrap();
    batch.run().await.unwrap();

    assert_eq!(
        executor.calls(),
        vec!["a".to_string(), "b".to_string(), "c".to_string()]
    );
}

// ============================================================================
// FAILURE ISOLATION & ESCALATION
// ============================================================================

#[tokio::test]
async fn instance_failure_is_contained_to_that_instance() {
    let dir = TempDir::new().unwrap();
    let executor = ScriptedExecutor::new([("b", Script::FailLocal)]);
    let batch = RunBatch::new(
        instances(&["a", "b", "c"]),
        Arc::clone(&executor) as Arc<dyn TaskExecutor>,
        config(&dir, 1),
    )
    .unwrap();
    let summary = batch.run().await.unwrap();

    assert_eq!(executor.calls().len(), 3, "a and c still run");
    assert_eq!(
        summary.exit_statuses["submitted"],
        vec!["a".to_string(), "c".to_string()]
    );
    assert_eq!(
        summary.exit_statuses["uncaught_exception:Execution"],
        vec!["b".to_string()]
    );
}

#[tokio::test]
async fn fatal_error_stops_scheduling_but_keeps_completed_work() {
    let dir = TempDir::new().unwrap();
    let executor = ScriptedExecutor::new([("b", Script::FailFatal)]);
    let batch = RunBatch::new(
        instances(&["a", "b", "c"]),
        Arc::clone(&executor) as Arc<dyn TaskExecutor>,
        config(&dir, 1),
    )
    .unwrap();
    let summary = batch.run().await.unwrap();

    // c is never started once b blows the budget.
    assert_eq!(executor.calls(), vec!["a".to_string(), "b".to_string()]);
    assert_eq!(summary.exit_statuses["submitted"], vec!["a".to_string()]);
    assert_eq!(
        summary.exit_statuses["uncaught_exception:CostLimitExceeded"],
        vec!["b".to_string()]
    );
    assert_eq!(summary.exit_statuses["not_run"], vec!["c".to_string()]);

    // a's completed result survives into the merged predictions.
    let merged: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(dir.path().join(PREDS_FILE)).unwrap())
            .unwrap();
    assert!(merged.get("a").is_some());
    assert!(merged.get("b").is_none());
    assert!(merged.get("c").is_none());
}

#[tokio::test]
async fn strict_mode_reraises_instance_errors() {
    let dir = TempDir::new().unwrap();
    let executor = ScriptedExecutor::new([("b", Script::FailLocal)]);
    let mut cfg = config(&dir, 1);
    cfg.strict = true;
    let batch = RunBatch::new(
        instances(&["a", "b", "c"]),
        Arc::clone(&executor) as Arc<dyn TaskExecutor>,
        cfg,
    )
    .unwrap();

    let err = batch.run().await.unwrap_err();
    assert!(matches!(err, DroverError::Execution { .. }));
    assert_eq!(executor.calls(), vec!["a".to_string(), "b".to_string()]);
}

// ============================================================================
// MERGE
// ============================================================================

#[tokio::test]
async fn merge_is_idempotent_over_a_completed_run() {
    let dir = TempDir::new().unwrap();
    let executor = ScriptedExecutor::new([]);
    let ids = ["z-inst", "a-inst", "m-inst"];
    let batch = RunBatch::new(
        instances(&ids),
        Arc::clone(&executor) as Arc<dyn TaskExecutor>,
        config(&dir, 1),
    )
    .unwrap();
    let summary = batch.run().await.unwrap();

    let first = std::fs::read(&summary.preds_path).unwrap();

    let dirs: Vec<_> = ids.iter().map(|id| dir.path().join(id)).collect();
    merge_predictions(&dirs, &summary.preds_path).unwrap();
    let second = std::fs::read(&summary.preds_path).unwrap();

    assert_eq!(first, second, "re-merge must be byte-identical");
}

#[tokio::test]
async fn patches_are_saved_by_the_default_hook() {
    let dir = TempDir::new().unwrap();
    let executor = ScriptedExecutor::new([]);
    let batch = RunBatch::new(
        instances(&["inst-0"]),
        Arc::clone(&executor) as Arc<dyn TaskExecutor>,
        config(&dir, 1),
    )
    .unwrap();
    batch.run().await.unwrap();

    let patch = std::fs::read_to_string(dir.path().join("inst-0/inst-0.patch")).unwrap();
    assert_eq!(patch, "patch for inst-0");
}

// ============================================================================
// CANCELLATION
// ============================================================================

#[tokio::test]
async fn cancellation_drains_in_flight_and_skips_queued_work() {
    let dir = TempDir::new().unwrap();
    let executor = ScriptedExecutor::new([("inst-0", Script::Block), ("inst-1", Script::Block)]);
    let ids = ["inst-0", "inst-1", "inst-2", "inst-3", "inst-4"];
    let batch = RunBatch::new(
        instances(&ids),
        Arc::clone(&executor) as Arc<dyn TaskExecutor>,
        config(&dir, 2),
    )
    .unwrap();
    let cancel = batch.cancellation_token();

    let run = tokio::spawn(batch.run());

    // Wait until both workers are genuinely in flight.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while executor.blocked.load(Ordering::SeqCst) < 2 {
        assert!(
            tokio::time::Instant::now() < deadline,
            "blocked instances never started"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    cancel.cancel();
    executor.release.notify_waiters();

    let summary = run.await.unwrap().unwrap();

    // The two in-flight instances finished; the queued three never ran.
    assert_eq!(executor.calls().len(), 2);
    assert_eq!(summary.n_completed, 2);
    assert_eq!(
        summary.exit_statuses["submitted"],
        vec!["inst-0".to_string(), "inst-1".to_string()]
    );
    assert_eq!(
        summary.exit_statuses["not_run"],
        vec![
            "inst-2".to_string(),
            "inst-3".to_string(),
            "inst-4".to_string()
        ]
    );

    // Interrupted runs still merge what completed and still write the
    // structured report.
    let merged: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(dir.path().join(PREDS_FILE)).unwrap())
            .unwrap();
    assert_eq!(merged.as_object().unwrap().len(), 2);

    let report: std::collections::BTreeMap<String, Vec<String>> = serde_yaml::from_str(
        &std::fs::read_to_string(dir.path().join(EXIT_STATUS_REPORT)).unwrap(),
    )
    .unwrap();
    assert!(report.contains_key("submitted"));
}
