//! Run-scoped progress tracking
//!
//! One tracker exists per batch run; it is created at run start and
//! dropped after the final report. Per-instance stages are only ever
//! written by the worker that owns that instance, so the map needs no
//! locking discipline beyond DashMap's own; the completion counter is the
//! one genuinely shared value and is atomic.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use colored::Colorize;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::warn;

use crate::error::DroverError;

/// Lifecycle stage of one instance within the current run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceStage {
    Queued,
    Starting,
    Running(String),
    Finished(String),
}

impl InstanceStage {
    pub fn is_running(&self) -> bool {
        matches!(self, InstanceStage::Starting | InstanceStage::Running(_))
    }

    pub fn exit_status(&self) -> Option<&str> {
        match self {
            InstanceStage::Finished(status) => Some(status),
            _ => None,
        }
    }
}

impl fmt::Display for InstanceStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstanceStage::Queued => write!(f, "queued"),
            InstanceStage::Starting => write!(f, "starting"),
            InstanceStage::Running(status) => write!(f, "running: {status}"),
            InstanceStage::Finished(status) => write!(f, "finished: {status}"),
        }
    }
}

/// Thread-safe per-run progress state.
pub struct ProgressTracker {
    /// instance id → current stage
    stages: DashMap<Arc<str>, InstanceStage>,
    /// exit status → instance ids (terminal statuses only)
    exit_stats: Mutex<BTreeMap<String, Vec<String>>>,
    n_completed: AtomicUsize,
    n_total: usize,
    started: Instant,
    /// Print colored per-event status lines as instances start/finish
    live: bool,
    /// Incrementally rewritten YAML tally, if configured
    report_path: Option<PathBuf>,
    report_printed: AtomicBool,
}

impl ProgressTracker {
    pub fn new(instance_ids: impl IntoIterator<Item = impl AsRef<str>>, live: bool) -> Self {
        let stages = DashMap::new();
        for id in instance_ids {
            stages.insert(Arc::from(id.as_ref()), InstanceStage::Queued);
        }
        let n_total = stages.len();
        Self {
            stages,
            exit_stats: Mutex::new(BTreeMap::new()),
            n_completed: AtomicUsize::new(0),
            n_total,
            started: Instant::now(),
            live,
            report_path: None,
            report_printed: AtomicBool::new(false),
        }
    }

    /// Persist the exit-status tally to this YAML file after every
    /// terminal transition.
    pub fn with_report_path(mut self, path: PathBuf) -> Self {
        self.report_path = Some(path);
        self
    }

    pub fn completed_count(&self) -> usize {
        self.n_completed.load(Ordering::SeqCst)
    }

    pub fn total_count(&self) -> usize {
        self.n_total
    }

    /// How many instances are currently starting or running.
    pub fn running_count(&self) -> usize {
        self.stages.iter().filter(|e| e.value().is_running()).count()
    }

    pub fn on_instance_start(&self, instance_id: &str) {
        self.stages
            .insert(Arc::from(instance_id), InstanceStage::Starting);
        if self.live {
            println!("  {} {} {}", "[⟳]".yellow(), instance_id, "starting".dimmed());
        }
    }

    /// Free-form status text while the instance runs ("starting environment",
    /// "running agent", ...).
    pub fn update_status(&self, instance_id: &str, status: &str) {
        self.stages.insert(
            Arc::from(instance_id),
            InstanceStage::Running(status.to_string()),
        );
    }

    /// Record a terminal status for an instance.
    pub fn on_instance_end(&self, instance_id: &str, exit_status: &str) {
        self.stages.insert(
            Arc::from(instance_id),
            InstanceStage::Finished(exit_status.to_string()),
        );
        let completed = self.n_completed.fetch_add(1, Ordering::SeqCst) + 1;

        self.exit_stats
            .lock()
            .entry(exit_status.to_string())
            .or_default()
            .push(instance_id.to_string());
        self.write_report();

        if self.live {
            let ok = !exit_status.starts_with("uncaught_exception");
            let counter = format!("[{}/{}]", completed, self.n_total);
            let counter = if ok { counter.green() } else { counter.red() };
            let symbol = if ok { "✓".green() } else { "✗".red() };
            println!("  {} {} {} {}", counter, instance_id, symbol, exit_status.dimmed());
        }
    }

    /// Record an engine-level crash, distinct from agent-reported failure.
    pub fn on_uncaught_exception(&self, instance_id: &str, err: &DroverError) {
        self.on_instance_end(instance_id, &format!("uncaught_exception:{}", err.kind()));
    }

    /// Render the live view: one line per instance plus a summary.
    pub fn render_snapshot(&self) -> String {
        let mut lines: Vec<String> = self
            .stages
            .iter()
            .map(|e| format!("{:<40} {}", e.key(), e.value()))
            .collect();
        lines.sort();
        lines.push(format!(
            "completed {}/{} ({} running)",
            self.completed_count(),
            self.n_total,
            self.running_count()
        ));
        lines.join("\n")
    }

    /// Sorted tally of terminal statuses. Instances that never reached a
    /// terminal stage (interrupted run) are grouped under `not_run`.
    pub fn exit_status_tally(&self) -> BTreeMap<String, Vec<String>> {
        let mut tally = self.exit_stats.lock().clone();
        for entry in tally.values_mut() {
            entry.sort();
        }
        let mut not_run: Vec<String> = self
            .stages
            .iter()
            .filter(|e| e.value().exit_status().is_none())
            .map(|e| e.key().to_string())
            .collect();
        if !not_run.is_empty() {
            not_run.sort();
            tally.insert("not_run".to_string(), not_run);
        }
        tally
    }

    /// Print the final human-readable report. Safe to call from multiple
    /// shutdown paths; only the first call prints.
    pub fn print_final_report(&self) {
        if self.report_printed.swap(true, Ordering::SeqCst) {
            return;
        }
        let tally = self.exit_status_tally();
        let elapsed = self.started.elapsed().as_secs();

        println!("\n{}", "Exit statuses".cyan().bold());
        for (status, ids) in &tally {
            println!("  {:<40} {}", status, ids.len());
        }
        println!(
            "{} {}/{} instances completed in {}s",
            "→".cyan(),
            self.completed_count(),
            self.n_total,
            elapsed
        );
    }

    fn write_report(&self) {
        let Some(path) = &self.report_path else {
            return;
        };
        let tally = self.exit_status_tally();
        let yaml = match serde_yaml::to_string(&tally) {
            Ok(yaml) => yaml,
            Err(e) => {
                warn!(error = %e, "Could not serialize exit-status report");
                return;
            }
        };
        if let Err(e) = std::fs::write(path, yaml) {
            warn!(path = %path.display(), error = %e, "Could not write exit-status report");
        }
    }
}
