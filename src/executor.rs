//! Task executor seam: how one instance actually runs
//!
//! The engine treats the agent as an opaque "run to completion" call
//! behind the [`TaskExecutor`] trait. The shipped [`CommandExecutor`] runs
//! an external agent command per instance and owns the environment
//! lifecycle around it; tests substitute scripted executors.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::error::{DroverError, Result};
use crate::instance::BatchInstance;
use crate::trajectory::{RunInfo, TrajectoryRecord, EARLY_EXIT};

/// Default timeout for one agent run (30 minutes)
const AGENT_TIMEOUT: Duration = Duration::from_secs(30 * 60);
/// Timeout for environment setup/teardown commands (5 minutes)
const ENV_TIMEOUT: Duration = Duration::from_secs(5 * 60);

// ============================================================================
// RESULT
// ============================================================================

/// Result of one non-skipped instance, produced exactly once by the
/// executor.
#[derive(Debug, Clone)]
pub struct AgentRunResult {
    pub instance_id: String,
    pub info: RunInfo,
    /// Final artifacts, keyed by name (`model_patch` is the one the
    /// merger and the patch hook care about).
    pub artifacts: Value,
}

impl AgentRunResult {
    /// Exit status, with absent treated as incomplete.
    pub fn exit_status(&self) -> &str {
        self.info.exit_status.as_deref().unwrap_or("unknown_exit")
    }

    /// The produced patch, if any.
    pub fn model_patch(&self) -> Option<&str> {
        self.artifacts.get("model_patch").and_then(Value::as_str)
    }
}

// ============================================================================
// TRAITS
// ============================================================================

/// Sandboxed execution environment lifecycle.
///
/// `close` must run on every exit path of instance execution, including
/// failures - a half-torn-down sandbox leaks containers.
#[async_trait]
pub trait Environment: Send {
    async fn start(&mut self) -> Result<()>;
    async fn close(&mut self) -> Result<()>;
}

/// Runs one instance to completion.
///
/// Side effects on success: a trajectory record at
/// `<output_dir>/<id>/<id>.traj` and (optionally) a patch artifact.
/// Failures are classified by [`DroverError::is_run_fatal`]: budget and
/// model-configuration errors abort the whole batch, anything else only
/// this instance.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(
        &self,
        instance: &BatchInstance,
        output_dir: &Path,
    ) -> Result<AgentRunResult>;

    /// True when the executor drives a human-in-the-loop agent. Incompatible
    /// with concurrent execution; rejected at configuration time.
    fn is_interactive(&self) -> bool {
        false
    }
}

// ============================================================================
// PROCESS ENVIRONMENT
// ============================================================================

/// Environment backed by optional shell setup/teardown commands
/// (e.g. `docker start ...` / `docker rm -f ...`).
pub struct ProcessEnvironment {
    instance_id: String,
    setup: Option<String>,
    teardown: Option<String>,
    started: bool,
}

impl ProcessEnvironment {
    pub fn new(instance_id: &str, setup: Option<String>, teardown: Option<String>) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            setup,
            teardown,
            started: false,
        }
    }

    async fn run_hook_cmd(&self, cmd: &str) -> Result<()> {
        let output = tokio::time::timeout(
            ENV_TIMEOUT,
            tokio::process::Command::new("sh")
                .arg("-c")
                .arg(cmd)
                .env("DROVER_INSTANCE_ID", &self.instance_id)
                .output(),
        )
        .await
        .map_err(|_| DroverError::Environment {
            instance_id: self.instance_id.clone(),
            details: format!("environment command timed out after {}s", ENV_TIMEOUT.as_secs()),
        })?
        .map_err(|e| DroverError::Environment {
            instance_id: self.instance_id.clone(),
            details: e.to_string(),
        })?;

        if !output.status.success() {
            return Err(DroverError::Environment {
                instance_id: self.instance_id.clone(),
                details: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Environment for ProcessEnvironment {
    async fn start(&mut self) -> Result<()> {
        if let Some(cmd) = self.setup.clone() {
            debug!(instance_id = %self.instance_id, "Starting environment");
            self.run_hook_cmd(&cmd).await?;
        }
        self.started = true;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if !self.started {
            return Ok(());
        }
        self.started = false;
        if let Some(cmd) = self.teardown.clone() {
            debug!(instance_id = %self.instance_id, "Closing environment");
            self.run_hook_cmd(&cmd).await?;
        }
        Ok(())
    }
}

// ============================================================================
// COMMAND EXECUTOR
// ============================================================================

/// Executor that runs an external agent command per instance.
///
/// The command receives the instance through env vars
/// (`DROVER_INSTANCE_ID`, `DROVER_PROBLEM_FILE`, `DROVER_OUTPUT_DIR`,
/// `DROVER_ENV_JSON`) and is expected to leave its patch at
/// `<output_dir>/<id>/<id>.patch`. The executor writes the trajectory
/// record from the captured output.
#[derive(Clone)]
pub struct CommandExecutor {
    agent_cmd: String,
    env_setup: Option<String>,
    env_teardown: Option<String>,
    timeout: Duration,
    interactive: bool,
}

impl CommandExecutor {
    pub fn new(agent_cmd: impl Into<String>) -> Self {
        Self {
            agent_cmd: agent_cmd.into(),
            env_setup: None,
            env_teardown: None,
            timeout: AGENT_TIMEOUT,
            interactive: false,
        }
    }

    /// Shell command run before the agent (sandbox boot)
    pub fn with_env_setup(mut self, cmd: Option<String>) -> Self {
        self.env_setup = cmd;
        self
    }

    /// Shell command run after the agent, on every exit path (sandbox teardown)
    pub fn with_env_teardown(mut self, cmd: Option<String>) -> Self {
        self.env_teardown = cmd;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Mark the agent as human-in-the-loop (stdio attached to the operator)
    pub fn interactive(mut self, interactive: bool) -> Self {
        self.interactive = interactive;
        self
    }

    async fn run_agent(
        &self,
        instance: &BatchInstance,
        instance_dir: &Path,
        output_dir: &Path,
    ) -> Result<AgentRunResult> {
        let problem_file = instance_dir.join(format!("{}.problem.md", instance.id));
        tokio::fs::write(&problem_file, &instance.problem_statement).await?;

        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c")
            .arg(&self.agent_cmd)
            .env("DROVER_INSTANCE_ID", &instance.id)
            .env("DROVER_PROBLEM_FILE", &problem_file)
            .env("DROVER_OUTPUT_DIR", output_dir)
            .env("DROVER_ENV_JSON", serde_json::to_string(&instance.env)?);

        if self.interactive {
            // Human-driven agent: hand over the terminal and wait.
            let status = cmd.status().await.map_err(|e| DroverError::Execution {
                instance_id: instance.id.clone(),
                details: format!("failed to launch agent: {e}"),
            })?;
            return self
                .finish(instance, instance_dir, output_dir, status.success(), String::new())
                .await;
        }

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| DroverError::Timeout {
                instance_id: instance.id.clone(),
                timeout_s: self.timeout.as_secs(),
            })?
            .map_err(|e| DroverError::Execution {
                instance_id: instance.id.clone(),
                details: format!("failed to launch agent: {e}"),
            })?;

        if !output.status.success() {
            return Err(DroverError::Execution {
                instance_id: instance.id.clone(),
                details: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        self.finish(instance, instance_dir, output_dir, true, stdout)
            .await
    }

    async fn finish(
        &self,
        instance: &BatchInstance,
        instance_dir: &Path,
        output_dir: &Path,
        success: bool,
        stdout: String,
    ) -> Result<AgentRunResult> {
        let exit_status = if success { "submitted" } else { EARLY_EXIT };
        let info = RunInfo {
            exit_status: Some(exit_status.to_string()),
            extra: Default::default(),
        };

        let record = TrajectoryRecord {
            history: vec![
                json!({"role": "user", "content": instance.problem_statement}),
                json!({"role": "agent", "content": stdout}),
            ],
            info: info.clone(),
        };
        record.write(output_dir, &instance.id)?;

        let patch_path = instance_dir.join(format!("{}.patch", instance.id));
        let artifacts = match tokio::fs::read_to_string(&patch_path).await {
            Ok(patch) => json!({ "model_patch": patch }),
            Err(_) => {
                warn!(instance_id = %instance.id, "Agent produced no patch artifact");
                json!({ "model_patch": null })
            }
        };

        Ok(AgentRunResult {
            instance_id: instance.id.clone(),
            info,
            artifacts,
        })
    }
}

#[async_trait]
impl TaskExecutor for CommandExecutor {
    async fn execute(
        &self,
        instance: &BatchInstance,
        output_dir: &Path,
    ) -> Result<AgentRunResult> {
        let instance_dir = output_dir.join(&instance.id);
        tokio::fs::create_dir_all(&instance_dir).await?;

        let mut env = ProcessEnvironment::new(
            &instance.id,
            self.env_setup.clone(),
            self.env_teardown.clone(),
        );
        env.start().await?;

        // Teardown runs whether the agent succeeded or not; the agent's
        // error wins over a teardown error.
        let run = self.run_agent(instance, &instance_dir, output_dir).await;
        let closed = env.close().await;
        let result = run?;
        closed?;
        Ok(result)
    }

    fn is_interactive(&self) -> bool {
        self.interactive
    }
}
