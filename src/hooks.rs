//! Run lifecycle hooks
//!
//! Hooks observe the run without the engine knowing what they do:
//! status propagation, patch saving, notifications. Optional callbacks
//! are default no-op methods, so a hook only implements what it cares
//! about. There is deliberately no isolation between hooks: an error from
//! one propagates to the scheduler, which classifies it like any other
//! instance error.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::info;

use crate::error::Result;
use crate::executor::AgentRunResult;
use crate::instance::BatchInstance;

/// What a hook learns about the run at registration time.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub output_dir: PathBuf,
    pub n_instances: usize,
}

/// Lifecycle listener for a batch run.
///
/// `on_init` runs synchronously when the hook is registered and may
/// reject the run by returning an error, which aborts startup.
#[async_trait]
pub trait RunHook: Send + Sync {
    fn on_init(&mut self, _run: &RunContext) -> Result<()> {
        Ok(())
    }

    async fn on_start(&self) -> Result<()> {
        Ok(())
    }

    async fn on_instance_start(
        &self,
        _instance: &BatchInstance,
        _instance_dir: &Path,
    ) -> Result<()> {
        Ok(())
    }

    async fn on_instance_completed(&self, _result: &AgentRunResult) -> Result<()> {
        Ok(())
    }

    async fn on_end(&self) -> Result<()> {
        Ok(())
    }
}

/// Ordered collection of hooks, invoked in registration order.
#[derive(Default)]
pub struct CombinedHooks {
    hooks: Vec<Box<dyn RunHook>>,
}

impl CombinedHooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a hook. Its `on_init` runs immediately; an error aborts
    /// startup before any instance runs.
    pub fn add(&mut self, mut hook: Box<dyn RunHook>, run: &RunContext) -> Result<()> {
        hook.on_init(run)?;
        self.hooks.push(hook);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    pub async fn on_start(&self) -> Result<()> {
        for hook in &self.hooks {
            hook.on_start().await?;
        }
        Ok(())
    }

    pub async fn on_instance_start(
        &self,
        instance: &BatchInstance,
        instance_dir: &Path,
    ) -> Result<()> {
        for hook in &self.hooks {
            hook.on_instance_start(instance, instance_dir).await?;
        }
        Ok(())
    }

    pub async fn on_instance_completed(&self, result: &AgentRunResult) -> Result<()> {
        for hook in &self.hooks {
            hook.on_instance_completed(result).await?;
        }
        Ok(())
    }

    pub async fn on_end(&self) -> Result<()> {
        for hook in &self.hooks {
            hook.on_end().await?;
        }
        Ok(())
    }
}

/// Persists each completed instance's patch next to its trajectory
/// (`<output_dir>/<id>/<id>.patch`).
#[derive(Default)]
pub struct SavePatchHook {
    output_dir: PathBuf,
}

#[async_trait]
impl RunHook for SavePatchHook {
    fn on_init(&mut self, run: &RunContext) -> Result<()> {
        self.output_dir = run.output_dir.clone();
        Ok(())
    }

    async fn on_instance_completed(&self, result: &AgentRunResult) -> Result<()> {
        let Some(patch) = result.model_patch() else {
            return Ok(());
        };
        let path = self
            .output_dir
            .join(&result.instance_id)
            .join(format!("{}.patch", result.instance_id));
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, patch).await?;
        info!(instance_id = %result.instance_id, path = %path.display(), "Saved patch");
        Ok(())
    }
}
