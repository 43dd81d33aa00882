//! Worktree lifecycle operations that span git and the container runtime.
//!
//! Each operation is a fixed list of steps. Steps are not rolled back on
//! failure; the error names the steps that already took effect and the
//! one that failed.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::path::Path;
use tracing::{info, warn};

use crate::error::{ApiError, ApiResult};
use crate::fleet::{Fleet, validate_name};
use crate::runtime::{Container, RuntimeResult, Worktree};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    CreateWorktree,
    DeleteWorktree,
    StartWorktree,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::CreateWorktree => "create worktree",
            Self::DeleteWorktree => "delete worktree",
            Self::StartWorktree => "start worktree",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    CreateWorktree,
    CreateContainer,
    StartContainer,
    StopContainer,
    DestroyContainer,
    RemoveWorktree,
}

impl Step {
    /// Past this step the prior state cannot be recovered by retrying or
    /// re-running the opposite operation.
    pub fn is_point_of_no_return(self) -> bool {
        matches!(self, Self::DestroyContainer | Self::RemoveWorktree)
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::CreateWorktree => "create worktree",
            Self::CreateContainer => "create container",
            Self::StartContainer => "start container",
            Self::StopContainer => "stop container",
            Self::DestroyContainer => "destroy container",
            Self::RemoveWorktree => "remove worktree",
        })
    }
}

#[derive(Debug)]
pub struct CompoundFailure {
    pub operation: Operation,
    pub completed: Vec<Step>,
    pub failed: Step,
    pub cause: ApiError,
}

impl fmt::Display for CompoundFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed at step '{}'", self.operation, self.failed)?;
        if !self.completed.is_empty() {
            let done: Vec<String> = self.completed.iter().map(|s| s.to_string()).collect();
            write!(f, " (already done: {})", done.join(", "))?;
        }
        write!(f, ": {}", self.cause)
    }
}

/// What a successful compound operation did.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompoundReport {
    pub operation: Operation,
    pub completed_steps: Vec<Step>,
    pub worktree: Worktree,
    pub container: Option<Container>,
}

struct Run {
    operation: Operation,
    completed: Vec<Step>,
}

impl Run {
    fn new(operation: Operation) -> Self {
        Self {
            operation,
            completed: Vec::new(),
        }
    }

    async fn step<T>(
        &mut self,
        step: Step,
        fut: impl Future<Output = RuntimeResult<T>>,
    ) -> ApiResult<T> {
        match fut.await {
            Ok(v) => {
                info!(operation = %self.operation, step = %step, "step completed");
                self.completed.push(step);
                Ok(v)
            }
            Err(e) => {
                warn!(operation = %self.operation, step = %step, "step failed: {}", e);
                if self.completed.iter().any(|s| s.is_point_of_no_return()) {
                    warn!(
                        operation = %self.operation,
                        completed = ?self.completed,
                        "failed after an irreversible step, not rolling back"
                    );
                }
                Err(ApiError::Compound(Box::new(CompoundFailure {
                    operation: self.operation,
                    completed: self.completed.clone(),
                    failed: step,
                    cause: ApiError::runtime(step, e),
                })))
            }
        }
    }

    fn finish(self, worktree: Worktree, container: Option<Container>) -> CompoundReport {
        CompoundReport {
            operation: self.operation,
            completed_steps: self.completed,
            worktree,
            container,
        }
    }
}

/// Whether a compound error left side effects behind.
pub fn mutated_anything(err: &ApiError) -> bool {
    matches!(err, ApiError::Compound(f) if !f.completed.is_empty())
}

/// Create a worktree, then (optionally) create and start its container.
pub async fn create_worktree(
    fleet: &Fleet,
    project: &Path,
    name: &str,
    branch: Option<&str>,
    start: bool,
) -> ApiResult<CompoundReport> {
    validate_name("worktree", name)?;
    if fleet
        .worktrees(project)
        .await?
        .iter()
        .any(|w| w.name == name)
    {
        return Err(ApiError::Conflict(format!(
            "worktree {name} already exists in {}",
            project.display()
        )));
    }

    let mut run = Run::new(Operation::CreateWorktree);
    let worktree = run
        .step(
            Step::CreateWorktree,
            fleet.worktree_manager().create(project, name, branch),
        )
        .await?;
    if !start {
        return Ok(run.finish(worktree, None));
    }

    let container = start_for(fleet, &mut run, &worktree).await?;
    Ok(run.finish(worktree, Some(container)))
}

/// Create (if missing) and start the container for an existing worktree.
pub async fn start_worktree(
    fleet: &Fleet,
    project: &Path,
    name: &str,
) -> ApiResult<CompoundReport> {
    let worktree = fleet.worktree(project, name).await?;
    if let Some(c) = fleet.container_for_path(&worktree.path).await?
        && c.is_running()
    {
        return Err(ApiError::BadState(format!(
            "container {} for worktree {name} is already running",
            c.name
        )));
    }

    let mut run = Run::new(Operation::StartWorktree);
    let container = start_for(fleet, &mut run, &worktree).await?;
    Ok(run.finish(worktree, Some(container)))
}

async fn start_for(fleet: &Fleet, run: &mut Run, worktree: &Worktree) -> ApiResult<Container> {
    let container = match fleet.container_for_path(&worktree.path).await? {
        Some(c) => c,
        None => {
            run.step(
                Step::CreateContainer,
                fleet.runtime().create(&worktree.path),
            )
            .await?
        }
    };
    if !container.is_running() {
        run.step(Step::StartContainer, fleet.runtime().start(&container.id))
            .await?;
    }
    fleet.container(&container.id).await
}

/// Stop and destroy the worktree's container, then remove the worktree.
pub async fn delete_worktree(
    fleet: &Fleet,
    project: &Path,
    name: &str,
) -> ApiResult<CompoundReport> {
    let worktree = fleet.worktree(project, name).await?;
    if worktree.is_main {
        return Err(ApiError::BadState(format!(
            "{name} is the main worktree of {} and cannot be deleted",
            project.display()
        )));
    }

    let mut run = Run::new(Operation::DeleteWorktree);
    let container = fleet.container_for_path(&worktree.path).await?;
    if let Some(c) = &container {
        if c.is_running() {
            run.step(Step::StopContainer, fleet.runtime().stop(&c.id))
                .await?;
        }
        run.step(Step::DestroyContainer, fleet.runtime().destroy(&c.id))
            .await?;
    }
    run.step(
        Step::RemoveWorktree,
        fleet.worktree_manager().remove(project, &worktree),
    )
    .await?;
    Ok(run.finish(worktree, container))
}
