//! Collaborators the control plane drives but does not own.
//!
//! Each concern is a trait so the server can be wired with the real
//! shell-out adapters in production and with in-memory fakes in tests.

pub mod docker;
pub mod git;
pub mod projects;
pub mod tmux;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Lifecycle state as reported by the container runtime.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Stopped,
    Running,
    Unknown,
}

impl ContainerState {
    /// Map a runtime status word (`running`, `exited`, `created`, ...)
    pub fn from_runtime_status(status: &str) -> Self {
        match status.trim().to_ascii_lowercase().as_str() {
            "running" => Self::Running,
            "exited" | "created" | "dead" | "stopped" => Self::Stopped,
            _ => Self::Unknown,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Container {
    pub id: String,
    pub name: String,
    pub state: ContainerState,
    pub project_path: PathBuf,
    /// User for `exec` into this container
    pub remote_user: String,
    pub created_at: DateTime<Utc>,
}

impl Container {
    pub fn is_running(&self) -> bool {
        self.state == ContainerState::Running
    }

    pub fn matches(&self, id_or_name: &str) -> bool {
        self.id == id_or_name
            || self.name == id_or_name
            || (id_or_name.len() >= 4 && self.id.starts_with(id_or_name))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Session {
    pub name: String,
    pub windows: u32,
    pub attached: bool,
}

/// Where the pane's cursor sits right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaneCursor {
    /// Lines scrolled off the top into history
    pub history_size: u64,
    /// Row of the cursor within the visible pane
    pub cursor_y: u64,
    /// Most lines the history keeps; 0 when unknown
    pub history_limit: u64,
}

/// Inclusive line range relative to the top of the visible pane;
/// negative values reach into scrollback. `None` means the pane edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LineRange {
    pub start: Option<i64>,
    pub end: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Worktree {
    pub name: String,
    pub path: PathBuf,
    pub branch: Option<String>,
    pub is_main: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Project {
    pub name: String,
    pub path: PathBuf,
}

/// Errors from collaborators. The API layer classifies these; nothing
/// here is shown to a client unclassified.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("container {0} is not running")]
    NotRunning(String),

    /// Git refused for a safety reason (dirty tree, unmerged branch).
    #[error("{0}")]
    Refused(String),

    #[error("`{command}` failed: {stderr}")]
    CommandFailed { command: String, stderr: String },

    #[error("could not parse {what}: {detail}")]
    Parse { what: String, detail: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type RuntimeResult<T> = Result<T, RuntimeError>;

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn list(&self) -> RuntimeResult<Vec<Container>>;
    /// Create (but do not start) a container for a project path.
    async fn create(&self, project_path: &Path) -> RuntimeResult<Container>;
    async fn start(&self, id: &str) -> RuntimeResult<()>;
    async fn stop(&self, id: &str) -> RuntimeResult<()>;
    async fn destroy(&self, id: &str) -> RuntimeResult<()>;
}

#[async_trait]
pub trait Multiplexer: Send + Sync {
    async fn list_sessions(&self, container: &Container) -> RuntimeResult<Vec<Session>>;
    async fn create_session(&self, container: &Container, name: &str) -> RuntimeResult<()>;
    async fn kill_session(&self, container: &Container, name: &str) -> RuntimeResult<()>;
    async fn cursor(&self, container: &Container, session: &str) -> RuntimeResult<PaneCursor>;
    async fn capture(
        &self,
        container: &Container,
        session: &str,
        range: LineRange,
    ) -> RuntimeResult<String>;
    /// Type `text` literally, without submitting it.
    async fn send_text(&self, container: &Container, session: &str, text: &str)
    -> RuntimeResult<()>;
    /// Press the submit key.
    async fn send_submit(&self, container: &Container, session: &str) -> RuntimeResult<()>;
    /// Program and arguments that attach an interactive terminal to `session`.
    fn attach_command(&self, container: &Container, session: &str) -> (String, Vec<String>);
}

#[async_trait]
pub trait WorktreeManager: Send + Sync {
    async fn list(&self, project: &Path) -> RuntimeResult<Vec<Worktree>>;
    async fn create(&self, project: &Path, name: &str, branch: Option<&str>)
    -> RuntimeResult<Worktree>;
    async fn remove(&self, project: &Path, worktree: &Worktree) -> RuntimeResult<()>;
}

#[async_trait]
pub trait ProjectSource: Send + Sync {
    async fn projects(&self) -> RuntimeResult<Vec<Project>>;
}

/// Run a command, returning stdout on success and a `CommandFailed` with
/// stderr otherwise.
pub(crate) async fn run_command(program: &str, args: &[&str]) -> RuntimeResult<String> {
    run_command_in(program, args, None).await
}

pub(crate) async fn run_command_in(
    program: &str,
    args: &[&str],
    cwd: Option<&Path>,
) -> RuntimeResult<String> {
    let mut cmd = tokio::process::Command::new(program);
    cmd.args(args);
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }
    tracing::debug!(program, ?args, "running collaborator command");
    let output = cmd.output().await?;
    if !output.status.success() {
        return Err(RuntimeError::CommandFailed {
            command: format!("{} {}", program, args.join(" ")),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_state_from_status() {
        assert_eq!(
            ContainerState::from_runtime_status("running"),
            ContainerState::Running
        );
        assert_eq!(
            ContainerState::from_runtime_status("Exited"),
            ContainerState::Stopped
        );
        assert_eq!(
            ContainerState::from_runtime_status("created"),
            ContainerState::Stopped
        );
        assert_eq!(
            ContainerState::from_runtime_status("restarting"),
            ContainerState::Unknown
        );
    }

    #[test]
    fn container_state_serializes_lowercase() {
        let json = serde_json::to_value(ContainerState::Running).unwrap();
        assert_eq!(json, "running");
    }

    #[test]
    fn container_matches_id_name_and_prefix() {
        let c = Container {
            id: "abcdef123456".into(),
            name: "web-dev".into(),
            state: ContainerState::Stopped,
            project_path: "/src/web".into(),
            remote_user: "vscode".into(),
            created_at: Utc::now(),
        };
        assert!(c.matches("abcdef123456"));
        assert!(c.matches("web-dev"));
        assert!(c.matches("abcd"));
        // too short to be an unambiguous prefix
        assert!(!c.matches("abc"));
        assert!(!c.matches("other"));
    }

    #[tokio::test]
    async fn run_command_reports_stderr() {
        let err = run_command("sh", &["-c", "echo boom >&2; exit 3"])
            .await
            .unwrap_err();
        match err {
            RuntimeError::CommandFailed { stderr, .. } => assert_eq!(stderr, "boom"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn run_command_in_uses_cwd() {
        let tmp = tempfile::tempdir().unwrap();
        let out = run_command_in("pwd", &[], Some(tmp.path())).await.unwrap();
        let expected = tmp.path().canonicalize().unwrap();
        assert_eq!(
            std::path::Path::new(out.trim()).canonicalize().unwrap(),
            expected
        );
    }
}
