//! The authoritative view of containers, sessions, projects and worktrees.
//!
//! `Fleet` holds no cached entity state. Every call re-reads from the
//! collaborators, resolves the target by id-or-name, and checks lifecycle
//! preconditions before acting.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use crate::cursor;
use crate::error::{ApiError, ApiResult};
use crate::runtime::{
    Container, ContainerRuntime, Multiplexer, PaneCursor, ProjectSource, Session, Worktree,
    WorktreeManager,
};

/// Result of a capture read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capture {
    pub content: String,
    /// Absolute cursor position (scrollback size plus visible row)
    pub cursor_y: u64,
    pub lines_requested: u32,
    /// The scrollback is full and `cursor_y` has stopped advancing
    #[serde(default)]
    pub saturated: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hierarchy {
    pub projects: Vec<ProjectView>,
    /// Containers whose path matches no discovered worktree
    pub unmatched: Vec<Container>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectView {
    pub name: String,
    pub path: PathBuf,
    /// Path segment used by the worktree endpoints
    pub encoded_path: String,
    pub worktrees: Vec<WorktreeView>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorktreeView {
    #[serde(flatten)]
    pub worktree: Worktree,
    pub container: Option<Container>,
}

pub fn encode_project_path(path: &Path) -> String {
    URL_SAFE_NO_PAD.encode(path.to_string_lossy().as_bytes())
}

/// Decode a base64-url project path segment. Padding is optional.
pub fn decode_project_path(encoded: &str) -> ApiResult<PathBuf> {
    let bytes = URL_SAFE_NO_PAD
        .decode(encoded.trim_end_matches('='))
        .map_err(|e| ApiError::Validation(format!("invalid project path encoding: {e}")))?;
    let path = String::from_utf8(bytes)
        .map_err(|_| ApiError::Validation("project path is not valid UTF-8".into()))?;
    let path = PathBuf::from(path);
    if !path.is_absolute() {
        return Err(ApiError::Validation(format!(
            "project path must be absolute: {}",
            path.display()
        )));
    }
    Ok(path)
}

/// Session and worktree names end up in tmux targets and on disk.
pub fn validate_name(kind: &str, name: &str) -> ApiResult<()> {
    if name.is_empty() || name.len() > 64 {
        return Err(ApiError::Validation(format!(
            "{kind} name must be 1-64 characters"
        )));
    }
    if name.starts_with('-')
        || name
            .chars()
            .any(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_')))
    {
        return Err(ApiError::Validation(format!(
            "{kind} name {name:?} may only contain letters, digits, '-' and '_'"
        )));
    }
    Ok(())
}

pub struct Fleet {
    runtime: Arc<dyn ContainerRuntime>,
    mux: Arc<dyn Multiplexer>,
    worktrees: Arc<dyn WorktreeManager>,
    projects: Arc<dyn ProjectSource>,
}

impl Fleet {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        mux: Arc<dyn Multiplexer>,
        worktrees: Arc<dyn WorktreeManager>,
        projects: Arc<dyn ProjectSource>,
    ) -> Self {
        Self {
            runtime,
            mux,
            worktrees,
            projects,
        }
    }

    pub(crate) fn runtime(&self) -> &dyn ContainerRuntime {
        self.runtime.as_ref()
    }

    pub(crate) fn multiplexer(&self) -> &dyn Multiplexer {
        self.mux.as_ref()
    }

    pub(crate) fn worktree_manager(&self) -> &dyn WorktreeManager {
        self.worktrees.as_ref()
    }

    // --- containers ---

    pub async fn containers(&self) -> ApiResult<Vec<Container>> {
        self.runtime
            .list()
            .await
            .map_err(|e| ApiError::runtime("list containers", e))
    }

    pub async fn container(&self, id_or_name: &str) -> ApiResult<Container> {
        let containers = self.containers().await?;
        // exact id or name wins over a prefix match
        if let Some(c) = containers
            .iter()
            .find(|c| c.id == id_or_name || c.name == id_or_name)
        {
            return Ok(c.clone());
        }
        let mut prefixed = containers.into_iter().filter(|c| c.matches(id_or_name));
        match (prefixed.next(), prefixed.next()) {
            (Some(c), None) => Ok(c),
            (Some(_), Some(_)) => Err(ApiError::Validation(format!(
                "container id prefix {id_or_name:?} is ambiguous"
            ))),
            _ => Err(ApiError::NotFound(format!(
                "container {id_or_name} not found"
            ))),
        }
    }

    pub async fn running_container(&self, id_or_name: &str) -> ApiResult<Container> {
        let container = self.container(id_or_name).await?;
        if !container.is_running() {
            return Err(ApiError::BadState(format!(
                "container {} is not running",
                container.name
            )));
        }
        Ok(container)
    }

    pub async fn container_for_path(&self, path: &Path) -> ApiResult<Option<Container>> {
        Ok(self
            .containers()
            .await?
            .into_iter()
            .find(|c| c.project_path == path))
    }

    pub async fn create_container(&self, project_path: &Path) -> ApiResult<Container> {
        if !project_path.is_absolute() {
            return Err(ApiError::Validation("project_path must be absolute".into()));
        }
        if let Some(existing) = self.container_for_path(project_path).await? {
            return Err(ApiError::Conflict(format!(
                "container {} already exists for {}",
                existing.name,
                project_path.display()
            )));
        }
        let container = self
            .runtime
            .create(project_path)
            .await
            .map_err(|e| ApiError::runtime("create container", e))?;
        info!(container = %container.name, path = %project_path.display(), "container created");
        Ok(container)
    }

    /// Start a stopped container, returning its state as re-read afterwards.
    pub async fn start_container(&self, id_or_name: &str) -> ApiResult<Container> {
        let container = self.container(id_or_name).await?;
        if container.is_running() {
            return Err(ApiError::BadState(format!(
                "container {} is already running",
                container.name
            )));
        }
        self.runtime
            .start(&container.id)
            .await
            .map_err(|e| ApiError::runtime("start container", e))?;
        info!(container = %container.name, "container started");
        self.container(&container.id).await
    }

    pub async fn stop_container(&self, id_or_name: &str) -> ApiResult<Container> {
        let container = self.container(id_or_name).await?;
        if !container.is_running() {
            return Err(ApiError::BadState(format!(
                "container {} is already stopped",
                container.name
            )));
        }
        self.runtime
            .stop(&container.id)
            .await
            .map_err(|e| ApiError::runtime("stop container", e))?;
        info!(container = %container.name, "container stopped");
        self.container(&container.id).await
    }

    /// Remove a container in any state. Returns what was removed.
    pub async fn destroy_container(&self, id_or_name: &str) -> ApiResult<Container> {
        let container = self.container(id_or_name).await?;
        self.runtime
            .destroy(&container.id)
            .await
            .map_err(|e| ApiError::runtime("destroy container", e))?;
        info!(container = %container.name, "container destroyed");
        Ok(container)
    }

    // --- sessions ---

    pub async fn sessions(&self, id_or_name: &str) -> ApiResult<(Container, Vec<Session>)> {
        let container = self.running_container(id_or_name).await?;
        let sessions = self
            .mux
            .list_sessions(&container)
            .await
            .map_err(|e| ApiError::runtime("list sessions", e))?;
        Ok((container, sessions))
    }

    /// Resolve a running container and a session that exists in it right now.
    pub async fn session(&self, id_or_name: &str, name: &str) -> ApiResult<(Container, Session)> {
        let (container, sessions) = self.sessions(id_or_name).await?;
        match sessions.into_iter().find(|s| s.name == name) {
            Some(s) => Ok((container, s)),
            None => Err(ApiError::NotFound(format!(
                "session {name} not found in container {}",
                container.name
            ))),
        }
    }

    pub async fn create_session(&self, id_or_name: &str, name: &str) -> ApiResult<Session> {
        validate_name("session", name)?;
        let (container, sessions) = self.sessions(id_or_name).await?;
        if sessions.iter().any(|s| s.name == name) {
            return Err(ApiError::Conflict(format!(
                "session {name} already exists in container {}",
                container.name
            )));
        }
        self.mux
            .create_session(&container, name)
            .await
            .map_err(|e| ApiError::runtime("create session", e))?;
        info!(container = %container.name, session = name, "session created");

        let (_, sessions) = self.sessions(&container.id).await?;
        sessions
            .into_iter()
            .find(|s| s.name == name)
            .ok_or_else(|| ApiError::Upstream(format!("session {name} vanished after creation")))
    }

    pub async fn kill_session(&self, id_or_name: &str, name: &str) -> ApiResult<()> {
        let (container, _) = self.session(id_or_name, name).await?;
        self.mux
            .kill_session(&container, name)
            .await
            .map_err(|e| ApiError::runtime("kill session", e))?;
        info!(container = %container.name, session = name, "session killed");
        Ok(())
    }

    async fn pane_cursor(&self, container: &Container, session: &str) -> ApiResult<PaneCursor> {
        self.mux
            .cursor(container, session)
            .await
            .map_err(|e| ApiError::runtime("read cursor", e))
    }

    /// Visible pane, optionally extended `backfill` lines into scrollback.
    pub async fn capture_visible(
        &self,
        id_or_name: &str,
        session: &str,
        backfill: u32,
    ) -> ApiResult<Capture> {
        let (container, _) = self.session(id_or_name, session).await?;
        let pane = self.pane_cursor(&container, session).await?;
        let content = self
            .mux
            .capture(&container, session, cursor::visible_with_backfill(backfill))
            .await
            .map_err(|e| ApiError::runtime("capture", e))?;
        Ok(Capture {
            content,
            cursor_y: cursor::position(pane),
            lines_requested: backfill,
            saturated: cursor::saturated(pane),
        })
    }

    /// Everything produced after `from`. Empty content when nothing is new,
    /// and also when the position went backwards; the caller compares
    /// `cursor_y` to `from` to tell those apart.
    pub async fn capture_since(
        &self,
        id_or_name: &str,
        session: &str,
        from: u64,
    ) -> ApiResult<Capture> {
        let (container, _) = self.session(id_or_name, session).await?;
        let pane = self.pane_cursor(&container, session).await?;
        let position = cursor::position(pane);
        let content = match cursor::range_since(from, pane) {
            Some(range) => self
                .mux
                .capture(&container, session, range)
                .await
                .map_err(|e| ApiError::runtime("capture", e))?,
            None => String::new(),
        };
        Ok(Capture {
            content,
            cursor_y: position,
            lines_requested: 0,
            saturated: cursor::saturated(pane),
        })
    }

    /// The last `lines` lines ending at the cursor row.
    pub async fn capture_last(
        &self,
        id_or_name: &str,
        session: &str,
        lines: u32,
    ) -> ApiResult<Capture> {
        let (container, _) = self.session(id_or_name, session).await?;
        let pane = self.pane_cursor(&container, session).await?;
        let content = self
            .mux
            .capture(&container, session, cursor::last_lines(lines, pane))
            .await
            .map_err(|e| ApiError::runtime("capture", e))?;
        Ok(Capture {
            content,
            cursor_y: cursor::position(pane),
            lines_requested: lines,
            saturated: cursor::saturated(pane),
        })
    }

    /// Type `text`, then press submit as a separate step.
    pub async fn send(
        &self,
        id_or_name: &str,
        session: &str,
        text: &str,
        submit: bool,
    ) -> ApiResult<()> {
        let (container, _) = self.session(id_or_name, session).await?;
        if !text.is_empty() {
            self.mux
                .send_text(&container, session, text)
                .await
                .map_err(|e| ApiError::runtime("send text", e))?;
        }
        if submit {
            self.mux
                .send_submit(&container, session)
                .await
                .map_err(|e| ApiError::runtime("send submit", e))?;
        }
        Ok(())
    }

    // --- projects & worktrees ---

    /// Only projects under the configured roots are addressable.
    pub async fn worktrees(&self, project: &Path) -> ApiResult<Vec<Worktree>> {
        if !self.is_known_project(project).await? {
            return Err(ApiError::NotFound(format!(
                "project {} not found",
                project.display()
            )));
        }
        self.worktrees
            .list(project)
            .await
            .map_err(|e| ApiError::runtime("list worktrees", e))
    }

    pub async fn worktree(&self, project: &Path, name: &str) -> ApiResult<Worktree> {
        self.worktrees(project)
            .await?
            .into_iter()
            .find(|w| w.name == name)
            .ok_or_else(|| {
                ApiError::NotFound(format!(
                    "worktree {name} not found in {}",
                    project.display()
                ))
            })
    }

    async fn is_known_project(&self, path: &Path) -> ApiResult<bool> {
        let projects = self
            .projects
            .projects()
            .await
            .map_err(|e| ApiError::runtime("list projects", e))?;
        Ok(projects.iter().any(|p| p.path == path))
    }

    /// Projects, their worktrees and matching containers, plus containers
    /// that belong to none of them.
    pub async fn hierarchy(&self) -> ApiResult<Hierarchy> {
        let projects = self
            .projects
            .projects()
            .await
            .map_err(|e| ApiError::runtime("list projects", e))?;
        let mut unmatched = self.containers().await?;
        let mut views = Vec::with_capacity(projects.len());

        for project in projects {
            let worktrees = match self.worktrees.list(&project.path).await {
                Ok(w) if !w.is_empty() => w,
                Ok(_) => vec![main_worktree(&project.path, &project.name)],
                Err(e) => {
                    warn!("Failed to list worktrees for {}: {}", project.path.display(), e);
                    vec![main_worktree(&project.path, &project.name)]
                }
            };
            let worktrees = worktrees
                .into_iter()
                .map(|worktree| {
                    let container = unmatched
                        .iter()
                        .position(|c| c.project_path == worktree.path)
                        .map(|i| unmatched.remove(i));
                    WorktreeView {
                        worktree,
                        container,
                    }
                })
                .collect();
            views.push(ProjectView {
                encoded_path: encode_project_path(&project.path),
                name: project.name,
                path: project.path,
                worktrees,
            });
        }

        Ok(Hierarchy {
            projects: views,
            unmatched,
        })
    }
}

fn main_worktree(path: &Path, name: &str) -> Worktree {
    Worktree {
        name: name.to_string(),
        path: path.to_path_buf(),
        branch: None,
        is_main: true,
    }
}
