//! In-memory collaborators for handler and fleet tests.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::AppState;
use crate::events::EventBroadcaster;
use crate::fleet::Fleet;
use crate::metrics::ServerMetrics;
use crate::runtime::git::worktree_path;
use crate::runtime::{
    Container, ContainerRuntime, ContainerState, LineRange, Multiplexer, PaneCursor, Project,
    ProjectSource, RuntimeError, RuntimeResult, Session, Worktree, WorktreeManager,
};

/// Rows in the fake pane.
pub const PANE_HEIGHT: usize = 24;

#[derive(Default)]
pub struct FakeRuntime {
    containers: Mutex<Vec<Container>>,
    calls: Mutex<Vec<String>>,
    fail_start: AtomicBool,
    next_id: AtomicUsize,
}

impl FakeRuntime {
    pub fn insert(&self, id: &str, name: &str, path: &str, state: ContainerState) {
        self.containers.lock().unwrap().push(Container {
            id: id.into(),
            name: name.into(),
            state,
            project_path: path.into(),
            remote_user: "vscode".into(),
            created_at: Utc::now(),
        });
    }

    /// Mutating calls received, as `"<op> <id>"`.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn fail_start(&self, fail: bool) {
        self.fail_start.store(fail, Ordering::SeqCst);
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn set_state(&self, id: &str, state: ContainerState) -> RuntimeResult<()> {
        let mut containers = self.containers.lock().unwrap();
        let c = containers
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| RuntimeError::NotFound(format!("container {id}")))?;
        c.state = state;
        Ok(())
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn list(&self) -> RuntimeResult<Vec<Container>> {
        Ok(self.containers.lock().unwrap().clone())
    }

    async fn create(&self, project_path: &Path) -> RuntimeResult<Container> {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        let name = project_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "container".into());
        let container = Container {
            id: format!("f{n:07x}"),
            name,
            state: ContainerState::Stopped,
            project_path: project_path.to_path_buf(),
            remote_user: "vscode".into(),
            created_at: Utc::now(),
        };
        self.record(format!("create {}", container.id));
        self.containers.lock().unwrap().push(container.clone());
        Ok(container)
    }

    async fn start(&self, id: &str) -> RuntimeResult<()> {
        self.record(format!("start {id}"));
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(RuntimeError::CommandFailed {
                command: format!("docker start {id}"),
                stderr: "port is already allocated".into(),
            });
        }
        self.set_state(id, ContainerState::Running)
    }

    async fn stop(&self, id: &str) -> RuntimeResult<()> {
        self.record(format!("stop {id}"));
        self.set_state(id, ContainerState::Stopped)
    }

    async fn destroy(&self, id: &str) -> RuntimeResult<()> {
        self.record(format!("destroy {id}"));
        let mut containers = self.containers.lock().unwrap();
        let before = containers.len();
        containers.retain(|c| c.id != id);
        if containers.len() == before {
            return Err(RuntimeError::NotFound(format!("container {id}")));
        }
        Ok(())
    }
}

#[derive(Default)]
struct FakePane {
    lines: Vec<String>,
    sent: Vec<String>,
    /// Like tmux's history-limit: older lines are discarded past it.
    history_limit: Option<u64>,
}

impl FakePane {
    /// The cursor sits on the last written line.
    fn cursor(&self) -> PaneCursor {
        let len = self.lines.len() as u64;
        let visible = len.min(PANE_HEIGHT as u64);
        PaneCursor {
            history_size: len - visible,
            cursor_y: visible.saturating_sub(1),
            history_limit: self.history_limit.unwrap_or(0),
        }
    }

    fn capture(&self, range: LineRange) -> String {
        let cursor = self.cursor();
        let history = cursor.history_size as i64;
        let start = history + range.start.unwrap_or(0);
        let end = history + range.end.unwrap_or(PANE_HEIGHT as i64 - 1);
        let len = self.lines.len() as i64;
        let (start, end) = (start.max(0), end.min(len - 1));
        if start > end {
            return String::new();
        }
        self.lines[start as usize..=end as usize]
            .iter()
            .map(|l| format!("{l}\n"))
            .collect()
    }
}

/// Sessions keyed by container id, each with a scripted pane.
#[derive(Default)]
pub struct FakeMux {
    panes: Mutex<HashMap<String, Vec<(String, FakePane)>>>,
}

impl FakeMux {
    pub fn add_session(&self, container_id: &str, name: &str) {
        self.panes
            .lock()
            .unwrap()
            .entry(container_id.to_string())
            .or_default()
            .push((name.to_string(), FakePane::default()));
    }

    pub fn remove_session(&self, container_id: &str, name: &str) {
        if let Some(sessions) = self.panes.lock().unwrap().get_mut(container_id) {
            sessions.retain(|(n, _)| n != name);
        }
    }

    pub fn push_output(&self, container_id: &str, session: &str, lines: &[&str]) {
        self.with_pane(container_id, session, |p| {
            p.lines.extend(lines.iter().map(|l| l.to_string()));
            if let Some(limit) = p.history_limit {
                let keep = limit as usize + PANE_HEIGHT;
                if p.lines.len() > keep {
                    p.lines.drain(..p.lines.len() - keep);
                }
            }
            Ok(())
        })
        .unwrap();
    }

    pub fn set_history_limit(&self, container_id: &str, session: &str, limit: u64) {
        self.with_pane(container_id, session, |p| {
            p.history_limit = Some(limit);
            Ok(())
        })
        .unwrap();
    }

    /// Simulate `clear`: the history is dropped and the cursor returns to the top.
    pub fn clear(&self, container_id: &str, session: &str) {
        self.with_pane(container_id, session, |p| {
            p.lines.clear();
            Ok(())
        })
        .unwrap();
    }

    pub fn sent(&self, container_id: &str, session: &str) -> Vec<String> {
        self.with_pane(container_id, session, |p| Ok(p.sent.clone()))
            .unwrap()
    }

    fn with_pane<T>(
        &self,
        container_id: &str,
        session: &str,
        f: impl FnOnce(&mut FakePane) -> RuntimeResult<T>,
    ) -> RuntimeResult<T> {
        let mut panes = self.panes.lock().unwrap();
        let pane = panes
            .get_mut(container_id)
            .and_then(|s| s.iter_mut().find(|(n, _)| n == session))
            .map(|(_, p)| p)
            .ok_or_else(|| RuntimeError::NotFound(format!("session {session}")))?;
        f(pane)
    }
}

fn ensure_running(container: &Container) -> RuntimeResult<()> {
    if container.is_running() {
        Ok(())
    } else {
        Err(RuntimeError::NotRunning(container.name.clone()))
    }
}

#[async_trait]
impl Multiplexer for FakeMux {
    async fn list_sessions(&self, container: &Container) -> RuntimeResult<Vec<Session>> {
        ensure_running(container)?;
        Ok(self
            .panes
            .lock()
            .unwrap()
            .get(&container.id)
            .map(|s| {
                s.iter()
                    .map(|(name, _)| Session {
                        name: name.clone(),
                        windows: 1,
                        attached: false,
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn create_session(&self, container: &Container, name: &str) -> RuntimeResult<()> {
        ensure_running(container)?;
        if self.with_pane(&container.id, name, |_| Ok(())).is_ok() {
            return Err(RuntimeError::AlreadyExists(format!("session {name}")));
        }
        self.add_session(&container.id, name);
        Ok(())
    }

    async fn kill_session(&self, container: &Container, name: &str) -> RuntimeResult<()> {
        ensure_running(container)?;
        self.with_pane(&container.id, name, |_| Ok(()))?;
        self.remove_session(&container.id, name);
        Ok(())
    }

    async fn cursor(&self, container: &Container, session: &str) -> RuntimeResult<PaneCursor> {
        ensure_running(container)?;
        self.with_pane(&container.id, session, |p| Ok(p.cursor()))
    }

    async fn capture(
        &self,
        container: &Container,
        session: &str,
        range: LineRange,
    ) -> RuntimeResult<String> {
        ensure_running(container)?;
        self.with_pane(&container.id, session, |p| Ok(p.capture(range)))
    }

    async fn send_text(
        &self,
        container: &Container,
        session: &str,
        text: &str,
    ) -> RuntimeResult<()> {
        ensure_running(container)?;
        self.with_pane(&container.id, session, |p| {
            p.sent.push(format!("text:{text}"));
            Ok(())
        })
    }

    async fn send_submit(&self, container: &Container, session: &str) -> RuntimeResult<()> {
        ensure_running(container)?;
        self.with_pane(&container.id, session, |p| {
            p.sent.push("submit".into());
            Ok(())
        })
    }

    fn attach_command(&self, _container: &Container, _session: &str) -> (String, Vec<String>) {
        // prints something and waits for input, like an attached session
        ("/bin/sh".into(), vec!["-c".into(), "echo attached; cat".into()])
    }
}

#[derive(Default)]
pub struct FakeWorktrees {
    trees: Mutex<HashMap<PathBuf, Vec<Worktree>>>,
    dirty: Mutex<HashSet<PathBuf>>,
    created: AtomicUsize,
}

impl FakeWorktrees {
    pub fn add_project(&self, path: &str) {
        let path = PathBuf::from(path);
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        self.trees.lock().unwrap().insert(
            path.clone(),
            vec![Worktree {
                name,
                path,
                branch: Some("main".into()),
                is_main: true,
            }],
        );
    }

    pub fn mark_dirty(&self, path: &Path) {
        self.dirty.lock().unwrap().insert(path.to_path_buf());
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WorktreeManager for FakeWorktrees {
    async fn list(&self, project: &Path) -> RuntimeResult<Vec<Worktree>> {
        self.trees
            .lock()
            .unwrap()
            .get(project)
            .cloned()
            .ok_or_else(|| RuntimeError::NotFound(format!("repository {}", project.display())))
    }

    async fn create(
        &self,
        project: &Path,
        name: &str,
        branch: Option<&str>,
    ) -> RuntimeResult<Worktree> {
        let mut trees = self.trees.lock().unwrap();
        let list = trees
            .get_mut(project)
            .ok_or_else(|| RuntimeError::NotFound(format!("repository {}", project.display())))?;
        let worktree = Worktree {
            name: name.into(),
            path: worktree_path(project, name),
            branch: Some(branch.unwrap_or(name).to_string()),
            is_main: false,
        };
        list.push(worktree.clone());
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(worktree)
    }

    async fn remove(&self, project: &Path, worktree: &Worktree) -> RuntimeResult<()> {
        if self.dirty.lock().unwrap().contains(&worktree.path) {
            return Err(RuntimeError::Refused(format!(
                "fatal: '{}' contains modified or untracked files, use --force to delete it",
                worktree.path.display()
            )));
        }
        let mut trees = self.trees.lock().unwrap();
        if let Some(list) = trees.get_mut(project) {
            list.retain(|w| w.path != worktree.path);
        }
        Ok(())
    }
}

pub struct FakeProjects(pub Vec<Project>);

#[async_trait]
impl ProjectSource for FakeProjects {
    async fn projects(&self) -> RuntimeResult<Vec<Project>> {
        Ok(self.0.clone())
    }
}

/// Handles to the fakes behind a test fleet.
pub struct Fakes {
    pub runtime: Arc<FakeRuntime>,
    pub mux: Arc<FakeMux>,
    pub worktrees: Arc<FakeWorktrees>,
}

/// A fleet with two projects and three containers:
/// `web` (running, session `main`), `api` (stopped), and `scratch`
/// (running, not under any project).
pub fn test_fleet() -> (Fleet, Fakes) {
    let runtime = Arc::new(FakeRuntime::default());
    runtime.insert("c0ffee01", "web", "/src/web", ContainerState::Running);
    runtime.insert("deadbeef02", "api", "/src/api", ContainerState::Stopped);
    runtime.insert("0badc0de03", "scratch", "/tmp/scratch", ContainerState::Running);

    let mux = Arc::new(FakeMux::default());
    mux.add_session("c0ffee01", "main");

    let worktrees = Arc::new(FakeWorktrees::default());
    worktrees.add_project("/src/web");
    worktrees.add_project("/src/api");

    let projects = Arc::new(FakeProjects(vec![
        Project {
            name: "api".into(),
            path: "/src/api".into(),
        },
        Project {
            name: "web".into(),
            path: "/src/web".into(),
        },
    ]));

    let fleet = Fleet::new(runtime.clone(), mux.clone(), worktrees.clone(), projects);
    (
        fleet,
        Fakes {
            runtime,
            mux,
            worktrees,
        },
    )
}

/// Build a fully-wired `AppState` over [`test_fleet`].
pub fn test_app_state() -> (AppState, Fakes) {
    let (fleet, fakes) = test_fleet();
    let state = AppState {
        fleet: Arc::new(fleet),
        events: Arc::new(EventBroadcaster::default()),
        metrics: Arc::new(ServerMetrics::new()),
    };
    (state, fakes)
}
