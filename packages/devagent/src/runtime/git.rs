//! Git worktrees via the `git` CLI.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::info;

use super::{RuntimeError, RuntimeResult, Worktree, WorktreeManager, run_command_in};

pub struct GitWorktrees {
    git_bin: String,
}

impl GitWorktrees {
    pub fn new(git_bin: String) -> Self {
        Self { git_bin }
    }

    async fn git(&self, project: &Path, args: &[&str]) -> RuntimeResult<String> {
        run_command_in(&self.git_bin, args, Some(project))
            .await
            .map_err(classify_git_error)
    }
}

/// New worktrees live next to the project: `<parent>/<project>.worktrees/<name>`.
pub fn worktree_path(project: &Path, name: &str) -> PathBuf {
    let project_name = project
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "project".to_string());
    project
        .parent()
        .unwrap_or(project)
        .join(format!("{project_name}.worktrees"))
        .join(name)
}

/// Git's safety refusals are passed through with their own wording.
fn classify_git_error(err: RuntimeError) -> RuntimeError {
    match err {
        RuntimeError::CommandFailed { ref stderr, .. }
            if stderr.contains("modified or untracked files")
                || stderr.contains("not fully merged")
                || stderr.contains("unmerged")
                || stderr.contains("is locked") =>
        {
            RuntimeError::Refused(stderr.clone())
        }
        RuntimeError::CommandFailed { ref stderr, .. } if stderr.contains("already exists") => {
            RuntimeError::AlreadyExists(stderr.clone())
        }
        RuntimeError::CommandFailed { ref stderr, .. }
            if stderr.contains("is not a working tree") || stderr.contains("not a git repository") =>
        {
            RuntimeError::NotFound(stderr.clone())
        }
        other => other,
    }
}

fn parse_porcelain(out: &str) -> Vec<Worktree> {
    let mut worktrees = Vec::new();
    for block in out.split("\n\n") {
        let mut path = None;
        let mut branch = None;
        for line in block.lines() {
            if let Some(p) = line.strip_prefix("worktree ") {
                path = Some(PathBuf::from(p));
            } else if let Some(b) = line.strip_prefix("branch ") {
                branch = Some(b.trim_start_matches("refs/heads/").to_string());
            }
        }
        if let Some(path) = path {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            worktrees.push(Worktree {
                name,
                path,
                branch,
                // git always lists the main worktree first
                is_main: worktrees.is_empty(),
            });
        }
    }
    worktrees
}

#[async_trait]
impl WorktreeManager for GitWorktrees {
    async fn list(&self, project: &Path) -> RuntimeResult<Vec<Worktree>> {
        let out = self.git(project, &["worktree", "list", "--porcelain"]).await?;
        Ok(parse_porcelain(&out))
    }

    async fn create(
        &self,
        project: &Path,
        name: &str,
        branch: Option<&str>,
    ) -> RuntimeResult<Worktree> {
        let path = worktree_path(project, name);
        let path_str = path.to_string_lossy().to_string();
        match branch {
            Some(b) => self.git(project, &["worktree", "add", &path_str, b]).await?,
            None => {
                self.git(project, &["worktree", "add", "-b", name, &path_str])
                    .await?
            }
        };
        info!(project = %project.display(), worktree = %path_str, "worktree created");
        Ok(Worktree {
            name: name.to_string(),
            path,
            branch: Some(branch.unwrap_or(name).to_string()),
            is_main: false,
        })
    }

    async fn remove(&self, project: &Path, worktree: &Worktree) -> RuntimeResult<()> {
        if worktree.is_main {
            return Err(RuntimeError::Refused(
                "the main worktree cannot be removed".into(),
            ));
        }
        let path_str = worktree.path.to_string_lossy().to_string();
        self.git(project, &["worktree", "remove", &path_str]).await?;
        info!(worktree = %path_str, "worktree removed");
        Ok(())
    }
}
