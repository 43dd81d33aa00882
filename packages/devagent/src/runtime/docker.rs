//! Container runtime backed by the `docker` CLI.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::{Container, ContainerRuntime, ContainerState, RuntimeError, RuntimeResult, run_command};

/// Label carrying the host project path of a managed container.
pub const LABEL_PROJECT: &str = "devagent.project";
/// Label set by editor tooling; accepted as a fallback project label.
pub const LABEL_LOCAL_FOLDER: &str = "devcontainer.local_folder";
/// Optional label naming the user for `exec`.
pub const LABEL_REMOTE_USER: &str = "devagent.remote_user";

pub struct DockerRuntime {
    docker_bin: String,
    compose_file: String,
    default_user: String,
}

impl DockerRuntime {
    pub fn new(docker_bin: String, compose_file: String, default_user: String) -> Self {
        Self {
            docker_bin,
            compose_file,
            default_user,
        }
    }

    async fn docker(&self, args: &[&str]) -> RuntimeResult<String> {
        run_command(&self.docker_bin, args)
            .await
            .map_err(classify_docker_error)
    }
}

/// One line of `docker ps --format '{{json .}}'`.
#[derive(Debug, Deserialize)]
struct PsLine {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Names")]
    names: String,
    #[serde(rename = "State")]
    state: String,
    #[serde(rename = "CreatedAt", default)]
    created_at: String,
    #[serde(rename = "Labels", default)]
    labels: String,
}

fn parse_labels(raw: &str) -> HashMap<&str, &str> {
    raw.split(',')
        .filter_map(|kv| kv.split_once('='))
        .map(|(k, v)| (k.trim(), v.trim()))
        .collect()
}

/// `2024-05-01 10:11:12 +0000 UTC` → UTC timestamp
fn parse_created_at(raw: &str) -> Option<DateTime<Utc>> {
    let mut parts = raw.split_whitespace();
    let date = parts.next()?;
    let time = parts.next()?;
    let offset = parts.next()?;
    DateTime::parse_from_str(&format!("{date} {time} {offset}"), "%Y-%m-%d %H:%M:%S %z")
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(&format!("{date} {time}"), "%Y-%m-%d %H:%M:%S")
                .ok()
                .map(|n| n.and_utc())
        })
}

fn parse_ps_line(line: &str, default_user: &str) -> Option<Container> {
    let ps: PsLine = serde_json::from_str(line).ok()?;
    let labels = parse_labels(&ps.labels);
    let project = labels
        .get(LABEL_PROJECT)
        .or_else(|| labels.get(LABEL_LOCAL_FOLDER))?;
    let remote_user = labels
        .get(LABEL_REMOTE_USER)
        .map(|u| u.to_string())
        .unwrap_or_else(|| default_user.to_string());

    Some(Container {
        id: ps.id,
        name: ps.names.split(',').next().unwrap_or_default().to_string(),
        state: ContainerState::from_runtime_status(&ps.state),
        project_path: PathBuf::from(project),
        remote_user,
        created_at: parse_created_at(&ps.created_at).unwrap_or_else(Utc::now),
    })
}

fn classify_docker_error(err: RuntimeError) -> RuntimeError {
    match err {
        RuntimeError::CommandFailed { ref stderr, .. } if stderr.contains("No such container") => {
            RuntimeError::NotFound(stderr.clone())
        }
        other => other,
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn list(&self) -> RuntimeResult<Vec<Container>> {
        let out = self
            .docker(&["ps", "-a", "--no-trunc", "--format", "{{json .}}"])
            .await?;
        let containers: Vec<Container> = out
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| parse_ps_line(l, &self.default_user))
            .collect();
        debug!(count = containers.len(), "listed managed containers");
        Ok(containers)
    }

    async fn create(&self, project_path: &Path) -> RuntimeResult<Container> {
        let compose = project_path.join(&self.compose_file);
        if !compose.exists() {
            return Err(RuntimeError::NotFound(format!(
                "compose file {}",
                compose.display()
            )));
        }
        let compose = compose.to_string_lossy().to_string();
        let project_dir = project_path.to_string_lossy().to_string();
        self.docker(&[
            "compose",
            "-f",
            &compose,
            "--project-directory",
            &project_dir,
            "create",
        ])
        .await?;
        info!(project = %project_dir, "container created");

        self.list()
            .await?
            .into_iter()
            .find(|c| c.project_path == project_path)
            .ok_or_else(|| RuntimeError::Parse {
                what: "created container".into(),
                detail: format!("no container labelled for {project_dir}"),
            })
    }

    async fn start(&self, id: &str) -> RuntimeResult<()> {
        self.docker(&["start", id]).await.map(|_| ())
    }

    async fn stop(&self, id: &str) -> RuntimeResult<()> {
        self.docker(&["stop", id]).await.map(|_| ())
    }

    async fn destroy(&self, id: &str) -> RuntimeResult<()> {
        self.docker(&["rm", "-f", id]).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike};

    const LINE: &str = r#"{"ID":"0123456789ab","Names":"web-dev","State":"running","CreatedAt":"2024-05-01 10:11:12 +0000 UTC","Labels":"devagent.project=/src/web,devagent.remote_user=vscode,other=x"}"#;

    #[test]
    fn parses_managed_container() {
        let c = parse_ps_line(LINE, "root").unwrap();
        assert_eq!(c.id, "0123456789ab");
        assert_eq!(c.name, "web-dev");
        assert_eq!(c.state, ContainerState::Running);
        assert_eq!(c.project_path, PathBuf::from("/src/web"));
        assert_eq!(c.remote_user, "vscode");
        assert_eq!(c.created_at.year(), 2024);
        assert_eq!(c.created_at.hour(), 10);
    }

    #[test]
    fn falls_back_to_default_user_and_local_folder_label() {
        let line = r#"{"ID":"ff","Names":"api","State":"exited","CreatedAt":"","Labels":"devcontainer.local_folder=/src/api"}"#;
        let c = parse_ps_line(line, "root").unwrap();
        assert_eq!(c.remote_user, "root");
        assert_eq!(c.project_path, PathBuf::from("/src/api"));
        assert_eq!(c.state, ContainerState::Stopped);
    }

    #[test]
    fn ignores_unmanaged_containers() {
        let line = r#"{"ID":"ff","Names":"postgres","State":"running","CreatedAt":"","Labels":"maintainer=x"}"#;
        assert!(parse_ps_line(line, "root").is_none());
    }

    #[test]
    fn ignores_garbage() {
        assert!(parse_ps_line("not json", "root").is_none());
    }

    #[test]
    fn no_such_container_is_not_found() {
        let err = classify_docker_error(RuntimeError::CommandFailed {
            command: "docker stop x".into(),
            stderr: "Error response from daemon: No such container: x".into(),
        });
        assert!(matches!(err, RuntimeError::NotFound(_)));
    }
}
