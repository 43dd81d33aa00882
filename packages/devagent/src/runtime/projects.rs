//! Projects are git repositories found directly under configured roots.

use async_trait::async_trait;
use std::path::PathBuf;
use tracing::warn;

use super::{Project, ProjectSource, RuntimeResult};

pub struct DirProjectSource {
    roots: Vec<PathBuf>,
}

impl DirProjectSource {
    pub fn new(roots: Vec<PathBuf>) -> Self {
        Self { roots }
    }
}

fn project_at(path: PathBuf) -> Option<Project> {
    if !path.join(".git").is_dir() {
        return None;
    }
    let name = path.file_name()?.to_string_lossy().to_string();
    Some(Project { name, path })
}

#[async_trait]
impl ProjectSource for DirProjectSource {
    async fn projects(&self) -> RuntimeResult<Vec<Project>> {
        let mut projects = Vec::new();
        for root in &self.roots {
            if let Some(p) = project_at(root.clone()) {
                projects.push(p);
                continue;
            }
            let mut entries = match tokio::fs::read_dir(root).await {
                Ok(e) => e,
                Err(e) => {
                    warn!("Skipping project root {}: {}", root.display(), e);
                    continue;
                }
            };
            while let Some(entry) = entries.next_entry().await? {
                if let Some(p) = project_at(entry.path()) {
                    projects.push(p);
                }
            }
        }
        projects.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(projects)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn finds_repositories_under_roots() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("web/.git")).unwrap();
        std::fs::create_dir_all(tmp.path().join("api/.git")).unwrap();
        std::fs::create_dir_all(tmp.path().join("notes")).unwrap();

        let source = DirProjectSource::new(vec![tmp.path().to_path_buf()]);
        let projects = source.projects().await.unwrap();
        let names: Vec<_> = projects.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["api", "web"]);
    }

    #[tokio::test]
    async fn root_that_is_a_repository_is_a_project() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = tmp.path().join("solo");
        std::fs::create_dir_all(repo.join(".git")).unwrap();

        let source = DirProjectSource::new(vec![repo.clone()]);
        let projects = source.projects().await.unwrap();
        assert_eq!(projects.len(), 1);
        assert_eq!(projects[0].path, repo);
    }

    #[tokio::test]
    async fn missing_root_is_skipped() {
        let source = DirProjectSource::new(vec![PathBuf::from("/definitely/not/here")]);
        assert!(source.projects().await.unwrap().is_empty());
    }
}
