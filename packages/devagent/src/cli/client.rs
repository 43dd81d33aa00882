//! Typed HTTP client for the Control API.

use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::error::Error as _;
use std::io;
use std::path::Path;
use std::time::Duration;

use crate::compound::CompoundReport;
use crate::error::{ErrorBody, ErrorKind};
use crate::fleet::{Capture, Hierarchy, encode_project_path};
use crate::runtime::{Container, Session};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Transport failure: refused, reset, or timed out.
    #[error("cannot reach devagent: {0}")]
    Connection(String),

    #[error("{}", .body.error)]
    Api { status: u16, body: ErrorBody },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ClientError {
    /// Any failure to get a response over the socket counts as a
    /// connection failure, including a peer that accepts and then drops.
    pub fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_connect() || err.is_timeout() || err.is_request() || dropped_connection(&err) {
            Self::Connection(err.to_string())
        } else {
            Self::Other(err.into())
        }
    }

    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Connection(_))
    }

    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Api { body, .. } => Some(body.kind),
            _ => None,
        }
    }
}

fn dropped_connection(err: &reqwest::Error) -> bool {
    let mut source = err.source();
    while let Some(cause) = source {
        if let Some(io) = cause.downcast_ref::<io::Error>() {
            if matches!(
                io.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::UnexpectedEof
            ) {
                return true;
            }
        }
        // hyper's incomplete-message error carries no io::Error
        if cause.to_string().contains("connection closed before message completed") {
            return true;
        }
        source = cause.source();
    }
    false
}

pub type ClientResult<T> = Result<T, ClientError>;

#[derive(Clone)]
pub struct ApiClient {
    base_url: String,
    http: reqwest::Client,
}

impl ApiClient {
    #[cfg(test)]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_timeout(base_url, Duration::from_secs(30))
    }

    pub fn with_timeout(base_url: impl Into<String>, timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            base_url: base_url.into(),
            http,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http
            .request(method, format!("{}{}", self.base_url, path))
    }

    async fn send(&self, req: RequestBuilder) -> ClientResult<Response> {
        let resp = req.send().await.map_err(ClientError::from_reqwest)?;
        if resp.status().is_success() {
            return Ok(resp);
        }
        let status = resp.status();
        let text = resp.text().await.map_err(ClientError::from_reqwest)?;
        let body = serde_json::from_str::<ErrorBody>(&text).unwrap_or_else(|_| ErrorBody {
            error: format!("{status}: {}", text.trim()),
            kind: fallback_kind(status),
            operation: None,
            completed_steps: None,
            failed_step: None,
        });
        Err(ClientError::Api {
            status: status.as_u16(),
            body,
        })
    }

    async fn json<T: DeserializeOwned>(&self, req: RequestBuilder) -> ClientResult<T> {
        self.send(req)
            .await?
            .json()
            .await
            .map_err(ClientError::from_reqwest)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> ClientResult<T> {
        self.json(self.request(Method::GET, path)).await
    }

    async fn post<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> ClientResult<T> {
        self.json(self.request(Method::POST, path).json(body)).await
    }

    async fn post_empty<T: DeserializeOwned>(&self, path: &str) -> ClientResult<T> {
        self.json(self.request(Method::POST, path)).await
    }

    pub async fn health(&self) -> ClientResult<serde_json::Value> {
        self.get("/api/health").await
    }

    pub async fn metrics(&self) -> ClientResult<serde_json::Value> {
        self.get("/api/metrics").await
    }

    pub async fn projects(&self) -> ClientResult<Hierarchy> {
        self.get("/api/projects").await
    }

    pub async fn containers(&self) -> ClientResult<Vec<Container>> {
        self.get("/api/containers").await
    }

    pub async fn create_container(&self, project_path: &Path) -> ClientResult<Container> {
        self.post(
            "/api/containers",
            &serde_json::json!({ "project_path": project_path }),
        )
        .await
    }

    pub async fn start_container(&self, id: &str) -> ClientResult<Container> {
        self.post_empty(&format!("/api/containers/{id}/start")).await
    }

    pub async fn stop_container(&self, id: &str) -> ClientResult<Container> {
        self.post_empty(&format!("/api/containers/{id}/stop")).await
    }

    pub async fn destroy_container(&self, id: &str) -> ClientResult<()> {
        self.send(self.request(Method::DELETE, &format!("/api/containers/{id}")))
            .await
            .map(|_| ())
    }

    pub async fn sessions(&self, id: &str) -> ClientResult<Vec<Session>> {
        self.get(&format!("/api/containers/{id}/sessions")).await
    }

    pub async fn create_session(&self, id: &str, name: &str) -> ClientResult<Session> {
        self.post(
            &format!("/api/containers/{id}/sessions"),
            &serde_json::json!({ "name": name }),
        )
        .await
    }

    pub async fn kill_session(&self, id: &str, name: &str) -> ClientResult<()> {
        self.send(self.request(
            Method::DELETE,
            &format!("/api/containers/{id}/sessions/{name}"),
        ))
        .await
        .map(|_| ())
    }

    pub async fn send_keys(&self, id: &str, name: &str, text: &str, submit: bool) -> ClientResult<()> {
        self.send(
            self.request(
                Method::POST,
                &format!("/api/containers/{id}/sessions/{name}/send"),
            )
            .json(&serde_json::json!({ "text": text, "submit": submit })),
        )
        .await
        .map(|_| ())
    }

    /// Visible pane plus `lines` of backfill, or everything after `from_cursor`.
    pub async fn capture(
        &self,
        id: &str,
        name: &str,
        lines: Option<u32>,
        from_cursor: Option<u64>,
    ) -> ClientResult<Capture> {
        let mut query: Vec<(&str, String)> = Vec::new();
        if let Some(n) = lines {
            query.push(("lines", n.to_string()));
        }
        if let Some(c) = from_cursor {
            query.push(("from_cursor", c.to_string()));
        }
        self.json(
            self.request(
                Method::GET,
                &format!("/api/containers/{id}/sessions/{name}/capture"),
            )
            .query(&query),
        )
        .await
    }

    pub async fn capture_lines(&self, id: &str, name: &str, lines: u32) -> ClientResult<Capture> {
        self.json(
            self.request(
                Method::GET,
                &format!("/api/containers/{id}/sessions/{name}/capture-lines"),
            )
            .query(&[("lines", lines)]),
        )
        .await
    }

    pub async fn create_worktree(
        &self,
        project: &Path,
        name: &str,
        branch: Option<&str>,
        start: bool,
    ) -> ClientResult<CompoundReport> {
        let encoded = encode_project_path(project);
        self.post(
            &format!("/api/projects/{encoded}/worktrees"),
            &serde_json::json!({ "name": name, "branch": branch, "start": start }),
        )
        .await
    }

    pub async fn delete_worktree(&self, project: &Path, name: &str) -> ClientResult<CompoundReport> {
        let encoded = encode_project_path(project);
        self.json(self.request(
            Method::DELETE,
            &format!("/api/projects/{encoded}/worktrees/{name}"),
        ))
        .await
    }

    pub async fn start_worktree(&self, project: &Path, name: &str) -> ClientResult<CompoundReport> {
        let encoded = encode_project_path(project);
        self.post_empty(&format!("/api/projects/{encoded}/worktrees/{name}/start"))
            .await
    }
}

fn fallback_kind(status: StatusCode) -> ErrorKind {
    match status {
        StatusCode::NOT_FOUND => ErrorKind::NotFound,
        StatusCode::CONFLICT => ErrorKind::Conflict,
        s if s.is_client_error() => ErrorKind::Validation,
        _ => ErrorKind::Upstream,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{Fakes, test_app_state};

    async fn spawn_api() -> (ApiClient, Fakes) {
        let (state, fakes) = test_app_state();
        let app = crate::handlers::api_routes().with_state(state);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (ApiClient::new(format!("http://{addr}")), fakes)
    }

    #[tokio::test]
    async fn lists_and_mutates_over_http() {
        let (client, _fakes) = spawn_api().await;
        assert_eq!(client.health().await.unwrap()["status"], "ok");
        assert_eq!(client.containers().await.unwrap().len(), 3);

        let started = client.start_container("api").await.unwrap();
        assert!(started.is_running());

        let session = client.create_session("api", "dev").await.unwrap();
        assert_eq!(session.name, "dev");
        let names: Vec<_> = client
            .sessions("api")
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(names, vec!["dev"]);
    }

    #[tokio::test]
    async fn api_errors_carry_kind_and_message() {
        let (client, _fakes) = spawn_api().await;
        let err = client.start_container("web").await.unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::BadState));
        assert!(err.to_string().contains("already running"));

        let err = client.destroy_container("ghost").await.unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::NotFound));
        assert!(matches!(err, ClientError::Api { status: 404, .. }));
    }

    #[tokio::test]
    async fn capture_and_send() {
        let (client, fakes) = spawn_api().await;
        fakes.mux.push_output("c0ffee01", "main", &["hello"]);
        let cap = client.capture_lines("web", "main", 5).await.unwrap();
        assert_eq!(cap.content, "hello\n");
        let since = client
            .capture("web", "main", None, Some(cap.cursor_y))
            .await
            .unwrap();
        assert_eq!(since.content, "");

        client.send_keys("web", "main", "q", false).await.unwrap();
        assert_eq!(fakes.mux.sent("c0ffee01", "main"), vec!["text:q"]);
    }

    #[tokio::test]
    async fn worktree_roundtrip_uses_encoded_path() {
        let (client, _fakes) = spawn_api().await;
        let project = Path::new("/src/web");
        let report = client
            .create_worktree(project, "feat", None, false)
            .await
            .unwrap();
        assert_eq!(report.completed_steps.len(), 1);
        let report = client.delete_worktree(project, "feat").await.unwrap();
        assert!(report.container.is_none());
    }

    #[tokio::test]
    async fn refused_connection_is_connection_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let err = ApiClient::new(format!("http://{addr}"))
            .containers()
            .await
            .unwrap_err();
        assert!(err.is_connection(), "{err:?}");
    }

    /// A listener that accepts every connection and closes it unanswered.
    async fn spawn_dropping_listener() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                drop(socket);
            }
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn dropped_connection_is_connection_error() {
        let client = ApiClient::new(spawn_dropping_listener().await);
        let err = client.capture_lines("web", "main", 5).await.unwrap_err();
        assert!(err.is_connection(), "{err:?}");
        let err = client.containers().await.unwrap_err();
        assert!(err.is_connection(), "{err:?}");
    }

    #[tokio::test]
    async fn hung_server_times_out_as_connection_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        // accept and hold sockets open without ever answering
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });
        let client = ApiClient::with_timeout(format!("http://{addr}"), Duration::from_millis(100));
        let err = client.health().await.unwrap_err();
        assert!(err.is_connection(), "{err:?}");
    }

    #[tokio::test]
    async fn undecodable_success_body_is_not_a_connection_error() {
        let app = axum::Router::new().route(
            "/api/containers",
            axum::routing::get(|| async { "not json" }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        let err = ApiClient::new(format!("http://{addr}"))
            .containers()
            .await
            .unwrap_err();
        assert!(!err.is_connection(), "{err:?}");
    }

    #[test]
    fn fallback_kinds_follow_status() {
        assert_eq!(fallback_kind(StatusCode::NOT_FOUND), ErrorKind::NotFound);
        assert_eq!(fallback_kind(StatusCode::METHOD_NOT_ALLOWED), ErrorKind::Validation);
        assert_eq!(fallback_kind(StatusCode::BAD_GATEWAY), ErrorKind::Upstream);
    }
}
