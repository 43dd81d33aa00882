//! Error classes of the Control API and their HTTP mapping.

use axum::{
    Json,
    extract::{
        rejection::{JsonRejection, PathRejection, QueryRejection},
        ws::rejection::WebSocketUpgradeRejection,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use std::fmt::Display;

use crate::compound::{CompoundFailure, Operation, Step};
use crate::runtime::RuntimeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    Conflict,
    BadState,
    Validation,
    Upstream,
}

impl ErrorKind {
    pub fn status(self) -> StatusCode {
        match self {
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Conflict => StatusCode::CONFLICT,
            Self::BadState | Self::Validation => StatusCode::BAD_REQUEST,
            Self::Upstream => StatusCode::BAD_GATEWAY,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    NotFound(String),

    /// Duplicate name, or a safety refusal from a collaborator.
    #[error("{0}")]
    Conflict(String),

    /// Illegal lifecycle transition.
    #[error("{0}")]
    BadState(String),

    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Upstream(String),

    #[error("{0}")]
    Compound(Box<CompoundFailure>),
}

pub type ApiResult<T> = Result<T, ApiError>;

impl ApiError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::BadState(_) => ErrorKind::BadState,
            Self::Validation(_) => ErrorKind::Validation,
            Self::Upstream(_) => ErrorKind::Upstream,
            Self::Compound(f) => f.cause.kind(),
        }
    }

    /// Classify a collaborator error, prefixing what was being attempted.
    pub fn runtime(context: impl Display, err: RuntimeError) -> Self {
        match err {
            RuntimeError::NotFound(what) => Self::NotFound(format!("{context}: {what} not found")),
            RuntimeError::AlreadyExists(what) => {
                Self::Conflict(format!("{context}: {what} already exists"))
            }
            RuntimeError::NotRunning(name) => {
                Self::BadState(format!("{context}: container {name} is not running"))
            }
            // git's own wording explains the refusal; keep it intact
            RuntimeError::Refused(reason) => Self::Conflict(format!("{context}: {reason}")),
            other => Self::Upstream(format!("{context}: {other}")),
        }
    }
}

impl From<RuntimeError> for ApiError {
    fn from(err: RuntimeError) -> Self {
        Self::runtime("request failed", err)
    }
}

// Malformed requests are validation failures, whatever axum's own status.

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::Validation(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self::Validation(rejection.body_text())
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        Self::Validation(rejection.body_text())
    }
}

impl From<WebSocketUpgradeRejection> for ApiError {
    fn from(rejection: WebSocketUpgradeRejection) -> Self {
        Self::Validation(rejection.body_text())
    }
}

/// JSON shape of every error response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub kind: ErrorKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<Operation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_steps: Option<Vec<Step>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_step: Option<Step>,
}

impl From<&ApiError> for ErrorBody {
    fn from(err: &ApiError) -> Self {
        let mut body = ErrorBody {
            error: err.to_string(),
            kind: err.kind(),
            operation: None,
            completed_steps: None,
            failed_step: None,
        };
        if let ApiError::Compound(f) = err {
            body.operation = Some(f.operation);
            body.completed_steps = Some(f.completed.clone());
            body.failed_step = Some(f.failed);
        }
        body
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.kind();
        if kind == ErrorKind::Upstream {
            tracing::error!("{}", self);
        } else {
            tracing::debug!(?kind, "{}", self);
        }
        (kind.status(), Json(ErrorBody::from(&self))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_to_statuses() {
        assert_eq!(ErrorKind::NotFound.status(), StatusCode::NOT_FOUND);
        assert_eq!(ErrorKind::Conflict.status(), StatusCode::CONFLICT);
        assert_eq!(ErrorKind::BadState.status(), StatusCode::BAD_REQUEST);
        assert_eq!(ErrorKind::Validation.status(), StatusCode::BAD_REQUEST);
        assert_eq!(ErrorKind::Upstream.status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn runtime_errors_are_classified() {
        let e = ApiError::runtime("start", RuntimeError::NotFound("container x".into()));
        assert_eq!(e.kind(), ErrorKind::NotFound);
        assert_eq!(e.to_string(), "start: container x not found");

        let e = ApiError::runtime("create session", RuntimeError::AlreadyExists("dev".into()));
        assert_eq!(e.kind(), ErrorKind::Conflict);

        let e = ApiError::runtime("create session", RuntimeError::NotRunning("web".into()));
        assert_eq!(e.kind(), ErrorKind::BadState);

        let e = ApiError::runtime(
            "stop",
            RuntimeError::CommandFailed {
                command: "docker stop x".into(),
                stderr: "daemon unreachable".into(),
            },
        );
        assert_eq!(e.kind(), ErrorKind::Upstream);
        assert!(e.to_string().starts_with("stop: "));
    }

    #[test]
    fn refusal_keeps_tool_wording() {
        let msg = "fatal: contains modified or untracked files, use --force to delete it";
        let e = ApiError::runtime("remove worktree", RuntimeError::Refused(msg.into()));
        assert_eq!(e.kind(), ErrorKind::Conflict);
        assert!(e.to_string().contains(msg));
    }

    #[tokio::test]
    async fn response_body_has_error_and_kind() {
        let resp = ApiError::NotFound("container nope not found".into()).into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"], "container nope not found");
        assert_eq!(json["kind"], "not_found");
        assert!(json.get("failed_step").is_none());
    }

    #[tokio::test]
    async fn compound_failure_reports_steps() {
        let err = ApiError::Compound(Box::new(CompoundFailure {
            operation: Operation::DeleteWorktree,
            completed: vec![Step::StopContainer],
            failed: Step::DestroyContainer,
            cause: ApiError::Upstream("destroy container: boom".into()),
        }));
        let resp = err.into_response();
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["operation"], "delete_worktree");
        assert_eq!(json["completed_steps"], serde_json::json!(["stop_container"]));
        assert_eq!(json["failed_step"], "destroy_container");
        assert_eq!(json["kind"], "upstream");
    }
}
