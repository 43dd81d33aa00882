use axum::{
    Json,
    extract::State,
    http::StatusCode,
};
use serde::Deserialize;

use crate::AppState;
use crate::error::ApiResult;
use crate::fleet::Capture;
use crate::runtime::Session;

use super::extract::{ValidJson, ValidPath, ValidQuery};

/// Default scrollback window for `capture-lines`.
pub const DEFAULT_CAPTURE_LINES: u32 = 20;

pub async fn list_sessions(
    State(state): State<AppState>,
    ValidPath(id): ValidPath<String>,
) -> ApiResult<Json<Vec<Session>>> {
    let (_, sessions) = state.fleet.sessions(&id).await?;
    Ok(Json(sessions))
}

#[derive(Deserialize)]
pub struct CreateSessionRequest {
    name: String,
}

pub async fn create_session(
    State(state): State<AppState>,
    ValidPath(id): ValidPath<String>,
    ValidJson(req): ValidJson<CreateSessionRequest>,
) -> ApiResult<(StatusCode, Json<Session>)> {
    let session = state.fleet.create_session(&id, &req.name).await?;
    state.mutated();
    Ok((StatusCode::CREATED, Json(session)))
}

pub async fn delete_session(
    State(state): State<AppState>,
    ValidPath((id, name)): ValidPath<(String, String)>,
) -> ApiResult<StatusCode> {
    state.fleet.kill_session(&id, &name).await?;
    state.mutated();
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
pub struct CaptureQuery {
    /// Scrollback lines to include above the visible pane
    lines: Option<u32>,
    /// Return only output produced after this position
    from_cursor: Option<u64>,
}

pub async fn capture_handler(
    State(state): State<AppState>,
    ValidPath((id, name)): ValidPath<(String, String)>,
    ValidQuery(q): ValidQuery<CaptureQuery>,
) -> ApiResult<Json<Capture>> {
    let capture = match q.from_cursor {
        Some(from) => state.fleet.capture_since(&id, &name, from).await?,
        None => {
            state
                .fleet
                .capture_visible(&id, &name, q.lines.unwrap_or(0))
                .await?
        }
    };
    Ok(Json(capture))
}

#[derive(Deserialize)]
pub struct CaptureLinesQuery {
    lines: Option<u32>,
}

pub async fn capture_lines_handler(
    State(state): State<AppState>,
    ValidPath((id, name)): ValidPath<(String, String)>,
    ValidQuery(q): ValidQuery<CaptureLinesQuery>,
) -> ApiResult<Json<Capture>> {
    let lines = q.lines.unwrap_or(DEFAULT_CAPTURE_LINES);
    Ok(Json(state.fleet.capture_last(&id, &name, lines).await?))
}

#[derive(Deserialize)]
pub struct SendRequest {
    text: String,
    #[serde(default = "default_submit")]
    submit: bool,
}

fn default_submit() -> bool {
    true
}

pub async fn send_handler(
    State(state): State<AppState>,
    ValidPath((id, name)): ValidPath<(String, String)>,
    ValidJson(req): ValidJson<SendRequest>,
) -> ApiResult<StatusCode> {
    state.fleet.send(&id, &name, &req.text, req.submit).await?;
    Ok(StatusCode::NO_CONTENT)
}
