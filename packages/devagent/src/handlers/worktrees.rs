//! Compound worktree operations. The project is addressed by its absolute
//! path, base64-url encoded into a single path segment.

use axum::{
    Json,
    extract::State,
    http::StatusCode,
};
use serde::Deserialize;

use crate::AppState;
use crate::compound::{self, CompoundReport, mutated_anything};
use crate::error::ApiResult;
use crate::fleet::decode_project_path;

use super::extract::{ValidJson, ValidPath};

#[derive(Deserialize)]
pub struct CreateWorktreeRequest {
    name: String,
    /// Existing branch to check out; a new branch named after the worktree otherwise
    branch: Option<String>,
    #[serde(default = "default_start")]
    start: bool,
}

fn default_start() -> bool {
    true
}

/// Notify on success, and on failure too when earlier steps already
/// changed something.
fn settle(state: &AppState, result: ApiResult<CompoundReport>) -> ApiResult<CompoundReport> {
    match &result {
        Ok(_) => state.mutated(),
        Err(e) if mutated_anything(e) => state.mutated(),
        Err(_) => {}
    }
    result
}

pub async fn create_worktree(
    State(state): State<AppState>,
    ValidPath(project): ValidPath<String>,
    ValidJson(req): ValidJson<CreateWorktreeRequest>,
) -> ApiResult<(StatusCode, Json<CompoundReport>)> {
    let project = decode_project_path(&project)?;
    let result = compound::create_worktree(
        &state.fleet,
        &project,
        &req.name,
        req.branch.as_deref(),
        req.start,
    )
    .await;
    let report = settle(&state, result)?;
    Ok((StatusCode::CREATED, Json(report)))
}

pub async fn delete_worktree(
    State(state): State<AppState>,
    ValidPath((project, name)): ValidPath<(String, String)>,
) -> ApiResult<Json<CompoundReport>> {
    let project = decode_project_path(&project)?;
    let result = compound::delete_worktree(&state.fleet, &project, &name).await;
    Ok(Json(settle(&state, result)?))
}

pub async fn start_worktree(
    State(state): State<AppState>,
    ValidPath((project, name)): ValidPath<(String, String)>,
) -> ApiResult<Json<CompoundReport>> {
    let project = decode_project_path(&project)?;
    let result = compound::start_worktree(&state.fleet, &project, &name).await;
    Ok(Json(settle(&state, result)?))
}
