use axum::{
    Json,
    extract::State,
    http::StatusCode,
};
use serde::Deserialize;
use std::path::PathBuf;

use crate::AppState;
use crate::error::ApiResult;
use crate::runtime::Container;

use super::extract::{ValidJson, ValidPath};

pub async fn list_containers(State(state): State<AppState>) -> ApiResult<Json<Vec<Container>>> {
    Ok(Json(state.fleet.containers().await?))
}

pub async fn get_container(
    State(state): State<AppState>,
    ValidPath(id): ValidPath<String>,
) -> ApiResult<Json<Container>> {
    Ok(Json(state.fleet.container(&id).await?))
}

#[derive(Deserialize)]
pub struct CreateContainerRequest {
    project_path: PathBuf,
}

pub async fn create_container(
    State(state): State<AppState>,
    ValidJson(req): ValidJson<CreateContainerRequest>,
) -> ApiResult<(StatusCode, Json<Container>)> {
    let container = state.fleet.create_container(&req.project_path).await?;
    state.mutated();
    Ok((StatusCode::CREATED, Json(container)))
}

pub async fn start_container(
    State(state): State<AppState>,
    ValidPath(id): ValidPath<String>,
) -> ApiResult<Json<Container>> {
    let container = state.fleet.start_container(&id).await?;
    state.mutated();
    Ok(Json(container))
}

pub async fn stop_container(
    State(state): State<AppState>,
    ValidPath(id): ValidPath<String>,
) -> ApiResult<Json<Container>> {
    let container = state.fleet.stop_container(&id).await?;
    state.mutated();
    Ok(Json(container))
}

pub async fn delete_container(
    State(state): State<AppState>,
    ValidPath(id): ValidPath<String>,
) -> ApiResult<StatusCode> {
    state.fleet.destroy_container(&id).await?;
    state.mutated();
    Ok(StatusCode::NO_CONTENT)
}
