use axum::{Json, extract::State};

use crate::AppState;
use crate::error::ApiResult;
use crate::fleet::Hierarchy;

pub async fn list_projects(State(state): State<AppState>) -> ApiResult<Json<Hierarchy>> {
    Ok(Json(state.fleet.hierarchy().await?))
}
