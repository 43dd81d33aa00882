pub mod containers;
pub mod events;
pub mod extract;
pub mod health;
pub mod projects;
pub mod sessions;
pub mod terminal;
pub mod worktrees;

use axum::{
    Router,
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::Response,
    routing::{delete, get, post},
};

use crate::AppState;

pub use containers::{
    create_container, delete_container, get_container, list_containers, start_container,
    stop_container,
};
pub use events::events_handler;
pub use health::{health_handler, metrics_handler};
pub use projects::list_projects;
pub use sessions::{
    capture_handler, capture_lines_handler, create_session, delete_session, list_sessions,
    send_handler,
};
pub use terminal::terminal_handler;
pub use worktrees::{create_worktree, delete_worktree, start_worktree};

/// Every Control API route, without middleware.
pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/api/health", get(health_handler))
        .route("/api/metrics", get(metrics_handler))
        .route("/api/events", get(events_handler))
        .route("/api/projects", get(list_projects))
        .route("/api/projects/{project}/worktrees", post(create_worktree))
        .route(
            "/api/projects/{project}/worktrees/{name}",
            delete(delete_worktree),
        )
        .route(
            "/api/projects/{project}/worktrees/{name}/start",
            post(start_worktree),
        )
        .route("/api/containers", get(list_containers).post(create_container))
        .route(
            "/api/containers/{id}",
            get(get_container).delete(delete_container),
        )
        .route("/api/containers/{id}/start", post(start_container))
        .route("/api/containers/{id}/stop", post(stop_container))
        .route(
            "/api/containers/{id}/sessions",
            get(list_sessions).post(create_session),
        )
        .route("/api/containers/{id}/sessions/{name}", delete(delete_session))
        .route(
            "/api/containers/{id}/sessions/{name}/capture",
            get(capture_handler),
        )
        .route(
            "/api/containers/{id}/sessions/{name}/capture-lines",
            get(capture_lines_handler),
        )
        .route("/api/containers/{id}/sessions/{name}/send", post(send_handler))
        .route(
            "/api/containers/{id}/sessions/{name}/terminal",
            get(terminal_handler),
        )
}

/// Counts upstream (collaborator) failures for `/api/metrics`.
pub async fn count_upstream_errors(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let response = next.run(request).await;
    if response.status() == StatusCode::BAD_GATEWAY {
        state.metrics.upstream_error();
    }
    response
}
