mod auth;
mod error;
mod routes;
mod state;

pub use auth::{bootstrap_token, hash_token};
pub use error::ApiError;
pub use state::AppState;

use std::net::SocketAddr;

use axum::http::{HeaderValue, Method};
use axum::middleware;
use axum::routing::{delete, get, post};
use axum::Router;
use tower_http::cors::CorsLayer;

fn cors_layer() -> CorsLayer {
    let origins = [
        "tauri://localhost",
        "http://localhost:5173",
        "http://127.0.0.1:5173",
    ]
    .into_iter()
    .filter_map(|origin| origin.parse::<HeaderValue>().ok())
    .collect::<Vec<_>>();
    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([
            axum::http::header::AUTHORIZATION,
            axum::http::header::CONTENT_TYPE,
        ])
}

pub fn app_router(state: AppState) -> Router {
    let open = Router::new()
        .route("/api/v1/auth/bootstrap", post(routes::auth::auth_bootstrap))
        .route("/api/v1/auth/status", get(routes::auth::auth_status));

    let protected = Router::new()
        .route(
            "/api/v1/projects",
            post(routes::projects::create_project).get(routes::projects::list_projects),
        )
        .route(
            "/api/v1/projects/{id}",
            get(routes::projects::get_project).put(routes::projects::update_project),
        )
        .route(
            "/api/v1/projects/{id}/memory/search",
            get(routes::projects::search_memory),
        )
        .route(
            "/api/v1/projects/{id}/runs",
            post(routes::runs::create_run).get(routes::runs::list_runs),
        )
        .route("/api/v1/runs/{id}", get(routes::runs::get_run))
        .route("/api/v1/runs/{id}/plan", post(routes::runs::create_plan).get(routes::runs::get_plan))
        .route("/api/v1/runs/{id}/start", post(routes::runs::start_run))
        .route("/api/v1/runs/{id}/pause", post(routes::runs::pause_run))
        .route("/api/v1/runs/{id}/resume", post(routes::runs::resume_run))
        .route("/api/v1/runs/{id}/cancel", post(routes::runs::cancel_run))
        .route(
            "/api/v1/runs/{id}/tasks/{task_id}/retry",
            post(routes::runs::retry_task),
        )
        .route(
            "/api/v1/runs/{id}/steps/{step_id}/retry",
            post(routes::runs::retry_step),
        )
        .route("/api/v1/runs/{id}/tasks", get(routes::runs::get_tasks))
        .route("/api/v1/runs/{id}/sources", get(routes::runs::get_sources))
        .route("/api/v1/runs/{id}/facts", get(routes::runs::get_facts))
        .route("/api/v1/runs/{id}/conflicts", get(routes::runs::get_conflicts))
        .route(
            "/api/v1/runs/{id}/conflicts/{conflict_id}/resolve",
            post(routes::runs::resolve_conflict),
        )
        .route("/api/v1/runs/{id}/artifacts", get(routes::runs::get_artifacts))
        .route("/api/v1/runs/{id}/approvals", get(routes::runs::list_approvals))
        .route("/api/v1/runs/{id}/snapshot", get(routes::runs::get_snapshot))
        .route(
            "/api/v1/runs/{id}/snapshot/download",
            get(routes::runs::download_snapshot),
        )
        .route("/api/v1/runs/{id}/events", get(routes::events::stream_events))
        .route(
            "/api/v1/runs/{id}/events/download",
            get(routes::events::download_events),
        )
        .route(
            "/api/v1/approvals/{id}/approve",
            post(routes::runs::approve_approval),
        )
        .route(
            "/api/v1/approvals/{id}/reject",
            post(routes::runs::reject_approval),
        )
        .route("/api/v1/memory/list", get(routes::memory::list_memory))
        .route("/api/v1/memory/create", post(routes::memory::create_memory))
        .route("/api/v1/memory/{id}", delete(routes::memory::delete_memory))
        .route("/api/v1/memory/{id}/pin", post(routes::memory::pin_memory))
        .route("/api/v1/memory/{id}/unpin", post(routes::memory::unpin_memory))
        .route("/api/v1/reminders", get(routes::reminders::list_reminders))
        .route(
            "/api/v1/reminders/create",
            post(routes::reminders::create_reminder),
        )
        .route(
            "/api/v1/reminders/{id}",
            delete(routes::reminders::cancel_reminder),
        )
        .route("/api/v1/skills", get(routes::skills::list_skills))
        .route(
            "/api/v1/skills/{name}/manifest",
            get(routes::skills::get_manifest),
        )
        .route("/api/v1/skills/reload", post(routes::skills::reload_skills))
        .route(
            "/api/v1/artifacts/{id}/download",
            get(routes::artifacts::download_artifact),
        )
        .route("/api/v1/secrets/unlock", post(routes::secrets::unlock))
        .route("/api/v1/secrets/openai", post(routes::secrets::set_openai))
        .route(
            "/api/v1/secrets/openai_local",
            post(routes::secrets::set_openai_local).get(routes::secrets::get_openai_local),
        )
        .route("/api/v1/secrets/status", get(routes::secrets::secrets_status))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::auth_middleware,
        ));

    open.merge(protected).layer(cors_layer()).with_state(state)
}

pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let router = app_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "aura api listening");
    axum::serve(listener, router).await?;
    Ok(())
}
