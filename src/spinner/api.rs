use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use serde::{Deserialize, Serialize};

use super::command::SpecParts;
use super::manager::{LifecycleManager, SpinRequest};
use super::models::{SelectorParts, Session, session_url};
use crate::errors::ProgenyError;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub manager: Arc<LifecycleManager>,
    /// Host name put into session URLs handed back to callers.
    pub public_host: String,
}

pub type SharedState = Arc<AppState>;

// ── Request / response payload types ──────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct SpinSessionRequest {
    pub username: String,
    pub session_name: Option<String>,
    #[serde(default)]
    pub uniquify: bool,
    #[serde(flatten)]
    pub spec: SpecParts,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SpinSessionResponse {
    pub port: u16,
    pub session_name: String,
    pub url: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SessionView {
    #[serde(flatten)]
    pub session: Session,
    pub url: String,
}

#[derive(Debug, Serialize)]
pub struct PrebakedView {
    pub name: String,
    pub command: String,
    pub config: super::command::ToolConfig,
}

// ── Error handling ────────────────────────────────────────────────────

pub struct ApiError(pub ProgenyError);

impl From<ProgenyError> for ApiError {
    fn from(e: ProgenyError) -> Self {
        Self(e)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            ProgenyError::NoFreePort { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ProgenyError::DuplicatePort { .. } | ProgenyError::SessionNameConflict { .. } => {
                StatusCode::CONFLICT
            }
            ProgenyError::Launch { .. } => StatusCode::BAD_GATEWAY,
            e if e.is_validation() => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self.0, kind = self.0.kind(), "Request failed");
        }
        let body = serde_json::json!({"error": self.0.to_string(), "kind": self.0.kind()});
        (status, Json(body)).into_response()
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route(
            "/api/sessions",
            get(list_sessions).post(spin_session).delete(cleanup_sessions),
        )
        .route("/api/prebaked", get(list_prebaked))
        .route("/health", get(health_check))
}

impl AppState {
    fn view(&self, session: Session) -> SessionView {
        let url = session.url(&self.public_host);
        SessionView { session, url }
    }
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

/// Without a selector, lists every live session.
async fn list_sessions(
    State(state): State<SharedState>,
    Query(parts): Query<SelectorParts>,
) -> Result<impl IntoResponse, ApiError> {
    let sessions = if parts.is_empty() {
        state.manager.list().await?
    } else {
        state.manager.lookup(&parts.into_selector()?).await?
    };
    let views: Vec<SessionView> = sessions.into_iter().map(|s| state.view(s)).collect();
    Ok(Json(views))
}

async fn spin_session(
    State(state): State<SharedState>,
    Json(req): Json<SpinSessionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let spec = req.spec.into_spec()?;
    let mut request = SpinRequest::new(req.username, spec).uniquify(req.uniquify);
    if let Some(name) = req.session_name {
        request = request.session_name(name);
    }
    let outcome = state.manager.spin(request).await?;
    let url = session_url(&state.public_host, outcome.port, &outcome.session_name);
    Ok((
        StatusCode::CREATED,
        Json(SpinSessionResponse {
            port: outcome.port,
            session_name: outcome.session_name,
            url,
        }),
    ))
}

async fn cleanup_sessions(
    State(state): State<SharedState>,
    Query(parts): Query<SelectorParts>,
) -> Result<impl IntoResponse, ApiError> {
    let selector = parts.into_selector()?;
    let cleaned = state.manager.cleanup(&selector).await?;
    let views: Vec<SessionView> = cleaned.into_iter().map(|s| state.view(s)).collect();
    Ok(Json(views))
}

async fn list_prebaked(State(state): State<SharedState>) -> impl IntoResponse {
    let projects: Vec<PrebakedView> = state
        .manager
        .catalog()
        .projects()
        .map(|p| PrebakedView {
            name: p.name.clone(),
            command: p.command(),
            config: p.config.clone(),
        })
        .collect();
    Json(projects)
}

// ── Tests ─────────────────────────────────────────────────────────────
