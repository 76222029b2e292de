//! HTTP surface over [`StoryService`].

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Extension, Json, Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use serde_json::json;

use oola_core::{StoryId, StoryStatus, User};

use crate::{
    auth::{auth_middleware, CallerIdentity},
    config::AuthConfig,
    error::ServiceError,
    service::{CreateStory, RegisterUser, StoryService},
};

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<StoryService>,
    pub metrics: Option<PrometheusHandle>,
}

#[derive(Debug)]
pub enum ApiError {
    Unauthenticated(String),
    Service(ServiceError),
}

impl From<ServiceError> for ApiError {
    fn from(e: ServiceError) -> Self {
        ApiError::Service(e)
    }
}

#[derive(Serialize)]
struct ErrorBody {
    success: bool,
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    kind: Option<&'static str>,
}

pub fn status_for(e: &ServiceError) -> StatusCode {
    match e {
        ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
        ServiceError::InvalidState(_) | ServiceError::Conflict(_) => StatusCode::CONFLICT,
        ServiceError::Forbidden(_) => StatusCode::FORBIDDEN,
        ServiceError::Validation(_) => StatusCode::BAD_REQUEST,
        ServiceError::Upstream(_) => StatusCode::BAD_GATEWAY,
        ServiceError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error, kind) = match self {
            ApiError::Unauthenticated(msg) => (StatusCode::UNAUTHORIZED, msg, None),
            ApiError::Service(e) => {
                let status = status_for(&e);
                if status == StatusCode::INTERNAL_SERVER_ERROR {
                    tracing::error!(error = %e, "Request failed");
                }
                (status, e.to_string(), Some(e.kind()))
            }
        };
        (
            status,
            Json(ErrorBody {
                success: false,
                error,
                kind,
            }),
        )
            .into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Resolves the request's identity to a registered user.
async fn caller(state: &AppState, identity: Option<Extension<CallerIdentity>>) -> ApiResult<User> {
    let Some(Extension(identity)) = identity else {
        return Err(ApiError::Unauthenticated("no caller identity on request".to_string()));
    };
    match state.service.user_by_name(&identity.username).await {
        Ok(user) => Ok(user),
        Err(ServiceError::NotFound(_)) => Err(ApiError::Unauthenticated(format!(
            "unknown user: {}",
            identity.username
        ))),
        Err(e) => Err(e.into()),
    }
}

pub fn router(state: AppState, auth: Arc<AuthConfig>) -> Router {
    let api = Router::new()
        .route("/api/me", get(me))
        .route("/api/languages", get(languages))
        .route("/api/genres", get(genres))
        .route("/api/stories", post(create_story).get(list_stories))
        .route("/api/stories/:id", get(get_story))
        .route("/api/stories/:id/checkout", post(checkout))
        .route("/api/stories/:id/checkin", post(checkin))
        .route("/api/stories/:id/finish", post(finish))
        .route("/api/stories/:id/content", get(content))
        .route("/api/stories/:id/checkout-status", get(checkout_status))
        .route("/api/stories/:id/contributors", get(contributors))
        .route("/api/stories/:id/ledger", get(ledger))
        .layer(middleware::from_fn(auth_middleware))
        .layer(Extension(auth));

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(render_metrics))
        // Registration comes before there is an identity to present.
        .route("/api/users", post(register_user))
        .merge(api)
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn render_metrics(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => handle.render().into_response(),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed").into_response(),
    }
}

async fn register_user(
    State(state): State<AppState>,
    Json(request): Json<RegisterUser>,
) -> ApiResult<impl IntoResponse> {
    let user = state.service.register_user(request).await?;
    Ok((StatusCode::CREATED, Json(user)))
}

async fn me(
    State(state): State<AppState>,
    identity: Option<Extension<CallerIdentity>>,
) -> ApiResult<Json<User>> {
    Ok(Json(caller(&state, identity).await?))
}

async fn languages(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.service.languages().await?))
}

async fn genres(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.service.genres().await?))
}

async fn create_story(
    State(state): State<AppState>,
    identity: Option<Extension<CallerIdentity>>,
    Json(request): Json<CreateStory>,
) -> ApiResult<impl IntoResponse> {
    let user = caller(&state, identity).await?;
    let story = state.service.create_story(user.id, request).await?;
    Ok((StatusCode::CREATED, Json(story)))
}

#[derive(Debug, Deserialize)]
struct StoryFilter {
    status: Option<StoryStatus>,
}

async fn list_stories(
    State(state): State<AppState>,
    Query(filter): Query<StoryFilter>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.service.list_stories(filter.status).await?))
}

async fn get_story(
    State(state): State<AppState>,
    Path(id): Path<StoryId>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.service.get_story(id).await?))
}

async fn checkout(
    State(state): State<AppState>,
    identity: Option<Extension<CallerIdentity>>,
    Path(id): Path<StoryId>,
) -> ApiResult<impl IntoResponse> {
    let user = caller(&state, identity).await?;
    Ok(Json(state.service.checkout(id, user.id).await?))
}

#[derive(Debug, Deserialize)]
struct CheckinBody {
    content: String,
}

async fn checkin(
    State(state): State<AppState>,
    identity: Option<Extension<CallerIdentity>>,
    Path(id): Path<StoryId>,
    Json(body): Json<CheckinBody>,
) -> ApiResult<impl IntoResponse> {
    let user = caller(&state, identity).await?;
    Ok(Json(state.service.checkin(id, user.id, &body.content).await?))
}

async fn finish(
    State(state): State<AppState>,
    identity: Option<Extension<CallerIdentity>>,
    Path(id): Path<StoryId>,
) -> ApiResult<impl IntoResponse> {
    let user = caller(&state, identity).await?;
    Ok(Json(state.service.finish_story(id, user.id).await?))
}

async fn content(
    State(state): State<AppState>,
    Path(id): Path<StoryId>,
) -> ApiResult<impl IntoResponse> {
    let text = state.service.story_content(id).await?;
    Ok(Json(json!({ "storyId": id, "content": text })))
}

async fn checkout_status(
    State(state): State<AppState>,
    identity: Option<Extension<CallerIdentity>>,
    Path(id): Path<StoryId>,
) -> ApiResult<impl IntoResponse> {
    // Anonymous viewers may look too.
    let viewer = match caller(&state, identity).await {
        Ok(user) => Some(user.id),
        Err(ApiError::Unauthenticated(_)) => None,
        Err(e) => return Err(e),
    };
    let status = state.service.checkout_status(id, viewer).await?;
    Ok(Json(json!({
        "storyId": id,
        "isCheckedOut": status.is_some(),
        "checkout": status,
    })))
}

async fn contributors(
    State(state): State<AppState>,
    Path(id): Path<StoryId>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.service.contributors(id).await?))
}

async fn ledger(
    State(state): State<AppState>,
    Path(id): Path<StoryId>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.service.ledger(id).await?))
}
