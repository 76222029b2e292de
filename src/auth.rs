use axum::{
    http::{header, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Extension, Json,
};
use serde::Serialize;
use subtle::ConstantTimeEq;

use crate::config::AuthConfig;

/// Header naming the acting user when authentication is disabled.
pub const DEV_USER_HEADER: &str = "X-Oola-User";

/// Authenticated caller identity, available to handlers via request extensions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerIdentity {
    /// Name of the API key used, if any.
    pub key_name: Option<String>,
    pub username: String,
}

#[derive(Serialize)]
struct AuthError {
    success: bool,
    error: String,
}

fn unauthorized(message: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(AuthError {
            success: false,
            error: message.to_string(),
        }),
    )
        .into_response()
}

pub async fn auth_middleware<B>(
    Extension(config): Extension<std::sync::Arc<AuthConfig>>,
    mut req: Request<B>,
    next: Next<B>,
) -> Response {
    if !config.enabled {
        let user = req
            .headers()
            .get(DEV_USER_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .map(str::to_string);
        if let Some(username) = user {
            req.extensions_mut().insert(CallerIdentity {
                key_name: None,
                username,
            });
        }
        return next.run(req).await;
    }

    let api_key = req
        .headers()
        .get("X-API-Key")
        .or_else(|| req.headers().get(header::AUTHORIZATION))
        .and_then(|v| v.to_str().ok())
        .map(|s| s.strip_prefix("Bearer ").unwrap_or(s));

    let Some(key) = api_key else {
        return unauthorized("Missing API key. Provide X-API-Key header or Authorization: Bearer <key>");
    };

    match config
        .api_keys
        .iter()
        .find(|entry| entry.key.as_bytes().ct_eq(key.as_bytes()).into())
    {
        Some(entry) => {
            tracing::debug!(key = %entry.name, user = %entry.user, "Authenticated request");
            req.extensions_mut().insert(CallerIdentity {
                key_name: Some(entry.name.clone()),
                username: entry.user.clone(),
            });
            next.run(req).await
        }
        None => {
            tracing::warn!("Invalid API key presented");
            unauthorized("Invalid API key")
        }
    }
}
