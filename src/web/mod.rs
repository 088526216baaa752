//! HTTP surface.
//!
//! `/mr/*` endpoints are public and require `Authorization: Token <token>`
//! when `server.auth_token` is set. The rest are internal, reachable only from
//! inside the deployment.

mod channels;
mod error;
mod flows;

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use deadpool_redis::redis::cmd;
use serde_json::json;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, warn};

use crate::runtime::Runtime;

pub use error::ApiError;

const TOKEN_PREFIX: &str = "Token ";

/// Builds the application router.
pub fn router(rt: Arc<Runtime>) -> Router {
    let public = Router::new()
        .route("/mr/channel/interrupt", post(channels::interrupt))
        .route("/mr/flow/preview_start", post(flows::preview_start))
        .route("/mr/flow/clone", post(flows::clone))
        .layer(middleware::from_fn_with_state(rt.clone(), auth_middleware));

    let internal = Router::new()
        .route("/flow/interrupt", post(flows::interrupt))
        .route("/flow/start", post(flows::start))
        .route("/flow/start_preview", post(flows::start_preview))
        .route("/flow/migrate", post(flows::migrate))
        .route("/health", get(health_check));

    with_layers(public.merge(internal).with_state(rt))
}

fn with_layers(router: Router) -> Router {
    router
        .layer(CatchPanicLayer::custom(|_| {
            error!("Handler panicked");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"error": "internal server error"}))).into_response()
        }))
        .layer(TraceLayer::new_for_http())
}

async fn auth_middleware(State(rt): State<Arc<Runtime>>, req: Request, next: Next) -> Result<Response, ApiError> {
    let Some(expected) = rt.config.server.auth_token.as_deref() else {
        return Ok(next.run(req).await);
    };

    let token = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix(TOKEN_PREFIX));

    match token {
        Some(token) if token == expected => Ok(next.run(req).await),
        Some(_) => {
            warn!(path = %req.uri().path(), "Invalid authorization token");
            Err(ApiError::Unauthorized)
        }
        None => {
            warn!(path = %req.uri().path(), "Missing or malformed Authorization header");
            Err(ApiError::Unauthorized)
        }
    }
}

async fn health_check(State(rt): State<Arc<Runtime>>) -> Response {
    let db_ok = match sqlx::query("SELECT 1").execute(&rt.db).await {
        Ok(_) => true,
        Err(e) => {
            error!(error = %e, "Database health check failed");
            false
        }
    };

    let redis_ok = match rt.rp.get().await {
        Ok(mut conn) => {
            let pong: Result<String, _> = cmd("PING").query_async(&mut conn).await;
            match pong {
                Ok(_) => true,
                Err(e) => {
                    error!(error = %e, "Redis PING failed");
                    false
                }
            }
        }
        Err(e) => {
            error!(error = %e, "Failed to get Redis connection");
            false
        }
    };

    let status = if db_ok && redis_ok { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    let label = |ok: bool| if ok { "connected" } else { "unavailable" };
    let body = json!({
        "status": if status == StatusCode::OK { "ok" } else { "degraded" },
        "version": rt.config.version,
        "db": label(db_ok),
        "redis": label(redis_ok),
    });
    (status, Json(body)).into_response()
}
