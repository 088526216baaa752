use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::error;

use crate::engine::EngineError;
use crate::models::DbError;
use crate::search::SearchError;
use crate::tasks::queue::QueueError;

/// Errors returned by HTTP handlers.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),

    /// A contact query the search service rejected
    #[error("{message}")]
    Query {
        message: String,
        code: String,
        extra: Map<String, Value>,
    },

    #[error("missing or invalid authorization token")]
    Unauthorized,

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) | ApiError::Query { .. } => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match &self {
            ApiError::Query { message, code, extra } => json!({"error": message, "code": code, "extra": extra}),
            ApiError::Internal(msg) => {
                error!(error = %msg, "Error handling request");
                json!({"error": msg})
            }
            other => json!({"error": other.to_string()}),
        };
        (status, Json(body)).into_response()
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::Validation(rejection.body_text())
    }
}

impl From<DbError> for ApiError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::NotFound { .. } | DbError::UrnTaken { .. } => ApiError::Validation(err.to_string()),
            DbError::Query { .. } => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<QueueError> for ApiError {
    fn from(err: QueueError) -> Self {
        ApiError::Internal(err.to_string())
    }
}

impl From<SearchError> for ApiError {
    fn from(err: SearchError) -> Self {
        match err {
            SearchError::Query { message, code, extra } => ApiError::Query { message, code, extra },
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        ApiError::Validation(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    async fn body_json(response: Response) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_query_error_response() {
        let mut extra = Map::new();
        extra.insert("property".into(), json!("age"));
        let err: ApiError = SearchError::Query {
            message: "can't resolve 'age' to attribute, scheme or field".into(),
            code: "unknown_property".into(),
            extra,
        }
        .into();

        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            body_json(response).await,
            json!({
                "error": "can't resolve 'age' to attribute, scheme or field",
                "code": "unknown_property",
                "extra": {"property": "age"}
            })
        );
    }

    #[tokio::test]
    async fn test_error_statuses() {
        let unavailable: ApiError = SearchError::Unavailable.into();
        assert_eq!(unavailable.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let not_found: ApiError = DbError::NotFound {
            kind: "channel",
            id: "12".into(),
        }
        .into();
        assert_eq!(not_found.status(), StatusCode::BAD_REQUEST);

        let engine: ApiError = EngineError::UnsupportedVersion("99.0".into()).into();
        let response = engine.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await, json!({"error": "unsupported spec version: 99.0"}));
    }
}
