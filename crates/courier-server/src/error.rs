use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use courier_engine::EngineError;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Missing caller identity")]
    Unauthenticated,

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ServerError::Unauthenticated => (StatusCode::UNAUTHORIZED, self.to_string()),
            ServerError::BadRequest(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            ServerError::Engine(e) => match e {
                EngineError::NotFound(_) => (StatusCode::NOT_FOUND, self.to_string()),
                EngineError::ValidationFailed(_) => (StatusCode::BAD_REQUEST, self.to_string()),
                EngineError::Forbidden(_) => (StatusCode::FORBIDDEN, self.to_string()),
                EngineError::TransportFailed(_) => (StatusCode::BAD_GATEWAY, self.to_string()),
                EngineError::StoreFailed(_) => {
                    tracing::error!(error = %e, "store failure");
                    (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
                }
            },
        };

        let body = serde_json::json!({
            "error": message,
        });

        (status, axum::Json(body)).into_response()
    }
}
