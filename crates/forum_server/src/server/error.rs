#![forbid(unsafe_code)]

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use tracing::error;

/// HTTP-facing failure, rendered as `{"success": false, "message": ..}`.
#[derive(Debug, Error)]
pub enum ApiError {
	#[error("unauthorized")]
	Unauthorized,

	#[error("{0}")]
	NotFound(String),

	#[error("internal server error")]
	Internal(#[from] anyhow::Error),
}

impl ApiError {
	pub fn status(&self) -> StatusCode {
		match self {
			ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
			ApiError::NotFound(_) => StatusCode::NOT_FOUND,
			ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
		}
	}
}

impl IntoResponse for ApiError {
	fn into_response(self) -> Response {
		if let ApiError::Internal(e) = &self {
			error!(error = %format!("{e:#}"), "request failed");
		}

		let body = serde_json::json!({
			"success": false,
			"message": self.to_string(),
		});

		(self.status(), Json(body)).into_response()
	}
}
