#![forbid(unsafe_code)]

use axum::extract::FromRequestParts;
use axum::http::header::COOKIE;
use axum::http::request::Parts;
use forum_domain::UserId;
use tracing::debug;

use crate::server::error::ApiError;
use crate::server::state::AppState;

/// Name of the cookie carrying the forum session token.
pub const SESSION_COOKIE: &str = "session_token";

/// The user behind the request's session cookie. Rejects with 401 when absent or expired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionUser(pub UserId);

impl FromRequestParts<AppState> for SessionUser {
	type Rejection = ApiError;

	async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
		let token = parts
			.headers
			.get_all(COOKIE)
			.iter()
			.filter_map(|v| v.to_str().ok())
			.find_map(|header| cookie_value(header, SESSION_COOKIE))
			.ok_or(ApiError::Unauthorized)?;

		match state.directory.session_user(token).await? {
			Some(user) => Ok(SessionUser(user)),
			None => {
				debug!("session: unknown or expired token");
				Err(ApiError::Unauthorized)
			}
		}
	}
}

/// Value of cookie `name` in a `Cookie:` header, if present and non-empty.
pub fn cookie_value<'a>(header: &'a str, name: &str) -> Option<&'a str> {
	header.split(';').find_map(|pair| {
		let (k, v) = pair.trim().split_once('=')?;
		let v = v.trim().trim_matches('"');
		(k.trim() == name && !v.is_empty()).then_some(v)
	})
}
