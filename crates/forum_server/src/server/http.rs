#![forbid(unsafe_code)]

use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use axum::routing::get;
use forum_domain::Identity;
use forum_protocol::Frame;
use futures::StreamExt;
use serde::Deserialize;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use crate::server::auth::SessionUser;
use crate::server::connection::run_pumps;
use crate::server::error::ApiError;
use crate::server::health::{healthz, readyz};
use crate::server::router::{ChatInbound, IgnoreInbound};
use crate::server::state::AppState;
use crate::server::store::Page;

/// All routes served by the real-time layer.
pub fn app(state: AppState) -> Router {
	Router::new()
		.route("/ws", get(chat_socket))
		.route("/users", get(presence_socket))
		.route("/render-users", get(render_users))
		.route("/messages", get(messages))
		.route("/healthz", get(healthz))
		.route("/readyz", get(readyz))
		.layer(TraceLayer::new_for_http())
		.with_state(state)
}

async fn identity_of(state: &AppState, SessionUser(user): SessionUser) -> Result<Identity, ApiError> {
	let name = state
		.directory
		.display_name(user)
		.await?
		.ok_or_else(|| ApiError::NotFound(format!("user {user} not found")))?;
	Ok(Identity::new(user, name))
}

async fn chat_socket(
	State(state): State<AppState>,
	session: SessionUser,
	ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
	let identity = identity_of(&state, session).await?;
	let max = state.settings.max_frame_bytes;

	Ok(ws
		.max_message_size(max)
		.max_frame_size(max)
		.on_upgrade(move |socket| chat_session(state, identity, socket)))
}

async fn chat_session(state: AppState, identity: Identity, socket: WebSocket) {
	let registration = state.hub.register(identity.name.clone()).await;
	let conn_id = registration.conn_id;
	info!(user = %identity, conn_id = %conn_id, "chat socket connected");

	let (sink, stream) = socket.split();
	let handler = Arc::new(ChatInbound::new(state.router.clone(), identity.clone()));
	let hub = state.hub.clone();
	let name = registration.name;

	let exit = run_pumps(
		sink,
		stream,
		registration.outbound,
		handler,
		state.settings.clone(),
		move || async move {
			hub.unregister(&name, conn_id).await;
		},
	)
	.await;

	info!(user = %identity, conn_id = %conn_id, ?exit, "chat socket closed");
}

async fn presence_socket(
	State(state): State<AppState>,
	session: SessionUser,
	ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
	let identity = identity_of(&state, session).await?;
	let max = state.settings.max_frame_bytes;

	Ok(ws
		.max_message_size(max)
		.max_frame_size(max)
		.on_upgrade(move |socket| presence_session(state, identity, socket)))
}

async fn presence_session(state: AppState, identity: Identity, socket: WebSocket) {
	let registration = state.presence.connect(&identity).await;
	let conn_id = registration.conn_id;
	info!(user = %identity, conn_id = %conn_id, "presence socket connected");

	let (sink, stream) = socket.split();
	let presence = state.presence.clone();
	let leaving = identity.clone();

	let exit = run_pumps(
		sink,
		stream,
		registration.outbound,
		Arc::new(IgnoreInbound),
		state.settings.clone(),
		move || async move {
			presence.disconnect(&leaving, conn_id).await;
		},
	)
	.await;

	info!(user = %identity, conn_id = %conn_id, ?exit, "presence socket closed");
}

async fn render_users(State(state): State<AppState>, session: SessionUser) -> Result<Json<serde_json::Value>, ApiError> {
	let identity = identity_of(&state, session).await?;
	let users = state.presence.snapshot_for(&identity).await?;

	Ok(Json(serde_json::json!({
		"success": true,
		"users": users,
	})))
}

#[derive(Debug, Default, Deserialize)]
struct HistoryQuery {
	#[serde(default)]
	sender: String,
	#[serde(default)]
	receiver: String,
	offset: Option<String>,
	limit: Option<String>,
}

async fn messages(
	State(state): State<AppState>,
	_session: SessionUser,
	Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<Frame>>, ApiError> {
	let page = Page::parse(query.offset.as_deref(), query.limit.as_deref(), state.history_default_limit);

	if query.sender.trim().is_empty() || query.receiver.trim().is_empty() {
		return Ok(Json(Vec::new()));
	}

	let history = state.history.page(&query.sender, &query.receiver, page).await?;
	debug!(
		sender = %query.sender,
		receiver = %query.receiver,
		offset = page.offset,
		limit = page.limit,
		rows = history.len(),
		"history page"
	);

	Ok(Json(history.into_iter().map(Frame::Message).collect()))
}
