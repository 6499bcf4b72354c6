#![forbid(unsafe_code)]

use std::sync::Arc;

use chrono::Utc;
use forum_domain::{DisplayName, Identity, UserId};
use forum_protocol::{ChatMessage, Frame, FrameKind, ProtocolError, TypingSignal, decode_frame, encode_frame};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::server::connection::InboundHandler;
use crate::server::hub::{Hub, SendOutcome};
use crate::server::store::{Directory, HistoryStore, StoredMessage};
use crate::util::time::to_stored_precision;

/// Why a single inbound frame was dropped. None of these close the connection.
#[derive(Debug, Error)]
pub enum RouteError {
	#[error("protocol error: {0}")]
	Protocol(ProtocolError),

	#[error("{0} frames are server-to-client only")]
	UnexpectedFrame(FrameKind),

	#[error("unknown identity: {0:?}")]
	UnknownIdentity(String),

	#[error("identity lookup failed for {name:?}: {error:#}")]
	Resolution { name: String, error: anyhow::Error },

	#[error("persist message: {0:#}")]
	Persistence(anyhow::Error),

	#[error("encode outbound frame: {0}")]
	Encode(ProtocolError),
}

/// What happened to a successfully processed frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteOutcome {
	pub kind: FrameKind,
	pub delivery: SendOutcome,
}

/// Classifies inbound chat frames, persists messages and delivers through the hub.
pub struct MessageRouter {
	directory: Arc<dyn Directory>,
	history: Arc<dyn HistoryStore>,
	hub: Hub,
	max_frame_bytes: usize,
}

impl MessageRouter {
	pub fn new(directory: Arc<dyn Directory>, history: Arc<dyn HistoryStore>, hub: Hub, max_frame_bytes: usize) -> Self {
		Self {
			directory,
			history,
			hub,
			max_frame_bytes,
		}
	}

	/// Process one raw frame sent by `sender`.
	pub async fn route(&self, sender: &Identity, payload: &str) -> Result<RouteOutcome, RouteError> {
		let frame = decode_frame(payload, self.max_frame_bytes).map_err(RouteError::Protocol)?;

		match frame {
			Frame::Message(msg) => self.route_message(sender, msg).await,
			Frame::Typing(signal) => self.route_typing(sender, signal).await,
			Frame::UserUpdate(_) => Err(RouteError::UnexpectedFrame(FrameKind::UserUpdate)),
		}
	}

	async fn route_message(&self, sender: &Identity, mut msg: ChatMessage) -> Result<RouteOutcome, RouteError> {
		// The payload's sender is never trusted.
		msg.sender = sender.name.to_string();

		let sender_id = self.resolve(&msg.sender).await?;
		let receiver_id = self.resolve(&msg.receiver).await?;
		// Addressed by nickname or email; stored and delivered under the nickname.
		let receiver_name = self.display_name(&msg.receiver, receiver_id).await?;

		msg.sender_id = Some(sender_id);
		msg.receiver_id = Some(receiver_id);
		msg.receiver = receiver_name.to_string();
		// Millisecond precision, matching `sent_at_ms`.
		msg.timestamp = msg.timestamp.map(to_stored_precision);
		let timestamp = msg.stamp_if_missing(to_stored_precision(Utc::now()));

		let stored = StoredMessage {
			sender: Identity::new(sender_id, sender.name.clone()),
			receiver: Identity::new(receiver_id, receiver_name),
			content: msg.content.clone(),
			timestamp,
		};
		self.history.append(&stored).await.map_err(RouteError::Persistence)?;
		metrics::counter!("forum_server_messages_persisted_total").increment(1);

		let encoded = encode_frame(&Frame::Message(msg)).map_err(RouteError::Encode)?;
		let delivery = self.hub.send_to(stored.receiver.name.as_str(), encoded).await;

		Ok(RouteOutcome {
			kind: FrameKind::Message,
			delivery,
		})
	}

	async fn route_typing(&self, sender: &Identity, mut signal: TypingSignal) -> Result<RouteOutcome, RouteError> {
		signal.sender = sender.name.to_string();

		let receiver = signal.receiver.clone();
		let encoded = encode_frame(&Frame::Typing(signal)).map_err(RouteError::Encode)?;
		let delivery = self.hub.send_to(&receiver, encoded).await;

		Ok(RouteOutcome {
			kind: FrameKind::Typing,
			delivery,
		})
	}

	async fn display_name(&self, addressed_as: &str, id: UserId) -> Result<DisplayName, RouteError> {
		match self.directory.display_name(id).await {
			Ok(Some(name)) => Ok(name),
			Ok(None) => Err(RouteError::UnknownIdentity(addressed_as.to_string())),
			Err(error) => Err(RouteError::Resolution {
				name: addressed_as.to_string(),
				error,
			}),
		}
	}

	async fn resolve(&self, name: &str) -> Result<UserId, RouteError> {
		if name.trim().is_empty() {
			return Err(RouteError::UnknownIdentity(name.to_string()));
		}

		match self.directory.user_id(name).await {
			Ok(Some(id)) => Ok(id),
			Ok(None) => Err(RouteError::UnknownIdentity(name.to_string())),
			Err(error) => Err(RouteError::Resolution {
				name: name.to_string(),
				error,
			}),
		}
	}
}

/// Read-pump handler for a chat socket: every frame goes through the router.
pub struct ChatInbound {
	router: Arc<MessageRouter>,
	identity: Identity,
}

impl ChatInbound {
	pub fn new(router: Arc<MessageRouter>, identity: Identity) -> Self {
		Self { router, identity }
	}
}

#[async_trait::async_trait]
impl InboundHandler for ChatInbound {
	async fn on_text(&self, payload: &str) {
		match self.router.route(&self.identity, payload).await {
			Ok(outcome) => {
				debug!(user = %self.identity.name, kind = %outcome.kind, delivery = ?outcome.delivery, "routed frame");
			}
			Err(e @ (RouteError::Protocol(_) | RouteError::UnexpectedFrame(_))) => {
				metrics::counter!("forum_server_frames_dropped_total").increment(1);
				warn!(user = %self.identity.name, error = %e, "dropping frame");
			}
			Err(e @ RouteError::UnknownIdentity(_)) => {
				metrics::counter!("forum_server_frames_dropped_total").increment(1);
				info!(user = %self.identity.name, error = %e, "dropping frame");
			}
			Err(e) => {
				metrics::counter!("forum_server_frames_dropped_total").increment(1);
				error!(user = %self.identity.name, error = %e, "failed to process frame");
			}
		}
	}
}

/// Presence sockets carry nothing meaningful inbound; frames only keep the deadline alive.
pub struct IgnoreInbound;

#[async_trait::async_trait]
impl InboundHandler for IgnoreInbound {
	async fn on_text(&self, _payload: &str) {}
}
