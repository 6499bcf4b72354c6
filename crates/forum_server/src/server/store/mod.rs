#![forbid(unsafe_code)]

//! Directory and history collaborators used by the real-time layer.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use forum_domain::{DisplayName, Identity, UserId};
use forum_protocol::ChatMessage;

#[cfg(test)]
pub mod memory;
pub mod sql;


/// Resolves users and sessions.
#[async_trait]
pub trait Directory: Send + Sync {
	/// Resolve a nickname or email address to a user id.
	async fn user_id(&self, nickname_or_email: &str) -> anyhow::Result<Option<UserId>>;

	async fn display_name(&self, id: UserId) -> anyhow::Result<Option<DisplayName>>;

	/// Every known user, in no particular order.
	async fn list_users(&self) -> anyhow::Result<Vec<Identity>>;

	/// Resolve a session token to its user, ignoring expired sessions.
	async fn session_user(&self, token: &str) -> anyhow::Result<Option<UserId>>;
}

/// Durable chat history.
#[async_trait]
pub trait HistoryStore: Send + Sync {
	async fn append(&self, msg: &StoredMessage) -> anyhow::Result<()>;

	/// Messages exchanged between `a` and `b` (either direction), newest first.
	async fn page(&self, a: &str, b: &str, page: Page) -> anyhow::Result<Vec<ChatMessage>>;

	/// Latest message time between `viewer` and each user they have talked to.
	async fn last_interactions(&self, viewer: UserId) -> anyhow::Result<HashMap<UserId, DateTime<Utc>>>;
}

/// A fully resolved chat message, ready to persist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
	pub sender: Identity,
	pub receiver: Identity,
	pub content: String,
	pub timestamp: DateTime<Utc>,
}

impl StoredMessage {
	#[allow(dead_code)]
	pub fn to_chat_message(&self) -> ChatMessage {
		ChatMessage {
			sender_id: Some(self.sender.id),
			sender: self.sender.name.to_string(),
			receiver_id: Some(self.receiver.id),
			receiver: self.receiver.name.to_string(),
			content: self.content.clone(),
			timestamp: Some(self.timestamp),
		}
	}
}

/// History page window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
	pub offset: i64,
	pub limit: i64,
}

impl Page {
	/// Parse query-string values. Anything missing or unparsable falls back to
	/// offset 0 and `default_limit`.
	pub fn parse(offset: Option<&str>, limit: Option<&str>, default_limit: i64) -> Self {
		let offset = offset
			.and_then(|v| v.trim().parse::<i64>().ok())
			.filter(|v| *v >= 0)
			.unwrap_or(0);
		let limit = limit
			.and_then(|v| v.trim().parse::<i64>().ok())
			.filter(|v| *v >= 0)
			.unwrap_or(default_limit);
		Self { offset, limit }
	}
}
