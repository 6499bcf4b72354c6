#![forbid(unsafe_code)]

use chrono::{DateTime, Datelike, SecondsFormat, Utc};
use forum_domain::UserId;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A frame as it travels over either socket, discriminated by `type`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum Frame {
	#[serde(rename = "message")]
	Message(ChatMessage),

	#[serde(rename = "typing")]
	Typing(TypingSignal),

	#[serde(rename = "user_update")]
	UserUpdate(UserUpdate),
}

/// Private chat message between two users.
///
/// Inbound frames may leave ids and timestamp blank; the server fills them in
/// before persisting and forwarding.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ChatMessage {
	#[serde(
		default,
		alias = "senderId",
		deserialize_with = "lenient_user_id",
		skip_serializing_if = "Option::is_none"
	)]
	pub sender_id: Option<UserId>,

	#[serde(default)]
	pub sender: String,

	#[serde(
		default,
		alias = "receiverId",
		deserialize_with = "lenient_user_id",
		skip_serializing_if = "Option::is_none"
	)]
	pub receiver_id: Option<UserId>,

	#[serde(default)]
	pub receiver: String,

	#[serde(default)]
	pub content: String,

	#[serde(default, deserialize_with = "lenient_timestamp", skip_serializing_if = "Option::is_none")]
	pub timestamp: Option<DateTime<Utc>>,
}

impl ChatMessage {
	/// Set the timestamp to `now` if the client left it out. Returns the effective value.
	pub fn stamp_if_missing(&mut self, now: DateTime<Utc>) -> DateTime<Utc> {
		*self.timestamp.get_or_insert(now)
	}
}

/// Ephemeral typing indicator. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TypingSignal {
	#[serde(default)]
	pub sender: String,

	#[serde(default)]
	pub receiver: String,

	#[serde(rename = "isTyping", default)]
	pub is_typing: bool,
}

/// Presence snapshot broadcast to every presence socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserUpdate {
	#[serde(default = "default_success")]
	pub success: bool,

	#[serde(default)]
	pub users: Vec<PresenceEntry>,
}

impl UserUpdate {
	pub fn new(users: Vec<PresenceEntry>) -> Self {
		Self { success: true, users }
	}
}

fn default_success() -> bool {
	true
}

/// One row of the presence snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceEntry {
	pub id: UserId,

	pub username: String,

	pub online: bool,

	/// Latest message between the viewer and this user; `""` on the wire when absent.
	#[serde(default, with = "lasttime")]
	pub lasttime: Option<DateTime<Utc>>,
}

/// Accepts a number, a numeric string, an empty string or null.
fn lenient_user_id<'de, D>(deserializer: D) -> Result<Option<UserId>, D::Error>
where
	D: Deserializer<'de>,
{
	#[derive(Deserialize)]
	#[serde(untagged)]
	enum Raw {
		Int(i64),
		Text(String),
	}

	match Option::<Raw>::deserialize(deserializer)? {
		None => Ok(None),
		Some(Raw::Int(v)) => Ok(Some(UserId(v))),
		Some(Raw::Text(s)) if s.trim().is_empty() => Ok(None),
		Some(Raw::Text(s)) => s.parse::<UserId>().map(Some).map_err(serde::de::Error::custom),
	}
}

/// Accepts RFC 3339, an empty string or null. The zero time (`0001-01-01T00:00:00Z`) counts as absent.
fn lenient_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
	D: Deserializer<'de>,
{
	let Some(raw) = Option::<String>::deserialize(deserializer)? else {
		return Ok(None);
	};
	if raw.trim().is_empty() {
		return Ok(None);
	}

	let ts = DateTime::parse_from_rfc3339(raw.trim())
		.map_err(serde::de::Error::custom)?
		.with_timezone(&Utc);

	if ts.year() <= 1 { Ok(None) } else { Ok(Some(ts)) }
}

mod lasttime {
	use super::*;

	pub fn serialize<S>(value: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
	where
		S: Serializer,
	{
		match value {
			Some(ts) => serializer.serialize_str(&ts.to_rfc3339_opts(SecondsFormat::Secs, true)),
			None => serializer.serialize_str(""),
		}
	}

	pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
	where
		D: Deserializer<'de>,
	{
		lenient_timestamp(deserializer)
	}
}
