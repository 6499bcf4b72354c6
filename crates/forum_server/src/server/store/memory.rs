#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use forum_domain::{DisplayName, Identity, UserId};
use forum_protocol::ChatMessage;

use crate::server::store::{Directory, HistoryStore, Page, StoredMessage};

/// In-process directory and history for tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
	users: Mutex<Vec<(Identity, String)>>,
	sessions: Mutex<HashMap<String, UserId>>,
	messages: Mutex<Vec<StoredMessage>>,
	fail_appends: AtomicBool,
}

impl MemoryStore {
	pub fn new() -> Self {
		Self::default()
	}

	/// Add a user with email `<name>@forum.test`. Ids are assigned from 1.
	pub fn add_user(&self, name: &str) -> Identity {
		let mut users = self.users.lock().expect("users lock");
		let id = UserId(users.len() as i64 + 1);
		let identity = Identity::new(id, DisplayName::new(name).expect("valid name"));
		users.push((identity.clone(), format!("{name}@forum.test")));
		identity
	}

	pub fn add_session(&self, token: &str, user: UserId) {
		self.sessions.lock().expect("sessions lock").insert(token.to_string(), user);
	}

	pub fn messages(&self) -> Vec<StoredMessage> {
		self.messages.lock().expect("messages lock").clone()
	}

	pub fn push_message(&self, msg: StoredMessage) {
		self.messages.lock().expect("messages lock").push(msg);
	}

	pub fn set_fail_appends(&self, fail: bool) {
		self.fail_appends.store(fail, Ordering::SeqCst);
	}
}

#[async_trait]
impl Directory for MemoryStore {
	async fn user_id(&self, nickname_or_email: &str) -> anyhow::Result<Option<UserId>> {
		let users = self.users.lock().expect("users lock");
		Ok(users
			.iter()
			.find(|(identity, email)| identity.name.as_str() == nickname_or_email || email == nickname_or_email)
			.map(|(identity, _)| identity.id))
	}

	async fn display_name(&self, id: UserId) -> anyhow::Result<Option<DisplayName>> {
		let users = self.users.lock().expect("users lock");
		Ok(users
			.iter()
			.find(|(identity, _)| identity.id == id)
			.map(|(identity, _)| identity.name.clone()))
	}

	async fn list_users(&self) -> anyhow::Result<Vec<Identity>> {
		let users = self.users.lock().expect("users lock");
		Ok(users.iter().map(|(identity, _)| identity.clone()).collect())
	}

	async fn session_user(&self, token: &str) -> anyhow::Result<Option<UserId>> {
		Ok(self.sessions.lock().expect("sessions lock").get(token).copied())
	}
}

#[async_trait]
impl HistoryStore for MemoryStore {
	async fn append(&self, msg: &StoredMessage) -> anyhow::Result<()> {
		if self.fail_appends.load(Ordering::SeqCst) {
			return Err(anyhow!("history store unavailable"));
		}
		self.messages.lock().expect("messages lock").push(msg.clone());
		Ok(())
	}

	async fn page(&self, a: &str, b: &str, page: Page) -> anyhow::Result<Vec<ChatMessage>> {
		let messages = self.messages.lock().expect("messages lock");
		let mut matching: Vec<(usize, &StoredMessage)> = messages
			.iter()
			.enumerate()
			.filter(|(_, m)| {
				let (s, r) = (m.sender.name.as_str(), m.receiver.name.as_str());
				(s == a && r == b) || (s == b && r == a)
			})
			.collect();
		matching.sort_by(|(ia, ma), (ib, mb)| mb.timestamp.cmp(&ma.timestamp).then(ib.cmp(ia)));

		Ok(matching
			.into_iter()
			.skip(page.offset as usize)
			.take(page.limit as usize)
			.map(|(_, m)| m.to_chat_message())
			.collect())
	}

	async fn last_interactions(&self, viewer: UserId) -> anyhow::Result<HashMap<UserId, DateTime<Utc>>> {
		let messages = self.messages.lock().expect("messages lock");
		let mut latest: HashMap<UserId, DateTime<Utc>> = HashMap::new();
		for m in messages.iter() {
			let other = if m.sender.id == viewer {
				m.receiver.id
			} else if m.receiver.id == viewer {
				m.sender.id
			} else {
				continue;
			};
			let entry = latest.entry(other).or_insert(m.timestamp);
			if m.timestamp > *entry {
				*entry = m.timestamp;
			}
		}
		Ok(latest)
	}
}
