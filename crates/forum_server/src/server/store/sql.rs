#![forbid(unsafe_code)]

use std::collections::HashMap;

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use forum_domain::{DisplayName, Identity, UserId};
use forum_protocol::ChatMessage;
use sqlx::postgres::PgPoolOptions;
use sqlx::sqlite::SqlitePoolOptions;
use tracing::{info, warn};

use crate::server::store::{Directory, HistoryStore, Page, StoredMessage};
use crate::util::time::{from_unix_ms, to_unix_ms, unix_ms_now};

/// Directory and history backed by the forum database.
#[derive(Clone)]
pub struct SqlStore {
	backend: SqlBackend,
}

#[derive(Clone)]
enum SqlBackend {
	Sqlite(sqlx::SqlitePool),
	Postgres(sqlx::PgPool),
}

type MessageRow = (i64, String, i64, String, String, i64);

impl SqlStore {
	/// Connect and apply migrations.
	pub async fn connect(database_url: &str, max_connections: Option<u32>) -> anyhow::Result<Self> {
		if database_url.starts_with("sqlite:") {
			let mut opts = SqlitePoolOptions::new();
			if database_url.contains(":memory:") {
				// Every connection to an in-memory database is its own database.
				opts = opts.max_connections(1).idle_timeout(None).max_lifetime(None);
			} else if let Some(max) = max_connections {
				opts = opts.max_connections(max);
			}

			let pool = opts.connect(database_url).await.context("connect sqlite")?;
			sqlx::migrate!("migrations/sqlite")
				.run(&pool)
				.await
				.context("run sqlite migrations")?;

			info!("store: sqlite ready");
			Ok(Self {
				backend: SqlBackend::Sqlite(pool),
			})
		} else if database_url.starts_with("postgres:") || database_url.starts_with("postgresql:") {
			let mut opts = PgPoolOptions::new();
			if let Some(max) = max_connections {
				opts = opts.max_connections(max);
			}

			let pool = opts.connect(database_url).await.context("connect postgres")?;
			sqlx::migrate!("migrations/postgres")
				.run(&pool)
				.await
				.context("run postgres migrations")?;

			info!("store: postgres ready");
			Ok(Self {
				backend: SqlBackend::Postgres(pool),
			})
		} else {
			Err(anyhow!("unsupported database_url (use sqlite: or postgres:)"))
		}
	}

	#[cfg(test)]
	pub(crate) fn sqlite_pool(&self) -> Option<&sqlx::SqlitePool> {
		match &self.backend {
			SqlBackend::Sqlite(pool) => Some(pool),
			SqlBackend::Postgres(_) => None,
		}
	}
}

#[async_trait]
impl Directory for SqlStore {
	async fn user_id(&self, nickname_or_email: &str) -> anyhow::Result<Option<UserId>> {
		let row: Option<(i64,)> = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query_as("SELECT id FROM users WHERE nickname = ? OR email = ? LIMIT 1")
				.bind(nickname_or_email)
				.bind(nickname_or_email)
				.fetch_optional(pool)
				.await
				.context("select user id (sqlite)")?,
			SqlBackend::Postgres(pool) => {
				sqlx::query_as("SELECT id FROM users WHERE nickname = $1 OR email = $1 LIMIT 1")
					.bind(nickname_or_email)
					.fetch_optional(pool)
					.await
					.context("select user id (postgres)")?
			}
		};

		Ok(row.map(|(id,)| UserId(id)))
	}

	async fn display_name(&self, id: UserId) -> anyhow::Result<Option<DisplayName>> {
		let row: Option<(String,)> = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query_as("SELECT nickname FROM users WHERE id = ?")
				.bind(id.get())
				.fetch_optional(pool)
				.await
				.context("select nickname (sqlite)")?,
			SqlBackend::Postgres(pool) => sqlx::query_as("SELECT nickname FROM users WHERE id = $1")
				.bind(id.get())
				.fetch_optional(pool)
				.await
				.context("select nickname (postgres)")?,
		};

		row.map(|(nickname,)| DisplayName::new(nickname).with_context(|| format!("user {id} has an invalid nickname")))
			.transpose()
	}

	async fn list_users(&self) -> anyhow::Result<Vec<Identity>> {
		let rows: Vec<(i64, String)> = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query_as("SELECT id, nickname FROM users")
				.fetch_all(pool)
				.await
				.context("select users (sqlite)")?,
			SqlBackend::Postgres(pool) => sqlx::query_as("SELECT id, nickname FROM users")
				.fetch_all(pool)
				.await
				.context("select users (postgres)")?,
		};

		let mut users = Vec::with_capacity(rows.len());
		for (id, nickname) in rows {
			match DisplayName::new(nickname) {
				Ok(name) => users.push(Identity::new(UserId(id), name)),
				Err(e) => warn!(user_id = id, error = %e, "store: skipping user with invalid nickname"),
			}
		}
		Ok(users)
	}

	async fn session_user(&self, token: &str) -> anyhow::Result<Option<UserId>> {
		let now = unix_ms_now();
		let row: Option<(i64,)> = match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query_as("SELECT user_id FROM sessions WHERE session_token = ? AND expires_at_ms > ?")
					.bind(token)
					.bind(now)
					.fetch_optional(pool)
					.await
					.context("select session (sqlite)")?
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query_as("SELECT user_id FROM sessions WHERE session_token = $1 AND expires_at_ms > $2")
					.bind(token)
					.bind(now)
					.fetch_optional(pool)
					.await
					.context("select session (postgres)")?
			}
		};

		Ok(row.map(|(id,)| UserId(id)))
	}
}

#[async_trait]
impl HistoryStore for SqlStore {
	async fn append(&self, msg: &StoredMessage) -> anyhow::Result<()> {
		let sent_at_ms = to_unix_ms(msg.timestamp);

		match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query(
					"INSERT INTO messages (sender_id, sender, receiver_id, receiver, content, sent_at_ms) \
					VALUES (?, ?, ?, ?, ?, ?)",
				)
				.bind(msg.sender.id.get())
				.bind(msg.sender.name.as_str())
				.bind(msg.receiver.id.get())
				.bind(msg.receiver.name.as_str())
				.bind(&msg.content)
				.bind(sent_at_ms)
				.execute(pool)
				.await
				.context("insert message (sqlite)")?;
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query(
					"INSERT INTO messages (sender_id, sender, receiver_id, receiver, content, sent_at_ms) \
					VALUES ($1, $2, $3, $4, $5, $6)",
				)
				.bind(msg.sender.id.get())
				.bind(msg.sender.name.as_str())
				.bind(msg.receiver.id.get())
				.bind(msg.receiver.name.as_str())
				.bind(&msg.content)
				.bind(sent_at_ms)
				.execute(pool)
				.await
				.context("insert message (postgres)")?;
			}
		}

		Ok(())
	}

	async fn page(&self, a: &str, b: &str, page: Page) -> anyhow::Result<Vec<ChatMessage>> {
		let rows: Vec<MessageRow> = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query_as(
				"SELECT sender_id, sender, receiver_id, receiver, content, sent_at_ms FROM messages \
				WHERE (sender = ? AND receiver = ?) OR (sender = ? AND receiver = ?) \
				ORDER BY sent_at_ms DESC, id DESC LIMIT ? OFFSET ?",
			)
			.bind(a)
			.bind(b)
			.bind(b)
			.bind(a)
			.bind(page.limit)
			.bind(page.offset)
			.fetch_all(pool)
			.await
			.context("select messages (sqlite)")?,
			SqlBackend::Postgres(pool) => sqlx::query_as(
				"SELECT sender_id, sender, receiver_id, receiver, content, sent_at_ms FROM messages \
				WHERE (sender = $1 AND receiver = $2) OR (sender = $2 AND receiver = $1) \
				ORDER BY sent_at_ms DESC, id DESC LIMIT $3 OFFSET $4",
			)
			.bind(a)
			.bind(b)
			.bind(page.limit)
			.bind(page.offset)
			.fetch_all(pool)
			.await
			.context("select messages (postgres)")?,
		};

		Ok(rows
			.into_iter()
			.map(|(sender_id, sender, receiver_id, receiver, content, sent_at_ms)| ChatMessage {
				sender_id: Some(UserId(sender_id)),
				sender,
				receiver_id: Some(UserId(receiver_id)),
				receiver,
				content,
				timestamp: from_unix_ms(sent_at_ms),
			})
			.collect())
	}

	async fn last_interactions(&self, viewer: UserId) -> anyhow::Result<HashMap<UserId, DateTime<Utc>>> {
		let rows: Vec<(i64, Option<i64>)> = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query_as(
				"SELECT CASE WHEN sender_id = ? THEN receiver_id ELSE sender_id END AS other, MAX(sent_at_ms) \
				FROM messages WHERE sender_id = ? OR receiver_id = ? GROUP BY other",
			)
			.bind(viewer.get())
			.bind(viewer.get())
			.bind(viewer.get())
			.fetch_all(pool)
			.await
			.context("select last interactions (sqlite)")?,
			SqlBackend::Postgres(pool) => sqlx::query_as(
				"SELECT CASE WHEN sender_id = $1 THEN receiver_id ELSE sender_id END AS other, MAX(sent_at_ms) \
				FROM messages WHERE sender_id = $1 OR receiver_id = $1 GROUP BY 1",
			)
			.bind(viewer.get())
			.fetch_all(pool)
			.await
			.context("select last interactions (postgres)")?,
		};

		Ok(rows
			.into_iter()
			.filter_map(|(other, latest)| Some((UserId(other), from_unix_ms(latest?)?)))
			.collect())
	}
}
