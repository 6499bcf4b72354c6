#![forbid(unsafe_code)]

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use forum_domain::{Identity, UserId};
use forum_protocol::{Frame, PresenceEntry, UserUpdate, encode_frame};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};

use crate::server::connection::{ConnId, ConnIdGen};
use crate::server::store::{Directory, HistoryStore};

/// Configuration for `PresenceRegistry`.
#[derive(Debug, Clone)]
pub struct PresenceConfig {
	pub outbound_queue_capacity: usize,

	pub debug_logs: bool,
}

impl Default for PresenceConfig {
	fn default() -> Self {
		Self {
			outbound_queue_capacity: 256,
			debug_logs: false,
		}
	}
}

/// Handed to a presence socket on connect.
#[derive(Debug)]
pub struct PresenceRegistration {
	pub conn_id: ConnId,
	pub outbound: mpsc::Receiver<String>,
}

/// Tracks who holds a presence socket and broadcasts the merged user list on every change.
///
/// Independent of the chat `Hub`: a user may be online here without a chat socket.
#[derive(Clone)]
pub struct PresenceRegistry {
	inner: Arc<Mutex<Inner>>,
	directory: Arc<dyn Directory>,
	history: Arc<dyn HistoryStore>,
	cfg: PresenceConfig,
	ids: ConnIdGen,
}

#[derive(Debug, Default)]
struct Inner {
	/// Users marked online by their latest presence connect.
	online: HashSet<UserId>,

	watchers: HashMap<ConnId, Watcher>,

	/// Watchers dropped for a full queue, awaiting their own disconnect.
	evicted: HashMap<ConnId, UserId>,
}

#[derive(Debug)]
struct Watcher {
	user: UserId,
	tx: mpsc::Sender<String>,
}

impl Inner {
	fn is_online(&self, user: UserId) -> bool {
		self.online.contains(&user)
	}
}

impl PresenceRegistry {
	pub fn new(directory: Arc<dyn Directory>, history: Arc<dyn HistoryStore>, cfg: PresenceConfig) -> Self {
		Self {
			inner: Arc::new(Mutex::new(Inner::default())),
			directory,
			history,
			cfg,
			ids: ConnIdGen::default(),
		}
	}

	/// Mark `user` online and broadcast their merged view to every presence socket.
	pub async fn connect(&self, user: &Identity) -> PresenceRegistration {
		let (tx, rx) = mpsc::channel(self.cfg.outbound_queue_capacity.max(1));
		let conn_id = self.ids.next();

		{
			let mut inner = self.inner.lock().await;
			inner.watchers.insert(conn_id, Watcher { user: user.id, tx });
			inner.online.insert(user.id);
			metrics::gauge!("forum_server_presence_connections_active").set(inner.watchers.len() as f64);
		}

		if self.cfg.debug_logs {
			debug!(user = %user, conn_id = %conn_id, "presence: connected");
		}

		if let Err(e) = self.broadcast_view(user).await {
			warn!(user = %user, error = %e, "presence: broadcast after connect failed");
		}

		PresenceRegistration { conn_id, outbound: rx }
	}

	/// Drop the presence socket `conn_id`, mark its user offline and rebroadcast.
	///
	/// The user goes offline even if another of their presence sockets is still open;
	/// that socket's next connect marks them online again. Unknown ids are ignored.
	pub async fn disconnect(&self, user: &Identity, conn_id: ConnId) {
		{
			let mut inner = self.inner.lock().await;
			let owner = match inner.watchers.remove(&conn_id) {
				Some(w) => Some(w.user),
				None => inner.evicted.remove(&conn_id),
			};
			let Some(owner) = owner else {
				return;
			};
			inner.online.remove(&owner);
			metrics::gauge!("forum_server_presence_connections_active").set(inner.watchers.len() as f64);
		}

		if self.cfg.debug_logs {
			debug!(user = %user, conn_id = %conn_id, "presence: disconnected");
		}

		if let Err(e) = self.broadcast_view(user).await {
			warn!(user = %user, error = %e, "presence: broadcast after disconnect failed");
		}
	}

	/// The merged view for `viewer`, excluding the viewer.
	pub async fn snapshot_for(&self, viewer: &Identity) -> anyhow::Result<Vec<PresenceEntry>> {
		let (users, interactions) = self.load(viewer.id).await?;
		let inner = self.inner.lock().await;
		Ok(merge_view(viewer.id, &users, &interactions, |id| inner.is_online(id)))
	}

	#[allow(dead_code)]
	pub async fn is_online(&self, user: UserId) -> bool {
		self.inner.lock().await.is_online(user)
	}

	/// Close every presence socket.
	pub async fn shutdown(&self) {
		let mut inner = self.inner.lock().await;
		let dropped = inner.watchers.len();
		inner.watchers.clear();
		inner.evicted.clear();
		inner.online.clear();
		metrics::gauge!("forum_server_presence_connections_active").set(0.0);
		info!(connections = dropped, "presence: shut down");
	}

	async fn load(&self, viewer: UserId) -> anyhow::Result<(Vec<Identity>, HashMap<UserId, DateTime<Utc>>)> {
		let users = self.directory.list_users().await.context("list users")?;
		let interactions = self
			.history
			.last_interactions(viewer)
			.await
			.context("load last interactions")?;
		Ok((users, interactions))
	}

	/// Compute `viewer`'s view, append their own entry and send it to all watchers.
	async fn broadcast_view(&self, viewer: &Identity) -> anyhow::Result<()> {
		let (users, interactions) = self.load(viewer.id).await?;

		let mut inner = self.inner.lock().await;
		let mut view = merge_view(viewer.id, &users, &interactions, |id| inner.is_online(id));
		view.push(PresenceEntry {
			id: viewer.id,
			username: viewer.name.to_string(),
			online: inner.is_online(viewer.id),
			lasttime: None,
		});

		let encoded = encode_frame(&Frame::UserUpdate(UserUpdate::new(view))).context("encode user_update")?;

		let mut evicted = Vec::new();
		for (conn_id, watcher) in &inner.watchers {
			match watcher.tx.try_send(encoded.clone()) {
				Ok(()) => {}
				Err(mpsc::error::TrySendError::Full(_)) | Err(mpsc::error::TrySendError::Closed(_)) => {
					evicted.push(*conn_id);
				}
			}
		}

		for conn_id in evicted {
			if let Some(w) = inner.watchers.remove(&conn_id) {
				metrics::counter!("forum_server_presence_evictions_total").increment(1);
				info!(conn_id = %conn_id, user_id = %w.user, "presence: evicted slow watcher");
				inner.evicted.insert(conn_id, w.user);
			}
		}

		metrics::counter!("forum_server_presence_broadcasts_total").increment(1);
		if self.cfg.debug_logs {
			debug!(viewer = %viewer, watchers = inner.watchers.len(), "presence: broadcast");
		}

		Ok(())
	}
}

/// Every user except `viewer`, most recent interaction first.
///
/// Users without any interaction sort last; ties break on username.
pub fn merge_view(
	viewer: UserId,
	users: &[Identity],
	interactions: &HashMap<UserId, DateTime<Utc>>,
	is_online: impl Fn(UserId) -> bool,
) -> Vec<PresenceEntry> {
	let mut view: Vec<PresenceEntry> = users
		.iter()
		.filter(|u| u.id != viewer)
		.map(|u| PresenceEntry {
			id: u.id,
			username: u.name.to_string(),
			online: is_online(u.id),
			lasttime: interactions.get(&u.id).copied(),
		})
		.collect();

	view.sort_by(|a, b| match (a.lasttime, b.lasttime) {
		(Some(x), Some(y)) => y.cmp(&x).then_with(|| a.username.cmp(&b.username)),
		(Some(_), None) => Ordering::Less,
		(None, Some(_)) => Ordering::Greater,
		(None, None) => a.username.cmp(&b.username),
	});

	view
}
