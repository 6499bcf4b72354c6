#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use forum_domain::DisplayName;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info};

use crate::server::connection::{ConnId, ConnIdGen};

/// Registry of chat connections keyed by display name.
///
/// All mutations go through the inner lock, which is never held across socket I/O.
#[derive(Debug, Clone)]
pub struct Hub {
	inner: Arc<Mutex<Inner>>,
	cfg: HubConfig,
	ids: ConnIdGen,
}

/// Configuration for `Hub`.
#[derive(Debug, Clone)]
pub struct HubConfig {
	/// Maximum number of queued frames per connection before it is evicted.
	pub outbound_queue_capacity: usize,

	pub debug_logs: bool,
}

impl Default for HubConfig {
	fn default() -> Self {
		Self {
			outbound_queue_capacity: 256,
			debug_logs: false,
		}
	}
}

/// Handed to the connection that just registered.
#[derive(Debug)]
pub struct Registration {
	pub conn_id: ConnId,
	pub name: DisplayName,
	pub outbound: mpsc::Receiver<String>,
}

/// Result of a unicast send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
	Queued,
	/// No connection registered under that name; the frame was dropped.
	Offline,
	/// The target queue was full; the connection has been removed and its queue closed.
	Evicted,
}

impl Hub {
	pub fn new(cfg: HubConfig) -> Self {
		Self {
			inner: Arc::new(Mutex::new(Inner::default())),
			cfg,
			ids: ConnIdGen::default(),
		}
	}

	/// Register a connection under `name`. Last registration wins.
	///
	/// A superseded connection keeps its queue open but is no longer reachable
	/// through `send_to`; it is released by its own `unregister`.
	pub async fn register(&self, name: DisplayName) -> Registration {
		let (tx, rx) = mpsc::channel(self.cfg.outbound_queue_capacity.max(1));
		let conn_id = self.ids.next();

		let mut inner = self.inner.lock().await;
		if let Some(prev) = inner.clients.insert(name.clone(), ClientEntry { conn_id, tx }) {
			debug!(user = %name, old_conn = %prev.conn_id, new_conn = %conn_id, "hub: connection superseded");
			inner.superseded.insert(prev.conn_id, prev.tx);
		}
		metrics::gauge!("forum_server_chat_connections_active").set(inner.clients.len() as f64);

		if self.cfg.debug_logs {
			debug!(user = %name, conn_id = %conn_id, clients = inner.clients.len(), "hub: registered");
		}

		Registration {
			conn_id,
			name,
			outbound: rx,
		}
	}

	/// Remove the connection `conn_id` registered under `name`, closing its queue.
	///
	/// A stale connection never removes a newer registration. Returns whether the
	/// live entry for `name` was removed.
	pub async fn unregister(&self, name: &DisplayName, conn_id: ConnId) -> bool {
		let mut inner = self.inner.lock().await;

		let is_current = inner.clients.get(name).is_some_and(|entry| entry.conn_id == conn_id);
		if is_current {
			inner.clients.remove(name);
			metrics::gauge!("forum_server_chat_connections_active").set(inner.clients.len() as f64);
			if self.cfg.debug_logs {
				debug!(user = %name, conn_id = %conn_id, "hub: unregistered");
			}
			return true;
		}

		if inner.superseded.remove(&conn_id).is_some() && self.cfg.debug_logs {
			debug!(user = %name, conn_id = %conn_id, "hub: released superseded connection");
		}
		false
	}

	/// Non-blocking unicast. A full queue evicts the receiver.
	pub async fn send_to(&self, name: &str, frame: String) -> SendOutcome {
		let mut inner = self.inner.lock().await;

		let Some(entry) = inner.clients.get(name) else {
			metrics::counter!("forum_server_hub_send_missed_total").increment(1);
			return SendOutcome::Offline;
		};

		let outcome = match entry.tx.try_send(frame) {
			Ok(()) => return SendOutcome::Queued,
			Err(mpsc::error::TrySendError::Full(_)) => SendOutcome::Evicted,
			// Receiver already gone; treat like an unregister that hasn't happened yet.
			Err(mpsc::error::TrySendError::Closed(_)) => SendOutcome::Offline,
		};

		if let Some(entry) = inner.clients.remove(name) {
			metrics::gauge!("forum_server_chat_connections_active").set(inner.clients.len() as f64);
			match outcome {
				SendOutcome::Evicted => {
					metrics::counter!("forum_server_hub_evictions_total").increment(1);
					info!(user = %name, conn_id = %entry.conn_id, "hub: evicted slow consumer");
				}
				_ => {
					metrics::counter!("forum_server_hub_send_missed_total").increment(1);
					debug!(user = %name, conn_id = %entry.conn_id, "hub: dropped closed connection");
				}
			}
		}

		outcome
	}

	/// Whether a live registration exists for `name`.
	#[allow(dead_code)]
	pub async fn is_registered(&self, name: &str) -> bool {
		self.inner.lock().await.clients.contains_key(name)
	}

	#[allow(dead_code)]
	pub async fn len(&self) -> usize {
		self.inner.lock().await.clients.len()
	}

	/// Drop every registration; each write pump sees its queue close and exits.
	pub async fn shutdown(&self) {
		let mut inner = self.inner.lock().await;
		let dropped = inner.clients.len() + inner.superseded.len();
		inner.clients.clear();
		inner.superseded.clear();
		metrics::gauge!("forum_server_chat_connections_active").set(0.0);
		info!(connections = dropped, "hub: shut down");
	}
}

#[derive(Debug, Default)]
struct Inner {
	clients: HashMap<DisplayName, ClientEntry>,

	/// Queues of connections replaced by a newer registration under the same name.
	superseded: HashMap<ConnId, mpsc::Sender<String>>,
}

#[derive(Debug)]
struct ClientEntry {
	conn_id: ConnId,
	tx: mpsc::Sender<String>,
}
