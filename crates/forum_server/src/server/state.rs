#![forbid(unsafe_code)]

use std::sync::Arc;

use crate::server::connection::ConnectionSettings;
use crate::server::health::HealthState;
use crate::server::hub::{Hub, HubConfig};
use crate::server::presence::{PresenceConfig, PresenceRegistry};
use crate::server::router::MessageRouter;
use crate::server::store::{Directory, HistoryStore};

/// Everything the HTTP handlers share. Built once in `main`, cloned per request.
#[derive(Clone)]
pub struct AppState {
	pub hub: Hub,
	pub presence: PresenceRegistry,
	pub router: Arc<MessageRouter>,
	pub directory: Arc<dyn Directory>,
	pub history: Arc<dyn HistoryStore>,
	pub settings: ConnectionSettings,
	pub history_default_limit: i64,
	pub health: HealthState,
}

impl AppState {
	pub fn new(
		directory: Arc<dyn Directory>,
		history: Arc<dyn HistoryStore>,
		settings: ConnectionSettings,
		history_default_limit: i64,
		debug_logs: bool,
	) -> Self {
		let hub = Hub::new(HubConfig {
			outbound_queue_capacity: settings.outbound_queue_capacity,
			debug_logs,
		});
		let presence = PresenceRegistry::new(
			directory.clone(),
			history.clone(),
			PresenceConfig {
				outbound_queue_capacity: settings.outbound_queue_capacity,
				debug_logs,
			},
		);
		let router = Arc::new(MessageRouter::new(
			directory.clone(),
			history.clone(),
			hub.clone(),
			settings.max_frame_bytes,
		));

		Self {
			hub,
			presence,
			router,
			directory,
			history,
			settings,
			history_default_limit,
			health: HealthState::new(),
		}
	}

	/// Close every socket queue so the write pumps send close frames and exit.
	pub async fn shutdown(&self) {
		self.health.mark_not_ready();
		self.hub.shutdown().await;
		self.presence.shutdown().await;
	}
}
