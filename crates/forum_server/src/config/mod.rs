#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use serde::Deserialize;
use tracing::{info, warn};

use crate::server::connection::ConnectionSettings;

pub const DEFAULT_BIND: &str = "127.0.0.1:8080";
pub const DEFAULT_DATABASE_URL: &str = "sqlite://forum.db?mode=rwc";
pub const DEFAULT_OUTBOUND_QUEUE_CAPACITY: usize = 256;
pub const DEFAULT_PONG_WAIT_SECS: u64 = 60;
pub const DEFAULT_WRITE_WAIT_SECS: u64 = 10;
pub const DEFAULT_HISTORY_LIMIT: i64 = 10;

/// Default config path: `~/.forum/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".forum").join("config.toml"))
}

/// Load the server config from TOML and env overrides.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg);

	apply_env_overrides(&mut cfg);
	cfg.chat.normalize();

	Ok(cfg)
}

/// Server config.
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
	pub server: ServerSettings,
	pub chat: ChatSettings,
	pub database: DatabaseSettings,
	pub history: HistorySettings,
}

/// Listener settings.
#[derive(Debug, Clone)]
pub struct ServerSettings {
	/// HTTP bind address (host:port).
	pub bind: String,
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
}

impl Default for ServerSettings {
	fn default() -> Self {
		Self {
			bind: DEFAULT_BIND.to_string(),
			metrics_bind: None,
		}
	}
}

/// Socket timing and queue settings shared by chat and presence sockets.
#[derive(Debug, Clone)]
pub struct ChatSettings {
	pub outbound_queue_capacity: usize,
	pub pong_wait: Duration,
	pub ping_period: Duration,
	pub write_wait: Duration,
	pub max_message_bytes: usize,
	pub debug_logs: bool,
}

impl Default for ChatSettings {
	fn default() -> Self {
		let pong_wait = Duration::from_secs(DEFAULT_PONG_WAIT_SECS);
		Self {
			outbound_queue_capacity: DEFAULT_OUTBOUND_QUEUE_CAPACITY,
			pong_wait,
			ping_period: ping_period_for(pong_wait),
			write_wait: Duration::from_secs(DEFAULT_WRITE_WAIT_SECS),
			max_message_bytes: forum_protocol::DEFAULT_MAX_FRAME_SIZE,
			debug_logs: false,
		}
	}
}

impl ChatSettings {
	fn normalize(&mut self) {
		if self.outbound_queue_capacity == 0 {
			warn!(
				default = DEFAULT_OUTBOUND_QUEUE_CAPACITY,
				"chat config: outbound_queue_capacity must be > 0; using default"
			);
			self.outbound_queue_capacity = DEFAULT_OUTBOUND_QUEUE_CAPACITY;
		}

		if self.pong_wait.is_zero() {
			warn!("chat config: pong_wait must be > 0; using default");
			self.pong_wait = Duration::from_secs(DEFAULT_PONG_WAIT_SECS);
		}

		if self.ping_period.is_zero() || self.ping_period >= self.pong_wait {
			let fixed = ping_period_for(self.pong_wait);
			warn!(
				ping_ms = self.ping_period.as_millis(),
				pong_ms = self.pong_wait.as_millis(),
				fixed_ms = fixed.as_millis(),
				"chat config: ping_period must be shorter than pong_wait; deriving from pong_wait"
			);
			self.ping_period = fixed;
		}
	}

	pub fn connection_settings(&self) -> ConnectionSettings {
		ConnectionSettings {
			outbound_queue_capacity: self.outbound_queue_capacity,
			pong_wait: self.pong_wait,
			ping_period: self.ping_period,
			write_wait: self.write_wait,
			max_frame_bytes: self.max_message_bytes,
		}
	}
}

/// Pings go out at 9/10 of the read deadline so a pong can land in time.
pub fn ping_period_for(pong_wait: Duration) -> Duration {
	pong_wait.saturating_mul(9) / 10
}

/// Database settings.
#[derive(Debug, Clone)]
pub struct DatabaseSettings {
	/// Database URL (sqlite: or postgres:).
	pub url: String,
	pub max_connections: Option<u32>,
}

impl Default for DatabaseSettings {
	fn default() -> Self {
		Self {
			url: DEFAULT_DATABASE_URL.to_string(),
			max_connections: None,
		}
	}
}

/// History query settings.
#[derive(Debug, Clone)]
pub struct HistorySettings {
	pub default_limit: i64,
}

impl Default for HistorySettings {
	fn default() -> Self {
		Self {
			default_limit: DEFAULT_HISTORY_LIMIT,
		}
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	chat: FileChatSettings,

	#[serde(default)]
	database: FileDatabaseSettings,

	#[serde(default)]
	history: FileHistorySettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	bind: Option<String>,
	metrics_bind: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileChatSettings {
	outbound_queue_capacity: Option<usize>,
	pong_wait_secs: Option<u64>,
	ping_period_secs: Option<u64>,
	write_wait_secs: Option<u64>,
	max_message_bytes: Option<usize>,
	debug_logs: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileDatabaseSettings {
	url: Option<String>,
	max_connections: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileHistorySettings {
	default_limit: Option<i64>,
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> Self {
		let defaults = ChatSettings::default();
		let pong_wait = file
			.chat
			.pong_wait_secs
			.map(Duration::from_secs)
			.unwrap_or(defaults.pong_wait);

		Self {
			server: ServerSettings {
				bind: file
					.server
					.bind
					.filter(|s| !s.trim().is_empty())
					.unwrap_or_else(|| DEFAULT_BIND.to_string()),
				metrics_bind: file.server.metrics_bind.filter(|s| !s.trim().is_empty()),
			},
			chat: ChatSettings {
				outbound_queue_capacity: file
					.chat
					.outbound_queue_capacity
					.unwrap_or(defaults.outbound_queue_capacity),
				pong_wait,
				ping_period: file
					.chat
					.ping_period_secs
					.map(Duration::from_secs)
					.unwrap_or_else(|| ping_period_for(pong_wait)),
				write_wait: file
					.chat
					.write_wait_secs
					.map(Duration::from_secs)
					.unwrap_or(defaults.write_wait),
				max_message_bytes: file.chat.max_message_bytes.unwrap_or(defaults.max_message_bytes),
				debug_logs: file.chat.debug_logs.unwrap_or(false),
			},
			database: DatabaseSettings {
				url: file
					.database
					.url
					.filter(|s| !s.trim().is_empty())
					.unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string()),
				max_connections: file.database.max_connections.filter(|v| *v > 0),
			},
			history: HistorySettings {
				default_limit: file
					.history
					.default_limit
					.filter(|v| *v > 0)
					.unwrap_or(DEFAULT_HISTORY_LIMIT),
			},
		}
	}
}

fn parse_env_bool(v: &str) -> Option<bool> {
	match v.trim().to_ascii_lowercase().as_str() {
		"1" | "true" | "yes" | "on" => Some(true),
		"0" | "false" | "no" | "off" => Some(false),
		_ => None,
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => parse_toml(&s).map(Some),
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn parse_toml(s: &str) -> anyhow::Result<FileConfig> {
	toml::from_str(s).context("parse TOML")
}

fn apply_env_overrides(cfg: &mut ServerConfig) {
	if let Ok(v) = std::env::var("FORUM_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.bind = v;
			info!("server config: bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("FORUM_METRICS_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.metrics_bind = Some(v);
			info!("server config: metrics_bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("FORUM_DATABASE_URL") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.database.url = v;
			info!("database config: url overridden by env");
		}
	}

	if let Ok(v) = std::env::var("FORUM_OUTBOUND_QUEUE_CAPACITY")
		&& let Ok(capacity) = v.trim().parse::<usize>()
	{
		cfg.chat.outbound_queue_capacity = capacity;
		info!(capacity, "chat config: outbound_queue_capacity overridden by env");
	}

	if let Ok(v) = std::env::var("FORUM_PONG_WAIT_SECS")
		&& let Ok(secs) = v.trim().parse::<u64>()
	{
		cfg.chat.pong_wait = Duration::from_secs(secs);
		cfg.chat.ping_period = ping_period_for(cfg.chat.pong_wait);
		info!(secs, "chat config: pong_wait overridden by env");
	}

	if let Ok(v) = std::env::var("FORUM_WRITE_WAIT_SECS")
		&& let Ok(secs) = v.trim().parse::<u64>()
	{
		cfg.chat.write_wait = Duration::from_secs(secs);
		info!(secs, "chat config: write_wait overridden by env");
	}

	if let Ok(v) = std::env::var("FORUM_CHAT_DEBUG_LOGS")
		&& let Some(enabled) = parse_env_bool(&v)
	{
		cfg.chat.debug_logs = enabled;
		info!(enabled, "chat config: debug_logs overridden by env");
	}

	if let Ok(v) = std::env::var("FORUM_HISTORY_DEFAULT_LIMIT")
		&& let Ok(limit) = v.trim().parse::<i64>()
		&& limit > 0
	{
		cfg.history.default_limit = limit;
		info!(limit, "history config: default_limit overridden by env");
	}
}
