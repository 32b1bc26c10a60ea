#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use boompow_domain::{Identity, SecretString, UserId, UserType};
use serde::Deserialize;
use tracing::{info, warn};

use crate::auth::credential::SERVICE_PREFIX;

const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);

/// Default config path: `~/.boompow/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".boompow").join("config.toml"))
}

/// Load the server config from TOML, then apply `BOOMPOW_*` env overrides.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg)?;

	apply_env_overrides(&mut cfg);

	Ok(cfg)
}

#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
	pub server: ServerSettings,
	pub pipeline: PipelineSettings,
	pub persistence: PersistenceSettings,

	/// Identities served from memory when persistence is disabled.
	pub users: Vec<Identity>,

	/// Service token → user id bindings used when persistence is disabled.
	pub service_token_users: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
	/// HTTP/WebSocket listener (`http://host:port` or `host:port`).
	pub bind: Option<String>,
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// Optional health/readiness HTTP bind address (host:port).
	pub health_bind: Option<String>,
	/// HMAC secret for bearer and reset-password tokens.
	pub auth_hmac_secret: Option<SecretString>,
	/// Accepted service tokens, `service:` prefix included.
	pub service_tokens: Vec<String>,
	pub worker_outbound_capacity: usize,
	pub keepalive_interval: Duration,
	pub keepalive_timeout: Duration,
	pub max_frame_bytes: usize,
}

impl Default for ServerSettings {
	fn default() -> Self {
		Self {
			bind: None,
			metrics_bind: None,
			health_bind: None,
			auth_hmac_secret: None,
			service_tokens: Vec::new(),
			worker_outbound_capacity: 64,
			keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
			keepalive_timeout: DEFAULT_KEEPALIVE_INTERVAL * 3,
			max_frame_bytes: boompow_protocol::DEFAULT_MAX_FRAME_SIZE,
		}
	}
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
	pub work_queue_capacity: usize,
	/// Reward every n-th accepted result per provider; 0 rewards awarded blocks only.
	pub payout_threshold: u64,
}

impl Default for PipelineSettings {
	fn default() -> Self {
		Self {
			work_queue_capacity: crate::server::stats::DEFAULT_WORK_QUEUE_CAPACITY,
			payout_threshold: 1,
		}
	}
}

#[derive(Debug, Clone, Default)]
pub struct PersistenceSettings {
	pub enabled: bool,
	/// Database URL (sqlite:, postgres: or mysql:).
	pub database_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	pipeline: FilePipelineSettings,

	#[serde(default)]
	persistence: FilePersistenceSettings,

	#[serde(default)]
	users: Vec<FileUser>,

	#[serde(default)]
	service_token_users: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	bind: Option<String>,
	metrics_bind: Option<String>,
	health_bind: Option<String>,
	auth_hmac_secret: Option<String>,
	#[serde(default)]
	service_tokens: Vec<String>,
	worker_outbound_capacity: Option<usize>,
	keepalive_interval_secs: Option<u64>,
	keepalive_timeout_secs: Option<u64>,
	max_frame_bytes: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FilePipelineSettings {
	work_queue_capacity: Option<usize>,
	payout_threshold: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FilePersistenceSettings {
	enabled: Option<bool>,
	database_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct FileUser {
	id: Option<String>,
	email: String,
	user_type: String,
	#[serde(default)]
	email_verified: bool,
	#[serde(default)]
	can_request_work: bool,
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> anyhow::Result<Self> {
		let defaults = ServerSettings::default();
		let keepalive_interval = file
			.server
			.keepalive_interval_secs
			.filter(|v| *v > 0)
			.map(Duration::from_secs)
			.unwrap_or(defaults.keepalive_interval);
		let keepalive_timeout = file
			.server
			.keepalive_timeout_secs
			.filter(|v| *v > 0)
			.map(Duration::from_secs)
			.unwrap_or(keepalive_interval * 3);

		let users = file
			.users
			.into_iter()
			.map(FileUser::into_identity)
			.collect::<anyhow::Result<Vec<_>>>()?;

		let mut cfg = Self {
			server: ServerSettings {
				bind: non_empty(file.server.bind),
				metrics_bind: non_empty(file.server.metrics_bind),
				health_bind: non_empty(file.server.health_bind),
				auth_hmac_secret: non_empty(file.server.auth_hmac_secret).map(SecretString::new),
				service_tokens: file.server.service_tokens.into_iter().filter_map(normalize_service_token).collect(),
				worker_outbound_capacity: file
					.server
					.worker_outbound_capacity
					.filter(|v| *v > 0)
					.unwrap_or(defaults.worker_outbound_capacity),
				keepalive_interval,
				keepalive_timeout,
				max_frame_bytes: file
					.server
					.max_frame_bytes
					.filter(|v| *v > 0)
					.unwrap_or(defaults.max_frame_bytes),
			},
			pipeline: PipelineSettings {
				work_queue_capacity: file
					.pipeline
					.work_queue_capacity
					.filter(|v| *v > 0)
					.unwrap_or(PipelineSettings::default().work_queue_capacity),
				payout_threshold: file.pipeline.payout_threshold.unwrap_or(1),
			},
			persistence: PersistenceSettings {
				enabled: file.persistence.enabled.unwrap_or(false),
				database_url: non_empty(file.persistence.database_url),
			},
			users,
			service_token_users: file
				.service_token_users
				.into_iter()
				.filter_map(|(token, user)| normalize_service_token(token).map(|token| (token, user)))
				.collect(),
		};
		cfg.validate_keepalive();
		Ok(cfg)
	}

	fn validate_keepalive(&mut self) {
		if self.server.keepalive_timeout <= self.server.keepalive_interval {
			let fixed = self.server.keepalive_interval * 3;
			warn!(
				interval_secs = self.server.keepalive_interval.as_secs(),
				timeout_secs = self.server.keepalive_timeout.as_secs(),
				fixed_secs = fixed.as_secs(),
				"server config: keepalive_timeout must exceed keepalive_interval; using 3x interval"
			);
			self.server.keepalive_timeout = fixed;
		}
	}
}

impl FileUser {
	fn into_identity(self) -> anyhow::Result<Identity> {
		let id = match self.id.as_deref() {
			Some(raw) => raw
				.parse::<UserId>()
				.with_context(|| format!("users: invalid id for {}", self.email))?,
			None => UserId::new_v4(),
		};
		let user_type = self
			.user_type
			.parse::<UserType>()
			.with_context(|| format!("users: invalid user_type for {}", self.email))?;

		Ok(Identity {
			id,
			email: self.email,
			email_verified: self.email_verified,
			can_request_work: self.can_request_work,
			user_type,
		})
	}
}

fn non_empty(v: Option<String>) -> Option<String> {
	v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

/// Service tokens are matched on the full header value, so the prefix is part of the token.
fn normalize_service_token(token: String) -> Option<String> {
	let token = token.trim();
	if token.is_empty() {
		return None;
	}
	if token.starts_with(SERVICE_PREFIX) {
		Some(token.to_string())
	} else {
		Some(format!("{SERVICE_PREFIX}{token}"))
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
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn apply_env_overrides(cfg: &mut ServerConfig) {
	apply_overrides(cfg, |name| std::env::var(name).ok());
}

fn apply_overrides(cfg: &mut ServerConfig, var: impl Fn(&str) -> Option<String>) {
	let text = |name: &str| var(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

	if let Some(v) = text("BOOMPOW_BIND") {
		cfg.server.bind = Some(v);
		info!("server config: bind overridden by env");
	}

	if let Some(v) = text("BOOMPOW_METRICS_BIND") {
		cfg.server.metrics_bind = Some(v);
		info!("server config: metrics_bind overridden by env");
	}

	if let Some(v) = text("BOOMPOW_HEALTH_BIND") {
		cfg.server.health_bind = Some(v);
		info!("server config: health_bind overridden by env");
	}

	if let Some(v) = text("BOOMPOW_AUTH_HMAC_SECRET") {
		cfg.server.auth_hmac_secret = Some(SecretString::new(v));
		info!("server auth: auth_hmac_secret overridden by env");
	}

	if let Some(v) = text("BOOMPOW_SERVICE_TOKENS") {
		cfg.server.service_tokens = v
			.split(',')
			.filter_map(|t| normalize_service_token(t.to_string()))
			.collect();
		info!(
			count = cfg.server.service_tokens.len(),
			"server auth: service_tokens overridden by env"
		);
	}

	if let Some(capacity) = text("BOOMPOW_WORKER_OUTBOUND_CAPACITY").and_then(|v| v.parse::<usize>().ok())
		&& capacity > 0
	{
		cfg.server.worker_outbound_capacity = capacity;
		info!(capacity, "server config: worker_outbound_capacity overridden by env");
	}

	if let Some(secs) = text("BOOMPOW_KEEPALIVE_INTERVAL_SECS").and_then(|v| v.parse::<u64>().ok())
		&& secs > 0
	{
		cfg.server.keepalive_interval = Duration::from_secs(secs);
		info!(secs, "server config: keepalive_interval overridden by env");
	}

	if let Some(secs) = text("BOOMPOW_KEEPALIVE_TIMEOUT_SECS").and_then(|v| v.parse::<u64>().ok())
		&& secs > 0
	{
		cfg.server.keepalive_timeout = Duration::from_secs(secs);
		info!(secs, "server config: keepalive_timeout overridden by env");
	}

	if let Some(bytes) = text("BOOMPOW_MAX_FRAME_BYTES").and_then(|v| v.parse::<usize>().ok())
		&& bytes > 0
	{
		cfg.server.max_frame_bytes = bytes;
		info!(bytes, "server config: max_frame_bytes overridden by env");
	}

	if let Some(capacity) = text("BOOMPOW_WORK_QUEUE_CAPACITY").and_then(|v| v.parse::<usize>().ok())
		&& capacity > 0
	{
		cfg.pipeline.work_queue_capacity = capacity;
		info!(capacity, "pipeline: work_queue_capacity overridden by env");
	}

	if let Some(threshold) = text("BOOMPOW_PAYOUT_THRESHOLD").and_then(|v| v.parse::<u64>().ok()) {
		cfg.pipeline.payout_threshold = threshold;
		info!(threshold, "pipeline: payout_threshold overridden by env");
	}

	if let Some(enabled) = text("BOOMPOW_PERSISTENCE_ENABLED").and_then(|v| parse_env_bool(&v)) {
		cfg.persistence.enabled = enabled;
		info!(enabled, "persistence: enabled overridden by env");
	}

	if let Some(v) = text("BOOMPOW_DATABASE_URL") {
		cfg.persistence.database_url = Some(v);
		info!("persistence: database_url overridden by env");
	}

	cfg.validate_keepalive();

	if cfg.server.auth_hmac_secret.is_none() {
		warn!("server auth: no auth_hmac_secret configured; bearer and reset-password tokens will be rejected");
	}
}
