#![forbid(unsafe_code)]

//! Collaborator seams for identity, token and statistics persistence.
//!
//! The server core only talks to these traits; handles are built once in `main`
//! and injected into the resolver and the pipeline.

pub mod memory;
pub mod sql;

use std::sync::Arc;
use std::time::Duration;

use boompow_domain::{Identity, UserId};

use crate::server::events::WorkEvent;

/// Lifetime of a password reset token.
pub const RESET_TOKEN_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Emails are matched case-insensitively. Every backend receives lookups in this
/// form and compares against its stored emails in the same form.
pub fn normalize_email(email: &str) -> String {
	email.trim().to_ascii_lowercase()
}

#[async_trait::async_trait]
pub trait IdentityStore: Send + Sync {
	async fn identity_by_id(&self, id: UserId) -> anyhow::Result<Option<Identity>>;

	async fn identity_by_email(&self, email: &str) -> anyhow::Result<Option<Identity>>;
}

/// One-time password reset tokens keyed by email.
#[async_trait::async_trait]
pub trait ResetTokenStore: Send + Sync {
	async fn set_reset_token(&self, email: &str, token: &str) -> anyhow::Result<()>;

	/// Returns `None` when no token exists or it has expired.
	async fn get_reset_token(&self, email: &str) -> anyhow::Result<Option<String>>;

	async fn delete_reset_token(&self, email: &str) -> anyhow::Result<bool>;
}

/// Service token → bound user id (raw string, parsed by the caller).
#[async_trait::async_trait]
pub trait ServiceTokenStore: Send + Sync {
	async fn user_for_service_token(&self, token: &str) -> anyhow::Result<Option<String>>;
}

/// Counters after a work result was recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WorkTally {
	/// Accepted results credited to the worker's owner, this one included.
	pub provider_results: u64,
	/// Results delivered to the requester, this one included.
	pub requester_results: u64,
}

#[async_trait::async_trait]
pub trait StatsStore: Send + Sync {
	async fn record_work(&self, event: &WorkEvent) -> anyhow::Result<WorkTally>;
}

/// The full set of collaborator handles used by the server.
#[derive(Clone)]
pub struct Stores {
	pub identities: Arc<dyn IdentityStore>,
	pub reset_tokens: Arc<dyn ResetTokenStore>,
	pub service_tokens: Arc<dyn ServiceTokenStore>,
	pub stats: Arc<dyn StatsStore>,
}

impl Stores {
	/// Everything backed by one SQL database.
	pub fn from_sql(store: sql::SqlStore) -> Self {
		let store = Arc::new(store);
		Self {
			identities: store.clone(),
			reset_tokens: store.clone(),
			service_tokens: store.clone(),
			stats: store,
		}
	}

	/// Process-local stores; nothing survives a restart.
	pub fn in_memory(
		identities: memory::MemoryIdentityStore,
		tokens: memory::MemoryTokenStore,
		stats: memory::MemoryStatsStore,
	) -> Self {
		let tokens = Arc::new(tokens);
		Self {
			identities: Arc::new(identities),
			reset_tokens: tokens.clone(),
			service_tokens: tokens,
			stats: Arc::new(stats),
		}
	}
}
