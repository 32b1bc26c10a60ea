#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::time::Duration;

use anyhow::anyhow;
use boompow_domain::{Identity, UserId};
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;

use crate::server::events::WorkEvent;
use crate::store::{
	IdentityStore, RESET_TOKEN_TTL, ResetTokenStore, ServiceTokenStore, StatsStore, WorkTally, normalize_email,
};

#[derive(Default)]
pub struct MemoryIdentityStore {
	inner: RwLock<HashMap<UserId, Identity>>,
}

impl MemoryIdentityStore {
	pub fn new() -> Self {
		Self::default()
	}

	/// Insert or replace an identity.
	pub async fn upsert(&self, identity: Identity) {
		self.inner.write().await.insert(identity.id, identity);
	}
}

#[async_trait::async_trait]
impl IdentityStore for MemoryIdentityStore {
	async fn identity_by_id(&self, id: UserId) -> anyhow::Result<Option<Identity>> {
		Ok(self.inner.read().await.get(&id).cloned())
	}

	async fn identity_by_email(&self, email: &str) -> anyhow::Result<Option<Identity>> {
		let email = normalize_email(email);
		let guard = self.inner.read().await;
		Ok(guard.values().find(|i| normalize_email(&i.email) == email).cloned())
	}
}

/// Reset tokens (with expiry) and service token bindings.
pub struct MemoryTokenStore {
	reset_ttl: Duration,
	reset: Mutex<HashMap<String, (String, Instant)>>,
	service: RwLock<HashMap<String, String>>,
}

impl Default for MemoryTokenStore {
	fn default() -> Self {
		Self::with_reset_ttl(RESET_TOKEN_TTL)
	}
}

impl MemoryTokenStore {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn with_reset_ttl(reset_ttl: Duration) -> Self {
		Self {
			reset_ttl,
			reset: Mutex::new(HashMap::new()),
			service: RwLock::new(HashMap::new()),
		}
	}

	/// Bind a service token to a user id string.
	pub async fn bind_service_token(&self, token: impl Into<String>, user_id: impl Into<String>) {
		self.service.write().await.insert(token.into(), user_id.into());
	}
}

#[async_trait::async_trait]
impl ResetTokenStore for MemoryTokenStore {
	async fn set_reset_token(&self, email: &str, token: &str) -> anyhow::Result<()> {
		let expires_at = Instant::now() + self.reset_ttl;
		self.reset
			.lock()
			.await
			.insert(normalize_email(email), (token.to_string(), expires_at));
		Ok(())
	}

	async fn get_reset_token(&self, email: &str) -> anyhow::Result<Option<String>> {
		let key = normalize_email(email);
		let mut guard = self.reset.lock().await;
		match guard.get(&key) {
			Some((_, expires_at)) if *expires_at <= Instant::now() => {
				guard.remove(&key);
				Ok(None)
			}
			Some((token, _)) => Ok(Some(token.clone())),
			None => Ok(None),
		}
	}

	async fn delete_reset_token(&self, email: &str) -> anyhow::Result<bool> {
		Ok(self.reset.lock().await.remove(&normalize_email(email)).is_some())
	}
}

#[async_trait::async_trait]
impl ServiceTokenStore for MemoryTokenStore {
	async fn user_for_service_token(&self, token: &str) -> anyhow::Result<Option<String>> {
		Ok(self.service.read().await.get(token).cloned())
	}
}

#[derive(Default)]
pub struct MemoryStatsStore {
	inner: Mutex<StatsCounters>,
}

#[derive(Default)]
struct StatsCounters {
	by_provider: HashMap<UserId, u64>,
	by_requester: HashMap<UserId, u64>,
}

impl MemoryStatsStore {
	pub fn new() -> Self {
		Self::default()
	}

	pub async fn provider_results(&self, provider: UserId) -> u64 {
		self.inner.lock().await.by_provider.get(&provider).copied().unwrap_or(0)
	}
}

#[async_trait::async_trait]
impl StatsStore for MemoryStatsStore {
	async fn record_work(&self, event: &WorkEvent) -> anyhow::Result<WorkTally> {
		let provider = event
			.worker_key
			.owner()
			.ok_or_else(|| anyhow!("worker key {} has no owning user", event.worker_key))?;

		let mut guard = self.inner.lock().await;

		let provider_results = guard.by_provider.entry(provider).or_insert(0);
		*provider_results += 1;
		let provider_results = *provider_results;

		let requester_results = guard.by_requester.entry(event.requester_id).or_insert(0);
		*requester_results += 1;

		Ok(WorkTally {
			provider_results,
			requester_results: *requester_results,
		})
	}
}
