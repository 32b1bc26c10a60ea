#![forbid(unsafe_code)]

//! SQL-backed collaborators. Tables are created and migrated outside this process.

use anyhow::{Context, anyhow};
use boompow_domain::{Identity, UserId};

use crate::server::events::WorkEvent;
use crate::store::{
	IdentityStore, RESET_TOKEN_TTL, ResetTokenStore, ServiceTokenStore, StatsStore, WorkTally, normalize_email,
};
use crate::util::time::unix_secs_now;

type IdentityRow = (String, String, bool, bool, String);

#[derive(Clone)]
pub struct SqlStore {
	backend: SqlBackend,
}

#[derive(Clone)]
enum SqlBackend {
	Sqlite(sqlx::SqlitePool),
	Postgres(sqlx::PgPool),
	Mysql(sqlx::MySqlPool),
}

impl SqlStore {
	pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
		let backend = if database_url.starts_with("sqlite:") {
			SqlBackend::Sqlite(sqlx::SqlitePool::connect(database_url).await.context("connect sqlite")?)
		} else if database_url.starts_with("postgres:") || database_url.starts_with("postgresql:") {
			SqlBackend::Postgres(sqlx::PgPool::connect(database_url).await.context("connect postgres")?)
		} else if database_url.starts_with("mysql:") || database_url.starts_with("mariadb:") {
			SqlBackend::Mysql(sqlx::MySqlPool::connect(database_url).await.context("connect mysql")?)
		} else {
			return Err(anyhow!("unsupported database_url for store"));
		};

		Ok(Self { backend })
	}

	/// `column` is a SQL expression over `users`, compared for equality with `value`.
	async fn fetch_identity(&self, column: &str, value: &str) -> anyhow::Result<Option<Identity>> {
		let row: Option<IdentityRow> = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query_as(&format!(
				"SELECT id, email, email_verified, can_request_work, type FROM users WHERE {column} = ?"
			))
			.bind(value)
			.fetch_optional(pool)
			.await
			.context("select user (sqlite)")?,
			SqlBackend::Postgres(pool) => sqlx::query_as(&format!(
				"SELECT id::text, email, email_verified, can_request_work, type::text FROM users WHERE {column}::text = $1"
			))
			.bind(value)
			.fetch_optional(pool)
			.await
			.context("select user (postgres)")?,
			SqlBackend::Mysql(pool) => sqlx::query_as(&format!(
				"SELECT id, email, email_verified, can_request_work, type FROM users WHERE {column} = ?"
			))
			.bind(value)
			.fetch_optional(pool)
			.await
			.context("select user (mysql)")?,
		};

		row.map(identity_from_row).transpose()
	}
}

fn identity_from_row((id, email, email_verified, can_request_work, user_type): IdentityRow) -> anyhow::Result<Identity> {
	Ok(Identity {
		id: id.parse().with_context(|| format!("users.id is not a uuid: {id}"))?,
		email,
		email_verified,
		can_request_work,
		user_type: user_type
			.parse()
			.with_context(|| format!("users.type is not a known user type: {user_type}"))?,
	})
}

#[async_trait::async_trait]
impl IdentityStore for SqlStore {
	async fn identity_by_id(&self, id: UserId) -> anyhow::Result<Option<Identity>> {
		self.fetch_identity("id", &id.to_string()).await
	}

	async fn identity_by_email(&self, email: &str) -> anyhow::Result<Option<Identity>> {
		self.fetch_identity("LOWER(email)", &normalize_email(email)).await
	}
}

#[async_trait::async_trait]
impl ResetTokenStore for SqlStore {
	async fn set_reset_token(&self, email: &str, token: &str) -> anyhow::Result<()> {
		let email = normalize_email(email);
		self.delete_reset_token(&email).await?;

		let expires_at = (unix_secs_now() + RESET_TOKEN_TTL.as_secs()) as i64;
		match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query("INSERT INTO password_reset_tokens (email, token, expires_at) VALUES (?, ?, ?)")
					.bind(email)
					.bind(token)
					.bind(expires_at)
					.execute(pool)
					.await
					.context("insert password_reset_tokens (sqlite)")?;
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query("INSERT INTO password_reset_tokens (email, token, expires_at) VALUES ($1, $2, $3)")
					.bind(email)
					.bind(token)
					.bind(expires_at)
					.execute(pool)
					.await
					.context("insert password_reset_tokens (postgres)")?;
			}
			SqlBackend::Mysql(pool) => {
				sqlx::query("INSERT INTO password_reset_tokens (email, token, expires_at) VALUES (?, ?, ?)")
					.bind(email)
					.bind(token)
					.bind(expires_at)
					.execute(pool)
					.await
					.context("insert password_reset_tokens (mysql)")?;
			}
		}

		Ok(())
	}

	async fn get_reset_token(&self, email: &str) -> anyhow::Result<Option<String>> {
		let email = normalize_email(email);
		let now = unix_secs_now() as i64;
		let token = match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query_scalar("SELECT token FROM password_reset_tokens WHERE email = ? AND expires_at > ?")
					.bind(email)
					.bind(now)
					.fetch_optional(pool)
					.await
					.context("select password_reset_tokens (sqlite)")?
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query_scalar("SELECT token FROM password_reset_tokens WHERE email = $1 AND expires_at > $2")
					.bind(email)
					.bind(now)
					.fetch_optional(pool)
					.await
					.context("select password_reset_tokens (postgres)")?
			}
			SqlBackend::Mysql(pool) => {
				sqlx::query_scalar("SELECT token FROM password_reset_tokens WHERE email = ? AND expires_at > ?")
					.bind(email)
					.bind(now)
					.fetch_optional(pool)
					.await
					.context("select password_reset_tokens (mysql)")?
			}
		};

		Ok(token)
	}

	async fn delete_reset_token(&self, email: &str) -> anyhow::Result<bool> {
		let email = normalize_email(email);
		let affected = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query("DELETE FROM password_reset_tokens WHERE email = ?")
				.bind(email)
				.execute(pool)
				.await
				.context("delete password_reset_tokens (sqlite)")?
				.rows_affected(),
			SqlBackend::Postgres(pool) => sqlx::query("DELETE FROM password_reset_tokens WHERE email = $1")
				.bind(email)
				.execute(pool)
				.await
				.context("delete password_reset_tokens (postgres)")?
				.rows_affected(),
			SqlBackend::Mysql(pool) => sqlx::query("DELETE FROM password_reset_tokens WHERE email = ?")
				.bind(email)
				.execute(pool)
				.await
				.context("delete password_reset_tokens (mysql)")?
				.rows_affected(),
		};

		Ok(affected > 0)
	}
}

#[async_trait::async_trait]
impl ServiceTokenStore for SqlStore {
	async fn user_for_service_token(&self, token: &str) -> anyhow::Result<Option<String>> {
		let user_id = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query_scalar("SELECT user_id FROM service_tokens WHERE token = ?")
				.bind(token)
				.fetch_optional(pool)
				.await
				.context("select service_tokens (sqlite)")?,
			SqlBackend::Postgres(pool) => sqlx::query_scalar("SELECT user_id::text FROM service_tokens WHERE token = $1")
				.bind(token)
				.fetch_optional(pool)
				.await
				.context("select service_tokens (postgres)")?,
			SqlBackend::Mysql(pool) => sqlx::query_scalar("SELECT user_id FROM service_tokens WHERE token = ?")
				.bind(token)
				.fetch_optional(pool)
				.await
				.context("select service_tokens (mysql)")?,
		};

		Ok(user_id)
	}
}

#[async_trait::async_trait]
impl StatsStore for SqlStore {
	async fn record_work(&self, event: &WorkEvent) -> anyhow::Result<WorkTally> {
		let provider = event
			.worker_key
			.owner()
			.ok_or_else(|| anyhow!("worker key {} has no owning user", event.worker_key))?
			.to_string();
		let requester = event.requester_id.to_string();
		let difficulty = i64::from(event.result.difficulty_multiplier);

		let (provider_results, requester_results): (i64, i64) = match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query(
					"INSERT INTO work_results (provider_id, requester_id, worker_key, hash, difficulty_multiplier, created_at) \
					VALUES (?, ?, ?, ?, ?, strftime('%s','now'))",
				)
				.bind(&provider)
				.bind(&requester)
				.bind(event.worker_key.as_str())
				.bind(&event.result.hash)
				.bind(difficulty)
				.execute(pool)
				.await
				.context("insert work_results (sqlite)")?;

				sqlx::query_as(
					"SELECT \
					(SELECT COUNT(*) FROM work_results WHERE provider_id = ?), \
					(SELECT COUNT(*) FROM work_results WHERE requester_id = ?)",
				)
				.bind(&provider)
				.bind(&requester)
				.fetch_one(pool)
				.await
				.context("count work_results (sqlite)")?
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query(
					"INSERT INTO work_results (provider_id, requester_id, worker_key, hash, difficulty_multiplier, created_at) \
					VALUES ($1::uuid, $2::uuid, $3, $4, $5, NOW())",
				)
				.bind(&provider)
				.bind(&requester)
				.bind(event.worker_key.as_str())
				.bind(&event.result.hash)
				.bind(difficulty)
				.execute(pool)
				.await
				.context("insert work_results (postgres)")?;

				sqlx::query_as(
					"SELECT \
					(SELECT COUNT(*) FROM work_results WHERE provider_id = $1::uuid), \
					(SELECT COUNT(*) FROM work_results WHERE requester_id = $2::uuid)",
				)
				.bind(&provider)
				.bind(&requester)
				.fetch_one(pool)
				.await
				.context("count work_results (postgres)")?
			}
			SqlBackend::Mysql(pool) => {
				sqlx::query(
					"INSERT INTO work_results (provider_id, requester_id, worker_key, hash, difficulty_multiplier, created_at) \
					VALUES (?, ?, ?, ?, ?, NOW())",
				)
				.bind(&provider)
				.bind(&requester)
				.bind(event.worker_key.as_str())
				.bind(&event.result.hash)
				.bind(difficulty)
				.execute(pool)
				.await
				.context("insert work_results (mysql)")?;

				sqlx::query_as(
					"SELECT \
					(SELECT COUNT(*) FROM work_results WHERE provider_id = ?), \
					(SELECT COUNT(*) FROM work_results WHERE requester_id = ?)",
				)
				.bind(&provider)
				.bind(&requester)
				.fetch_one(pool)
				.await
				.context("count work_results (mysql)")?
			}
		};

		Ok(WorkTally {
			provider_results: provider_results.max(0) as u64,
			requester_results: requester_results.max(0) as u64,
		})
	}
}
