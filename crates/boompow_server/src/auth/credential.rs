#![forbid(unsafe_code)]

use std::collections::HashSet;
use std::sync::Arc;

use boompow_domain::{Identity, SecretString, UserId};
use tracing::{debug, warn};

use crate::auth::token::{fingerprint, verify_hmac_token};
use crate::auth::{AuthContext, AuthError, TokenSource, TrustLevel};
use crate::store::{IdentityStore, ResetTokenStore, ServiceTokenStore, normalize_email};

pub const RESET_PASSWORD_PREFIX: &str = "resetpassword:";
pub const SERVICE_PREFIX: &str = "service:";

/// Authorization header classified by scheme. Prefixes are case-sensitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Credential<'a> {
	None,
	/// Token with the `resetpassword:` prefix stripped.
	ResetPassword(&'a str),
	/// The whole header value, prefix included, as configured by operators.
	Service(&'a str),
	Bearer(&'a str),
}

impl<'a> Credential<'a> {
	pub fn parse(header: Option<&'a str>) -> Self {
		let Some(header) = header.filter(|h| !h.is_empty()) else {
			return Credential::None;
		};

		if let Some(token) = header.strip_prefix(RESET_PASSWORD_PREFIX) {
			Credential::ResetPassword(token)
		} else if header.starts_with(SERVICE_PREFIX) {
			Credential::Service(header)
		} else {
			Credential::Bearer(header)
		}
	}

	pub const fn scheme(&self) -> &'static str {
		match self {
			Credential::None => "none",
			Credential::ResetPassword(_) => "resetpassword",
			Credential::Service(_) => "service",
			Credential::Bearer(_) => "bearer",
		}
	}
}

/// Settings for the credential resolver.
#[derive(Debug, Clone, Default)]
pub struct ResolverSettings {
	/// Secret for bearer and reset-password tokens; without it those schemes always fail.
	pub hmac_secret: Option<SecretString>,

	/// Accepted service tokens, each including the `service:` prefix.
	pub service_tokens: HashSet<String>,
}

/// Turns an authorization header into an optional `AuthContext`.
pub struct CredentialResolver {
	identities: Arc<dyn IdentityStore>,
	reset_tokens: Arc<dyn ResetTokenStore>,
	service_token_users: Arc<dyn ServiceTokenStore>,
	settings: ResolverSettings,
}

impl CredentialResolver {
	pub fn new(
		identities: Arc<dyn IdentityStore>,
		reset_tokens: Arc<dyn ResetTokenStore>,
		service_token_users: Arc<dyn ServiceTokenStore>,
		settings: ResolverSettings,
	) -> Self {
		Self {
			identities,
			reset_tokens,
			service_token_users,
			settings,
		}
	}

	/// `Ok(None)` means the request proceeds unauthenticated.
	pub async fn resolve(&self, header: Option<&str>, caller_ip: &str) -> Result<Option<AuthContext>, AuthError> {
		let credential = Credential::parse(header);

		let resolved = match credential {
			Credential::None => return Ok(None),
			Credential::ResetPassword(token) => self.resolve_reset_password(token).await,
			Credential::Service(token) => self.resolve_service(token, caller_ip).await,
			Credential::Bearer(token) => self.resolve_bearer(token).await,
		};

		match &resolved {
			Ok(Some(ctx)) => {
				metrics::counter!("boompow_server_auth_resolved_total", "trust" => ctx.trust.as_str()).increment(1);
			}
			Ok(None) => {
				debug!(scheme = credential.scheme(), "credential valid but no matching identity");
				metrics::counter!("boompow_server_auth_unknown_identity_total").increment(1);
			}
			Err(AuthError::InvalidToken) => {
				metrics::counter!("boompow_server_auth_invalid_token_total", "scheme" => credential.scheme()).increment(1);
			}
			Err(AuthError::Store(_)) => {}
		}

		resolved
	}

	async fn resolve_reset_password(&self, token: &str) -> Result<Option<AuthContext>, AuthError> {
		let email = self.decode_email(token)?;

		let stored = self
			.reset_tokens
			.get_reset_token(&email)
			.await
			.map_err(AuthError::Store)?;
		if stored.is_none() {
			debug!("reset token has no live store entry");
			return Err(AuthError::InvalidToken);
		}

		let identity = self
			.identities
			.identity_by_email(&email)
			.await
			.map_err(AuthError::Store)?;
		Ok(with_trust(identity, TrustLevel::Token(TokenSource::ResetPassword)))
	}

	async fn resolve_service(&self, token: &str, caller_ip: &str) -> Result<Option<AuthContext>, AuthError> {
		if !self.settings.service_tokens.contains(token) {
			warn!(
				caller_ip,
				token = %fingerprint(token),
				"invalid service token attempt (not configured)"
			);
			return Err(AuthError::InvalidToken);
		}

		let Some(raw_user_id) = self
			.service_token_users
			.user_for_service_token(token)
			.await
			.map_err(AuthError::Store)?
		else {
			warn!(
				caller_ip,
				token = %fingerprint(token),
				"invalid service token attempt (no bound user)"
			);
			return Err(AuthError::InvalidToken);
		};

		let user_id: UserId = raw_user_id.parse().map_err(|e| {
			warn!(token = %fingerprint(token), error = %e, "service token bound to unparseable user id");
			AuthError::InvalidToken
		})?;

		let identity = self
			.identities
			.identity_by_id(user_id)
			.await
			.map_err(AuthError::Store)?;
		Ok(with_trust(identity, TrustLevel::Token(TokenSource::Service)))
	}

	async fn resolve_bearer(&self, token: &str) -> Result<Option<AuthContext>, AuthError> {
		let email = self.decode_email(token)?;

		let identity = self
			.identities
			.identity_by_email(&email)
			.await
			.map_err(AuthError::Store)?;
		Ok(with_trust(identity, TrustLevel::Jwt))
	}

	fn decode_email(&self, token: &str) -> Result<String, AuthError> {
		let Some(secret) = self.settings.hmac_secret.as_ref() else {
			debug!("no hmac secret configured; rejecting token");
			return Err(AuthError::InvalidToken);
		};

		match verify_hmac_token(token, secret.expose()) {
			Ok(claims) => Ok(normalize_email(&claims.sub)),
			Err(e) => {
				debug!(error = %e, "token verification failed");
				Err(AuthError::InvalidToken)
			}
		}
	}
}

fn with_trust(identity: Option<Identity>, trust: TrustLevel) -> Option<AuthContext> {
	identity.map(|identity| AuthContext::new(identity, trust))
}
