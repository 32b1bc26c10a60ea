#![forbid(unsafe_code)]

pub mod credential;
pub mod gate;
pub mod token;



use boompow_domain::Identity;
use thiserror::Error;

/// Which token scheme produced a `Token` trust level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenSource {
	/// Operator-provisioned, non-expiring `service:` token.
	Service,
	/// One-time `resetpassword:` token.
	ResetPassword,
}

/// How the caller proved who they are.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrustLevel {
	/// Interactive login (bearer token).
	Jwt,
	Token(TokenSource),
}

impl TrustLevel {
	pub const fn as_str(self) -> &'static str {
		match self {
			TrustLevel::Jwt => "jwt",
			TrustLevel::Token(TokenSource::Service) => "token/service",
			TrustLevel::Token(TokenSource::ResetPassword) => "token/reset_password",
		}
	}
}

/// Resolved caller for a single request. Read-only once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthContext {
	pub identity: Identity,
	pub trust: TrustLevel,
}

impl AuthContext {
	pub fn new(identity: Identity, trust: TrustLevel) -> Self {
		Self { identity, trust }
	}
}

/// Terminal credential failures.
#[derive(Debug, Error)]
pub enum AuthError {
	/// Malformed, expired or unmatched credential, whatever the scheme.
	#[error("invalid token")]
	InvalidToken,

	/// A collaborator lookup failed; the credential itself was not judged.
	#[error("credential lookup failed: {0}")]
	Store(#[source] anyhow::Error),
}
