#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Account kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UserType {
	/// Runs workers and computes proof-of-work.
	Provider,
	/// Submits work and gets rewarded.
	Requester,
}

impl UserType {
	/// Stable string identifier.
	pub const fn as_str(self) -> &'static str {
		match self {
			UserType::Provider => "PROVIDER",
			UserType::Requester => "REQUESTER",
		}
	}
}

impl fmt::Display for UserType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("unknown user type: {0}")]
	UnknownUserType(String),
	#[error("invalid format: {0}")]
	InvalidFormat(String),
}

impl FromStr for UserType {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}

		match s.to_ascii_uppercase().as_str() {
			"PROVIDER" => Ok(UserType::Provider),
			"REQUESTER" => Ok(UserType::Requester),
			_ => Err(ParseIdError::UnknownUserType(s.to_string())),
		}
	}
}

/// Persistent user identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub Uuid);

impl UserId {
	/// Create a new random user id.
	pub fn new_v4() -> Self {
		Self(Uuid::new_v4())
	}
}

impl fmt::Display for UserId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl FromStr for UserId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}
		Uuid::parse_str(s)
			.map(Self)
			.map_err(|e| ParseIdError::InvalidFormat(e.to_string()))
	}
}

/// Read-only user record as seen by the server core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
	pub id: UserId,
	pub email: String,
	pub email_verified: bool,
	pub can_request_work: bool,
	pub user_type: UserType,
}

impl Identity {
	pub fn is_provider(&self) -> bool {
		self.user_type == UserType::Provider
	}

	pub fn is_requester(&self) -> bool {
		self.user_type == UserType::Requester
	}
}

/// Stable key of a live worker connection.
///
/// Unique among live connections; may be reused once the previous holder is gone.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerKey(String);

impl WorkerKey {
	/// Create a non-empty `WorkerKey`.
	pub fn new(key: impl Into<String>) -> Result<Self, ParseIdError> {
		let key = key.into();
		if key.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(key))
	}

	/// Key for the `seq`-th connection opened by `owner` (`<user id>:<seq>`).
	pub fn for_connection(owner: UserId, seq: u64) -> Self {
		Self(format!("{owner}:{seq}"))
	}

	/// Owning user, when the key was built with `for_connection`.
	pub fn owner(&self) -> Option<UserId> {
		let (owner, _) = self.0.rsplit_once(':')?;
		owner.parse().ok()
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for WorkerKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for WorkerKey {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		WorkerKey::new(s.to_string())
	}
}

/// Wrapper that redacts in logs.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretString(String);

impl SecretString {
	pub fn new(s: impl Into<String>) -> Self {
		Self(s.into())
	}

	/// Access the inner secret string.
	pub fn expose(&self) -> &str {
		&self.0
	}
}

impl fmt::Debug for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("SecretString(<redacted>)")
	}
}

impl fmt::Display for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("<redacted>")
	}
}
