#![forbid(unsafe_code)]

use boompow_domain::UserId;
use serde::{Deserialize, Serialize};

/// Worker → server message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
	/// A computed proof-of-work for a previously broadcast request.
	WorkResult(WorkResult),
}

/// Server → worker message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
	/// Work to be computed by any worker that picks it up.
	WorkGenerate(WorkGenerate),

	/// The receiving worker earned a reward.
	RewardEarned(RewardEarned),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkResult {
	pub request_id: String,
	pub requester_id: UserId,
	pub hash: String,
	pub work: String,
	pub difficulty_multiplier: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkGenerate {
	pub request_id: String,
	pub requester_id: UserId,
	pub hash: String,
	pub difficulty_multiplier: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardEarned {
	pub hash: String,
	pub requester_id: UserId,

	/// Accepted results credited to the worker so far.
	pub total_results: u64,

	pub awarded_at_unix_ms: i64,
}
