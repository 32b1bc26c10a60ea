#![forbid(unsafe_code)]

use boompow_domain::{UserId, WorkerKey};
use boompow_protocol::{ServerMessage, WorkResult};

/// A worker finished a piece of work. Consumed once by the stats aggregator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkEvent {
	pub worker_key: WorkerKey,
	pub requester_id: UserId,
	pub result: WorkResult,
}

/// A reward to push to one connected client. Consumed once by the reward notifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewardEvent {
	pub target_client_id: WorkerKey,
	pub payload: ServerMessage,
}
