#![forbid(unsafe_code)]

use std::sync::Arc;

use boompow_protocol::{RewardEarned, ServerMessage};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::server::events::{RewardEvent, WorkEvent};
use crate::store::{StatsStore, WorkTally};
use crate::util::time::unix_ms_now;

pub const DEFAULT_WORK_QUEUE_CAPACITY: usize = 100;

/// Bounded queue between the connection read loops and the aggregator.
pub fn work_queue(capacity: usize) -> (mpsc::Sender<WorkEvent>, mpsc::Receiver<WorkEvent>) {
	mpsc::channel(capacity.max(1))
}

/// When a recorded result earns its worker a reward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RewardPolicy {
	/// Reward every n-th accepted result; 0 disables rewards.
	pub payout_threshold: u64,
}

impl Default for RewardPolicy {
	fn default() -> Self {
		Self { payout_threshold: 1 }
	}
}

impl RewardPolicy {
	/// Decided from the server-side tally only; nothing in the worker's frame
	/// influences the outcome.
	pub fn evaluate(&self, tally: &WorkTally) -> bool {
		self.payout_threshold > 0 && tally.provider_results > 0 && tally.provider_results % self.payout_threshold == 0
	}
}

/// Single consumer of the work queue.
pub struct StatsAggregator {
	stats: Arc<dyn StatsStore>,
	policy: RewardPolicy,
	work_rx: mpsc::Receiver<WorkEvent>,
	reward_tx: mpsc::UnboundedSender<RewardEvent>,
}

impl StatsAggregator {
	pub fn new(
		stats: Arc<dyn StatsStore>,
		policy: RewardPolicy,
		work_rx: mpsc::Receiver<WorkEvent>,
		reward_tx: mpsc::UnboundedSender<RewardEvent>,
	) -> Self {
		Self {
			stats,
			policy,
			work_rx,
			reward_tx,
		}
	}

	/// Drain the queue in arrival order until every producer is gone.
	pub async fn run(mut self) {
		while let Some(event) = self.work_rx.recv().await {
			metrics::counter!("boompow_server_work_events_total").increment(1);

			let Some(reward) = self.process(event).await else {
				continue;
			};

			if self.reward_tx.send(reward).is_err() {
				debug!("reward queue closed; dropping reward");
			}
		}
		info!("work queue closed; stats aggregator stopped");
	}

	async fn process(&self, event: WorkEvent) -> Option<RewardEvent> {
		let tally = match self.stats.record_work(&event).await {
			Ok(tally) => tally,
			Err(e) => {
				metrics::counter!("boompow_server_stats_errors_total").increment(1);
				warn!(
					worker = %event.worker_key,
					hash = %event.result.hash,
					error = ?e,
					"failed to record work result; dropping"
				);
				return None;
			}
		};

		if !self.policy.evaluate(&tally) {
			return None;
		}

		debug!(
			worker = %event.worker_key,
			total_results = tally.provider_results,
			"reward earned"
		);
		metrics::counter!("boompow_server_rewards_emitted_total").increment(1);

		Some(RewardEvent {
			payload: ServerMessage::RewardEarned(RewardEarned {
				hash: event.result.hash,
				requester_id: event.requester_id,
				total_results: tally.provider_results,
				awarded_at_unix_ms: unix_ms_now(),
			}),
			target_client_id: event.worker_key,
		})
	}
}

pub fn spawn_stats_aggregator(aggregator: StatsAggregator) -> JoinHandle<()> {
	tokio::spawn(aggregator.run())
}
