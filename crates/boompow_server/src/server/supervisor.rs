#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::Context as _;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

use crate::server::hub::{Hub, HubConfig};
use crate::server::notifier::{RewardNotifier, spawn_reward_notifier};
use crate::server::stats::{DEFAULT_WORK_QUEUE_CAPACITY, RewardPolicy, StatsAggregator, spawn_stats_aggregator, work_queue};
use crate::store::StatsStore;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
	pub work_queue_capacity: usize,
	pub reward_policy: RewardPolicy,
}

impl Default for PipelineConfig {
	fn default() -> Self {
		Self {
			work_queue_capacity: DEFAULT_WORK_QUEUE_CAPACITY,
			reward_policy: RewardPolicy::default(),
		}
	}
}

/// Owns the hub and the background tasks behind it.
///
/// Work flows hub → aggregator → notifier → hub; shutdown follows the same
/// chain so each stage drains what it already accepted.
pub struct Supervisor {
	hub: Hub,
	aggregator: JoinHandle<()>,
	notifier: JoinHandle<()>,
}

impl Supervisor {
	pub fn start(stats: Arc<dyn StatsStore>, hub_cfg: HubConfig, cfg: PipelineConfig) -> Self {
		let (work_tx, work_rx) = work_queue(cfg.work_queue_capacity);
		let (reward_tx, reward_rx) = mpsc::unbounded_channel();

		let hub = Hub::new(hub_cfg, work_tx);
		let aggregator = spawn_stats_aggregator(StatsAggregator::new(stats, cfg.reward_policy, work_rx, reward_tx));
		let notifier = spawn_reward_notifier(RewardNotifier::new(hub.clone(), reward_rx));

		info!(
			work_queue_capacity = cfg.work_queue_capacity,
			payout_threshold = cfg.reward_policy.payout_threshold,
			"work pipeline started"
		);

		Self {
			hub,
			aggregator,
			notifier,
		}
	}

	pub fn hub(&self) -> &Hub {
		&self.hub
	}

	/// Disconnect every worker, then wait for the aggregator and notifier to drain.
	pub async fn shutdown(self) -> anyhow::Result<()> {
		let disconnected = self.hub.close();
		info!(disconnected, "hub closed; draining work pipeline");

		self.aggregator.await.context("stats aggregator task failed")?;
		self.notifier.await.context("reward notifier task failed")?;

		info!("work pipeline stopped");
		Ok(())
	}
}
