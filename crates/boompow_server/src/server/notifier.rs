#![forbid(unsafe_code)]

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::server::events::RewardEvent;
use crate::server::hub::Hub;

/// Single consumer of the reward queue. Delivery is best effort.
pub struct RewardNotifier {
	hub: Hub,
	reward_rx: mpsc::UnboundedReceiver<RewardEvent>,
}

impl RewardNotifier {
	pub fn new(hub: Hub, reward_rx: mpsc::UnboundedReceiver<RewardEvent>) -> Self {
		Self { hub, reward_rx }
	}

	pub async fn run(mut self) {
		while let Some(event) = self.reward_rx.recv().await {
			let target = event.target_client_id;
			if self.hub.send_to(&target, event.payload) {
				metrics::counter!("boompow_server_rewards_delivered_total").increment(1);
				debug!(client = %target, "reward delivered");
			} else {
				metrics::counter!("boompow_server_rewards_undelivered_total").increment(1);
				info!(client = %target, "reward target not connected; dropping");
			}
		}
		info!("reward queue closed; reward notifier stopped");
	}
}

pub fn spawn_reward_notifier(notifier: RewardNotifier) -> JoinHandle<()> {
	tokio::spawn(notifier.run())
}
