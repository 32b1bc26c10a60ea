#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use boompow_domain::{UserId, WorkerKey};
use boompow_protocol::{ServerMessage, WorkGenerate, WorkResult, WorkerMessage, encode_message_default};
use futures::{SinkExt, StreamExt};
use tokio::io::DuplexStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::Role;

use crate::server::events::{RewardEvent, WorkEvent};
use crate::server::hub::{Hub, HubConfig};
use crate::server::notifier::RewardNotifier;
use crate::server::stats::{DEFAULT_WORK_QUEUE_CAPACITY, RewardPolicy, work_queue};
use crate::server::supervisor::{PipelineConfig, Supervisor};
use crate::store::memory::MemoryStatsStore;

type Client = WebSocketStream<DuplexStream>;

async fn socket_pair() -> (WebSocketStream<DuplexStream>, Client) {
	let (server_io, client_io) = tokio::io::duplex(64 * 1024);
	let server = WebSocketStream::from_raw_socket(server_io, Role::Server, None).await;
	let client = WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;
	(server, client)
}

fn work_result(hash: &str, requester_id: UserId) -> WorkResult {
	WorkResult {
		request_id: format!("req-{hash}"),
		requester_id,
		hash: hash.to_string(),
		work: "00000000deadbeef".to_string(),
		difficulty_multiplier: 1,
	}
}

fn work_event(hash: &str) -> WorkEvent {
	let result = work_result(hash, UserId::new_v4());
	WorkEvent {
		worker_key: WorkerKey::for_connection(UserId::new_v4(), 0),
		requester_id: result.requester_id,
		result,
	}
}

async fn submit(client: &mut Client, result: WorkResult) {
	let frame = encode_message_default(&WorkerMessage::WorkResult(result)).expect("encode");
	client.send(Message::text(frame)).await.expect("send frame");
}

async fn next_text(client: &mut Client, wait: Duration) -> Option<ServerMessage> {
	timeout(wait, async {
		while let Some(Ok(frame)) = client.next().await {
			if let Message::Text(text) = frame {
				return serde_json::from_str(text.as_str()).ok();
			}
		}
		None
	})
	.await
	.ok()
	.flatten()
}

#[tokio::test]
async fn work_queue_blocks_the_101st_producer_until_drained() {
	let (tx, mut rx) = work_queue(DEFAULT_WORK_QUEUE_CAPACITY);

	for i in 0..DEFAULT_WORK_QUEUE_CAPACITY {
		tx.try_send(work_event(&format!("h{i}"))).expect("queue has room");
	}

	let blocked = timeout(Duration::from_millis(50), tx.send(work_event("overflow"))).await;
	assert!(blocked.is_err(), "the 101st send should wait for capacity");

	let first = rx.recv().await.expect("queued event");
	assert_eq!(first.result.hash, "h0");

	timeout(Duration::from_millis(250), tx.send(work_event("overflow")))
		.await
		.expect("send proceeds once a slot frees")
		.expect("queue open");
}

#[tokio::test]
async fn saturated_queue_applies_backpressure_without_loss() {
	let (work_tx, mut work_rx) = work_queue(1);
	let hub = Hub::new(HubConfig::default(), work_tx);
	let (server, mut client) = socket_pair().await;
	let worker = WorkerKey::for_connection(UserId::new_v4(), 0);
	hub.register(worker.clone(), server).expect("register");

	let requester = UserId::new_v4();
	for hash in ["h1", "h2", "h3"] {
		submit(&mut client, work_result(hash, requester)).await;
	}

	// Give the read loop time to fill the queue and park on it.
	tokio::time::sleep(Duration::from_millis(50)).await;
	assert_eq!(hub.connected_count(), 1);

	let mut hashes = Vec::new();
	for _ in 0..3 {
		let event = timeout(Duration::from_millis(500), work_rx.recv())
			.await
			.expect("event within timeout")
			.expect("queue open");
		assert_eq!(event.worker_key, worker);
		hashes.push(event.result.hash);
	}
	assert_eq!(hashes, ["h1", "h2", "h3"]);
}

#[tokio::test]
async fn reward_goes_only_to_the_originating_connection() {
	let stats = Arc::new(MemoryStatsStore::new());
	let supervisor = Supervisor::start(stats.clone(), HubConfig::default(), PipelineConfig::default());
	let hub = supervisor.hub().clone();

	let provider = UserId::new_v4();
	let (server_a, mut client_a) = socket_pair().await;
	let (server_b, mut client_b) = socket_pair().await;
	hub.register(WorkerKey::for_connection(provider, 0), server_a)
		.expect("register a");
	hub.register(WorkerKey::for_connection(UserId::new_v4(), 1), server_b)
		.expect("register b");

	let requester = UserId::new_v4();
	submit(&mut client_a, work_result("block-hash", requester)).await;

	match next_text(&mut client_a, Duration::from_secs(1)).await {
		Some(ServerMessage::RewardEarned(reward)) => {
			assert_eq!(reward.hash, "block-hash");
			assert_eq!(reward.requester_id, requester);
			assert_eq!(reward.total_results, 1);
		}
		other => panic!("expected reward_earned, got {other:?}"),
	}
	assert!(next_text(&mut client_a, Duration::from_millis(100)).await.is_none());
	assert!(next_text(&mut client_b, Duration::from_millis(100)).await.is_none());
	assert_eq!(stats.provider_results(provider).await, 1);

	timeout(Duration::from_secs(2), supervisor.shutdown())
		.await
		.expect("shutdown within timeout")
		.expect("clean shutdown");
}

#[tokio::test]
async fn threshold_policy_skips_intermediate_results() {
	let stats = Arc::new(MemoryStatsStore::new());
	let supervisor = Supervisor::start(
		stats,
		HubConfig::default(),
		PipelineConfig {
			reward_policy: RewardPolicy { payout_threshold: 2 },
			..PipelineConfig::default()
		},
	);
	let (server, mut client) = socket_pair().await;
	supervisor
		.hub()
		.register(WorkerKey::for_connection(UserId::new_v4(), 0), server)
		.expect("register");

	let requester = UserId::new_v4();
	submit(&mut client, work_result("first", requester)).await;
	submit(&mut client, work_result("second", requester)).await;

	match next_text(&mut client, Duration::from_secs(1)).await {
		Some(ServerMessage::RewardEarned(reward)) => {
			assert_eq!(reward.hash, "second");
			assert_eq!(reward.total_results, 2);
		}
		other => panic!("expected reward_earned, got {other:?}"),
	}

	supervisor.shutdown().await.expect("clean shutdown");
}

#[tokio::test]
async fn worker_claimed_blocks_do_not_bypass_the_threshold() {
	let stats = Arc::new(MemoryStatsStore::new());
	let supervisor = Supervisor::start(
		stats.clone(),
		HubConfig::default(),
		PipelineConfig {
			reward_policy: RewardPolicy { payout_threshold: 1000 },
			..PipelineConfig::default()
		},
	);
	let provider = UserId::new_v4();
	let (server, mut client) = socket_pair().await;
	supervisor
		.hub()
		.register(WorkerKey::for_connection(provider, 0), server)
		.expect("register");

	let requester = UserId::new_v4();
	for i in 0..5 {
		let frame = format!(
			r#"{{"type":"work_result","request_id":"req-{i}","requester_id":"{requester}","hash":"claimed-{i}","work":"00","difficulty_multiplier":1,"block_awarded":true}}"#
		);
		client.send(Message::text(frame)).await.expect("send frame");
	}

	assert!(next_text(&mut client, Duration::from_millis(300)).await.is_none());
	assert_eq!(stats.provider_results(provider).await, 5);

	supervisor.shutdown().await.expect("clean shutdown");
}

#[tokio::test]
async fn stats_failure_drops_the_event_and_keeps_running() {
	let supervisor = Supervisor::start(
		Arc::new(MemoryStatsStore::new()),
		HubConfig::default(),
		PipelineConfig::default(),
	);
	let hub = supervisor.hub().clone();

	// Opaque keys carry no owner, so the stats store rejects their results.
	let (server_bad, mut client_bad) = socket_pair().await;
	hub.register(WorkerKey::new("rig-without-owner").unwrap(), server_bad)
		.expect("register bad");
	let (server_good, mut client_good) = socket_pair().await;
	hub.register(WorkerKey::for_connection(UserId::new_v4(), 0), server_good)
		.expect("register good");

	let requester = UserId::new_v4();
	submit(&mut client_bad, work_result("rejected", requester)).await;
	tokio::time::sleep(Duration::from_millis(50)).await;
	submit(&mut client_good, work_result("accepted", requester)).await;

	match next_text(&mut client_good, Duration::from_secs(1)).await {
		Some(ServerMessage::RewardEarned(reward)) => assert_eq!(reward.hash, "accepted"),
		other => panic!("expected reward_earned, got {other:?}"),
	}
	assert!(next_text(&mut client_bad, Duration::from_millis(100)).await.is_none());

	supervisor.shutdown().await.expect("clean shutdown");
}

#[tokio::test]
async fn notifier_drops_rewards_for_missing_clients() {
	let (work_tx, _work_rx) = work_queue(1);
	let hub = Hub::new(HubConfig::default(), work_tx);
	let (server, mut client) = socket_pair().await;
	let present = WorkerKey::for_connection(UserId::new_v4(), 0);
	hub.register(present.clone(), server).expect("register");

	let (reward_tx, reward_rx) = mpsc::unbounded_channel();
	let notifier = tokio::spawn(RewardNotifier::new(hub.clone(), reward_rx).run());

	let payload = ServerMessage::WorkGenerate(WorkGenerate {
		request_id: "r".to_string(),
		requester_id: UserId::new_v4(),
		hash: "for-present".to_string(),
		difficulty_multiplier: 1,
	});
	reward_tx
		.send(RewardEvent {
			target_client_id: WorkerKey::for_connection(UserId::new_v4(), 9),
			payload: payload.clone(),
		})
		.unwrap();
	reward_tx
		.send(RewardEvent {
			target_client_id: present,
			payload: payload.clone(),
		})
		.unwrap();
	drop(reward_tx);

	timeout(Duration::from_secs(1), notifier)
		.await
		.expect("notifier drains and stops")
		.expect("notifier task");
	assert_eq!(next_text(&mut client, Duration::from_secs(1)).await, Some(payload));
}

#[tokio::test]
async fn shutdown_disconnects_workers_and_stops_tasks() {
	let supervisor = Supervisor::start(
		Arc::new(MemoryStatsStore::new()),
		HubConfig::default(),
		PipelineConfig::default(),
	);
	let hub = supervisor.hub().clone();
	let (server, _client) = socket_pair().await;
	let conn = hub
		.register(WorkerKey::for_connection(UserId::new_v4(), 0), server)
		.expect("register");

	timeout(Duration::from_secs(2), supervisor.shutdown())
		.await
		.expect("shutdown within timeout")
		.expect("clean shutdown");

	timeout(Duration::from_secs(1), conn.closed())
		.await
		.expect("connection loops stopped");
	assert_eq!(hub.connected_count(), 0);
}
