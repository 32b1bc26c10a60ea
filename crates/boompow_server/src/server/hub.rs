#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use boompow_domain::WorkerKey;
use boompow_protocol::{DEFAULT_MAX_FRAME_SIZE, ServerMessage, WorkerMessage, decode_message, encode_message};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at, timeout};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::server::events::WorkEvent;

/// Registry of live worker connections.
///
/// Cloning is cheap; all clones share the same connection map.
#[derive(Clone)]
pub struct Hub {
	inner: Arc<Mutex<Inner>>,
	cfg: HubConfig,
}

/// Configuration for `Hub`.
#[derive(Debug, Clone)]
pub struct HubConfig {
	/// Maximum number of queued outbound messages per connection.
	pub outbound_queue_capacity: usize,

	pub keepalive_interval: Duration,

	/// Silence on the socket longer than this disconnects the worker.
	pub keepalive_timeout: Duration,

	pub max_frame_bytes: usize,
}

impl Default for HubConfig {
	fn default() -> Self {
		Self {
			outbound_queue_capacity: 64,
			keepalive_interval: Duration::from_secs(10),
			keepalive_timeout: Duration::from_secs(30),
			max_frame_bytes: DEFAULT_MAX_FRAME_SIZE,
		}
	}
}

struct Inner {
	connections: HashMap<WorkerKey, Entry>,
	next_generation: u64,

	/// `None` once the hub is closed.
	work_tx: Option<mpsc::Sender<WorkEvent>>,
}

struct Entry {
	generation: u64,
	outbound: mpsc::Sender<ServerMessage>,
	shutdown: watch::Sender<bool>,
}

impl Entry {
	fn close(self) {
		let _ = self.shutdown.send(true);
	}
}

/// Handle to the two tasks serving one registered connection.
pub struct WorkConnection {
	key: WorkerKey,
	generation: u64,
	reader: JoinHandle<()>,
	writer: JoinHandle<()>,
}

impl WorkConnection {
	pub fn key(&self) -> &WorkerKey {
		&self.key
	}

	pub fn generation(&self) -> u64 {
		self.generation
	}

	/// Resolves once both the read and the write loop have stopped.
	pub async fn closed(self) {
		let _ = self.reader.await;
		let _ = self.writer.await;
	}
}

impl Hub {
	/// Decoded worker messages are pushed on `work_tx`.
	pub fn new(cfg: HubConfig, work_tx: mpsc::Sender<WorkEvent>) -> Self {
		Self {
			inner: Arc::new(Mutex::new(Inner {
				connections: HashMap::new(),
				next_generation: 0,
				work_tx: Some(work_tx),
			})),
			cfg,
		}
	}

	/// Track `socket` under `key` and start its read and write loops.
	///
	/// A live connection already holding `key` is closed and replaced.
	pub fn register<S>(&self, key: WorkerKey, socket: WebSocketStream<S>) -> anyhow::Result<WorkConnection>
	where
		S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
	{
		let (outbound_tx, outbound_rx) = mpsc::channel(self.cfg.outbound_queue_capacity.max(1));
		let (shutdown_tx, shutdown_rx) = watch::channel(false);

		let (generation, work_tx, replaced, connected) = {
			let mut inner = self.inner.lock();
			let Some(work_tx) = inner.work_tx.clone() else {
				return Err(anyhow!("hub is closed"));
			};

			inner.next_generation += 1;
			let generation = inner.next_generation;
			let replaced = inner.connections.insert(
				key.clone(),
				Entry {
					generation,
					outbound: outbound_tx,
					shutdown: shutdown_tx,
				},
			);
			(generation, work_tx, replaced, inner.connections.len())
		};

		if let Some(old) = replaced {
			warn!(key = %key, old_generation = old.generation, "replacing live connection with the same key");
			metrics::counter!("boompow_server_connections_replaced_total").increment(1);
			old.close();
		}
		set_connected_gauge(connected);

		let (sink, stream) = socket.split();

		let reader = tokio::spawn(read_loop(
			self.clone(),
			key.clone(),
			generation,
			stream,
			work_tx,
			shutdown_rx.clone(),
		));
		let writer = tokio::spawn(write_loop(
			self.clone(),
			key.clone(),
			generation,
			sink,
			outbound_rx,
			shutdown_rx,
		));

		info!(key = %key, generation, connected, "worker connected");
		metrics::counter!("boompow_server_connections_total").increment(1);

		Ok(WorkConnection {
			key,
			generation,
			reader,
			writer,
		})
	}

	/// Remove `key` and stop its loops. Returns false if it was not registered.
	pub fn unregister(&self, key: &WorkerKey) -> bool {
		let (removed, connected) = {
			let mut inner = self.inner.lock();
			let removed = inner.connections.remove(key);
			(removed, inner.connections.len())
		};

		let Some(entry) = removed else {
			return false;
		};
		entry.close();
		set_connected_gauge(connected);
		info!(key = %key, connected, "worker unregistered");
		true
	}

	/// Like `unregister`, but only if `key` still belongs to `generation`.
	fn release(&self, key: &WorkerKey, generation: u64) -> bool {
		let (removed, connected) = {
			let mut inner = self.inner.lock();
			let owned = inner
				.connections
				.get(key)
				.is_some_and(|entry| entry.generation == generation);
			let removed = if owned { inner.connections.remove(key) } else { None };
			(removed, inner.connections.len())
		};

		let Some(entry) = removed else {
			return false;
		};
		entry.close();
		set_connected_gauge(connected);
		info!(key = %key, generation, connected, "worker disconnected");
		true
	}

	/// Queue `message` for one connection without waiting.
	///
	/// False when the key is unknown, its buffer is full or it is closing.
	pub fn send_to(&self, key: &WorkerKey, message: ServerMessage) -> bool {
		let inner = self.inner.lock();
		let Some(entry) = inner.connections.get(key) else {
			return false;
		};

		match entry.outbound.try_send(message) {
			Ok(()) => true,
			Err(mpsc::error::TrySendError::Full(_)) => {
				metrics::counter!("boompow_server_outbound_dropped_total").increment(1);
				debug!(key = %key, "outbound queue full; message dropped");
				false
			}
			Err(mpsc::error::TrySendError::Closed(_)) => false,
		}
	}

	/// Queue `message` for every live connection. Returns how many accepted it.
	pub fn broadcast(&self, message: ServerMessage) -> usize {
		let inner = self.inner.lock();
		let mut delivered = 0usize;
		let mut dropped = 0u64;

		for entry in inner.connections.values() {
			match entry.outbound.try_send(message.clone()) {
				Ok(()) => delivered += 1,
				Err(mpsc::error::TrySendError::Full(_)) => dropped += 1,
				Err(mpsc::error::TrySendError::Closed(_)) => {}
			}
		}

		if dropped > 0 {
			metrics::counter!("boompow_server_outbound_dropped_total").increment(dropped);
			debug!(dropped, delivered, "broadcast: some outbound queues were full");
		}
		delivered
	}

	pub fn connected_count(&self) -> usize {
		self.inner.lock().connections.len()
	}

	#[cfg(test)]
	pub fn connected_keys(&self) -> Vec<WorkerKey> {
		self.inner.lock().connections.keys().cloned().collect()
	}

	/// Stop accepting registrations and disconnect every worker.
	///
	/// The hub's work queue sender is released here; the queue closes once all
	/// read loops have stopped.
	pub fn close(&self) -> usize {
		let drained: Vec<Entry> = {
			let mut inner = self.inner.lock();
			inner.work_tx = None;
			inner.connections.drain().map(|(_, entry)| entry).collect()
		};

		let closed = drained.len();
		for entry in drained {
			entry.close();
		}
		set_connected_gauge(0);
		closed
	}
}

fn set_connected_gauge(connected: usize) {
	metrics::gauge!("boompow_server_connected_workers").set(connected as f64);
}

async fn read_loop<S>(
	hub: Hub,
	key: WorkerKey,
	generation: u64,
	mut stream: SplitStream<WebSocketStream<S>>,
	work_tx: mpsc::Sender<WorkEvent>,
	mut shutdown: watch::Receiver<bool>,
) where
	S: AsyncRead + AsyncWrite + Unpin,
{
	let keepalive_timeout = hub.cfg.keepalive_timeout;
	let max_frame_bytes = hub.cfg.max_frame_bytes;

	loop {
		let next = tokio::select! {
			_ = shutdown.changed() => break,
			next = timeout(keepalive_timeout, stream.next()) => next,
		};

		let message = match next {
			Ok(Some(Ok(message))) => message,
			Ok(Some(Err(e))) => {
				debug!(key = %key, error = %e, "worker socket error");
				metrics::counter!("boompow_server_transport_errors_total").increment(1);
				break;
			}
			Ok(None) => break,
			Err(_) => {
				info!(key = %key, timeout_ms = keepalive_timeout.as_millis() as u64, "worker missed keep-alive");
				metrics::counter!("boompow_server_keepalive_timeouts_total").increment(1);
				break;
			}
		};

		let text = match message {
			Message::Text(text) => text,
			Message::Close(_) => break,
			Message::Binary(_) => {
				metrics::counter!("boompow_server_frames_rejected_total").increment(1);
				debug!(key = %key, "ignoring binary frame");
				continue;
			}
			_ => continue,
		};

		metrics::counter!("boompow_server_frames_in_total").increment(1);
		let event = match decode_message::<WorkerMessage>(text.as_str(), max_frame_bytes) {
			Ok(WorkerMessage::WorkResult(result)) => WorkEvent {
				worker_key: key.clone(),
				requester_id: result.requester_id,
				result,
			},
			Err(e) => {
				metrics::counter!("boompow_server_frames_rejected_total").increment(1);
				debug!(key = %key, error = %e, "dropping undecodable frame");
				continue;
			}
		};

		tokio::select! {
			_ = shutdown.changed() => break,
			sent = work_tx.send(event) => {
				if sent.is_err() {
					break;
				}
			}
		}
	}

	hub.release(&key, generation);
}

async fn write_loop<S>(
	hub: Hub,
	key: WorkerKey,
	generation: u64,
	mut sink: SplitSink<WebSocketStream<S>, Message>,
	mut outbound: mpsc::Receiver<ServerMessage>,
	mut shutdown: watch::Receiver<bool>,
) where
	S: AsyncRead + AsyncWrite + Unpin,
{
	let interval = hub.cfg.keepalive_interval;
	let max_frame_bytes = hub.cfg.max_frame_bytes;
	let mut ping = interval_at(Instant::now() + interval, interval);
	ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

	loop {
		tokio::select! {
			_ = shutdown.changed() => break,
			_ = ping.tick() => {
				if let Err(e) = sink.send(Message::Ping(Default::default())).await {
					debug!(key = %key, error = %e, "keep-alive ping failed");
					break;
				}
			}
			message = outbound.recv() => {
				let Some(message) = message else {
					break;
				};

				let text = match encode_message(&message, max_frame_bytes) {
					Ok(text) => text,
					Err(e) => {
						warn!(key = %key, error = %e, "failed to encode server message");
						continue;
					}
				};

				if let Err(e) = sink.send(Message::text(text)).await {
					debug!(key = %key, error = %e, "worker socket write failed");
					metrics::counter!("boompow_server_transport_errors_total").increment(1);
					break;
				}
				metrics::counter!("boompow_server_frames_out_total").increment(1);
			}
		}
	}

	let _ = timeout(Duration::from_secs(1), async {
		let _ = sink.send(Message::Close(None)).await;
		let _ = sink.close().await;
	})
	.await;

	hub.release(&key, generation);
}
