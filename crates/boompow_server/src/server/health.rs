#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Context as _;
use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::server::hub::Hub;

/// Liveness and readiness as seen by the health listener.
#[derive(Clone)]
pub struct HealthState {
	ready: Arc<AtomicBool>,
	hub: Hub,
}

impl HealthState {
	pub fn new(hub: Hub) -> Self {
		Self {
			ready: Arc::new(AtomicBool::new(false)),
			hub,
		}
	}

	pub fn mark_ready(&self) {
		self.ready.store(true, Ordering::Relaxed);
	}

	pub fn mark_not_ready(&self) {
		self.ready.store(false, Ordering::Relaxed);
	}

	pub fn is_ready(&self) -> bool {
		self.ready.load(Ordering::Relaxed)
	}
}

pub fn spawn_health_server(bind: SocketAddr, state: HealthState) {
	tokio::spawn(async move {
		if let Err(err) = run_health_server(bind, state).await {
			warn!(error = ?err, "health server stopped");
		}
	});
}

async fn run_health_server(bind: SocketAddr, state: HealthState) -> anyhow::Result<()> {
	let listener = TcpListener::bind(bind)
		.await
		.with_context(|| format!("bind health listener on {bind}"))?;
	info!(addr = %bind, "health server listening");

	loop {
		let (stream, _addr) = listener.accept().await.context("accept health connection")?;
		let io = TokioIo::new(stream);
		let state = state.clone();
		tokio::spawn(async move {
			let service = service_fn(move |req| handle_health(req, state.clone()));
			if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
				warn!(error = %err, "health connection error");
			}
		});
	}
}

async fn handle_health(req: Request<Incoming>, state: HealthState) -> Result<Response<Full<Bytes>>, hyper::Error> {
	if req.method() != Method::GET {
		return Ok(plain(StatusCode::METHOD_NOT_ALLOWED, Bytes::new()));
	}

	let resp = match req.uri().path() {
		"/healthz" => plain(
			StatusCode::OK,
			Bytes::from(format!("ok workers={}", state.hub.connected_count())),
		),
		"/readyz" if state.is_ready() => plain(StatusCode::OK, Bytes::from_static(b"ready")),
		"/readyz" => plain(StatusCode::SERVICE_UNAVAILABLE, Bytes::from_static(b"not-ready")),
		_ => plain(StatusCode::NOT_FOUND, Bytes::new()),
	};
	Ok(resp)
}

fn plain(status: StatusCode, body: Bytes) -> Response<Full<Bytes>> {
	let mut resp = Response::new(Full::new(body));
	*resp.status_mut() = status;
	resp
}
