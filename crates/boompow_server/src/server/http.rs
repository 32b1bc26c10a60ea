#![forbid(unsafe_code)]

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Context as _;
use boompow_domain::{UserId, WorkerKey};
use boompow_protocol::{ServerMessage, WorkGenerate};
use bytes::Bytes;
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::Incoming;
use hyper::header::{
	AUTHORIZATION, CONNECTION, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY,
	SEC_WEBSOCKET_VERSION, UPGRADE,
};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tracing::{debug, error, info, warn};

use crate::auth::credential::CredentialResolver;
use crate::auth::gate::{authenticated_user, authorized_provider, authorized_requester, authorized_service_token};
use crate::auth::{AuthContext, AuthError};
use crate::server::hub::Hub;

pub const WORKER_PATH: &str = "/ws/worker";
pub const WORK_PATH: &str = "/v1/work";
pub const ME_PATH: &str = "/v1/me";

const MAX_BODY_BYTES: usize = 16 * 1024;

/// Shared state for every HTTP connection.
pub struct AppState {
	resolver: Arc<CredentialResolver>,
	hub: Hub,
	next_conn_seq: AtomicU64,
}

impl AppState {
	pub fn new(resolver: Arc<CredentialResolver>, hub: Hub) -> Self {
		Self {
			resolver,
			hub,
			next_conn_seq: AtomicU64::new(0),
		}
	}
}

#[derive(Debug, Deserialize)]
struct WorkRequest {
	hash: String,
	difficulty_multiplier: u32,
}

#[derive(Debug, Serialize)]
struct WorkAccepted {
	request_id: String,
	workers: usize,
}

/// Serve HTTP on `listener` until `shutdown` flips or its sender is dropped.
///
/// Connections already upgraded to WebSocket are owned by the hub and outlive this loop.
pub async fn run_http_server(
	listener: TcpListener,
	state: Arc<AppState>,
	mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
	let local = listener.local_addr().context("read listener address")?;
	info!(addr = %local, "http server listening");

	loop {
		let (stream, peer) = tokio::select! {
			_ = shutdown.changed() => break,
			accepted = listener.accept() => match accepted {
				Ok(accepted) => accepted,
				Err(e) => {
					warn!(error = %e, "accept failed");
					continue;
				}
			},
		};

		let io = TokioIo::new(stream);
		let state = state.clone();
		tokio::spawn(async move {
			let service = service_fn(move |req| handle_request(req, peer, state.clone()));
			if let Err(err) = http1::Builder::new()
				.serve_connection(io, service)
				.with_upgrades()
				.await
			{
				debug!(peer = %peer, error = %err, "http connection error");
			}
		});
	}

	info!("http server stopped accepting connections");
	Ok(())
}

async fn handle_request(
	req: Request<Incoming>,
	peer: SocketAddr,
	state: Arc<AppState>,
) -> Result<Response<Full<Bytes>>, Infallible> {
	metrics::counter!("boompow_server_http_requests_total").increment(1);
	let caller_ip = caller_ip(req.headers(), peer);

	let header = match req.headers().get(AUTHORIZATION).map(HeaderValue::to_str) {
		None => None,
		Some(Ok(value)) => Some(value.to_string()),
		Some(Err(_)) => return Ok(error_response(StatusCode::FORBIDDEN, "Invalid Token")),
	};

	let auth = match state.resolver.resolve(header.as_deref(), &caller_ip).await {
		Ok(auth) => auth,
		Err(AuthError::InvalidToken) => return Ok(error_response(StatusCode::FORBIDDEN, "Invalid Token")),
		Err(AuthError::Store(e)) => {
			error!(caller_ip = %caller_ip, error = ?e, "credential lookup failed");
			return Ok(error_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error"));
		}
	};

	let response = match (req.method(), req.uri().path()) {
		(&Method::GET, WORKER_PATH) => upgrade_worker(req, auth.as_ref(), &state),
		(&Method::POST, WORK_PATH) => submit_work(req, auth.as_ref(), &state).await,
		(&Method::GET, ME_PATH) => me(auth.as_ref()),
		_ => error_response(StatusCode::NOT_FOUND, "Not Found"),
	};
	Ok(response)
}

/// First `x-forwarded-for` entry, else the socket peer.
fn caller_ip(headers: &HeaderMap, peer: SocketAddr) -> String {
	headers
		.get("x-forwarded-for")
		.and_then(|v| v.to_str().ok())
		.and_then(|v| v.split(',').next())
		.map(str::trim)
		.filter(|v| !v.is_empty())
		.map(str::to_string)
		.unwrap_or_else(|| peer.ip().to_string())
}

fn upgrade_worker(mut req: Request<Incoming>, auth: Option<&AuthContext>, state: &AppState) -> Response<Full<Bytes>> {
	let Some(ctx) = authorized_provider(auth) else {
		metrics::counter!("boompow_server_worker_upgrades_denied_total").increment(1);
		return error_response(StatusCode::FORBIDDEN, "Unauthorized");
	};

	let Some(accept) = websocket_accept(req.headers()) else {
		return error_response(StatusCode::BAD_REQUEST, "Expected WebSocket upgrade");
	};

	let seq = state.next_conn_seq.fetch_add(1, Ordering::Relaxed);
	let key = WorkerKey::for_connection(ctx.identity.id, seq);
	let hub = state.hub.clone();
	let on_upgrade = hyper::upgrade::on(&mut req);

	tokio::spawn(async move {
		let upgraded = match on_upgrade.await {
			Ok(upgraded) => upgraded,
			Err(e) => {
				warn!(key = %key, error = %e, "websocket upgrade failed");
				return;
			}
		};

		let socket = WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None).await;
		match hub.register(key.clone(), socket) {
			Ok(conn) => {
				debug!(key = %conn.key(), generation = conn.generation(), "worker socket upgraded");
				conn.closed().await;
			}
			Err(e) => warn!(key = %key, error = %e, "worker registration refused"),
		}
	});

	let mut resp = Response::new(Full::new(Bytes::new()));
	*resp.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
	let headers = resp.headers_mut();
	headers.insert(CONNECTION, HeaderValue::from_static("Upgrade"));
	headers.insert(UPGRADE, HeaderValue::from_static("websocket"));
	headers.insert(SEC_WEBSOCKET_ACCEPT, accept);
	resp
}

/// `Sec-WebSocket-Accept` for a well-formed version 13 upgrade request.
fn websocket_accept(headers: &HeaderMap) -> Option<HeaderValue> {
	let header_has_token = |name: HeaderName, token: &str| {
		headers
			.get_all(name)
			.iter()
			.filter_map(|v| v.to_str().ok())
			.flat_map(|v| v.split(','))
			.any(|v| v.trim().eq_ignore_ascii_case(token))
	};

	if !header_has_token(CONNECTION, "upgrade") || !header_has_token(UPGRADE, "websocket") {
		return None;
	}
	if headers.get(SEC_WEBSOCKET_VERSION).map(HeaderValue::as_bytes) != Some(b"13".as_slice()) {
		return None;
	}

	let key = headers.get(SEC_WEBSOCKET_KEY)?;
	HeaderValue::from_str(&derive_accept_key(key.as_bytes())).ok()
}

async fn submit_work(req: Request<Incoming>, auth: Option<&AuthContext>, state: &AppState) -> Response<Full<Bytes>> {
	let Some(ctx) = authorized_requester(auth).or_else(|| authorized_service_token(auth)) else {
		return error_response(StatusCode::FORBIDDEN, "Unauthorized");
	};
	let requester_id = ctx.identity.id;
	let trust = ctx.trust.as_str();

	let body = match Limited::new(req.into_body(), MAX_BODY_BYTES).collect().await {
		Ok(collected) => collected.to_bytes(),
		Err(e) => {
			debug!(error = %e, "failed to read work request body");
			return error_response(StatusCode::BAD_REQUEST, "Invalid request body");
		}
	};

	let request: WorkRequest = match serde_json::from_slice(&body) {
		Ok(request) => request,
		Err(e) => {
			debug!(error = %e, "malformed work request");
			return error_response(StatusCode::BAD_REQUEST, "Invalid request body");
		}
	};
	if request.hash.trim().is_empty() || request.difficulty_multiplier == 0 {
		return error_response(StatusCode::BAD_REQUEST, "Invalid request body");
	}

	let request_id = uuid::Uuid::new_v4().to_string();
	let workers = broadcast_work(&state.hub, &request_id, requester_id, request);

	info!(request_id = %request_id, requester = %requester_id, trust, workers, "work request broadcast");
	metrics::counter!("boompow_server_work_requests_total").increment(1);

	json_response(StatusCode::ACCEPTED, &WorkAccepted { request_id, workers })
}

fn broadcast_work(hub: &Hub, request_id: &str, requester_id: UserId, request: WorkRequest) -> usize {
	hub.broadcast(ServerMessage::WorkGenerate(WorkGenerate {
		request_id: request_id.to_string(),
		requester_id,
		hash: request.hash,
		difficulty_multiplier: request.difficulty_multiplier,
	}))
}

fn me(auth: Option<&AuthContext>) -> Response<Full<Bytes>> {
	match authenticated_user(auth) {
		Some(ctx) => json_response(StatusCode::OK, &ctx.identity),
		None => error_response(StatusCode::FORBIDDEN, "Unauthorized"),
	}
}

fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Full<Bytes>> {
	match serde_json::to_vec(body) {
		Ok(body) => with_json_body(status, Bytes::from(body)),
		Err(e) => {
			error!(error = %e, "failed to encode response body");
			error_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
		}
	}
}

/// `{"errors":[{"message": ...}]}`
fn error_response(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
	let body = serde_json::json!({ "errors": [{ "message": message }] });
	with_json_body(status, Bytes::from(body.to_string()))
}

fn with_json_body(status: StatusCode, body: Bytes) -> Response<Full<Bytes>> {
	let mut resp = Response::new(Full::new(body));
	*resp.status_mut() = status;
	resp.headers_mut()
		.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
	resp
}
