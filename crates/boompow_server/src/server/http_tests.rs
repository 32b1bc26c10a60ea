#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use boompow_domain::{Identity, SecretString, UserId, UserType};
use boompow_protocol::{ServerMessage, WorkResult, WorkerMessage, encode_message_default};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::auth::credential::{CredentialResolver, ResolverSettings};
use crate::auth::token::issue_hmac_token;
use crate::server::http::{AppState, run_http_server};
use crate::server::hub::HubConfig;
use crate::server::supervisor::{PipelineConfig, Supervisor};
use crate::store::memory::{MemoryIdentityStore, MemoryStatsStore, MemoryTokenStore};

const SECRET: &str = "http-test-secret";
const SERVICE_TOKEN: &str = "service:http-tests";

type Worker = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct TestServer {
	addr: SocketAddr,
	supervisor: Supervisor,
	identities: Arc<MemoryIdentityStore>,
	tokens: Arc<MemoryTokenStore>,
	_shutdown: watch::Sender<bool>,
}

impl TestServer {
	async fn start() -> Self {
		let identities = Arc::new(MemoryIdentityStore::new());
		let tokens = Arc::new(MemoryTokenStore::new());
		let resolver = CredentialResolver::new(
			identities.clone(),
			tokens.clone(),
			tokens.clone(),
			ResolverSettings {
				hmac_secret: Some(SecretString::new(SECRET)),
				service_tokens: [SERVICE_TOKEN.to_string()].into_iter().collect(),
			},
		);

		let supervisor = Supervisor::start(
			Arc::new(MemoryStatsStore::new()),
			HubConfig::default(),
			PipelineConfig::default(),
		);
		let state = Arc::new(AppState::new(Arc::new(resolver), supervisor.hub().clone()));

		let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
		let addr = listener.local_addr().expect("local addr");
		let (shutdown_tx, shutdown_rx) = watch::channel(false);
		tokio::spawn(run_http_server(listener, state, shutdown_rx));

		Self {
			addr,
			supervisor,
			identities,
			tokens,
			_shutdown: shutdown_tx,
		}
	}

	async fn user(&self, email: &str, user_type: UserType) -> (Identity, String) {
		let identity = Identity {
			id: UserId::new_v4(),
			email: email.to_string(),
			email_verified: true,
			can_request_work: user_type == UserType::Requester,
			user_type,
		};
		self.identities.upsert(identity.clone()).await;
		let token = issue_hmac_token(email, Duration::from_secs(300), SECRET).expect("issue token");
		(identity, token)
	}

	async fn request(&self, method: &str, path: &str, auth: Option<&str>, body: &str) -> (u16, String) {
		let mut stream = TcpStream::connect(self.addr).await.expect("connect");

		let mut raw = format!(
			"{method} {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\nContent-Type: application/json\r\nContent-Length: {}\r\n",
			body.len()
		);
		if let Some(auth) = auth {
			raw.push_str(&format!("Authorization: {auth}\r\n"));
		}
		raw.push_str("\r\n");
		raw.push_str(body);
		stream.write_all(raw.as_bytes()).await.expect("write request");

		let mut response = String::new();
		timeout(Duration::from_secs(2), stream.read_to_string(&mut response))
			.await
			.expect("response within timeout")
			.expect("read response");

		let status = response
			.split_whitespace()
			.nth(1)
			.and_then(|s| s.parse().ok())
			.expect("status code");
		let body = response
			.split_once("\r\n\r\n")
			.map(|(_, body)| body.to_string())
			.unwrap_or_default();
		(status, body)
	}

	async fn connect_worker(&self, token: &str) -> Result<Worker, WsError> {
		let mut request = format!("ws://{}/ws/worker", self.addr)
			.into_client_request()
			.expect("client request");
		request
			.headers_mut()
			.insert("Authorization", HeaderValue::from_str(token).expect("header value"));
		let (worker, _) = tokio_tungstenite::connect_async(request).await?;
		Ok(worker)
	}

	async fn wait_for_workers(&self, n: usize) {
		timeout(Duration::from_secs(2), async {
			while self.supervisor.hub().connected_count() != n {
				tokio::time::sleep(Duration::from_millis(10)).await;
			}
		})
		.await
		.expect("workers registered");
	}
}

async fn next_server_message(worker: &mut Worker) -> ServerMessage {
	loop {
		let frame = timeout(Duration::from_secs(1), worker.next())
			.await
			.expect("frame within timeout")
			.expect("socket open")
			.expect("valid frame");
		if let Message::Text(text) = frame {
			return serde_json::from_str(text.as_str()).expect("server message json");
		}
	}
}

#[tokio::test]
async fn invalid_token_gets_opaque_403() {
	let server = TestServer::start().await;

	for auth in ["garbage", "resetpassword:garbage", "service:unknown"] {
		let (status, body) = server.request("GET", "/v1/me", Some(auth), "").await;
		assert_eq!(status, 403, "{auth}");
		assert_eq!(body, r#"{"errors":[{"message":"Invalid Token"}]}"#);
	}
}

#[tokio::test]
async fn me_returns_the_resolved_identity() {
	let server = TestServer::start().await;
	let (identity, token) = server.user("dana@example.com", UserType::Provider).await;

	let (status, body) = server.request("GET", "/v1/me", Some(&token), "").await;
	assert_eq!(status, 200);
	let returned: Identity = serde_json::from_str(&body).expect("identity json");
	assert_eq!(returned, identity);

	let (status, body) = server.request("GET", "/v1/me", None, "").await;
	assert_eq!(status, 403);
	assert!(body.contains("Unauthorized"));
}

#[tokio::test]
async fn unknown_routes_are_404() {
	let server = TestServer::start().await;
	let (status, _) = server.request("GET", "/graphql", None, "").await;
	assert_eq!(status, 404);
}

#[tokio::test]
async fn requesters_cannot_open_worker_sockets() {
	let server = TestServer::start().await;
	let (_, token) = server.user("req@example.com", UserType::Requester).await;

	match server.connect_worker(&token).await {
		Err(WsError::Http(resp)) => assert_eq!(resp.status(), 403),
		Err(other) => panic!("expected http 403, got {other:?}"),
		Ok(_) => panic!("requester opened a worker socket"),
	}
	assert_eq!(server.supervisor.hub().connected_count(), 0);
}

#[tokio::test]
async fn work_request_reaches_worker_and_reward_returns() {
	let server = TestServer::start().await;
	let (_, provider_token) = server.user("miner@example.com", UserType::Provider).await;
	let (requester, requester_token) = server.user("wallet@example.com", UserType::Requester).await;

	let mut worker = server.connect_worker(&provider_token).await.expect("worker connects");
	server.wait_for_workers(1).await;

	let (status, body) = server
		.request(
			"POST",
			"/v1/work",
			Some(&requester_token),
			r#"{"hash":"F00D","difficulty_multiplier":4}"#,
		)
		.await;
	assert_eq!(status, 202);
	let accepted: serde_json::Value = serde_json::from_str(&body).expect("accepted json");
	assert_eq!(accepted["workers"], 1);

	let work = match next_server_message(&mut worker).await {
		ServerMessage::WorkGenerate(work) => work,
		other => panic!("expected work_generate, got {other:?}"),
	};
	assert_eq!(work.hash, "F00D");
	assert_eq!(work.difficulty_multiplier, 4);
	assert_eq!(work.requester_id, requester.id);
	assert_eq!(accepted["request_id"], work.request_id.as_str());

	let result = WorkResult {
		request_id: work.request_id.clone(),
		requester_id: work.requester_id,
		hash: work.hash.clone(),
		work: "c5cf86c1cdd2dd2f".to_string(),
		difficulty_multiplier: work.difficulty_multiplier,
	};
	let frame = encode_message_default(&WorkerMessage::WorkResult(result)).expect("encode");
	worker.send(Message::text(frame)).await.expect("send result");

	match next_server_message(&mut worker).await {
		ServerMessage::RewardEarned(reward) => {
			assert_eq!(reward.hash, "F00D");
			assert_eq!(reward.requester_id, requester.id);
			assert_eq!(reward.total_results, 1);
		}
		other => panic!("expected reward_earned, got {other:?}"),
	}
}

#[tokio::test]
async fn service_tokens_may_submit_work() {
	let server = TestServer::start().await;
	let (requester, _) = server.user("svc@example.com", UserType::Requester).await;
	server
		.tokens
		.bind_service_token(SERVICE_TOKEN, requester.id.to_string())
		.await;

	let (status, body) = server
		.request(
			"POST",
			"/v1/work",
			Some(SERVICE_TOKEN),
			r#"{"hash":"AB","difficulty_multiplier":1}"#,
		)
		.await;
	assert_eq!(status, 202);
	assert!(body.contains(r#""workers":0"#), "{body}");

	// Service trust is not an interactive session.
	let (status, _) = server.request("GET", "/v1/me", Some(SERVICE_TOKEN), "").await;
	assert_eq!(status, 403);
}

#[tokio::test]
async fn malformed_work_requests_are_rejected() {
	let server = TestServer::start().await;
	let (_, token) = server.user("wallet@example.com", UserType::Requester).await;

	for body in ["not json", r#"{"hash":"","difficulty_multiplier":1}"#, r#"{"hash":"AB","difficulty_multiplier":0}"#] {
		let (status, _) = server.request("POST", "/v1/work", Some(&token), body).await;
		assert_eq!(status, 400, "{body}");
	}

	let (_, provider_token) = server.user("miner@example.com", UserType::Provider).await;
	let (status, _) = server
		.request(
			"POST",
			"/v1/work",
			Some(&provider_token),
			r#"{"hash":"AB","difficulty_multiplier":1}"#,
		)
		.await;
	assert_eq!(status, 403);
}
