#![forbid(unsafe_code)]

mod auth;
mod config;
mod server;
mod store;
mod util;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, anyhow};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::auth::credential::{CredentialResolver, ResolverSettings};
use crate::config::ServerConfig;
use crate::server::health::{HealthState, spawn_health_server};
use crate::server::http::{AppState, run_http_server};
use crate::server::hub::HubConfig;
use crate::server::stats::RewardPolicy;
use crate::server::supervisor::{PipelineConfig, Supervisor};
use crate::store::Stores;
use crate::store::memory::{MemoryIdentityStore, MemoryStatsStore, MemoryTokenStore};
use crate::store::sql::SqlStore;
use crate::util::bind::parse_bind_addr;

const DEFAULT_BIND: &str = "http://127.0.0.1:8080";

struct CliArgs {
	bind: Option<SocketAddr>,
	config_path: Option<PathBuf>,
}

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: boompow_server [--bind http://host:port] [--config path]\n\
\n\
Options:\n\
\t--bind     Bind endpoint (default: server.bind from config, else {DEFAULT_BIND})\n\
\t          Format: [http://]ip:port\n\
\t--config   Config file (default: ~/.boompow/config.toml)\n\
\t--help     Show this help\n\
"
	);
	std::process::exit(2)
}

fn parse_args() -> CliArgs {
	let mut args = CliArgs {
		bind: None,
		config_path: None,
	};

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--bind" | "--listen" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				let addr = parse_bind_addr(&v).unwrap_or_else(|e| {
					eprintln!("{e}");
					usage_and_exit();
				});
				args.bind = Some(addr);
			}
			"--config" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--config must be non-empty");
					usage_and_exit();
				}
				args.config_path = Some(PathBuf::from(v));
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	args
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,boompow_server=debug".to_string());

	let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty());
	let base = tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false));

	if let Some(endpoint) = otlp_endpoint {
		use opentelemetry::global;
		use opentelemetry::trace::TracerProvider as _;
		use opentelemetry_otlp::WithExportConfig;

		match opentelemetry_otlp::SpanExporter::builder()
			.with_tonic()
			.with_endpoint(endpoint.clone())
			.build()
		{
			Ok(exporter) => {
				let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
					.with_batch_exporter(exporter)
					.build();
				let tracer = tracer_provider.tracer("boompow_server");
				global::set_tracer_provider(tracer_provider);

				let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
				base.with(otel_layer).init();
				info!(endpoint = %endpoint, "otlp tracing enabled");
			}
			Err(e) => {
				base.init();
				warn!(error = %e, "failed to initialize otlp tracing");
			}
		}
	} else {
		base.init();
	}
}

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match parse_bind_addr(bind) {
		Ok(addr) => {
			if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
				.with_http_listener(addr)
				.install()
			{
				warn!(error = %e, "failed to start metrics exporter");
			} else {
				info!(%addr, "metrics exporter listening");
			}
		}
		Err(e) => {
			warn!(error = %e, %bind, "invalid metrics bind address");
		}
	}
}

async fn build_stores(cfg: &ServerConfig) -> anyhow::Result<Stores> {
	if cfg.persistence.enabled {
		let Some(database_url) = cfg.persistence.database_url.as_deref() else {
			return Err(anyhow!("persistence enabled but no database_url configured"));
		};
		let store = SqlStore::connect(database_url).await?;
		return Ok(Stores::from_sql(store));
	}

	warn!(
		users = cfg.users.len(),
		service_tokens = cfg.service_token_users.len(),
		"persistence disabled; serving identities from config and keeping stats in memory"
	);

	let identities = MemoryIdentityStore::new();
	for identity in &cfg.users {
		identities.upsert(identity.clone()).await;
	}

	let tokens = MemoryTokenStore::new();
	for (token, user_id) in &cfg.service_token_users {
		tokens.bind_service_token(token.clone(), user_id.clone()).await;
	}

	Ok(Stores::in_memory(identities, tokens, MemoryStatsStore::new()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();

	let args = parse_args();

	let config_path = match args.config_path {
		Some(path) => path,
		None => crate::config::default_config_path()?,
	};
	let server_cfg = crate::config::load_server_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded server config (toml + env overrides)");

	let bind_addr = match args.bind {
		Some(addr) => addr,
		None => parse_bind_addr(server_cfg.server.bind.as_deref().unwrap_or(DEFAULT_BIND))
			.context("invalid server.bind")?,
	};

	init_metrics(server_cfg.server.metrics_bind.as_deref());

	let stores = build_stores(&server_cfg).await?;

	let resolver = CredentialResolver::new(
		stores.identities.clone(),
		stores.reset_tokens.clone(),
		stores.service_tokens.clone(),
		ResolverSettings {
			hmac_secret: server_cfg.server.auth_hmac_secret.clone(),
			service_tokens: server_cfg.server.service_tokens.iter().cloned().collect(),
		},
	);

	let hub_cfg = HubConfig {
		outbound_queue_capacity: server_cfg.server.worker_outbound_capacity,
		keepalive_interval: server_cfg.server.keepalive_interval,
		keepalive_timeout: server_cfg.server.keepalive_timeout,
		max_frame_bytes: server_cfg.server.max_frame_bytes,
	};
	let pipeline_cfg = PipelineConfig {
		work_queue_capacity: server_cfg.pipeline.work_queue_capacity,
		reward_policy: RewardPolicy {
			payout_threshold: server_cfg.pipeline.payout_threshold,
		},
	};
	let supervisor = Supervisor::start(stores.stats.clone(), hub_cfg, pipeline_cfg);

	let health_state = HealthState::new(supervisor.hub().clone());
	if let Some(bind) = server_cfg.server.health_bind.as_deref() {
		match parse_bind_addr(bind) {
			Ok(addr) => spawn_health_server(addr, health_state.clone()),
			Err(e) => warn!(error = %e, %bind, "invalid health bind address"),
		}
	}

	let listener = TcpListener::bind(bind_addr)
		.await
		.with_context(|| format!("bind http listener on {bind_addr}"))?;
	let state = Arc::new(AppState::new(Arc::new(resolver), supervisor.hub().clone()));
	let (shutdown_tx, shutdown_rx) = watch::channel(false);
	let http_server = tokio::spawn(run_http_server(listener, state, shutdown_rx));

	health_state.mark_ready();
	info!(bind = %bind_addr, "boompow_server: ready");

	tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
	info!("shutdown requested");

	health_state.mark_not_ready();
	let _ = shutdown_tx.send(true);
	http_server.await.context("http server task failed")??;
	supervisor.shutdown().await?;

	Ok(())
}
