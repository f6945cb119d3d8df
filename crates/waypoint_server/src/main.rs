#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, anyhow};
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use waypoint_server::config::{
	BrokerSettings, IdentitySettings, default_config_path, load_gateway_config_from_path,
};
use waypoint_server::server::auth::ConnectionAuthenticator;
use waypoint_server::server::bridge::BrokerBridge;
use waypoint_server::server::broker::{AmqpBroker, Broker, MemoryBroker};
use waypoint_server::server::gateway::{Gateway, GatewayServer};
use waypoint_server::server::health::{HealthState, spawn_health_server};
use waypoint_server::server::identity::{IdentityStore, SqlIdentityStore, StaticIdentityStore};
use waypoint_server::server::liveness::{LivenessConfig, LivenessMonitor};
use waypoint_server::server::registry::ConnectionRegistry;
use waypoint_util::endpoint::WsEndpoint;

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: waypoint_server [--bind ws://host:port] [--config path]\n\
\n\
Options:\n\
\t--bind     Bind endpoint (default: server.bind from config, else ws://0.0.0.0:9080)\n\
\t          Format: ws://host:port\n\
\t--config   Config file (default: ~/.waypoint/config.toml)\n\
\t--help    Show this help\n\
"
	);
	std::process::exit(2)
}

struct Args {
	bind: Option<SocketAddr>,
	config: Option<PathBuf>,
}

fn parse_bind(endpoint: &str) -> Result<SocketAddr, String> {
	WsEndpoint::parse(endpoint)?.to_socket_addr_if_ip_literal()
}

fn parse_args() -> Args {
	let mut args = Args { bind: None, config: None };

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--bind" | "--listen" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--bind must be non-empty (expected ws://host:port)");
					usage_and_exit();
				}
				let addr = parse_bind(&v).unwrap_or_else(|e| {
					eprintln!("{e}");
					usage_and_exit();
				});
				args.bind = Some(addr);
			}
			"--config" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				args.config = Some(PathBuf::from(v));
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
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,waypoint_server=debug".to_string());

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
				let tracer = tracer_provider.tracer("waypoint_server");
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

	match bind.parse::<SocketAddr>() {
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
			warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)");
		}
	}
}

async fn connect_identity_store(cfg: &IdentitySettings) -> anyhow::Result<Arc<dyn IdentityStore>> {
	if let Some(url) = cfg.database_url.as_ref() {
		let store = SqlIdentityStore::connect(url.expose())
			.await
			.context("connect identity store")?;
		info!("identity store: database");
		return Ok(Arc::new(store));
	}

	if !cfg.static_public_keys.is_empty() {
		let store = StaticIdentityStore::from_files(&cfg.static_public_keys).context("load static public keys")?;
		warn!(users = store.len(), "identity store: static key files (development only)");
		return Ok(Arc::new(store));
	}

	Err(anyhow!(
		"no identity source configured (set identity.database_url or identity.static_public_keys)"
	))
}

async fn connect_broker(cfg: &BrokerSettings) -> anyhow::Result<Arc<dyn Broker>> {
	if cfg.is_memory() {
		warn!("broker: in-process memory broker (development only)");
		return Ok(Arc::new(MemoryBroker::new()));
	}

	let broker = AmqpBroker::connect(cfg.url.expose()).await.context("connect broker")?;
	Ok(Arc::new(broker))
}

async fn shutdown_signal() {
	let ctrl_c = async {
		if let Err(e) = tokio::signal::ctrl_c().await {
			warn!(error = %e, "failed to listen for ctrl-c");
			std::future::pending::<()>().await;
		}
	};

	#[cfg(unix)]
	let terminate = async {
		match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
			Ok(mut sig) => {
				sig.recv().await;
			}
			Err(e) => {
				warn!(error = %e, "failed to listen for SIGTERM");
				std::future::pending::<()>().await;
			}
		}
	};

	#[cfg(not(unix))]
	let terminate = std::future::pending::<()>();

	tokio::select! {
		_ = ctrl_c => {}
		_ = terminate => {}
	}

	info!("shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();

	let args = parse_args();

	let config_path = match args.config {
		Some(path) => path,
		None => default_config_path()?,
	};
	let cfg = load_gateway_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded gateway config (toml + env overrides)");

	init_metrics(cfg.server.metrics_bind.as_deref());

	let bind_addr = match args.bind {
		Some(addr) => addr,
		None => parse_bind(&cfg.server.bind).map_err(|e| anyhow!("server.bind: {e}"))?,
	};

	let store = connect_identity_store(&cfg.identity).await?;
	let broker = connect_broker(&cfg.broker).await?;

	let health_state = {
		let broker = Arc::clone(&broker);
		HealthState::new().with_check(move || broker.is_connected())
	};
	if let Some(bind) = cfg.server.health_bind.as_deref() {
		match bind.parse::<SocketAddr>() {
			Ok(addr) => {
				spawn_health_server(addr, health_state.clone());
				info!(%addr, "health server listening");
			}
			Err(e) => warn!(error = %e, %bind, "invalid health bind address (expected host:port)"),
		}
	}

	let registry = ConnectionRegistry::new();
	let bridge = BrokerBridge::new(Arc::clone(&broker), registry.clone(), cfg.broker.exchange.clone());
	let authenticator = ConnectionAuthenticator::new(
		Arc::clone(&store),
		cfg.server.auth_header.clone(),
		cfg.server.jwt_algorithm,
	);
	let gateway = Arc::new(
		Gateway::new(registry.clone(), bridge, authenticator).with_handshake_timeout(cfg.server.handshake_timeout),
	);

	let monitor = LivenessMonitor::new(
		registry,
		LivenessConfig {
			period: cfg.server.liveness_period,
			max_missed_probes: cfg.server.max_missed_probes,
		},
	)
	.spawn();

	let server = GatewayServer::bind(bind_addr, Arc::clone(&gateway))
		.await
		.with_context(|| format!("bind websocket listener on {bind_addr}"))?;
	info!(
		bind = %server.local_addr()?,
		exchange = %cfg.broker.exchange,
		auth_header = %cfg.server.auth_header,
		algorithm = %cfg.server.jwt_algorithm,
		"waypoint_server: websocket gateway ready"
	);
	health_state.mark_ready();

	server.run_until(shutdown_signal()).await;

	health_state.mark_not_ready();
	monitor.abort();
	store.close().await;
	info!("waypoint_server: shutdown complete");

	Ok(())
}
