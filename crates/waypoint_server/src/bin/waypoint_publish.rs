#![forbid(unsafe_code)]

use std::io::Read as _;
use std::path::PathBuf;

use anyhow::Context as _;
use bytes::Bytes;
use tracing::info;
use waypoint_domain::LocationTopic;
use waypoint_server::config::{default_config_path, load_gateway_config_from_path};
use waypoint_server::server::broker::{AmqpBroker, Broker};

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: waypoint_publish --username u [--payload json] [--config path]\n\
\n\
Publishes one location update to every connected device of a user.\n\
\n\
Options:\n\
	--username  Target user\n\
	--payload   Message body (default: read from stdin)\n\
	--config    Config file (default: ~/.waypoint/config.toml)\n\
	--help      Show this help\n"
	);
	std::process::exit(2)
}

struct Args {
	username: String,
	payload: Option<String>,
	config: Option<PathBuf>,
}

fn parse_args() -> Args {
	let mut username = None;
	let mut payload = None;
	let mut config = None;

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--username" => username = Some(it.next().unwrap_or_else(|| usage_and_exit())),
			"--payload" => payload = Some(it.next().unwrap_or_else(|| usage_and_exit())),
			"--config" => config = Some(PathBuf::from(it.next().unwrap_or_else(|| usage_and_exit()))),
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	let Some(username) = username.filter(|u| !u.trim().is_empty()) else {
		eprintln!("--username is required");
		usage_and_exit();
	};

	Args {
		username,
		payload,
		config,
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
	tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();

	let args = parse_args();
	let config_path = match args.config {
		Some(path) => path,
		None => default_config_path()?,
	};
	let cfg = load_gateway_config_from_path(&config_path)?;

	let routing_key = LocationTopic::user_broadcast_key(&args.username)?;
	let payload = match args.payload {
		Some(p) => p,
		None => {
			let mut buf = String::new();
			std::io::stdin().read_to_string(&mut buf).context("read payload from stdin")?;
			buf
		}
	};

	let broker = AmqpBroker::connect(cfg.broker.url.expose())
		.await
		.context("connect broker")?;
	broker
		.publish(&cfg.broker.exchange, &routing_key, Bytes::from(payload))
		.await
		.context("publish")?;
	info!(exchange = %cfg.broker.exchange, %routing_key, "published");
	broker.close().await;

	Ok(())
}
