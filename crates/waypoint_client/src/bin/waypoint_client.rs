#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context as _;
use tracing::{info, warn};
use waypoint_client::token::mint_for;
use waypoint_client::{DEFAULT_GATEWAY_ENDPOINT, DeviceConfig, DeviceEvent, DeviceSession};
use waypoint_domain::SigningAlgorithm;

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: waypoint_client [--connect ws://host:port] (--token jwt | --private-key path --username u --device-id d)\n\
\n\
Options:\n\
	--connect      Gateway endpoint (default: ws://127.0.0.1:9080)\n\
	--token        Pre-minted device token (or WAYPOINT_CLIENT_TOKEN)\n\
	--private-key  PEM private key used to mint a token locally\n\
	--username     Token username (with --private-key)\n\
	--device-id    Token device id (with --private-key)\n\
	--algorithm    RS256 | RS384 | RS512 (default: RS512)\n\
	--header       Auth header name (default: asimovlives)\n\
	--help         Show this help\n\
\n\
Examples:\n\
	waypoint_client --token eyJhbGciOi...\n\
	waypoint_client --private-key alice.pem --username alice --device-id phoneA\n"
	);
	std::process::exit(2)
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,waypoint_client=debug".to_string());
	tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

struct Args {
	endpoint: String,
	token: Option<String>,
	private_key: Option<PathBuf>,
	username: Option<String>,
	device_id: Option<String>,
	algorithm: SigningAlgorithm,
	header: Option<String>,
}

fn non_empty(flag: &str, v: String) -> String {
	if v.trim().is_empty() {
		eprintln!("{flag} must be non-empty");
		usage_and_exit();
	}
	v
}

fn parse_args() -> Args {
	let mut args = Args {
		endpoint: DEFAULT_GATEWAY_ENDPOINT.to_string(),
		token: std::env::var("WAYPOINT_CLIENT_TOKEN")
			.ok()
			.map(|v| v.trim().to_string())
			.filter(|v| !v.is_empty()),
		private_key: None,
		username: None,
		device_id: None,
		algorithm: SigningAlgorithm::default(),
		header: None,
	};

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		let mut value = |flag: &str| non_empty(flag, it.next().unwrap_or_else(|| usage_and_exit()));
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--connect" | "--endpoint" => args.endpoint = value("--connect"),
			"--token" => args.token = Some(value("--token")),
			"--private-key" => args.private_key = Some(PathBuf::from(value("--private-key"))),
			"--username" => args.username = Some(value("--username")),
			"--device-id" => args.device_id = Some(value("--device-id")),
			"--algorithm" => {
				let v = value("--algorithm");
				args.algorithm = v.parse().unwrap_or_else(|e| {
					eprintln!("{e}");
					usage_and_exit()
				});
			}
			"--header" => args.header = Some(value("--header")),
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	args
}

fn resolve_token(args: &Args) -> anyhow::Result<String> {
	if let Some(token) = args.token.as_ref() {
		return Ok(token.clone());
	}

	let (Some(path), Some(username), Some(device_id)) = (&args.private_key, &args.username, &args.device_id) else {
		eprintln!("either --token or --private-key with --username and --device-id is required");
		usage_and_exit();
	};

	let pem = std::fs::read_to_string(path).with_context(|| format!("read private key {}", path.display()))?;
	let token = mint_for(&pem, args.algorithm, username, device_id, Duration::from_secs(3600))?;
	info!(%username, %device_id, algorithm = %args.algorithm, "minted device token");
	Ok(token)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();
	let args = parse_args();

	let mut cfg = DeviceConfig::new(args.endpoint.clone(), resolve_token(&args)?);
	if let Some(header) = args.header.as_ref() {
		cfg.auth_header = header.to_ascii_lowercase();
	}

	let mut session = DeviceSession::connect(&cfg).await?;

	let mut interrupted = false;
	loop {
		tokio::select! {
			_ = tokio::signal::ctrl_c() => {
				info!("ctrl-c received, closing");
				interrupted = true;
				break;
			}
			event = session.next_event() => match event? {
				Some(DeviceEvent::Text(text)) => println!("{text}"),
				Some(DeviceEvent::Binary(data)) => println!("<{} bytes>", data.len()),
				Some(DeviceEvent::Closed { code, reason }) => {
					info!(?code, %reason, "gateway closed the connection");
					break;
				}
				None => break,
			},
		}
	}

	if interrupted && let Err(e) = session.close().await {
		warn!(error = %e, "close failed");
	}

	Ok(())
}
