use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::connect_info::IntoMakeServiceWithConnectInfo;
use clap::Parser;
use playgate_core::drain::DrainMode;
use playgate_core::{drain, signal, telemetry, version};
use tracing::{info, warn};

/// Upper bound on how long a shutdown waits for executions already in
/// flight to finish after the listener stops accepting new connections.
/// Independent of any single request's `ExecutionTimeout`, since several
/// may be mid-flight at once when the signal arrives.
const DRAIN_DEADLINE: Duration = Duration::from_secs(30);

#[derive(Parser, Debug)]
#[command(about, long_about = None)]
#[command(disable_version_flag = true)]
struct Args {
	/// Print version (as a simple version string)
	#[arg(short = 'V', long = "version", value_name = "version")]
	version_short: bool,
}

fn main() -> anyhow::Result<()> {
	telemetry::setup_logging();

	let args = Args::parse();
	if args.version_short {
		println!("{}", version::BuildInfo::new());
		return Ok(());
	}

	tokio::runtime::Builder::new_multi_thread()
		.enable_all()
		.build()?
		.block_on(run())
}

async fn run() -> anyhow::Result<()> {
	let config = Arc::new(playgate::Config::load()?);
	info!(
		host = %config.server_host,
		port = config.server_port,
		version = %version::BuildInfo::new(),
		"starting playgate"
	);

	let addr = SocketAddr::from((config.server_host, config.server_port));
	let listener = tokio::net::TcpListener::bind(addr).await?;

	let (drain_trigger, drain_watcher) = drain::new();
	let router: IntoMakeServiceWithConnectInfo<_, SocketAddr> =
		playgate::build_router(config, drain_watcher.clone()).into_make_service_with_connect_info::<SocketAddr>();

	let shutdown = signal::Shutdown::new();
	axum::serve(listener, router)
		.with_graceful_shutdown(shutdown.wait())
		.await?;

	info!("listener closed, draining in-flight executions");
	// The root watcher handed to `build_router` was cloned per in-flight
	// execution; drop our own copy so the drain below only waits on those.
	drop(drain_watcher);
	match tokio::time::timeout(DRAIN_DEADLINE, drain_trigger.start_drain_and_wait(DrainMode::Graceful)).await {
		Ok(()) => info!("drain complete, shutting down"),
		Err(_) => warn!("drain deadline exceeded, exiting with executions still in flight"),
	}
	Ok(())
}
