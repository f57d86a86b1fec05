use reputation_state_sync::config::SyncConfig;
use reputation_state_sync::ledger::JsonRpcLedgerClient;
use reputation_state_sync::sync::{LeafStore, Synchronizer};

use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() {
	tracing_subscriber::fmt()
		.with_env_filter(
			tracing_subscriber::EnvFilter::builder()
				.with_default_directive(tracing::Level::INFO.into())
				.from_env_lossy(),
		)
		.with_target(false)
		.with_thread_ids(false)
		.with_thread_names(false)
		.with_file(false)
		.with_line_number(false)
		.with_timer(tracing_subscriber::fmt::time::time())
		.init();

	if let Err(e) = run().await {
		error!("State sync stopped: {}", e);
		std::process::exit(1);
	}
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
	let config = match std::env::args().nth(1).or_else(|| std::env::var("STATE_SYNC_CONFIG").ok()) {
		Some(path) => SyncConfig::load(&PathBuf::from(path))?,
		None => SyncConfig::default(),
	}
	.apply_env_overrides();

	info!(
		"Starting state sync for attester {} from {}",
		config.attester_id, config.rpc_url
	);

	let store = Arc::new(LeafStore::open(&config.database_path)?);
	let ledger = Arc::new(JsonRpcLedgerClient::new(
		config.rpc_url.clone(),
		config.contract_address.clone(),
	)?);
	let synchronizer = Synchronizer::new(store, ledger, config)?;

	synchronizer.start().await?;
	synchronizer.wait_for_sync(None).await?;
	info!("Caught up: {}", synchronizer.progress().summary());

	tokio::select! {
		result = tokio::signal::ctrl_c() => {
			result?;
			info!("Shutdown requested");
		}
		// The loop only exits on its own after a fatal error, which stop() reports.
		_ = wait_until_stopped(&synchronizer) => {}
	}

	synchronizer.stop().await?;
	info!("Stopped: {}", synchronizer.progress().summary());
	Ok(())
}

async fn wait_until_stopped(synchronizer: &Synchronizer) {
	while synchronizer.is_running() {
		tokio::time::sleep(std::time::Duration::from_secs(1)).await;
	}
}
