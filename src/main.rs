use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use wallet_sync_core::utils::{FetchFlag, format_btc_amount};
use wallet_sync_core::{Asset, CoreConfig, FileConfigStore, WalletRegistry};

const DEFAULT_CONFIG: &str = "wallet-sync.json";
const SETTINGS_FILE: &str = "settings.json";
const SUBSCRIBER_ID: &str = "log";
const BALANCE_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main(flavor = "current_thread")]
async fn main() {
	tracing_subscriber::fmt()
		.with_env_filter(
			tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()),
		)
		.with_target(false)
		.with_thread_ids(false)
		.with_thread_names(false)
		.with_file(false)
		.with_line_number(false)
		.with_timer(tracing_subscriber::fmt::time::time())
		.init();

	info!("Starting wallet sync service");

	let config_path = std::env::args()
		.nth(1)
		.map(PathBuf::from)
		.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG));
	let mut config = match CoreConfig::load(&config_path) {
		Ok(config) => config,
		Err(e) => {
			error!("Failed to load configuration: {}", e);
			return;
		}
	};

	match FileConfigStore::open(config.data_dir.join(SETTINGS_FILE)) {
		Ok(settings) => {
			if let Err(e) = config.apply_settings(&settings) {
				error!("Failed to apply settings: {}", e);
				return;
			}
		}
		Err(e) => warn!("Ignoring settings file: {}", e),
	}

	let registry = match WalletRegistry::from_config(config) {
		Ok(registry) => Arc::new(registry),
		Err(e) => {
			error!("Failed to load wallets: {}", e);
			return;
		}
	};
	info!("Loaded {} wallets", registry.ids().len());

	for (id, e) in registry.start_all().await {
		error!("Wallet {} did not start: {}", id, e);
	}

	for wallet in registry.all() {
		log_notifications(wallet);
	}

	let refresher = tokio::spawn(refresh_balances(registry.clone()));

	if let Err(e) = tokio::signal::ctrl_c().await {
		error!("Failed to listen for shutdown signal: {}", e);
	}
	info!("Shutting down");
	refresher.abort();

	for (id, e) in registry.cancel_all().await {
		warn!("Wallet {} shut down uncleanly: {}", id, e);
	}
	info!("All wallets disconnected");
}

fn log_notifications(wallet: Arc<dyn Asset>) {
	let id = wallet.record().id.clone();
	let mut receiver = match wallet.subscribe(SUBSCRIBER_ID) {
		Ok(receiver) => receiver,
		Err(e) => {
			warn!("Cannot subscribe to wallet {}: {}", id, e);
			return;
		}
	};
	tokio::spawn(async move {
		while let Some(event) = receiver.recv().await {
			info!("[{}] {}", id, event.description());
		}
		info!("[{}] notification channel closed", id);
	});
}

async fn refresh_balances(registry: Arc<WalletRegistry>) {
	let flag = FetchFlag::new();
	let mut interval = tokio::time::interval(BALANCE_INTERVAL);
	let mut was_synced = false;

	loop {
		interval.tick().await;

		let synced = registry.all_synced();
		if synced != was_synced {
			info!("All wallets synced: {}", synced);
			was_synced = synced;
		}

		let Some(guard) = flag.begin() else {
			continue;
		};
		let registry = registry.clone();
		tokio::spawn(async move {
			let _guard = guard;
			for wallet in registry.all() {
				let record = wallet.record();
				match wallet.accounts().await {
					Ok(accounts) => {
						let peers = wallet.peer_count().await;
						for account in accounts {
							info!(
								"[{}] account {} '{}': {} total, {} spendable, {} peers",
								record.id,
								account.number,
								account.name,
								format_btc_amount(account.total),
								format_btc_amount(account.spendable),
								peers
							);
						}
					}
					Err(e) => warn!("[{}] balance unavailable: {}", record.id, e),
				}
			}
		});
	}
}
