//! Asset facade: the one wallet interface the rest of the application programs against.
//!
//! The backend variant is chosen once, in [`load_asset`]. Callers hold an
//! `Arc<dyn Asset>` and never branch on the variant afterwards.

pub mod base;
pub mod fullnode;
pub mod spv;

pub use base::WalletCore;
pub use fullnode::FullNodeWallet;
pub use spv::SpvWallet;

use crate::backend::{BackendConnector, BackendParams, StoreOptions};
use crate::config::CoreConfig;
use crate::notify::EventReceiver;
use crate::wallet::sync::{ManagerSettings, SyncState, SyncStats, SyncStatus};
use crate::wallet::{AccountRecord, AssetKind, SyncError, WalletRecord};

use async_trait::async_trait;
use bitcoin::ScriptBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

/// A loaded wallet, whatever backend it syncs through
#[async_trait]
pub trait Asset: Send + Sync {
	fn core(&self) -> &WalletCore;

	fn record(&self) -> &WalletRecord {
		self.core().record()
	}

	fn sync_state(&self) -> SyncState {
		self.core().sync_state()
	}

	fn watch_state(&self) -> watch::Receiver<SyncStatus> {
		self.core().watch_state()
	}

	fn sync_stats(&self) -> SyncStats {
		self.core().stats()
	}

	fn is_synced(&self) -> bool {
		self.sync_state() == SyncState::Synced
	}

	/// Connect the backend and start syncing. See [`crate::wallet::SyncManager::start`].
	async fn start(&self) -> Result<(), SyncError> {
		self.core().manager().start().await
	}

	/// Stop syncing and release the backend. See [`crate::wallet::SyncManager::cancel`].
	async fn cancel(&self) -> Result<(), SyncError> {
		self.core().manager().cancel().await
	}

	/// Register a notification subscriber under a caller-chosen ID
	fn subscribe(&self, id: &str) -> Result<EventReceiver, SyncError> {
		self.core().subscribe(id)
	}

	fn unsubscribe(&self, id: &str) {
		self.core().unsubscribe(id)
	}

	async fn accounts(&self) -> Result<Vec<AccountRecord>, SyncError> {
		self.core().accounts().await
	}

	async fn balance(&self, account: u32) -> Result<AccountRecord, SyncError> {
		self.core().balance(account).await
	}

	/// Watch `scripts` for `account`, creating the account if needed
	async fn import_account(
		&self,
		number: u32,
		name: &str,
		scripts: Vec<ScriptBuf>,
	) -> Result<(), SyncError> {
		self.core().import_account(number, name, scripts).await
	}

	async fn peer_count(&self) -> u32 {
		self.core().peer_count().await
	}
}

/// Build the wallet for `record`, picking its variant from the record's kind.
///
/// Nothing is opened here; the backend is connected by [`Asset::start`].
pub fn load_asset(
	record: WalletRecord,
	birthday: u32,
	config: &CoreConfig,
	connector: Arc<dyn BackendConnector>,
) -> Arc<dyn Asset> {
	let params = BackendParams {
		kind: record.kind,
		network: record.network,
		dir: config.wallet_dir(&record.id),
		store: StoreOptions {
			birthday,
			required_confirmations: config.required_confirmations,
		},
		rpc: config.rpc.clone(),
		spv: config.spv.clone(),
	};
	let settings = ManagerSettings::from_config(config);
	info!(
		"Loading {} wallet {} on {} from {:?}",
		record.kind, record.id, record.network, params.dir
	);

	let kind = record.kind;
	let core = WalletCore::new(
		record,
		params,
		connector,
		settings,
		config.subscriber_queue_depth,
	);
	match kind {
		AssetKind::FullNode => Arc::new(FullNodeWallet::new(core, config.rpc.clone())),
		AssetKind::Spv => Arc::new(SpvWallet::new(core, config.spv.clone())),
	}
}
