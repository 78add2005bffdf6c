//! State shared by every wallet variant

use crate::backend::{BackendConnector, BackendParams, StoreError};
use crate::notify::{EventReceiver, NotificationHub};
use crate::wallet::sync::{ManagerSettings, SyncManager, SyncState, SyncStats, SyncStatus};
use crate::wallet::{AccountRecord, SyncError, WalletRecord};

use bitcoin::ScriptBuf;
use std::sync::Arc;
use tokio::sync::watch;

/// Identity, sync manager and notification hub of one wallet
pub struct WalletCore {
	record: WalletRecord,
	manager: SyncManager,
}

impl WalletCore {
	pub fn new(
		record: WalletRecord,
		params: BackendParams,
		connector: Arc<dyn BackendConnector>,
		settings: ManagerSettings,
		subscriber_queue_depth: usize,
	) -> Self {
		let hub = Arc::new(NotificationHub::new(record.id.clone(), subscriber_queue_depth));
		let manager = SyncManager::new(record.id.clone(), params, connector, hub, settings);
		Self { record, manager }
	}

	pub fn record(&self) -> &WalletRecord {
		&self.record
	}

	pub fn manager(&self) -> &SyncManager {
		&self.manager
	}

	pub fn sync_state(&self) -> SyncState {
		self.manager.state()
	}

	pub fn watch_state(&self) -> watch::Receiver<SyncStatus> {
		self.manager.watch()
	}

	pub fn stats(&self) -> SyncStats {
		self.manager.stats()
	}

	pub fn subscribe(&self, id: &str) -> Result<EventReceiver, SyncError> {
		self.manager.hub().add_listener(id)
	}

	pub fn unsubscribe(&self, id: &str) {
		self.manager.hub().remove_listener(id);
	}

	pub async fn accounts(&self) -> Result<Vec<AccountRecord>, SyncError> {
		let backend = self.manager.backend().await?;
		backend.store.accounts().await.map_err(|e| self.store_error(e))
	}

	pub async fn balance(&self, account: u32) -> Result<AccountRecord, SyncError> {
		let backend = self.manager.backend().await?;
		backend
			.store
			.account(account)
			.await
			.map_err(|e| self.store_error(e))?
			.ok_or(SyncError::UnknownAccount(account))
	}

	pub async fn import_account(
		&self,
		number: u32,
		name: &str,
		scripts: Vec<ScriptBuf>,
	) -> Result<(), SyncError> {
		let backend = self.manager.backend().await?;
		backend
			.store
			.import_account(number, name, scripts)
			.await
			.map_err(|e| self.store_error(e))
	}

	// A store closed under us means a cancel won the race
	fn store_error(&self, e: StoreError) -> SyncError {
		match e {
			StoreError::Closed => SyncError::NotConnected(self.record.id.clone()),
			other => SyncError::StorageUnavailable(other.to_string()),
		}
	}

	pub async fn peer_count(&self) -> u32 {
		match self.manager.backend().await {
			Ok(backend) => backend.client.peer_count(),
			Err(_) => 0,
		}
	}
}

