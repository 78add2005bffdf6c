//! Multi-wallet container and the caller's wallet/account selection.

use crate::asset::{Asset, load_asset};
use crate::backend::{BackendConnector, DefaultConnector};
use crate::config::{CoreConfig, WalletEntry};
use crate::wallet::{AccountRecord, SyncError, WalletId};

use futures::future::join_all;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

/// The wallet and account a caller is currently working with.
///
/// Passed explicitly to the operations that need it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectionContext {
	pub wallet: Option<WalletId>,
	pub account: Option<u32>,
}

impl SelectionContext {
	pub fn new() -> Self {
		Self::default()
	}

	/// Select a wallet. The account selection is reset.
	pub fn select_wallet(&mut self, wallet: WalletId) {
		self.wallet = Some(wallet);
		self.account = None;
	}

	pub fn select_account(&mut self, account: u32) {
		self.account = Some(account);
	}

	pub fn clear(&mut self) {
		self.wallet = None;
		self.account = None;
	}
}

/// All loaded wallets, keyed by ID.
///
/// The map lock is only held to look wallets up; wallet operations run on a cloned
/// handle so wallets progress independently.
pub struct WalletRegistry {
	config: CoreConfig,
	connector: Arc<dyn BackendConnector>,
	wallets: RwLock<BTreeMap<WalletId, Arc<dyn Asset>>>,
}

impl WalletRegistry {
	pub fn new(config: CoreConfig, connector: Arc<dyn BackendConnector>) -> Self {
		Self {
			config,
			connector,
			wallets: RwLock::new(BTreeMap::new()),
		}
	}

	/// Registry over the real backends with every configured wallet loaded
	pub fn from_config(config: CoreConfig) -> Result<Self, SyncError> {
		let entries = config.wallets.clone();
		let registry = Self::new(config, Arc::new(DefaultConnector));
		for entry in &entries {
			registry.load(entry)?;
		}
		Ok(registry)
	}

	pub fn config(&self) -> &CoreConfig {
		&self.config
	}

	pub fn load(&self, entry: &WalletEntry) -> Result<Arc<dyn Asset>, SyncError> {
		let mut wallets = self.wallets.write().unwrap_or_else(|p| p.into_inner());
		if wallets.contains_key(&entry.id) {
			return Err(SyncError::Config(format!("Wallet {} is already loaded", entry.id)));
		}
		let asset = load_asset(
			entry.record(self.config.network),
			entry.birthday_height,
			&self.config,
			self.connector.clone(),
		);
		wallets.insert(entry.id.clone(), asset.clone());
		Ok(asset)
	}

	pub fn get(&self, id: &WalletId) -> Result<Arc<dyn Asset>, SyncError> {
		self.wallets
			.read()
			.unwrap_or_else(|p| p.into_inner())
			.get(id)
			.cloned()
			.ok_or_else(|| SyncError::UnknownWallet(id.clone()))
	}

	pub fn ids(&self) -> Vec<WalletId> {
		self.wallets
			.read()
			.unwrap_or_else(|p| p.into_inner())
			.keys()
			.cloned()
			.collect()
	}

	pub fn all(&self) -> Vec<Arc<dyn Asset>> {
		self.wallets
			.read()
			.unwrap_or_else(|p| p.into_inner())
			.values()
			.cloned()
			.collect()
	}

	/// Cancel a wallet and drop it from the registry.
	///
	/// The wallet is removed even when its cancel timed out.
	pub async fn remove(&self, id: &WalletId) -> Result<(), SyncError> {
		let wallet = self.get(id)?;
		let cancelled = wallet.cancel().await;
		self.wallets
			.write()
			.unwrap_or_else(|p| p.into_inner())
			.remove(id);
		info!("Wallet {} removed", id);
		cancelled
	}

	/// Start every wallet concurrently. Returns the wallets that failed to start.
	pub async fn start_all(&self) -> Vec<(WalletId, SyncError)> {
		let wallets = self.all();
		let results = join_all(wallets.iter().map(|w| w.start())).await;
		collect_failures(&wallets, results, "start")
	}

	/// Cancel every wallet concurrently. Returns the wallets whose cancel reported an error.
	pub async fn cancel_all(&self) -> Vec<(WalletId, SyncError)> {
		let wallets = self.all();
		let results = join_all(wallets.iter().map(|w| w.cancel())).await;
		collect_failures(&wallets, results, "cancel")
	}

	/// True when at least one wallet is loaded and every wallet is synced
	pub fn all_synced(&self) -> bool {
		let wallets = self.all();
		!wallets.is_empty() && wallets.iter().all(|w| w.is_synced())
	}

	/// The wallet named by `selection`, if it is loaded
	pub fn selected(&self, selection: &SelectionContext) -> Option<Arc<dyn Asset>> {
		let id = selection.wallet.as_ref()?;
		self.get(id).ok()
	}

	/// Balance of the selected account (account 0 when none is selected)
	pub async fn selected_balance(
		&self,
		selection: &SelectionContext,
	) -> Result<AccountRecord, SyncError> {
		let id = selection
			.wallet
			.as_ref()
			.ok_or_else(|| SyncError::Config("No wallet selected".to_string()))?;
		let wallet = self.get(id)?;
		wallet.balance(selection.account.unwrap_or(0)).await
	}
}

fn collect_failures(
	wallets: &[Arc<dyn Asset>],
	results: Vec<Result<(), SyncError>>,
	action: &str,
) -> Vec<(WalletId, SyncError)> {
	wallets
		.iter()
		.zip(results)
		.filter_map(|(wallet, result)| {
			result.err().map(|e| {
				warn!("Failed to {} wallet {}: {}", action, wallet.record().id, e);
				(wallet.record().id.clone(), e)
			})
		})
		.collect()
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::wallet::{AssetKind, NetworkKind};
	use tempfile::TempDir;

	fn config(dir: &TempDir) -> CoreConfig {
		CoreConfig {
			network: NetworkKind::Simulation,
			data_dir: dir.path().to_path_buf(),
			wallets: vec![
				WalletEntry {
					id: WalletId::from("alpha"),
					name: "Alpha".to_string(),
					kind: AssetKind::Spv,
					watch_only: false,
					birthday_height: 0,
				},
				WalletEntry {
					id: WalletId::from("beta"),
					name: "Beta".to_string(),
					kind: AssetKind::FullNode,
					watch_only: true,
					birthday_height: 10,
				},
			],
			..CoreConfig::default()
		}
	}

	#[tokio::test]
	async fn test_lookup_and_remove() {
		let dir = TempDir::new().unwrap();
		let registry = WalletRegistry::from_config(config(&dir)).unwrap();

		assert_eq!(registry.ids(), vec![WalletId::from("alpha"), WalletId::from("beta")]);
		let beta = registry.get(&WalletId::from("beta")).unwrap();
		assert_eq!(beta.record().kind, AssetKind::FullNode);
		assert_eq!(beta.record().network, NetworkKind::Simulation);
		assert!(!registry.all_synced());

		registry.remove(&WalletId::from("beta")).await.unwrap();
		assert!(matches!(
			registry.get(&WalletId::from("beta")),
			Err(SyncError::UnknownWallet(_))
		));
		assert!(matches!(
			registry.remove(&WalletId::from("beta")).await,
			Err(SyncError::UnknownWallet(_))
		));
	}

	#[tokio::test]
	async fn test_selection_context() {
		let dir = TempDir::new().unwrap();
		let registry = WalletRegistry::from_config(config(&dir)).unwrap();
		let mut selection = SelectionContext::new();

		assert!(registry.selected(&selection).is_none());
		assert!(matches!(
			registry.selected_balance(&selection).await,
			Err(SyncError::Config(_))
		));

		selection.select_wallet(WalletId::from("alpha"));
		selection.select_account(2);
		assert_eq!(registry.selected(&selection).unwrap().record().name, "Alpha");

		// Not started yet, so nothing can be queried
		assert!(matches!(
			registry.selected_balance(&selection).await,
			Err(SyncError::NotConnected(_))
		));

		selection.select_wallet(WalletId::from("beta"));
		assert_eq!(selection.account, None);
		selection.clear();
		assert!(registry.selected(&selection).is_none());
	}

	#[test]
	fn test_duplicate_load_rejected() {
		let dir = TempDir::new().unwrap();
		let config = config(&dir);
		let entry = config.wallets[0].clone();
		let registry = WalletRegistry::from_config(config).unwrap();
		assert!(matches!(registry.load(&entry), Err(SyncError::Config(_))));
	}
}
