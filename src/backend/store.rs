//! Local index database for a wallet backend.
//!
//! Each backend variant owns its own on-disk layout under the wallet directory:
//! the full-node backend keeps a human readable JSON snapshot, the SPV backend a
//! compact bincode snapshot next to its filter state. Both record the same logical
//! content: the synced tip, a bounded window of recent block hashes for reorg
//! handling, the wallet accounts with their watched scripts, and the credits
//! (owned outputs) discovered while scanning.
//!
//! The store directory is guarded by an exclusive file lock held for the lifetime of
//! the handle. [`IndexStore::close`] releases it; the lifecycle manager pushes that
//! call onto its rollback stack as soon as the store is open.

use crate::backend::scan;
use crate::backend::types::{BlockStamp, StoreError, TxRecord};
use crate::wallet::{AccountRecord, AssetKind, NetworkKind};

use bitcoin::{BlockHash, OutPoint, ScriptBuf, Transaction, Txid};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

/// Number of recent block hashes kept for reorg handling and locators
pub const RECENT_WINDOW: usize = 144;

const FORMAT_VERSION: u32 = 2;
const LOCK_FILE: &str = "LOCK";

/// On-disk layout of the index store, one per backend variant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreLayout {
	FullNode,
	Spv,
}

impl StoreLayout {
	pub fn for_kind(kind: AssetKind) -> Self {
		match kind {
			AssetKind::FullNode => StoreLayout::FullNode,
			AssetKind::Spv => StoreLayout::Spv,
		}
	}

	fn dir_name(self) -> &'static str {
		match self {
			StoreLayout::FullNode => "fullnode",
			StoreLayout::Spv => "spv",
		}
	}

	fn file_name(self) -> &'static str {
		match self {
			StoreLayout::FullNode => "wallet.json",
			StoreLayout::Spv => "neutrino.db",
		}
	}

	fn encode(self, state: &StoreState) -> Result<Vec<u8>, StoreError> {
		match self {
			StoreLayout::FullNode => serde_json::to_vec_pretty(state)
				.map_err(|e| StoreError::Corrupt(format!("Failed to serialize store: {}", e))),
			StoreLayout::Spv => bincode::serialize(state)
				.map_err(|e| StoreError::Corrupt(format!("Failed to serialize store: {}", e))),
		}
	}

	fn decode(self, bytes: &[u8]) -> Result<StoreState, StoreError> {
		match self {
			StoreLayout::FullNode => serde_json::from_slice(bytes)
				.map_err(|e| StoreError::Corrupt(format!("Failed to parse store: {}", e))),
			StoreLayout::Spv => bincode::deserialize(bytes)
				.map_err(|e| StoreError::Corrupt(format!("Failed to decode store: {}", e))),
		}
	}
}

/// Options applied when a store is opened
#[derive(Debug, Clone, Copy)]
pub struct StoreOptions {
	/// Height scanning starts from for a fresh store
	pub birthday: u32,
	/// Confirmations before a credit counts as spendable
	pub required_confirmations: u32,
}

impl Default for StoreOptions {
	fn default() -> Self {
		Self {
			birthday: 0,
			required_confirmations: 1,
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct StoredAccount {
	pub number: u32,
	pub name: String,
	pub scripts: Vec<ScriptBuf>,
}

/// An output owned by one of the wallet accounts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Credit {
	pub outpoint: OutPoint,
	pub account: u32,
	pub value: u64,
	pub height: Option<u32>,
	pub spent_by: Option<Txid>,
	/// Height of the block that spent this credit, `None` while unspent or spent unconfirmed
	#[serde(default)]
	pub spent_height: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct StoreState {
	pub version: u32,
	pub network: NetworkKind,
	pub birthday: u32,
	pub tip: Option<BlockStamp>,
	pub recent: BTreeMap<u32, BlockHash>,
	pub accounts: Vec<StoredAccount>,
	pub credits: Vec<Credit>,
	pub updated_at: String,
}

impl StoreState {
	fn new(network: NetworkKind, birthday: u32) -> Self {
		Self {
			version: FORMAT_VERSION,
			network,
			birthday,
			tip: None,
			recent: BTreeMap::new(),
			accounts: vec![StoredAccount {
				number: 0,
				name: "default".to_string(),
				scripts: Vec::new(),
			}],
			credits: Vec::new(),
			updated_at: chrono::Utc::now().to_rfc3339(),
		}
	}

	fn connect(&mut self, stamp: BlockStamp) {
		self.tip = Some(stamp);
		self.recent.insert(stamp.height, stamp.hash);
		while self.recent.len() > RECENT_WINDOW {
			self.recent.pop_first();
		}
	}

	fn account_record(&self, account: &StoredAccount, required_confirmations: u32) -> AccountRecord {
		let tip_height = self.tip.map(|t| t.height);
		let mut total = 0u64;
		let mut spendable = 0u64;

		for credit in self
			.credits
			.iter()
			.filter(|c| c.account == account.number && c.spent_by.is_none())
		{
			total = total.saturating_add(credit.value);
			let confirmations = match (credit.height, tip_height) {
				(Some(h), Some(tip)) if tip >= h => tip - h + 1,
				_ => 0,
			};
			if confirmations >= required_confirmations {
				spendable = spendable.saturating_add(credit.value);
			}
		}

		AccountRecord {
			number: account.number,
			name: account.name.clone(),
			total,
			spendable,
		}
	}
}

/// Handle on an open index store.
///
/// Every accessor fails with [`StoreError::Closed`] once [`IndexStore::close`] ran.
pub struct IndexStore {
	layout: StoreLayout,
	path: PathBuf,
	required_confirmations: u32,
	state: tokio::sync::Mutex<Option<StoreState>>,
	lock: Mutex<Option<File>>,
	closed: AtomicBool,
}

impl IndexStore {
	/// Open (or create) the store for `layout` below `dir` and take its lock.
	pub async fn open(
		dir: &Path,
		layout: StoreLayout,
		network: NetworkKind,
		options: StoreOptions,
	) -> Result<Self, StoreError> {
		let store_dir = dir.join(layout.dir_name());
		tokio::fs::create_dir_all(&store_dir).await?;

		let lock = acquire_lock(&store_dir)?;

		let path = store_dir.join(layout.file_name());
		let state = match tokio::fs::read(&path).await {
			Ok(bytes) => {
				let state = layout.decode(&bytes)?;
				if state.version != FORMAT_VERSION {
					return Err(StoreError::Corrupt(format!(
						"Unsupported store version {}",
						state.version
					)));
				}
				if state.network != network {
					return Err(StoreError::NetworkMismatch {
						expected: network.to_string(),
						found: state.network.to_string(),
					});
				}
				info!(
					"Loaded {:?} store from {:?} at tip {:?}",
					layout,
					path,
					state.tip.map(|t| t.height)
				);
				state
			}
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
				let state = StoreState::new(network, options.birthday);
				write_atomic(&path, &layout.encode(&state)?).await?;
				info!("Created {:?} store at {:?}", layout, path);
				state
			}
			Err(e) => return Err(e.into()),
		};

		Ok(Self {
			layout,
			path,
			required_confirmations: options.required_confirmations,
			state: tokio::sync::Mutex::new(Some(state)),
			lock: Mutex::new(Some(lock)),
			closed: AtomicBool::new(false),
		})
	}

	pub fn layout(&self) -> StoreLayout {
		self.layout
	}

	pub fn path(&self) -> &Path {
		&self.path
	}

	pub fn is_closed(&self) -> bool {
		self.closed.load(Ordering::SeqCst)
	}

	/// Flush and release the store. Safe to call more than once.
	pub async fn close(&self) -> Result<(), StoreError> {
		let flushed = {
			let mut guard = self.state.lock().await;
			match guard.take() {
				Some(state) => write_atomic(&self.path, &self.layout.encode(&state)?).await,
				None => Ok(()),
			}
		};

		let file = match self.lock.lock() {
			Ok(mut guard) => guard.take(),
			Err(poisoned) => poisoned.into_inner().take(),
		};
		if let Some(file) = file {
			if let Err(e) = FileExt::unlock(&file) {
				warn!("Failed to unlock store {:?}: {}", self.path, e);
			}
		}

		if !self.closed.swap(true, Ordering::SeqCst) {
			debug!("Closed store {:?}", self.path);
		}
		flushed
	}

	async fn read<R>(&self, f: impl FnOnce(&StoreState) -> R) -> Result<R, StoreError> {
		let guard = self.state.lock().await;
		let state = guard.as_ref().ok_or(StoreError::Closed)?;
		Ok(f(state))
	}

	/// Apply `f` to a copy of the state and swap it in once the copy is on disk.
	async fn update<R>(&self, f: impl FnOnce(&mut StoreState) -> R) -> Result<R, StoreError> {
		let mut guard = self.state.lock().await;
		let mut next = guard.as_ref().ok_or(StoreError::Closed)?.clone();
		let result = f(&mut next);
		next.updated_at = chrono::Utc::now().to_rfc3339();
		write_atomic(&self.path, &self.layout.encode(&next)?).await?;
		*guard = Some(next);
		Ok(result)
	}

	pub async fn tip(&self) -> Result<Option<BlockStamp>, StoreError> {
		self.read(|s| s.tip).await
	}

	pub async fn birthday(&self) -> Result<u32, StoreError> {
		self.read(|s| s.birthday).await
	}

	pub async fn hash_at(&self, height: u32) -> Result<Option<BlockHash>, StoreError> {
		self.read(|s| s.recent.get(&height).copied()).await
	}

	/// Height of `hash` if it is within the recent window
	pub async fn height_of(&self, hash: &BlockHash) -> Result<Option<u32>, StoreError> {
		self.read(|s| {
			s.recent
				.iter()
				.find(|(_, h)| *h == hash)
				.map(|(height, _)| *height)
		})
		.await
	}

	/// Recent hashes, newest first, for a `getheaders` locator
	pub async fn locator(&self) -> Result<Vec<BlockHash>, StoreError> {
		self.read(|s| s.recent.values().rev().copied().collect()).await
	}

	pub async fn watched_scripts(&self) -> Result<Vec<ScriptBuf>, StoreError> {
		self.read(|s| {
			s.accounts
				.iter()
				.flat_map(|a| a.scripts.iter().cloned())
				.collect()
		})
		.await
	}

	pub async fn accounts(&self) -> Result<Vec<AccountRecord>, StoreError> {
		let required = self.required_confirmations;
		self.read(|s| {
			s.accounts
				.iter()
				.map(|a| s.account_record(a, required))
				.collect()
		})
		.await
	}

	pub async fn account(&self, number: u32) -> Result<Option<AccountRecord>, StoreError> {
		let required = self.required_confirmations;
		self.read(|s| {
			s.accounts
				.iter()
				.find(|a| a.number == number)
				.map(|a| s.account_record(a, required))
		})
		.await
	}

	/// Add an account, or extend an existing one with more watched scripts.
	pub async fn import_account(
		&self,
		number: u32,
		name: &str,
		scripts: Vec<ScriptBuf>,
	) -> Result<(), StoreError> {
		self.update(|s| match s.accounts.iter_mut().find(|a| a.number == number) {
			Some(account) => {
				for script in scripts {
					if !account.scripts.contains(&script) {
						account.scripts.push(script);
					}
				}
			}
			None => {
				s.accounts.push(StoredAccount {
					number,
					name: name.to_string(),
					scripts,
				});
				s.accounts.sort_by_key(|a| a.number);
			}
		})
		.await
	}

	/// Whether any of `txs` pays a watched script or spends a wallet credit
	pub async fn is_relevant(&self, txs: &[Transaction]) -> Result<bool, StoreError> {
		self.read(|s| scan::is_relevant(s, txs)).await
	}

	/// Connect a block on top of the tip, scanning its transactions for wallet activity.
	pub async fn connect_block(
		&self,
		stamp: BlockStamp,
		txs: &[Transaction],
	) -> Result<Vec<TxRecord>, StoreError> {
		self.update(|s| {
			s.connect(stamp);
			scan::scan_block(s, txs, Some(stamp.height))
		})
		.await
	}

	/// Connect a run of headers that carry no wallet activity, with a single write.
	pub async fn connect_headers(&self, stamps: &[BlockStamp]) -> Result<(), StoreError> {
		if stamps.is_empty() {
			return Ok(());
		}
		self.update(|s| {
			for stamp in stamps {
				s.connect(*stamp);
			}
		})
		.await
	}

	/// Disconnect the tip block, returning it.
	///
	/// Credits confirmed in that block become unconfirmed again and spends made by
	/// it are undone, so reconnecting the block rescans both.
	pub async fn disconnect_tip(&self) -> Result<Option<BlockStamp>, StoreError> {
		self.update(|s| {
			let tip = s.tip?;
			s.recent.remove(&tip.height);
			for credit in s.credits.iter_mut() {
				if credit.height == Some(tip.height) {
					credit.height = None;
				}
				if credit.spent_height == Some(tip.height) {
					credit.spent_by = None;
					credit.spent_height = None;
				}
			}
			s.tip = tip.height.checked_sub(1).and_then(|h| {
				s.recent
					.get(&h)
					.map(|hash| BlockStamp { height: h, hash: *hash })
			});
			Some(tip)
		})
		.await
	}
}

fn acquire_lock(store_dir: &Path) -> Result<File, StoreError> {
	let lock_path = store_dir.join(LOCK_FILE);
	let file = OpenOptions::new()
		.read(true)
		.write(true)
		.create(true)
		.truncate(false)
		.open(&lock_path)?;

	file.try_lock_exclusive().map_err(|e| {
		if e.kind() == fs2::lock_contended_error().kind() {
			StoreError::Locked(store_dir.to_path_buf())
		} else {
			StoreError::Io(e)
		}
	})?;

	Ok(file)
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
	let tmp = path.with_extension("tmp");
	tokio::fs::write(&tmp, bytes).await?;
	tokio::fs::rename(&tmp, path).await?;
	Ok(())
}
