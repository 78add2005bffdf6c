//! Configuration for the sync core and the key/value settings store it reads from.

use crate::wallet::{AssetKind, NetworkKind, SyncError, WalletId, WalletRecord};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info};

/// Settings key holding the network name
pub const NETWORK_KEY: &str = "network";
/// Settings key holding the root storage directory
pub const DATA_DIR_KEY: &str = "data_dir";

/// Full-node RPC endpoint and credentials
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcEndpoint {
	/// HTTP JSON-RPC URL, e.g. `http://127.0.0.1:18334`
	pub url: String,
	/// Websocket notification URL, e.g. `ws://127.0.0.1:18334/ws`
	pub ws_url: String,
	pub user: String,
	pub password: String,
}

impl RpcEndpoint {
	/// Local node on the network's default RPC port
	pub fn local(network: NetworkKind, user: &str, password: &str) -> Self {
		let port = network.default_rpc_port();
		Self {
			url: format!("http://127.0.0.1:{}", port),
			ws_url: format!("ws://127.0.0.1:{}/ws", port),
			user: user.to_string(),
			password: password.to_string(),
		}
	}
}

/// Peer overrides for the SPV backend
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpvOptions {
	/// Peers to try before anything discovered. Replaces the network's default hints.
	pub peers: Vec<String>,
	/// Only ever talk to `peers`, skipping DNS discovery
	pub connect_only: bool,
}

/// A wallet to load at startup
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletEntry {
	pub id: WalletId,
	pub name: String,
	pub kind: AssetKind,
	#[serde(default)]
	pub watch_only: bool,
	/// Height scanning starts from when the wallet has no local state
	#[serde(default)]
	pub birthday_height: u32,
}

impl WalletEntry {
	pub fn record(&self, network: NetworkKind) -> WalletRecord {
		WalletRecord {
			id: self.id.clone(),
			name: self.name.clone(),
			kind: self.kind,
			network,
			watch_only: self.watch_only,
		}
	}
}

/// Sync core configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
	pub network: NetworkKind,
	/// Root directory; each wallet stores its data in `<data_dir>/<wallet id>`
	pub data_dir: PathBuf,
	/// Upper bound on waiting for sync workers to stop
	pub cancel_timeout_ms: u64,
	/// Pending events kept per subscriber before the oldest are dropped
	pub subscriber_queue_depth: usize,
	/// Capacity of the channel between a chain client and the event pump
	pub event_channel_capacity: usize,
	pub required_confirmations: u32,
	pub rpc: Option<RpcEndpoint>,
	pub spv: SpvOptions,
	pub wallets: Vec<WalletEntry>,
}

impl Default for CoreConfig {
	fn default() -> Self {
		Self {
			network: NetworkKind::Test,
			data_dir: PathBuf::from("wallets"),
			cancel_timeout_ms: 10_000,
			subscriber_queue_depth: 256,
			event_channel_capacity: 1024,
			required_confirmations: 1,
			rpc: None,
			spv: SpvOptions::default(),
			wallets: Vec::new(),
		}
	}
}

impl CoreConfig {
	/// Load a JSON configuration file. Missing fields take their defaults.
	pub fn load(path: &Path) -> Result<Self, SyncError> {
		let raw = std::fs::read_to_string(path)
			.map_err(|e| SyncError::Config(format!("Failed to read {:?}: {}", path, e)))?;
		let config = Self::from_json(&raw)?;
		info!("Loaded configuration from {:?}", path);
		Ok(config)
	}

	pub fn from_json(raw: &str) -> Result<Self, SyncError> {
		let config: Self = serde_json::from_str(raw)
			.map_err(|e| SyncError::Config(format!("Invalid configuration: {}", e)))?;
		config.validate()?;
		Ok(config)
	}

	fn validate(&self) -> Result<(), SyncError> {
		if self.subscriber_queue_depth == 0 {
			return Err(SyncError::Config(
				"subscriber_queue_depth must be at least 1".to_string(),
			));
		}
		if self.event_channel_capacity == 0 {
			return Err(SyncError::Config(
				"event_channel_capacity must be at least 1".to_string(),
			));
		}
		let mut ids: Vec<&WalletId> = self.wallets.iter().map(|w| &w.id).collect();
		ids.sort();
		if let Some(pair) = ids.windows(2).find(|pair| pair[0] == pair[1]) {
			return Err(SyncError::Config(format!(
				"Wallet {} is listed more than once",
				pair[0]
			)));
		}
		Ok(())
	}

	pub fn cancel_timeout(&self) -> Duration {
		Duration::from_millis(self.cancel_timeout_ms)
	}

	/// Take the network and storage directory from the settings store, if set there.
	pub fn apply_settings(&mut self, settings: &dyn ConfigStore) -> Result<(), SyncError> {
		if let Some(value) = settings.read_value(NETWORK_KEY) {
			self.network = serde_json::from_value(value)
				.map_err(|e| SyncError::Config(format!("Invalid {}: {}", NETWORK_KEY, e)))?;
		}
		if let Some(value) = settings.read_value(DATA_DIR_KEY) {
			let dir = value.as_str().ok_or_else(|| {
				SyncError::Config(format!("{} must be a string", DATA_DIR_KEY))
			})?;
			self.data_dir = PathBuf::from(dir);
		}
		debug!(
			"Settings applied: network {} data dir {:?}",
			self.network, self.data_dir
		);
		Ok(())
	}

	pub fn wallet_dir(&self, id: &WalletId) -> PathBuf {
		self.data_dir.join(id.as_str())
	}
}

/// Key/value settings owned by the application
pub trait ConfigStore: Send + Sync {
	fn read_value(&self, key: &str) -> Option<Value>;
	fn write_value(&self, key: &str, value: Value) -> Result<(), SyncError>;
}

/// [`ConfigStore`] backed by a JSON object on disk
pub struct FileConfigStore {
	path: PathBuf,
	values: Mutex<Map<String, Value>>,
}

impl FileConfigStore {
	/// Open the settings file, starting empty if it does not exist yet.
	pub fn open(path: impl Into<PathBuf>) -> Result<Self, SyncError> {
		let path = path.into();
		let values = match std::fs::read_to_string(&path) {
			Ok(raw) => serde_json::from_str::<Map<String, Value>>(&raw)
				.map_err(|e| SyncError::Config(format!("Invalid settings file {:?}: {}", path, e)))?,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Map::new(),
			Err(e) => {
				return Err(SyncError::Config(format!(
					"Failed to read settings {:?}: {}",
					path, e
				)));
			}
		};
		Ok(Self {
			path,
			values: Mutex::new(values),
		})
	}

	fn persist(&self, values: &Map<String, Value>) -> Result<(), SyncError> {
		let bytes = serde_json::to_vec_pretty(values)
			.map_err(|e| SyncError::Config(format!("Failed to serialize settings: {}", e)))?;
		let tmp = self.path.with_extension("tmp");
		std::fs::write(&tmp, bytes)
			.and_then(|_| std::fs::rename(&tmp, &self.path))
			.map_err(|e| SyncError::Config(format!("Failed to write settings {:?}: {}", self.path, e)))
	}
}

impl ConfigStore for FileConfigStore {
	fn read_value(&self, key: &str) -> Option<Value> {
		let values = self.values.lock().unwrap_or_else(|p| p.into_inner());
		values.get(key).cloned()
	}

	fn write_value(&self, key: &str, value: Value) -> Result<(), SyncError> {
		let mut values = self.values.lock().unwrap_or_else(|p| p.into_inner());
		values.insert(key.to_string(), value);
		self.persist(&values)
	}
}
