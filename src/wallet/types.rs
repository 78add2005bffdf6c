use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Opaque identity of a wallet, unique within a registry
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WalletId(String);

impl WalletId {
	pub fn new(id: impl Into<String>) -> Self {
		Self(id.into())
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for WalletId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl From<&str> for WalletId {
	fn from(value: &str) -> Self {
		Self::new(value)
	}
}

/// Which backend protocol a wallet syncs through.
///
/// Resolved once when the wallet is loaded; callers never branch on it afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetKind {
	/// Connected to a validating full node over RPC
	FullNode,
	/// Compact block filters over direct peer connections
	Spv,
}

impl fmt::Display for AssetKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			AssetKind::FullNode => f.write_str("full-node"),
			AssetKind::Spv => f.write_str("spv"),
		}
	}
}

/// Network a wallet lives on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkKind {
	Main,
	Test,
	/// Private regression/simulation network
	Simulation,
}

impl NetworkKind {
	/// Chain parameters used for wire magic, genesis and address encoding
	pub fn chain(self) -> bitcoin::Network {
		match self {
			NetworkKind::Main => bitcoin::Network::Bitcoin,
			NetworkKind::Test => bitcoin::Network::Testnet,
			NetworkKind::Simulation => bitcoin::Network::Regtest,
		}
	}

	pub fn default_p2p_port(self) -> u16 {
		match self {
			NetworkKind::Main => 8333,
			NetworkKind::Test => 18333,
			NetworkKind::Simulation => 18444,
		}
	}

	pub fn default_rpc_port(self) -> u16 {
		match self {
			NetworkKind::Main => 8334,
			NetworkKind::Test => 18334,
			NetworkKind::Simulation => 18556,
		}
	}
}

impl fmt::Display for NetworkKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			NetworkKind::Main => f.write_str("mainnet"),
			NetworkKind::Test => f.write_str("testnet"),
			NetworkKind::Simulation => f.write_str("simnet"),
		}
	}
}

/// Static identity of a loaded wallet.
///
/// The live sync state and the backend handle are owned by the wallet's sync manager,
/// see [`crate::asset::Asset::sync_state`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletRecord {
	pub id: WalletId,
	pub name: String,
	pub kind: AssetKind,
	pub network: NetworkKind,
	#[serde(default)]
	pub watch_only: bool,
}

/// Balance snapshot of one account, always derived from the live index store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountRecord {
	pub number: u32,
	pub name: String,
	/// Unspent value in satoshis, confirmed or not
	pub total: u64,
	/// Unspent value with enough confirmations to be spent
	pub spendable: u64,
}

/// Errors surfaced to callers of the sync core
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
	#[error("Storage unavailable: {0}")]
	StorageUnavailable(String),

	#[error("Network client initialization failed: {0}")]
	NetworkInitFailed(String),

	#[error("Wallet {0} is already running")]
	AlreadyRunning(WalletId),

	#[error("Wallet {0} is not connected")]
	NotConnected(WalletId),

	#[error("Subscriber {0} is already registered")]
	DuplicateSubscriber(String),

	#[error("Sync worker did not stop within {0:?}, resources were released forcibly")]
	CancellationTimeout(Duration),

	#[error("Start of wallet {0} was cancelled")]
	Cancelled(WalletId),

	#[error("Unknown account {0}")]
	UnknownAccount(u32),

	#[error("Unknown wallet {0}")]
	UnknownWallet(WalletId),

	#[error("Configuration error: {0}")]
	Config(String),
}
