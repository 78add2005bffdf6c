//! Types shared by the backend clients and the local index store

use bitcoin::{BlockHash, Txid};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// A block position on the chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockStamp {
	pub height: u32,
	pub hash: BlockHash,
}

/// A transaction relevant to the wallet, as recorded in the index store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxRecord {
	/// The transaction id.
	pub txid: Txid,
	/// Height of the block containing the transaction, `None` while unconfirmed.
	pub block_height: Option<u32>,
	/// Value received by wallet accounts, in satoshis.
	pub received: u64,
	/// Value of wallet outputs spent by this transaction, in satoshis.
	pub spent: u64,
	/// Account numbers touched by this transaction.
	pub accounts: Vec<u32>,
}

/// Events emitted by a chain client while it drives sync.
///
/// These are the backend's raw stream; the sync manager converts them into
/// notification events and sync-state changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawEvent {
	/// A block was connected to the wallet's tip
	BlockConnected {
		stamp: BlockStamp,
		relevant: Vec<TxRecord>,
	},
	/// The wallet's tip block was disconnected by a reorg
	BlockDisconnected { stamp: BlockStamp },
	/// Best height known on the network (node tip or peer start height)
	NetworkHeight { height: u32 },
	/// The connection to the node or sync peer was lost
	ConnectionLost { reason: String },
}

/// Error types for local index store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
	#[error("Store directory {0} is locked by another process")]
	Locked(PathBuf),

	#[error("Store file is corrupt: {0}")]
	Corrupt(String),

	#[error("Store belongs to {found}, expected {expected}")]
	NetworkMismatch { expected: String, found: String },

	#[error("Store is closed")]
	Closed,

	#[error("IO error: {0}")]
	Io(#[from] std::io::Error),
}

/// Error types for chain client operations
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
	#[error("RPC error: {0}")]
	Rpc(String),

	#[error("No data returned")]
	NoData,

	#[error("WebSocket error: {0}")]
	WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

	#[error("HTTP error: {0}")]
	Http(#[from] reqwest::Error),

	#[error("JSON parse error: {0}")]
	Json(#[from] serde_json::Error),

	#[error("Wire decode error: {0}")]
	Decode(#[from] bitcoin::consensus::encode::Error),

	#[error("IO error: {0}")]
	Io(#[from] std::io::Error),

	#[error("Peer error: {0}")]
	Peer(String),

	#[error("Store error: {0}")]
	Store(#[from] StoreError),

	#[error("Invalid configuration: {0}")]
	Config(String),

	#[error("Event channel closed")]
	ChannelClosed,
}

impl BackendError {
	/// Whether the sync worker should back off and reconnect instead of giving up
	pub fn is_transient(&self) -> bool {
		!matches!(
			self,
			BackendError::Store(_) | BackendError::Config(_) | BackendError::ChannelClosed
		)
	}
}
