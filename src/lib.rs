//! Wallet synchronization core.
//!
//! Keeps a wallet's local index in agreement with the chain through one of two
//! interchangeable backends (a full node over JSON-RPC, or compact block filters over
//! direct peer connections), manages the connection lifecycle with ordered rollback,
//! and fans block and transaction events out to independently registered subscribers.

pub mod asset;
pub mod backend;
pub mod config;
pub mod notify;
pub mod registry;
pub mod utils;
pub mod wallet;

pub use asset::{Asset, FullNodeWallet, SpvWallet, load_asset};
pub use config::{ConfigStore, CoreConfig, FileConfigStore};
pub use notify::{EventReceiver, NotificationEvent, NotificationHub};
pub use registry::{SelectionContext, WalletRegistry};
pub use wallet::sync::{SyncState, SyncStatus};
pub use wallet::{AccountRecord, AssetKind, NetworkKind, SyncError, WalletId, WalletRecord};
