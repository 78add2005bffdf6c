//! Wallet Synchronization Module
//!
//! This module owns the connection lifecycle of one wallet:
//!
//! - `manager`: `SyncManager`, the start/cancel state machine and its background tasks.
//! - `lifecycle`: the per-generation token (cancellation, rollback stack, worker set).
//! - `rollback`: the ordered stack of release actions run on failure or cancellation.
//! - `progress_tracker`: tracks processed and network heights to decide when the wallet is synced.

/// Per-generation session token
pub mod lifecycle;
/// Start/cancel state machine
pub mod manager;
/// Tracks synchronization progress and statistics
pub mod progress_tracker;
/// Ordered release of acquired resources
pub mod rollback;

pub use manager::{ManagerSettings, SyncManager};
pub use progress_tracker::SyncStats;

use serde::{Deserialize, Serialize};
use std::fmt;

/// Connection state of a wallet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
	Disconnected,
	/// Backend connection is being opened
	Opening,
	Syncing,
	Synced,
	/// Teardown in progress
	Cancelling,
}

impl SyncState {
	/// Whether a backend session exists (or is being set up)
	pub fn is_active(self) -> bool {
		!matches!(self, SyncState::Disconnected)
	}

	pub fn is_connected(self) -> bool {
		matches!(self, SyncState::Syncing | SyncState::Synced)
	}
}

impl fmt::Display for SyncState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let name = match self {
			SyncState::Disconnected => "disconnected",
			SyncState::Opening => "opening",
			SyncState::Syncing => "syncing",
			SyncState::Synced => "synced",
			SyncState::Cancelling => "cancelling",
		};
		f.write_str(name)
	}
}

/// State snapshot published on the wallet's watch channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncStatus {
	/// Generation of the session the state belongs to; 0 before the first start
	pub generation: u64,
	pub state: SyncState,
}

impl Default for SyncStatus {
	fn default() -> Self {
		Self {
			generation: 0,
			state: SyncState::Disconnected,
		}
	}
}
