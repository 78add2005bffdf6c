//! Progress tracking for wallet synchronization.
//!
//! This module provides the `SyncProgressTracker`, which follows one sync session: the
//! heights the backend connected, the best height known on the network, and counts of
//! blocks, relevant transactions and reorgs. The event pump feeds it every raw backend
//! event and derives the `Syncing`/`Synced` state from it.

use tracing::info;

/// Service for tracking synchronization progress
///
/// The wallet counts as synced once the highest processed height has reached the best
/// height reported by the node or sync peer, while that connection is still up.
#[derive(Debug, Clone, Default)]
pub struct SyncProgressTracker {
	/// First height processed in this session
	start_height: Option<u32>,
	/// The highest block height we've processed
	highest_processed_height: Option<u32>,
	/// Best height known on the network
	network_height: Option<u32>,
	/// Whether the node or peer connection is currently up
	connected: bool,
	blocks_processed: usize,
	transactions_processed: usize,
	reorgs: usize,
	/// Last height at which we logged progress
	last_logged_height: u32,
}

impl SyncProgressTracker {
	pub fn new() -> Self {
		Self::default()
	}

	/// Record a connected block and the number of wallet transactions in it
	pub fn record_block(&mut self, height: u32, relevant_transactions: usize) {
		self.start_height.get_or_insert(height);
		self.highest_processed_height = Some(height);
		self.blocks_processed += 1;
		self.transactions_processed += relevant_transactions;
		self.connected = true;
	}

	/// Take the tip already in the store as processed, without counting a block
	pub fn record_baseline(&mut self, height: u32) {
		if self.highest_processed_height.is_none() {
			self.highest_processed_height = Some(height);
			self.last_logged_height = height;
		}
	}

	/// Record that the block at `height` was disconnected by a reorg
	pub fn record_disconnect(&mut self, height: u32) {
		self.highest_processed_height = height.checked_sub(1);
		self.reorgs += 1;
	}

	pub fn record_network_height(&mut self, height: u32) {
		self.network_height = Some(height);
		self.connected = true;
	}

	pub fn record_connection_lost(&mut self) {
		self.connected = false;
	}

	pub fn is_synced(&self) -> bool {
		match (self.highest_processed_height, self.network_height) {
			(Some(processed), Some(network)) => self.connected && processed >= network,
			_ => false,
		}
	}

	/// Log progress every 1000 blocks or when forced
	pub fn log_progress(&mut self, force: bool) {
		let Some(highest) = self.highest_processed_height else {
			return;
		};
		let blocks_since_last_log = highest.saturating_sub(self.last_logged_height);

		if force || blocks_since_last_log >= 1000 {
			info!(
				"Sync progress: height {} of {:?}, {} relevant transactions, {} reorgs",
				highest, self.network_height, self.transactions_processed, self.reorgs
			);
			self.last_logged_height = highest;
		}
	}

	pub fn get_stats(&self) -> SyncStats {
		SyncStats {
			start_height: self.start_height,
			highest_processed_height: self.highest_processed_height,
			network_height: self.network_height,
			blocks_processed: self.blocks_processed,
			transactions_processed: self.transactions_processed,
			reorgs: self.reorgs,
		}
	}
}

/// Statistics about the sync progress
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStats {
	pub start_height: Option<u32>,
	pub highest_processed_height: Option<u32>,
	pub network_height: Option<u32>,
	pub blocks_processed: usize,
	pub transactions_processed: usize,
	pub reorgs: usize,
}

impl SyncStats {
	/// Get a human-readable summary of the sync statistics
	pub fn summary(&self) -> String {
		format!(
			"Sync from {:?} to {:?} of {:?}: {} blocks, {} transactions{}",
			self.start_height,
			self.highest_processed_height,
			self.network_height,
			self.blocks_processed,
			self.transactions_processed,
			if self.reorgs == 0 {
				String::new()
			} else {
				format!(" ({} reorgs)", self.reorgs)
			}
		)
	}
}
