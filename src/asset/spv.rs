//! Wallet synced over compact block filters

use super::{Asset, WalletCore};
use crate::backend::{BackendError, PeerPlan};
use crate::config::SpvOptions;

/// SPV backed wallet
pub struct SpvWallet {
	core: WalletCore,
	options: SpvOptions,
}

impl SpvWallet {
	pub fn new(core: WalletCore, options: SpvOptions) -> Self {
		Self { core, options }
	}

	/// Peers this wallet will try, derived from its network and the configured overrides
	pub fn peer_plan(&self) -> Result<PeerPlan, BackendError> {
		PeerPlan::for_network(self.core.record().network, &self.options)
	}
}

impl Asset for SpvWallet {
	fn core(&self) -> &WalletCore {
		&self.core
	}
}
