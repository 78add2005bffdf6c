//! Wallet synced through a validating full node

use super::{Asset, WalletCore};
use crate::config::RpcEndpoint;

/// Full-node backed wallet
pub struct FullNodeWallet {
	core: WalletCore,
	endpoint: Option<RpcEndpoint>,
}

impl FullNodeWallet {
	pub fn new(core: WalletCore, endpoint: Option<RpcEndpoint>) -> Self {
		Self { core, endpoint }
	}

	/// RPC URL of the node, if one is configured
	pub fn node_url(&self) -> Option<&str> {
		self.endpoint.as_ref().map(|e| e.url.as_str())
	}
}

impl Asset for FullNodeWallet {
	fn core(&self) -> &WalletCore {
		&self.core
	}
}
