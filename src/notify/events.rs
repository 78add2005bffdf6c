//! Events delivered to wallet subscribers

use crate::backend::TxRecord;

use bitcoin::BlockHash;
use serde::{Deserialize, Serialize};

/// A notification fanned out to every active subscriber of a wallet.
///
/// Events are immutable; each subscriber receives its own clone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NotificationEvent {
	/// A block was attached to the wallet's chain
	BlockAttached { height: u32, hash: BlockHash },
	/// A transaction touching the wallet was found
	NewTransaction { tx: TxRecord },
}

impl NotificationEvent {
	/// Short description for logs
	pub fn description(&self) -> String {
		match self {
			NotificationEvent::BlockAttached { height, hash } => {
				format!("BlockAttached {{ height: {}, hash: {} }}", height, hash)
			}
			NotificationEvent::NewTransaction { tx } => {
				format!("NewTransaction {{ txid: {}, height: {:?} }}", tx.txid, tx.block_height)
			}
		}
	}
}
