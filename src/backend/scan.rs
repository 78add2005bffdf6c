//! Matching of block transactions against the wallet's watched scripts

use crate::backend::store::{Credit, StoreState};
use crate::backend::types::TxRecord;

use bitcoin::{OutPoint, Transaction};
use std::collections::BTreeSet;
use tracing::debug;

/// Scan `txs` against `state`, recording new credits and spends.
///
/// Returns one record per transaction that touched a wallet account, in block order.
pub(crate) fn scan_block(
	state: &mut StoreState,
	txs: &[Transaction],
	height: Option<u32>,
) -> Vec<TxRecord> {
	let mut records = Vec::new();

	for tx in txs {
		let txid = tx.compute_txid();
		let mut accounts = BTreeSet::new();
		let mut spent = 0u64;
		let mut received = 0u64;

		for input in &tx.input {
			if let Some(credit) = state
				.credits
				.iter_mut()
				.find(|c| c.outpoint == input.previous_output && c.spent_by.is_none())
			{
				credit.spent_by = Some(txid);
				credit.spent_height = height;
				spent = spent.saturating_add(credit.value);
				accounts.insert(credit.account);
			}
		}

		for (vout, output) in tx.output.iter().enumerate() {
			let Some(account) = state
				.accounts
				.iter()
				.find(|a| a.scripts.contains(&output.script_pubkey))
				.map(|a| a.number)
			else {
				continue;
			};

			let outpoint = OutPoint::new(txid, vout as u32);
			let value = output.value.to_sat();
			match state.credits.iter_mut().find(|c| c.outpoint == outpoint) {
				// Seen before, e.g. reconnected after a reorg
				Some(existing) => existing.height = height,
				None => state.credits.push(Credit {
					outpoint,
					account,
					value,
					height,
					spent_by: None,
					spent_height: None,
				}),
			}
			received = received.saturating_add(value);
			accounts.insert(account);
		}

		if !accounts.is_empty() {
			debug!(
				"Relevant transaction {} at {:?}: received {} spent {}",
				txid, height, received, spent
			);
			records.push(TxRecord {
				txid,
				block_height: height,
				received,
				spent,
				accounts: accounts.into_iter().collect(),
			});
		}
	}

	records
}

/// Whether scanning `txs` would touch the wallet, without changing `state`
pub(crate) fn is_relevant(state: &StoreState, txs: &[Transaction]) -> bool {
	txs.iter().any(|tx| {
		tx.input.iter().any(|input| {
			state
				.credits
				.iter()
				.any(|c| c.outpoint == input.previous_output && c.spent_by.is_none())
		}) || tx.output.iter().any(|output| {
			state
				.accounts
				.iter()
				.any(|a| a.scripts.contains(&output.script_pubkey))
		})
	})
}
