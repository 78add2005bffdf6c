/// Satoshis per coin
pub const SATS_PER_COIN: u64 = 100_000_000;

/// Format a satoshi amount as a coin value with all eight decimals
pub fn format_btc_amount(sats: u64) -> String {
	format!("{}.{:08}", sats / SATS_PER_COIN, sats % SATS_PER_COIN)
}
