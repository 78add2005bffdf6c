//! Utility module for the wallet sync core.
//!
//! Re-exports formatting helpers and the background fetch flag.

/// Utility functions for formatting and display
pub mod index;
/// In-progress flag for background fetches
pub mod fetch;

pub use fetch::{FetchFlag, FetchGuard};
pub use index::format_btc_amount;
