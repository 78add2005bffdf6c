use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Marks a background fetch as running so overlapping fetches can be skipped.
///
/// The flag is cleared when the [`FetchGuard`] returned by [`FetchFlag::begin`] is
/// dropped, whether the fetch succeeded, failed or was cancelled.
#[derive(Debug, Clone, Default)]
pub struct FetchFlag {
	in_progress: Arc<AtomicBool>,
}

impl FetchFlag {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn is_in_progress(&self) -> bool {
		self.in_progress.load(Ordering::SeqCst)
	}

	/// Mark a fetch as started. `None` if one is already running.
	pub fn begin(&self) -> Option<FetchGuard> {
		self.in_progress
			.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
			.ok()
			.map(|_| FetchGuard {
				flag: self.in_progress.clone(),
			})
	}
}

/// Clears its [`FetchFlag`] on drop
#[derive(Debug)]
pub struct FetchGuard {
	flag: Arc<AtomicBool>,
}

impl Drop for FetchGuard {
	fn drop(&mut self) {
		self.flag.store(false, Ordering::SeqCst);
	}
}
