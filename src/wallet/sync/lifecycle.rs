//! One generation of a running sync session.

use super::rollback::RollbackStack;

use std::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Default)]
struct Workers {
	handles: Vec<JoinHandle<()>>,
	sealed: bool,
}

/// Cancellation signal, rollback stack and worker tasks of one session.
///
/// A fresh token is created by every successful transition out of `Disconnected`;
/// its generation number is what the event pump and the hub compare against to
/// discard output from an older session.
pub struct LifecycleToken {
	generation: u64,
	cancel: CancellationToken,
	rollback: RollbackStack,
	workers: Mutex<Workers>,
}

impl LifecycleToken {
	pub fn new(generation: u64) -> Self {
		Self {
			generation,
			cancel: CancellationToken::new(),
			rollback: RollbackStack::new(),
			workers: Mutex::new(Workers::default()),
		}
	}

	pub fn generation(&self) -> u64 {
		self.generation
	}

	pub fn cancel_token(&self) -> &CancellationToken {
		&self.cancel
	}

	pub fn cancel(&self) {
		self.cancel.cancel();
	}

	pub fn is_cancelled(&self) -> bool {
		self.cancel.is_cancelled()
	}

	pub fn rollback(&self) -> &RollbackStack {
		&self.rollback
	}

	/// Hand the session's tasks to the token.
	///
	/// Returns `false` and aborts them if the token was already torn down.
	pub fn install_workers(&self, handles: Vec<JoinHandle<()>>) -> bool {
		let mut workers = self.workers.lock().unwrap_or_else(|p| p.into_inner());
		if workers.sealed {
			debug!(
				"Generation {} already torn down, aborting {} late workers",
				self.generation,
				handles.len()
			);
			for handle in handles {
				handle.abort();
			}
			return false;
		}
		workers.handles.extend(handles);
		true
	}

	/// Take the tasks for joining. Later installs are refused.
	pub fn take_workers(&self) -> Vec<JoinHandle<()>> {
		let mut workers = self.workers.lock().unwrap_or_else(|p| p.into_inner());
		workers.sealed = true;
		std::mem::take(&mut workers.handles)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn test_install_after_take_is_refused() {
		let token = LifecycleToken::new(3);
		assert!(token.install_workers(vec![tokio::spawn(async {})]));
		assert_eq!(token.take_workers().len(), 1);

		let late = tokio::spawn(async {
			tokio::time::sleep(std::time::Duration::from_secs(60)).await;
		});
		assert!(!token.install_workers(vec![late]));
		assert!(token.take_workers().is_empty());
		assert_eq!(token.generation(), 3);
	}
}
