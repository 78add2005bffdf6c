//! Ordered release of acquired resources.
//!
//! Every acquisition step of a session pushes the matching release. Draining runs the
//! releases newest first, each exactly once. The stack lock is held for the whole drain,
//! so a second drainer only returns once the first has finished releasing.

use std::future::Future;
use std::pin::Pin;
use tokio::sync::Mutex;
use tracing::debug;

type Release = Pin<Box<dyn Future<Output = ()> + Send>>;

struct Entry {
	label: &'static str,
	release: Release,
}

#[derive(Default)]
struct Inner {
	entries: Vec<Entry>,
	drained: bool,
}

/// Stack of pending releases for one session
#[derive(Default)]
pub struct RollbackStack {
	inner: Mutex<Inner>,
}

impl RollbackStack {
	pub fn new() -> Self {
		Self::default()
	}

	/// Register a release. Once the stack has been drained the release runs immediately.
	pub async fn push<F>(&self, label: &'static str, release: F)
	where
		F: Future<Output = ()> + Send + 'static,
	{
		let mut inner = self.inner.lock().await;
		if inner.drained {
			drop(inner);
			debug!("Releasing {} immediately, session already torn down", label);
			release.await;
			return;
		}
		inner.entries.push(Entry {
			label,
			release: Box::pin(release),
		});
	}

	/// Run every pending release in reverse push order. Returns how many ran.
	pub async fn drain(&self) -> usize {
		let mut inner = self.inner.lock().await;
		inner.drained = true;

		let mut released = 0;
		while let Some(entry) = inner.entries.pop() {
			debug!("Releasing {}", entry.label);
			entry.release.await;
			released += 1;
		}
		released
	}

	pub async fn len(&self) -> usize {
		self.inner.lock().await.entries.len()
	}

	pub async fn is_drained(&self) -> bool {
		self.inner.lock().await.drained
	}
}
