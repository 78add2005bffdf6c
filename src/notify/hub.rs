//! Per-wallet fan-out of notification events to named subscribers.
//!
//! Every subscriber owns a private bounded queue. Publishing pushes a clone of the event
//! into each queue without awaiting anything; when a queue is full its oldest pending
//! event is dropped, so a stalled subscriber never holds up the backend or its peers.

use super::events::NotificationEvent;
use crate::wallet::{SyncError, WalletId};

use futures::Stream;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

#[derive(Default)]
struct QueueState {
	events: VecDeque<NotificationEvent>,
	closed: bool,
	dropped: u64,
}

struct SubscriberQueue {
	id: String,
	depth: usize,
	state: Mutex<QueueState>,
	notify: Notify,
}

impl SubscriberQueue {
	fn new(id: &str, depth: usize) -> Self {
		Self {
			id: id.to_string(),
			depth,
			state: Mutex::new(QueueState::default()),
			notify: Notify::new(),
		}
	}

	fn lock(&self) -> MutexGuard<'_, QueueState> {
		self.state.lock().unwrap_or_else(|p| p.into_inner())
	}

	fn push(&self, event: NotificationEvent) -> bool {
		{
			let mut state = self.lock();
			if state.closed {
				return false;
			}
			if state.events.len() >= self.depth {
				state.events.pop_front();
				state.dropped += 1;
				if state.dropped == 1 || state.dropped % 100 == 0 {
					warn!(
						"Subscriber {} is lagging, {} events dropped so far",
						self.id, state.dropped
					);
				}
			}
			state.events.push_back(event);
		}
		self.notify.notify_one();
		true
	}

	fn close(&self) {
		{
			let mut state = self.lock();
			state.closed = true;
			state.events.clear();
		}
		self.notify.notify_one();
	}

	fn is_closed(&self) -> bool {
		self.lock().closed
	}
}

/// Receiving end of one subscription.
///
/// Dropping it deactivates the subscription, which frees its ID for reuse.
pub struct EventReceiver {
	queue: Arc<SubscriberQueue>,
}

impl EventReceiver {
	pub fn id(&self) -> &str {
		&self.queue.id
	}

	/// Next event in publish order, or `None` once the subscription is closed.
	pub async fn recv(&mut self) -> Option<NotificationEvent> {
		loop {
			{
				let mut state = self.queue.lock();
				if let Some(event) = state.events.pop_front() {
					return Some(event);
				}
				if state.closed {
					return None;
				}
			}
			self.queue.notify.notified().await;
		}
	}

	/// Next pending event without waiting
	pub fn try_recv(&mut self) -> Option<NotificationEvent> {
		self.queue.lock().events.pop_front()
	}

	pub fn is_closed(&self) -> bool {
		self.queue.is_closed()
	}

	/// Events discarded because this subscriber fell behind
	pub fn dropped(&self) -> u64 {
		self.queue.lock().dropped
	}

	pub fn into_stream(self) -> impl Stream<Item = NotificationEvent> + Send {
		futures::stream::unfold(self, |mut rx| async move {
			rx.recv().await.map(|event| (event, rx))
		})
	}
}

impl Drop for EventReceiver {
	fn drop(&mut self) {
		self.queue.close();
	}
}

#[derive(Default)]
struct HubState {
	attached: Option<u64>,
	subscribers: HashMap<String, Arc<SubscriberQueue>>,
}

/// Subscriber registry of one wallet
pub struct NotificationHub {
	wallet: WalletId,
	depth: usize,
	state: Mutex<HubState>,
}

impl NotificationHub {
	pub fn new(wallet: WalletId, depth: usize) -> Self {
		Self {
			wallet,
			depth: depth.max(1),
			state: Mutex::new(HubState::default()),
		}
	}

	fn lock(&self) -> MutexGuard<'_, HubState> {
		self.state.lock().unwrap_or_else(|p| p.into_inner())
	}

	/// Register a subscriber under `id`.
	///
	/// # Errors
	/// `DuplicateSubscriber` if a subscriber with that ID is still active.
	pub fn add_listener(&self, id: &str) -> Result<EventReceiver, SyncError> {
		let mut state = self.lock();
		if let Some(existing) = state.subscribers.get(id) {
			if !existing.is_closed() {
				return Err(SyncError::DuplicateSubscriber(id.to_string()));
			}
		}

		let queue = Arc::new(SubscriberQueue::new(id, self.depth));
		state.subscribers.insert(id.to_string(), queue.clone());
		debug!("Subscriber {} added to wallet {}", id, self.wallet);
		Ok(EventReceiver { queue })
	}

	/// Deactivate and close a subscriber. Unknown or repeated IDs are ignored.
	pub fn remove_listener(&self, id: &str) {
		let removed = self.lock().subscribers.remove(id);
		if let Some(queue) = removed {
			queue.close();
			debug!("Subscriber {} removed from wallet {}", id, self.wallet);
		}
	}

	/// Accept events from `generation` from now on
	pub fn attach(&self, generation: u64) {
		self.lock().attached = Some(generation);
		debug!("Hub of wallet {} attached to generation {}", self.wallet, generation);
	}

	pub fn detach(&self, generation: u64) {
		let mut state = self.lock();
		if state.attached == Some(generation) {
			state.attached = None;
			debug!("Hub of wallet {} detached from generation {}", self.wallet, generation);
		}
	}

	pub fn attached(&self) -> Option<u64> {
		self.lock().attached
	}

	/// Deliver `event` to every active subscriber.
	///
	/// Events from a generation other than the attached one are discarded. Returns the
	/// number of subscribers the event was queued for.
	pub fn publish(&self, generation: u64, event: &NotificationEvent) -> usize {
		let mut state = self.lock();
		if state.attached != Some(generation) {
			debug!(
				"Discarding stale {} from generation {} for wallet {}",
				event.description(),
				generation,
				self.wallet
			);
			return 0;
		}

		state.subscribers.retain(|_, queue| !queue.is_closed());
		state
			.subscribers
			.values()
			.filter(|queue| queue.push(event.clone()))
			.count()
	}

	/// Close every subscriber channel and forget them all
	pub fn close_all(&self) {
		let subscribers: Vec<Arc<SubscriberQueue>> =
			self.lock().subscribers.drain().map(|(_, q)| q).collect();
		if !subscribers.is_empty() {
			info!(
				"Closing {} subscribers of wallet {}",
				subscribers.len(),
				self.wallet
			);
		}
		for queue in subscribers {
			queue.close();
		}
	}

	/// Number of active subscribers
	pub fn subscriber_count(&self) -> usize {
		self.lock()
			.subscribers
			.values()
			.filter(|q| !q.is_closed())
			.count()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use bitcoin::BlockHash;
	use bitcoin::hashes::Hash;
	use futures::StreamExt;

	fn block(height: u32) -> NotificationEvent {
		NotificationEvent::BlockAttached {
			height,
			hash: BlockHash::all_zeros(),
		}
	}

	#[tokio::test]
	async fn test_duplicate_and_reuse_after_drop() {
		let hub = NotificationHub::new(WalletId::from("w"), 8);
		let first = hub.add_listener("ui-1").unwrap();
		assert!(matches!(
			hub.add_listener("ui-1"),
			Err(SyncError::DuplicateSubscriber(id)) if id == "ui-1"
		));

		drop(first);
		assert!(hub.add_listener("ui-1").is_ok());
	}

	#[tokio::test]
	async fn test_remove_is_idempotent_and_closes() {
		let hub = NotificationHub::new(WalletId::from("w"), 8);
		hub.attach(1);
		let mut rx = hub.add_listener("a").unwrap();
		hub.publish(1, &block(1));

		hub.remove_listener("a");
		hub.remove_listener("a");
		hub.remove_listener("never-added");

		// Pending events are discarded on close
		assert_eq!(rx.recv().await, None);
		assert!(rx.is_closed());
		assert_eq!(hub.subscriber_count(), 0);
	}

	#[tokio::test]
	async fn test_stale_generation_discarded() {
		let hub = NotificationHub::new(WalletId::from("w"), 8);
		let mut rx = hub.add_listener("a").unwrap();

		assert_eq!(hub.publish(1, &block(1)), 0);
		hub.attach(2);
		assert_eq!(hub.publish(1, &block(1)), 0);
		assert_eq!(hub.publish(2, &block(2)), 1);
		hub.detach(1);
		assert_eq!(hub.attached(), Some(2));
		hub.detach(2);
		assert_eq!(hub.publish(2, &block(3)), 0);

		assert_eq!(rx.try_recv(), Some(block(2)));
		assert_eq!(rx.try_recv(), None);
	}

	#[tokio::test]
	async fn test_slow_subscriber_drops_oldest_only() {
		let hub = NotificationHub::new(WalletId::from("w"), 4);
		hub.attach(1);
		let mut slow = hub.add_listener("slow").unwrap();
		let mut fast = hub.add_listener("fast").unwrap();

		let mut fast_seen = Vec::new();
		for height in 0..10 {
			hub.publish(1, &block(height));
			fast_seen.push(fast.recv().await.unwrap());
		}

		assert_eq!(fast_seen, (0..10).map(block).collect::<Vec<_>>());
		assert_eq!(fast.dropped(), 0);

		assert_eq!(slow.dropped(), 6);
		let mut slow_seen = Vec::new();
		while let Some(event) = slow.try_recv() {
			slow_seen.push(event);
		}
		assert_eq!(slow_seen, (6..10).map(block).collect::<Vec<_>>());
	}

	#[tokio::test]
	async fn test_stream_ends_on_close_all() {
		let hub = Arc::new(NotificationHub::new(WalletId::from("w"), 8));
		hub.attach(1);
		let stream = hub.add_listener("s").unwrap().into_stream();

		let waiter = tokio::spawn(async move { stream.collect::<Vec<_>>().await });
		tokio::task::yield_now().await;
		hub.publish(1, &block(1));
		tokio::time::sleep(std::time::Duration::from_millis(20)).await;
		hub.close_all();

		let received = waiter.await.unwrap();
		assert_eq!(received, vec![block(1)]);
		assert_eq!(hub.subscriber_count(), 0);
	}
}
