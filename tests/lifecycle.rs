//! Start/cancel lifecycle tests against a scripted backend.
//!
//! The mock connector opens a real index store in a temp directory and hands out
//! chain clients whose raw events are fed by the test.

use async_trait::async_trait;
use bitcoin::BlockHash;
use bitcoin::hashes::Hash;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::{Mutex, mpsc};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use wallet_sync_core::backend::{
	BackendConnector, BackendError, BackendParams, BlockStamp, ChainClient, DefaultConnector,
	IndexStore, RawEvent,
};
use wallet_sync_core::config::WalletEntry;
use wallet_sync_core::{
	Asset, AssetKind, CoreConfig, EventReceiver, NetworkKind, NotificationEvent, SyncError,
	SyncState, WalletId, WalletRegistry, load_asset,
};

type Feed = mpsc::UnboundedReceiver<RawEvent>;

struct MockClient {
	store: Arc<IndexStore>,
	feed: Mutex<Option<Feed>>,
	ignore_cancel: bool,
	log: Arc<StdMutex<Vec<String>>>,
}

#[async_trait]
impl ChainClient for MockClient {
	fn name(&self) -> &str {
		"mock"
	}

	async fn run(
		&self,
		_store: Arc<IndexStore>,
		events: mpsc::Sender<RawEvent>,
		cancel: CancellationToken,
	) -> Result<(), BackendError> {
		let mut feed = self.feed.lock().await;
		loop {
			tokio::select! {
				_ = cancel.cancelled() => {
					if self.ignore_cancel {
						std::future::pending::<()>().await;
					}
					return Ok(());
				}
				event = recv_feed(&mut feed) => match event {
					Some(event) => {
						events.send(event).await.map_err(|_| BackendError::ChannelClosed)?;
					}
					None => {
						*feed = None;
					}
				}
			}
		}
	}

	async fn stop(&self) {
		let state = if self.store.is_closed() { "closed" } else { "open" };
		self.log
			.lock()
			.unwrap()
			.push(format!("stop client (store {})", state));
	}

	fn peer_count(&self) -> u32 {
		1
	}
}

// Pends forever once the test drops its sender
async fn recv_feed(feed: &mut Option<Feed>) -> Option<RawEvent> {
	match feed.as_mut() {
		Some(feed) => feed.recv().await,
		None => std::future::pending().await,
	}
}

#[derive(Default)]
struct MockConnector {
	fail_client: bool,
	ignore_cancel: bool,
	client_delay: Option<Duration>,
	feeds: StdMutex<VecDeque<Feed>>,
	stores: StdMutex<Vec<Arc<IndexStore>>>,
	log: Arc<StdMutex<Vec<String>>>,
}

impl MockConnector {
	/// Queue the event feed for the next client this connector opens
	fn feed(&self) -> mpsc::UnboundedSender<RawEvent> {
		let (tx, rx) = mpsc::unbounded_channel();
		self.feeds.lock().unwrap().push_back(rx);
		tx
	}

	fn last_store(&self) -> Arc<IndexStore> {
		self.stores.lock().unwrap().last().cloned().unwrap()
	}

	fn log(&self) -> Vec<String> {
		self.log.lock().unwrap().clone()
	}
}

#[async_trait]
impl BackendConnector for MockConnector {
	async fn open_store(&self, params: &BackendParams) -> Result<Arc<IndexStore>, SyncError> {
		let store = DefaultConnector.open_store(params).await?;
		self.stores.lock().unwrap().push(store.clone());
		self.log.lock().unwrap().push("open store".to_string());
		Ok(store)
	}

	async fn open_client(
		&self,
		_params: &BackendParams,
		store: Arc<IndexStore>,
	) -> Result<Arc<dyn ChainClient>, SyncError> {
		if let Some(delay) = self.client_delay {
			tokio::time::sleep(delay).await;
		}
		if self.fail_client {
			return Err(SyncError::NetworkInitFailed("no peers".to_string()));
		}
		self.log.lock().unwrap().push("open client".to_string());
		Ok(Arc::new(MockClient {
			store,
			feed: Mutex::new(self.feeds.lock().unwrap().pop_front()),
			ignore_cancel: self.ignore_cancel,
			log: self.log.clone(),
		}))
	}
}

struct Harness {
	_dir: TempDir,
	config: CoreConfig,
	connector: Arc<MockConnector>,
	wallet: Arc<dyn Asset>,
}

fn entry(id: &str) -> WalletEntry {
	WalletEntry {
		id: WalletId::from(id),
		name: format!("Wallet {}", id),
		kind: AssetKind::Spv,
		watch_only: false,
		birthday_height: 0,
	}
}

fn harness(connector: MockConnector, tune: impl FnOnce(&mut CoreConfig)) -> Harness {
	let dir = TempDir::new().unwrap();
	let mut config = CoreConfig {
		network: NetworkKind::Simulation,
		data_dir: dir.path().to_path_buf(),
		..CoreConfig::default()
	};
	tune(&mut config);

	let connector = Arc::new(connector);
	let wallet = load_asset(
		entry("w1").record(config.network),
		0,
		&config,
		connector.clone(),
	);
	Harness {
		_dir: dir,
		config,
		connector,
		wallet,
	}
}

fn store_params(h: &Harness) -> BackendParams {
	BackendParams {
		kind: AssetKind::Spv,
		network: NetworkKind::Simulation,
		dir: h.config.wallet_dir(&WalletId::from("w1")),
		store: Default::default(),
		rpc: None,
		spv: Default::default(),
	}
}

fn stamp(height: u32) -> BlockStamp {
	BlockStamp {
		height,
		hash: BlockHash::from_byte_array([height as u8; 32]),
	}
}

fn connected(height: u32) -> RawEvent {
	RawEvent::BlockConnected {
		stamp: stamp(height),
		relevant: Vec::new(),
	}
}

fn attached(height: u32) -> NotificationEvent {
	NotificationEvent::BlockAttached {
		height,
		hash: stamp(height).hash,
	}
}

async fn next(rx: &mut EventReceiver) -> Option<NotificationEvent> {
	timeout(Duration::from_secs(2), rx.recv())
		.await
		.expect("no event within 2s")
}

async fn wait_state(wallet: &Arc<dyn Asset>, state: SyncState) {
	let mut rx = wallet.watch_state();
	timeout(Duration::from_secs(2), rx.wait_for(|s| s.state == state))
		.await
		.expect("state not reached within 2s")
		.unwrap();
}

#[tokio::test]
async fn test_subscriber_receives_block_and_id_is_reusable_after_cancel() {
	let h = harness(MockConnector::default(), |_| {});
	let feed = h.connector.feed();

	h.wallet.start().await.unwrap();
	assert_eq!(h.wallet.sync_state(), SyncState::Syncing);

	let mut rx = h.wallet.subscribe("ui-1").unwrap();
	feed.send(connected(100)).unwrap();
	assert_eq!(next(&mut rx).await, Some(attached(100)));

	tokio::time::sleep(Duration::from_millis(50)).await;
	assert_eq!(rx.try_recv(), None);

	h.wallet.cancel().await.unwrap();
	assert_eq!(h.wallet.sync_state(), SyncState::Disconnected);
	assert_eq!(next(&mut rx).await, None);
	assert!(h.wallet.subscribe("ui-1").is_ok());
}

#[tokio::test]
async fn test_second_start_is_refused() {
	let h = harness(MockConnector::default(), |_| {});

	h.wallet.start().await.unwrap();
	let generation = h.wallet.watch_state().borrow().generation;

	assert!(matches!(h.wallet.start().await, Err(SyncError::AlreadyRunning(_))));
	assert_eq!(h.wallet.watch_state().borrow().generation, generation);
	assert_eq!(h.wallet.sync_state(), SyncState::Syncing);

	h.wallet.cancel().await.unwrap();
}

#[tokio::test]
async fn test_client_failure_releases_store() {
	let connector = MockConnector {
		fail_client: true,
		..MockConnector::default()
	};
	let h = harness(connector, |_| {});

	let result = h.wallet.start().await;
	assert!(matches!(result, Err(SyncError::NetworkInitFailed(_))));
	assert_eq!(h.wallet.sync_state(), SyncState::Disconnected);
	assert!(h.connector.last_store().is_closed());
	assert!(h.wallet.core().manager().hub().attached().is_none());

	// The directory lock went with the store, so it can be opened again
	let reopened = DefaultConnector.open_store(&store_params(&h)).await.unwrap();
	assert!(!reopened.is_closed());
}

#[tokio::test]
async fn test_cancel_releases_in_reverse_order() {
	let h = harness(MockConnector::default(), |_| {});

	h.wallet.start().await.unwrap();
	let store = h.connector.last_store();
	assert!(!store.is_closed());

	h.wallet.cancel().await.unwrap();
	assert!(store.is_closed());
	assert_eq!(
		h.connector.log(),
		vec!["open store", "open client", "stop client (store open)"]
	);
	assert!(h.wallet.core().manager().hub().attached().is_none());
}

#[tokio::test]
async fn test_new_generation_is_isolated_from_the_old_one() {
	let h = harness(MockConnector::default(), |_| {});
	let first_feed = h.connector.feed();

	h.wallet.start().await.unwrap();
	let mut old = h.wallet.subscribe("a").unwrap();
	first_feed.send(connected(1)).unwrap();
	assert_eq!(next(&mut old).await, Some(attached(1)));
	h.wallet.cancel().await.unwrap();

	let second_feed = h.connector.feed();
	h.wallet.start().await.unwrap();
	assert_eq!(h.wallet.watch_state().borrow().generation, 2);
	assert_eq!(h.wallet.sync_stats().highest_processed_height, None);

	let mut new = h.wallet.subscribe("a").unwrap();
	let hub = h.wallet.core().manager().hub().clone();
	assert_eq!(hub.publish(1, &attached(99)), 0);

	second_feed.send(connected(2)).unwrap();
	assert_eq!(next(&mut new).await, Some(attached(2)));
	assert_eq!(next(&mut old).await, None);

	h.wallet.cancel().await.unwrap();
}

#[tokio::test]
async fn test_duplicate_subscriber_rejected_while_active() {
	let h = harness(MockConnector::default(), |_| {});

	let first = h.wallet.subscribe("ui").unwrap();
	assert!(matches!(
		h.wallet.subscribe("ui"),
		Err(SyncError::DuplicateSubscriber(id)) if id == "ui"
	));

	h.wallet.unsubscribe("ui");
	assert!(first.is_closed());
	assert!(h.wallet.subscribe("ui").is_ok());
}

#[tokio::test]
async fn test_slow_subscriber_does_not_hold_up_fast_one() {
	let h = harness(MockConnector::default(), |config| config.subscriber_queue_depth = 4);
	let feed = h.connector.feed();

	h.wallet.start().await.unwrap();
	let mut slow = h.wallet.subscribe("slow").unwrap();
	let mut fast = h.wallet.subscribe("fast").unwrap();

	for height in 1..=10 {
		feed.send(connected(height)).unwrap();
	}
	for height in 1..=10 {
		assert_eq!(next(&mut fast).await, Some(attached(height)));
	}

	assert_eq!(slow.dropped(), 6);
	for height in 7..=10 {
		assert_eq!(slow.try_recv(), Some(attached(height)));
	}
	assert_eq!(slow.try_recv(), None);

	h.wallet.cancel().await.unwrap();
}

#[tokio::test]
async fn test_synced_follows_network_height_and_connection() {
	let h = harness(MockConnector::default(), |_| {});
	let feed = h.connector.feed();

	h.wallet.start().await.unwrap();
	feed.send(RawEvent::NetworkHeight { height: 101 }).unwrap();
	feed.send(connected(100)).unwrap();
	feed.send(connected(101)).unwrap();
	wait_state(&h.wallet, SyncState::Synced).await;
	assert!(h.wallet.is_synced());

	feed.send(RawEvent::ConnectionLost {
		reason: "peer went away".to_string(),
	})
	.unwrap();
	wait_state(&h.wallet, SyncState::Syncing).await;

	let stats = h.wallet.sync_stats();
	assert_eq!(stats.highest_processed_height, Some(101));
	assert_eq!(stats.network_height, Some(101));

	h.wallet.cancel().await.unwrap();
	assert!(!h.wallet.is_synced());
}

#[tokio::test]
async fn test_up_to_date_store_is_synced_without_new_blocks() {
	let h = harness(MockConnector::default(), |_| {});
	let store = DefaultConnector.open_store(&store_params(&h)).await.unwrap();
	let stamps: Vec<BlockStamp> = (1..=5).map(stamp).collect();
	store.connect_headers(&stamps).await.unwrap();
	store.close().await.unwrap();

	let feed = h.connector.feed();
	h.wallet.start().await.unwrap();
	feed.send(RawEvent::NetworkHeight { height: 5 }).unwrap();
	wait_state(&h.wallet, SyncState::Synced).await;
	assert!(h.wallet.is_synced());

	let stats = h.wallet.sync_stats();
	assert_eq!(stats.highest_processed_height, Some(5));
	assert_eq!(stats.blocks_processed, 0);

	h.wallet.cancel().await.unwrap();
}

#[tokio::test]
async fn test_cancel_is_idempotent_and_concurrent_cancels_agree() {
	let h = harness(MockConnector::default(), |_| {});

	h.wallet.cancel().await.unwrap();

	h.wallet.start().await.unwrap();
	let (first, second) = tokio::join!(h.wallet.cancel(), h.wallet.cancel());
	first.unwrap();
	second.unwrap();
	assert_eq!(h.wallet.sync_state(), SyncState::Disconnected);
	assert_eq!(
		h.connector
			.log()
			.iter()
			.filter(|l| l.starts_with("stop client"))
			.count(),
		1
	);

	h.wallet.cancel().await.unwrap();
}

#[tokio::test]
async fn test_stuck_worker_times_out_but_still_disconnects() {
	let connector = MockConnector {
		ignore_cancel: true,
		..MockConnector::default()
	};
	let h = harness(connector, |config| config.cancel_timeout_ms = 100);

	h.wallet.start().await.unwrap();
	let store = h.connector.last_store();

	let result = h.wallet.cancel().await;
	assert!(matches!(result, Err(SyncError::CancellationTimeout(t)) if t == Duration::from_millis(100)));
	assert_eq!(h.wallet.sync_state(), SyncState::Disconnected);
	assert!(store.is_closed());

	// A fresh start works after the forced teardown
	h.wallet.start().await.unwrap();
	assert_eq!(h.wallet.sync_state(), SyncState::Syncing);
}

#[tokio::test]
async fn test_cancel_during_open_rolls_back_late_client() {
	let connector = MockConnector {
		client_delay: Some(Duration::from_millis(200)),
		..MockConnector::default()
	};
	let h = harness(connector, |_| {});

	let starting = {
		let wallet = h.wallet.clone();
		tokio::spawn(async move { wallet.start().await })
	};
	wait_state(&h.wallet, SyncState::Opening).await;
	tokio::time::sleep(Duration::from_millis(50)).await;

	h.wallet.cancel().await.unwrap();
	assert_eq!(h.wallet.sync_state(), SyncState::Disconnected);

	let result = starting.await.unwrap();
	assert!(matches!(result, Err(SyncError::Cancelled(_))));
	assert_eq!(h.wallet.sync_state(), SyncState::Disconnected);
	assert!(h.connector.last_store().is_closed());
	// The client arrived after the teardown and was stopped straight away
	assert_eq!(
		h.connector.log(),
		vec!["open store", "open client", "stop client (store closed)"]
	);
}

#[tokio::test]
async fn test_store_queries_need_a_connection() {
	let h = harness(MockConnector::default(), |_| {});

	assert!(matches!(h.wallet.balance(0).await, Err(SyncError::NotConnected(_))));
	assert_eq!(h.wallet.peer_count().await, 0);

	h.wallet.start().await.unwrap();
	let balance = h.wallet.balance(0).await.unwrap();
	assert_eq!(balance.number, 0);
	assert_eq!(balance.total, 0);
	assert!(matches!(h.wallet.balance(7).await, Err(SyncError::UnknownAccount(7))));
	assert_eq!(h.wallet.peer_count().await, 1);

	h.wallet.cancel().await.unwrap();
	assert!(matches!(h.wallet.accounts().await, Err(SyncError::NotConnected(_))));
}

#[tokio::test]
async fn test_registry_tracks_every_wallet() {
	let dir = TempDir::new().unwrap();
	let config = CoreConfig {
		network: NetworkKind::Simulation,
		data_dir: dir.path().to_path_buf(),
		..CoreConfig::default()
	};
	let connector = Arc::new(MockConnector::default());
	let feed = connector.feed();
	let registry = WalletRegistry::new(config, connector.clone());
	let wallet = registry.load(&entry("solo")).unwrap();

	assert!(registry.start_all().await.is_empty());
	assert!(!registry.all_synced());

	feed.send(RawEvent::NetworkHeight { height: 5 }).unwrap();
	feed.send(connected(5)).unwrap();
	wait_state(&wallet, SyncState::Synced).await;
	assert!(registry.all_synced());

	assert!(registry.cancel_all().await.is_empty());
	assert!(!registry.all_synced());
}
