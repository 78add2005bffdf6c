//! Start/cancel state machine for one wallet's backend session.
//!
//! `start` opens the backend, attaches the notification hub and spawns two tasks: the
//! worker, which drives the chain client and reconnects with exponential backoff on
//! transient failures, and the event pump, which turns raw backend events into
//! progress, state changes and subscriber notifications. `cancel` signals the session,
//! joins both tasks within the configured timeout and releases everything in reverse
//! acquisition order.

use super::lifecycle::LifecycleToken;
use super::progress_tracker::{SyncProgressTracker, SyncStats};
use super::{SyncState, SyncStatus};
use crate::backend::{Backend, BackendConnector, BackendParams, RawEvent};
use crate::config::CoreConfig;
use crate::notify::{NotificationEvent, NotificationHub};
use crate::wallet::{SyncError, WalletId};

use backoff::ExponentialBackoffBuilder;
use backoff::backoff::Backoff;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// A client session lasting this long resets the reconnect backoff
const STABLE_SESSION: Duration = Duration::from_secs(60);

/// Tunables of a sync manager
#[derive(Debug, Clone)]
pub struct ManagerSettings {
	/// Upper bound on waiting for the worker tasks during cancel
	pub cancel_timeout: Duration,
	pub event_channel_capacity: usize,
	pub initial_backoff: Duration,
	pub max_backoff: Duration,
}

impl Default for ManagerSettings {
	fn default() -> Self {
		Self {
			cancel_timeout: Duration::from_secs(10),
			event_channel_capacity: 1024,
			initial_backoff: Duration::from_secs(1),
			max_backoff: Duration::from_secs(60),
		}
	}
}

impl ManagerSettings {
	pub fn from_config(config: &CoreConfig) -> Self {
		Self {
			cancel_timeout: config.cancel_timeout(),
			event_channel_capacity: config.event_channel_capacity,
			..Self::default()
		}
	}
}

#[derive(Default)]
struct Slot {
	generation: u64,
	token: Option<Arc<LifecycleToken>>,
	backend: Option<Backend>,
}

#[derive(Default)]
struct GenerationProgress {
	generation: u64,
	tracker: SyncProgressTracker,
}

/// Owns the backend session of one wallet
pub struct SyncManager {
	wallet: WalletId,
	params: BackendParams,
	connector: Arc<dyn BackendConnector>,
	hub: Arc<NotificationHub>,
	settings: ManagerSettings,
	slot: Mutex<Slot>,
	status: Arc<watch::Sender<SyncStatus>>,
	progress: Arc<StdMutex<GenerationProgress>>,
}

impl SyncManager {
	pub fn new(
		wallet: WalletId,
		params: BackendParams,
		connector: Arc<dyn BackendConnector>,
		hub: Arc<NotificationHub>,
		settings: ManagerSettings,
	) -> Self {
		let (status, _) = watch::channel(SyncStatus::default());
		Self {
			wallet,
			params,
			connector,
			hub,
			settings,
			slot: Mutex::new(Slot::default()),
			status: Arc::new(status),
			progress: Arc::new(StdMutex::new(GenerationProgress::default())),
		}
	}

	pub fn wallet(&self) -> &WalletId {
		&self.wallet
	}

	pub fn hub(&self) -> &Arc<NotificationHub> {
		&self.hub
	}

	pub fn status(&self) -> SyncStatus {
		*self.status.borrow()
	}

	pub fn state(&self) -> SyncState {
		self.status.borrow().state
	}

	/// Watch state changes
	pub fn watch(&self) -> watch::Receiver<SyncStatus> {
		self.status.subscribe()
	}

	pub fn stats(&self) -> SyncStats {
		self.progress
			.lock()
			.unwrap_or_else(|p| p.into_inner())
			.tracker
			.get_stats()
	}

	/// Handle on the live backend, for the duration of one query
	pub async fn backend(&self) -> Result<Backend, SyncError> {
		let slot = self.slot.lock().await;
		match (&slot.backend, self.state().is_connected()) {
			(Some(backend), true) => Ok(backend.clone()),
			_ => Err(SyncError::NotConnected(self.wallet.clone())),
		}
	}

	/// Open the backend and start syncing.
	///
	/// # Errors
	/// * `AlreadyRunning` unless the wallet is `Disconnected`; nothing changes.
	/// * `StorageUnavailable` / `NetworkInitFailed` from the backend open.
	/// * `Cancelled` when a concurrent `cancel` interrupted the start.
	///
	/// On any error every resource acquired so far has been released and the wallet
	/// is back in `Disconnected`.
	pub async fn start(&self) -> Result<(), SyncError> {
		let token = {
			let mut slot = self.slot.lock().await;
			let current = self.status();
			if current.state != SyncState::Disconnected {
				debug!(
					"Start of wallet {} refused in state {}",
					self.wallet, current.state
				);
				return Err(SyncError::AlreadyRunning(self.wallet.clone()));
			}

			slot.generation += 1;
			let token = Arc::new(LifecycleToken::new(slot.generation));
			slot.token = Some(token.clone());
			slot.backend = None;
			*self.progress.lock().unwrap_or_else(|p| p.into_inner()) = GenerationProgress {
				generation: slot.generation,
				tracker: SyncProgressTracker::new(),
			};
			self.status.send_replace(SyncStatus {
				generation: slot.generation,
				state: SyncState::Opening,
			});
			token
		};

		info!(
			"Starting {} sync for wallet {} (generation {})",
			self.params.kind,
			self.wallet,
			token.generation()
		);

		match self.open_session(&token).await {
			Ok(()) => Ok(()),
			Err(e) => {
				warn!("Start of wallet {} failed: {}", self.wallet, e);
				token.cancel();
				for handle in token.take_workers() {
					handle.abort();
				}
				let released = token.rollback().drain().await;
				debug!("Rolled back {} resources of wallet {}", released, self.wallet);
				self.finish_failed_start(token.generation()).await;
				Err(e)
			}
		}
	}

	async fn open_session(&self, token: &Arc<LifecycleToken>) -> Result<(), SyncError> {
		let generation = token.generation();

		let backend = Backend::open(self.connector.as_ref(), &self.params, token.rollback()).await?;
		self.ensure_live(token)?;

		// Blocks already in the store count as processed, so a wallet with nothing
		// to catch up turns synced on the first network height.
		let stored_tip = backend
			.store
			.tip()
			.await
			.map_err(|e| SyncError::StorageUnavailable(e.to_string()))?;
		if let Some(tip) = stored_tip {
			let mut progress = self.progress.lock().unwrap_or_else(|p| p.into_inner());
			if progress.generation == generation {
				progress.tracker.record_baseline(tip.height);
			}
		}

		self.hub.attach(generation);
		{
			let hub = self.hub.clone();
			token
				.rollback()
				.push("detach notification hub", async move { hub.detach(generation) })
				.await;
		}

		let (events_tx, events_rx) = mpsc::channel(self.settings.event_channel_capacity.max(1));
		let worker = tokio::spawn(run_worker(
			self.wallet.clone(),
			backend.clone(),
			events_tx,
			token.cancel_token().clone(),
			self.settings.clone(),
		));
		let pump = EventPump {
			wallet: self.wallet.clone(),
			generation,
			status: self.status.clone(),
			hub: self.hub.clone(),
			progress: self.progress.clone(),
		};
		let pump = tokio::spawn(pump.run(events_rx));

		if !token.install_workers(vec![worker, pump]) {
			return Err(SyncError::Cancelled(self.wallet.clone()));
		}

		let mut slot = self.slot.lock().await;
		if slot.generation != generation {
			return Err(SyncError::Cancelled(self.wallet.clone()));
		}
		self.ensure_live(token)?;
		slot.backend = Some(backend);

		let synced = self
			.progress
			.lock()
			.unwrap_or_else(|p| p.into_inner())
			.tracker
			.is_synced();
		let next = if synced {
			SyncState::Synced
		} else {
			SyncState::Syncing
		};
		self.status.send_if_modified(|s| {
			if s.generation == generation && s.state == SyncState::Opening {
				s.state = next;
				true
			} else {
				false
			}
		});

		info!(
			"Wallet {} connected via {} (generation {})",
			self.wallet, self.params.kind, generation
		);
		Ok(())
	}

	fn ensure_live(&self, token: &LifecycleToken) -> Result<(), SyncError> {
		if token.is_cancelled() {
			return Err(SyncError::Cancelled(self.wallet.clone()));
		}
		Ok(())
	}

	// A concurrent cancel owns the transition out of `Cancelling`
	async fn finish_failed_start(&self, generation: u64) {
		let mut slot = self.slot.lock().await;
		if slot.generation != generation {
			return;
		}
		let reset = self.status.send_if_modified(|s| {
			if s.generation == generation && s.state == SyncState::Opening {
				s.state = SyncState::Disconnected;
				true
			} else {
				false
			}
		});
		if reset {
			slot.token = None;
			slot.backend = None;
		}
	}

	/// Stop syncing and release the backend.
	///
	/// A no-op when already `Disconnected`. A cancel racing another cancel waits for
	/// the first one to finish.
	///
	/// # Errors
	/// `CancellationTimeout` if the worker tasks had to be aborted. The wallet still
	/// ends up `Disconnected` with every resource released.
	pub async fn cancel(&self) -> Result<(), SyncError> {
		let (token, generation) = {
			let mut slot = self.slot.lock().await;
			let current = self.status();
			match current.state {
				SyncState::Disconnected => return Ok(()),
				SyncState::Cancelling => {
					drop(slot);
					self.wait_disconnected(current.generation).await;
					return Ok(());
				}
				_ => {}
			}

			let Some(token) = slot.token.clone() else {
				warn!("Wallet {} had no live session in state {}", self.wallet, current.state);
				self.status.send_replace(SyncStatus {
					generation: current.generation,
					state: SyncState::Disconnected,
				});
				return Ok(());
			};
			slot.backend = None;
			self.status.send_replace(SyncStatus {
				generation: current.generation,
				state: SyncState::Cancelling,
			});
			(token, current.generation)
		};

		info!("Cancelling sync for wallet {} (generation {})", self.wallet, generation);
		token.cancel();

		let timeout = self.settings.cancel_timeout;
		let deadline = tokio::time::Instant::now() + timeout;
		let mut timed_out = false;
		for mut handle in token.take_workers() {
			match tokio::time::timeout_at(deadline, &mut handle).await {
				Ok(Ok(())) => {}
				Ok(Err(e)) if e.is_panic() => {
					error!("Sync task of wallet {} panicked: {}", self.wallet, e);
				}
				Ok(Err(_)) => {}
				Err(_) => {
					timed_out = true;
					handle.abort();
				}
			}
		}
		if timed_out {
			error!(
				"Sync tasks of wallet {} did not stop within {:?}, releasing resources forcibly",
				self.wallet, timeout
			);
		}

		let released = token.rollback().drain().await;
		self.hub.close_all();

		{
			let mut slot = self.slot.lock().await;
			if slot.generation == generation {
				slot.token = None;
				slot.backend = None;
			}
			self.status.send_if_modified(|s| {
				if s.generation == generation && s.state == SyncState::Cancelling {
					s.state = SyncState::Disconnected;
					true
				} else {
					false
				}
			});
		}

		info!(
			"Wallet {} disconnected, {} resources released",
			self.wallet, released
		);
		if timed_out {
			return Err(SyncError::CancellationTimeout(timeout));
		}
		Ok(())
	}

	async fn wait_disconnected(&self, generation: u64) {
		let mut rx = self.status.subscribe();
		let _ = rx
			.wait_for(|s| s.generation != generation || s.state == SyncState::Disconnected)
			.await
			.map(|_| ());
	}
}

/// Drive the chain client until cancelled, reconnecting on transient failures.
async fn run_worker(
	wallet: WalletId,
	backend: Backend,
	events: mpsc::Sender<RawEvent>,
	cancel: CancellationToken,
	settings: ManagerSettings,
) {
	let mut backoff = ExponentialBackoffBuilder::new()
		.with_initial_interval(settings.initial_backoff)
		.with_max_interval(settings.max_backoff)
		.with_max_elapsed_time(None)
		.build();

	loop {
		let started = Instant::now();
		let result = backend
			.client
			.run(backend.store.clone(), events.clone(), cancel.clone())
			.await;
		if cancel.is_cancelled() {
			break;
		}

		match result {
			Ok(()) => {
				debug!("{} client of wallet {} stopped", backend.client.name(), wallet);
				break;
			}
			Err(e) if e.is_transient() => {
				if started.elapsed() >= STABLE_SESSION {
					backoff.reset();
				}
				let delay = backoff.next_backoff().unwrap_or(settings.max_backoff);
				warn!(
					"{} client of wallet {} failed: {}, retrying in {:?}",
					backend.client.name(),
					wallet,
					e,
					delay
				);
				let lost = RawEvent::ConnectionLost {
					reason: e.to_string(),
				};
				if events.send(lost).await.is_err() {
					break;
				}
				tokio::select! {
					_ = cancel.cancelled() => break,
					_ = tokio::time::sleep(delay) => {}
				}
			}
			Err(e) => {
				error!("Sync worker of wallet {} stopped: {}", wallet, e);
				break;
			}
		}
	}

	debug!("Sync worker of wallet {} exited", wallet);
}

/// Converts raw backend events of one generation into progress and notifications
struct EventPump {
	wallet: WalletId,
	generation: u64,
	status: Arc<watch::Sender<SyncStatus>>,
	hub: Arc<NotificationHub>,
	progress: Arc<StdMutex<GenerationProgress>>,
}

impl EventPump {
	async fn run(self, mut events: mpsc::Receiver<RawEvent>) {
		while let Some(event) = events.recv().await {
			self.handle(event);
		}
		debug!(
			"Event pump of wallet {} generation {} finished",
			self.wallet, self.generation
		);
	}

	fn handle(&self, event: RawEvent) {
		let synced = {
			let mut progress = self.progress.lock().unwrap_or_else(|p| p.into_inner());
			if progress.generation != self.generation {
				debug!("Dropping stale event from generation {}", self.generation);
				return;
			}
			let tracker = &mut progress.tracker;
			match &event {
				RawEvent::BlockConnected { stamp, relevant } => {
					tracker.record_block(stamp.height, relevant.len());
					tracker.log_progress(false);
				}
				RawEvent::BlockDisconnected { stamp } => {
					info!(
						"Wallet {} rolled back block {} at height {}",
						self.wallet, stamp.hash, stamp.height
					);
					tracker.record_disconnect(stamp.height);
				}
				RawEvent::NetworkHeight { height } => tracker.record_network_height(*height),
				RawEvent::ConnectionLost { reason } => {
					warn!("Wallet {} lost its connection: {}", self.wallet, reason);
					tracker.record_connection_lost();
				}
			}
			tracker.is_synced()
		};

		if let RawEvent::BlockConnected { stamp, relevant } = event {
			self.hub.publish(
				self.generation,
				&NotificationEvent::BlockAttached {
					height: stamp.height,
					hash: stamp.hash,
				},
			);
			for tx in relevant {
				self.hub
					.publish(self.generation, &NotificationEvent::NewTransaction { tx });
			}
		}

		self.update_state(synced);
	}

	fn update_state(&self, synced: bool) {
		let next = if synced {
			SyncState::Synced
		} else {
			SyncState::Syncing
		};
		let generation = self.generation;
		let changed = self.status.send_if_modified(|s| {
			if s.generation == generation && s.state.is_connected() && s.state != next {
				s.state = next;
				true
			} else {
				false
			}
		});
		if changed {
			info!("Wallet {} is now {}", self.wallet, next);
		}
	}
}
