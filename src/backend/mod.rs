//! Backend connection: the local index store plus the protocol-specific chain client.
//!
//! A backend is opened in two steps, store first and client second. Each successful
//! step registers its release on the caller's [`RollbackStack`], so a failure in the
//! second step (or a cancellation between them) releases the store again.

pub mod peer;
pub mod rpc;
mod scan;
pub mod store;
pub mod types;

pub use peer::{PeerPlan, SpvClient};
pub use rpc::FullNodeClient;
pub use store::{IndexStore, StoreLayout, StoreOptions};
pub use types::*;

use crate::config::{RpcEndpoint, SpvOptions};
use crate::wallet::sync::rollback::RollbackStack;
use crate::wallet::{AssetKind, NetworkKind, SyncError};

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// A network client that keeps an index store in sync with the chain
#[async_trait]
pub trait ChainClient: Send + Sync {
	fn name(&self) -> &str;

	/// Drive sync until `cancel` fires or the connection fails.
	///
	/// Returns `Ok(())` only when stopped or cancelled. Raw events go to `events`
	/// in chain order.
	async fn run(
		&self,
		store: Arc<IndexStore>,
		events: mpsc::Sender<RawEvent>,
		cancel: CancellationToken,
	) -> Result<(), BackendError>;

	/// Stop the client and any background tasks it owns. Idempotent.
	async fn stop(&self);

	/// Number of connected peers (1 for a connected full node)
	fn peer_count(&self) -> u32;
}

/// Everything needed to open a wallet's backend
#[derive(Debug, Clone)]
pub struct BackendParams {
	pub kind: AssetKind,
	pub network: NetworkKind,
	/// Wallet data directory; each store layout lives in its own subdirectory
	pub dir: PathBuf,
	pub store: StoreOptions,
	pub rpc: Option<RpcEndpoint>,
	pub spv: SpvOptions,
}

/// Opens the two halves of a backend
#[async_trait]
pub trait BackendConnector: Send + Sync {
	/// Open the local index database. Fails with `StorageUnavailable`.
	async fn open_store(&self, params: &BackendParams) -> Result<Arc<IndexStore>, SyncError>;

	/// Construct the network client. Fails with `NetworkInitFailed`.
	async fn open_client(
		&self,
		params: &BackendParams,
		store: Arc<IndexStore>,
	) -> Result<Arc<dyn ChainClient>, SyncError>;
}

/// An open backend. Owned by the sync manager of one wallet.
#[derive(Clone)]
pub struct Backend {
	pub store: Arc<IndexStore>,
	pub client: Arc<dyn ChainClient>,
}

impl Backend {
	pub async fn open(
		connector: &dyn BackendConnector,
		params: &BackendParams,
		rollback: &RollbackStack,
	) -> Result<Self, SyncError> {
		let store = connector.open_store(params).await?;
		{
			let store = store.clone();
			rollback
				.push("close index store", async move {
					if let Err(e) = store.close().await {
						warn!("Failed to close index store: {}", e);
					}
				})
				.await;
		}

		let client = connector.open_client(params, store.clone()).await?;
		{
			let client = client.clone();
			rollback
				.push("stop chain client", async move { client.stop().await })
				.await;
		}

		debug!(
			"Opened {} backend on {} at {:?}",
			params.kind, params.network, params.dir
		);
		Ok(Self { store, client })
	}
}

/// Connector for the real backends
pub struct DefaultConnector;

#[async_trait]
impl BackendConnector for DefaultConnector {
	async fn open_store(&self, params: &BackendParams) -> Result<Arc<IndexStore>, SyncError> {
		IndexStore::open(
			&params.dir,
			StoreLayout::for_kind(params.kind),
			params.network,
			params.store,
		)
		.await
		.map(Arc::new)
		.map_err(|e| SyncError::StorageUnavailable(e.to_string()))
	}

	async fn open_client(
		&self,
		params: &BackendParams,
		_store: Arc<IndexStore>,
	) -> Result<Arc<dyn ChainClient>, SyncError> {
		match params.kind {
			AssetKind::FullNode => {
				let endpoint = params.rpc.clone().ok_or_else(|| {
					SyncError::NetworkInitFailed("No RPC endpoint configured".to_string())
				})?;
				let client = FullNodeClient::new(params.network, endpoint)
					.map_err(|e| SyncError::NetworkInitFailed(e.to_string()))?;
				Ok(Arc::new(client))
			}
			AssetKind::Spv => {
				let client = SpvClient::new(params.network, &params.spv)
					.map_err(|e| SyncError::NetworkInitFailed(e.to_string()))?;
				client.begin_discovery();
				Ok(Arc::new(client))
			}
		}
	}
}
