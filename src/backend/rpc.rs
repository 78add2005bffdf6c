//! Full-node chain client.
//!
//! Catch-up runs over HTTP JSON-RPC against a validating node (`getblockcount`,
//! `getblockhash`, `getblock`), while a websocket session subscribed with
//! `notifyblocks` drives live updates. Every block from the wallet's tip (or its
//! birthday for a fresh store) up to the node's best height is fetched in full and
//! scanned locally, so the node never learns which scripts the wallet watches.

use super::ChainClient;
use super::store::IndexStore;
use super::types::{BackendError, BlockStamp, RawEvent};
use crate::config::RpcEndpoint;
use crate::wallet::NetworkKind;

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64_STANDARD};
use bitcoin::{Block, BlockHash, consensus};
use futures_util::{SinkExt, StreamExt};
use reqwest::Client;
use serde_json::{Value, json};
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::{
	connect_async,
	tungstenite::{Message, client::IntoClientRequest},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Most blocks connected header-only with a single store write during catch-up
const HEADER_BATCH: usize = 500;

/// Block notification pushed by the node over the websocket session
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum NodeNotification {
	BlockConnected,
	BlockDisconnected(BlockHash),
}

/// JSON-RPC client for a validating full node
pub struct FullNodeClient {
	/// The underlying HTTP client for RPC calls.
	http_client: Client,
	endpoint: RpcEndpoint,
	network: NetworkKind,
	connected: AtomicBool,
	stopped: CancellationToken,
	request_id: AtomicU64,
}

impl FullNodeClient {
	/// Create a new full-node client.
	///
	/// # Arguments
	/// * `network` - The network the node is expected to serve.
	/// * `endpoint` - HTTP and websocket URLs plus RPC credentials.
	///
	/// # Errors
	/// Returns `BackendError::Config` for malformed URLs or missing credentials.
	/// No connection is made here.
	pub fn new(network: NetworkKind, endpoint: RpcEndpoint) -> Result<Self, BackendError> {
		reqwest::Url::parse(&endpoint.url)
			.map_err(|e| BackendError::Config(format!("Invalid RPC URL {}: {}", endpoint.url, e)))?;
		endpoint
			.ws_url
			.as_str()
			.into_client_request()
			.map_err(|e| {
				BackendError::Config(format!("Invalid websocket URL {}: {}", endpoint.ws_url, e))
			})?;
		if endpoint.user.is_empty() || endpoint.password.is_empty() {
			return Err(BackendError::Config(
				"RPC user and password are required".to_string(),
			));
		}

		let http_client = Client::builder().timeout(Duration::from_secs(30)).build()?;

		Ok(Self {
			http_client,
			endpoint,
			network,
			connected: AtomicBool::new(false),
			stopped: CancellationToken::new(),
			request_id: AtomicU64::new(1),
		})
	}

	fn auth_header(&self) -> String {
		let credentials = format!("{}:{}", self.endpoint.user, self.endpoint.password);
		format!("Basic {}", BASE64_STANDARD.encode(credentials))
	}

	/// Execute a JSON-RPC call and return its `result` member.
	pub async fn call(&self, method: &str, params: Value) -> Result<Value, BackendError> {
		let request_body = json!({
			"jsonrpc": "1.0",
			"id": self.request_id.fetch_add(1, Ordering::Relaxed),
			"method": method,
			"params": params,
		});

		let response = self
			.http_client
			.post(&self.endpoint.url)
			.basic_auth(&self.endpoint.user, Some(&self.endpoint.password))
			.json(&request_body)
			.send()
			.await?;

		let status = response.status();
		if status == reqwest::StatusCode::UNAUTHORIZED {
			return Err(BackendError::Rpc("RPC credentials rejected".to_string()));
		}

		let response_json: Value = response.json().await?;
		if let Some(error) = response_json.get("error").filter(|e| !e.is_null()) {
			return Err(BackendError::Rpc(format!("{} failed: {}", method, error)));
		}
		if !status.is_success() {
			return Err(BackendError::Rpc(format!("HTTP error: {}", status)));
		}

		response_json
			.get("result")
			.cloned()
			.ok_or(BackendError::NoData)
	}

	async fn block_count(&self) -> Result<u32, BackendError> {
		let result = self.call("getblockcount", json!([])).await?;
		result
			.as_u64()
			.and_then(|h| u32::try_from(h).ok())
			.ok_or(BackendError::NoData)
	}

	async fn block_hash(&self, height: u32) -> Result<BlockHash, BackendError> {
		let result = self.call("getblockhash", json!([height])).await?;
		let hex = result.as_str().ok_or(BackendError::NoData)?;
		BlockHash::from_str(hex)
			.map_err(|e| BackendError::Rpc(format!("Invalid block hash {}: {}", hex, e)))
	}

	async fn block(&self, hash: &BlockHash) -> Result<Block, BackendError> {
		let result = self.call("getblock", json!([hash.to_string(), false])).await?;
		let hex = result.as_str().ok_or(BackendError::NoData)?;
		let bytes = hex::decode(hex)
			.map_err(|e| BackendError::Rpc(format!("Invalid block encoding: {}", e)))?;
		Ok(consensus::deserialize(&bytes)?)
	}

	/// Bring the store up to the node's best height.
	///
	/// Blocks without wallet activity are connected in batches of headers; a block
	/// that touches the wallet is scanned and written on its own.
	async fn catch_up(
		&self,
		store: &IndexStore,
		events: &mpsc::Sender<RawEvent>,
	) -> Result<(), BackendError> {
		let best = self.block_count().await?;
		emit(events, RawEvent::NetworkHeight { height: best }).await?;

		let client = self;
		let mut parent = rewind_to_node(store, events, best, move |h| client.block_hash(h)).await?;
		let mut next = match parent {
			Some(tip) => tip.height + 1,
			None => store.birthday().await?,
		};
		let mut pending = Vec::new();

		while next <= best {
			let hash = self.block_hash(next).await?;
			let block = self.block(&hash).await?;

			if parent.is_some_and(|p| p.hash != block.header.prev_blockhash) {
				info!("Reorg below height {} on {}", next, self.network);
				flush_headers(store, events, &mut pending).await?;
				parent = rewind_to_node(store, events, best, move |h| client.block_hash(h)).await?;
				next = match parent {
					Some(tip) => tip.height + 1,
					None => store.birthday().await?,
				};
				continue;
			}

			let stamp = BlockStamp { height: next, hash };
			if store.is_relevant(&block.txdata).await? {
				flush_headers(store, events, &mut pending).await?;
				let relevant = store.connect_block(stamp, &block.txdata).await?;
				emit(events, RawEvent::BlockConnected { stamp, relevant }).await?;
			} else {
				pending.push(stamp);
				if pending.len() >= HEADER_BATCH {
					flush_headers(store, events, &mut pending).await?;
				}
			}
			parent = Some(stamp);
			next += 1;
		}

		flush_headers(store, events, &mut pending).await
	}

	async fn session(
		&self,
		store: &IndexStore,
		events: &mpsc::Sender<RawEvent>,
	) -> Result<(), BackendError> {
		let mut request = self.endpoint.ws_url.as_str().into_client_request()?;
		request.headers_mut().insert(
			"Authorization",
			self.auth_header().parse().map_err(|_| {
				BackendError::Config("Invalid authorization header value".to_string())
			})?,
		);

		let (ws_stream, response) = connect_async(request).await?;
		debug!(
			"WebSocket connection established, response status: {}",
			response.status()
		);
		let (mut ws_sender, mut ws_receiver) = ws_stream.split();

		let subscribe = json!({
			"jsonrpc": "1.0",
			"id": 0,
			"method": "notifyblocks",
			"params": [],
		});
		ws_sender.send(Message::Text(subscribe.to_string())).await?;
		self.connected.store(true, Ordering::SeqCst);
		info!("Subscribed to block notifications at {}", self.endpoint.ws_url);

		self.catch_up(store, events).await?;

		while let Some(msg) = ws_receiver.next().await {
			match msg? {
				Message::Text(text) => match parse_notification(&text) {
					Some(NodeNotification::BlockConnected) => self.catch_up(store, events).await?,
					Some(NodeNotification::BlockDisconnected(hash)) => {
						let tip = store.tip().await?;
						if tip.map(|t| t.hash) == Some(hash) {
							if let Some(stamp) = store.disconnect_tip().await? {
								emit(events, RawEvent::BlockDisconnected { stamp }).await?;
							}
						}
					}
					None => debug!("Ignoring websocket message: {}", text),
				},
				Message::Close(frame) => {
					return Err(BackendError::Rpc(format!(
						"Notification stream closed: {:?}",
						frame
					)));
				}
				_ => {}
			}
		}

		Err(BackendError::Rpc("Notification stream ended".to_string()))
	}
}

#[async_trait]
impl ChainClient for FullNodeClient {
	fn name(&self) -> &str {
		"full-node"
	}

	async fn run(
		&self,
		store: Arc<IndexStore>,
		events: mpsc::Sender<RawEvent>,
		cancel: CancellationToken,
	) -> Result<(), BackendError> {
		let result = tokio::select! {
			_ = cancel.cancelled() => Ok(()),
			_ = self.stopped.cancelled() => Ok(()),
			result = self.session(&store, &events) => result,
		};
		self.connected.store(false, Ordering::SeqCst);
		result
	}

	async fn stop(&self) {
		if !self.stopped.is_cancelled() {
			info!("Stopping full-node client for {}", self.endpoint.url);
		}
		self.stopped.cancel();
	}

	fn peer_count(&self) -> u32 {
		u32::from(self.connected.load(Ordering::SeqCst))
	}
}

pub(crate) async fn emit(
	events: &mpsc::Sender<RawEvent>,
	event: RawEvent,
) -> Result<(), BackendError> {
	events
		.send(event)
		.await
		.map_err(|_| BackendError::ChannelClosed)
}

/// Disconnect stored blocks until the tip is on the node's chain.
///
/// `node_hash` resolves the node's block hash at a height. Returns the surviving tip,
/// `None` once the recent window is exhausted.
pub(crate) async fn rewind_to_node<F, Fut>(
	store: &IndexStore,
	events: &mpsc::Sender<RawEvent>,
	best: u32,
	mut node_hash: F,
) -> Result<Option<BlockStamp>, BackendError>
where
	F: FnMut(u32) -> Fut,
	Fut: Future<Output = Result<BlockHash, BackendError>>,
{
	loop {
		let Some(tip) = store.tip().await? else {
			return Ok(None);
		};
		if tip.height <= best && node_hash(tip.height).await? == tip.hash {
			return Ok(Some(tip));
		}

		info!(
			"Stored tip {} at height {} is not on the node's chain (best {})",
			tip.hash, tip.height, best
		);
		match store.disconnect_tip().await? {
			Some(stamp) => emit(events, RawEvent::BlockDisconnected { stamp }).await?,
			None => return Ok(None),
		}
	}
}

/// Connect the buffered header-only blocks and announce each of them.
pub(crate) async fn flush_headers(
	store: &IndexStore,
	events: &mpsc::Sender<RawEvent>,
	pending: &mut Vec<BlockStamp>,
) -> Result<(), BackendError> {
	if pending.is_empty() {
		return Ok(());
	}
	store.connect_headers(pending).await?;
	debug!("Connected {} blocks up to {}", pending.len(), pending[pending.len() - 1].height);
	for stamp in pending.drain(..) {
		emit(
			events,
			RawEvent::BlockConnected {
				stamp,
				relevant: Vec::new(),
			},
		)
		.await?;
	}
	Ok(())
}

/// Parse a node notification. Replies to our own requests and unknown methods yield `None`.
pub(crate) fn parse_notification(text: &str) -> Option<NodeNotification> {
	let parsed: Value = match serde_json::from_str(text) {
		Ok(parsed) => parsed,
		Err(e) => {
			warn!("Malformed notification: {}", e);
			return None;
		}
	};

	match parsed.get("method").and_then(|m| m.as_str())? {
		"blockconnected" => Some(NodeNotification::BlockConnected),
		"blockdisconnected" => {
			let first = parsed.get("params")?.get(0)?.as_str()?;
			disconnected_hash(first).map(NodeNotification::BlockDisconnected)
		}
		_ => None,
	}
}

// Older nodes send the block hash, newer ones the serialized header
fn disconnected_hash(param: &str) -> Option<BlockHash> {
	if let Ok(hash) = BlockHash::from_str(param) {
		return Some(hash);
	}
	let bytes = hex::decode(param).ok()?;
	let header: bitcoin::block::Header = consensus::deserialize(&bytes).ok()?;
	Some(header.block_hash())
}
