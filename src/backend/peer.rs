//! SPV chain client over direct peer connections using compact block filters (BIP157/158).
//!
//! The client talks to one peer at a time. Headers are fetched with `getheaders`; blocks
//! below the wallet birthday are connected header-only, blocks at or above it have their
//! basic filter checked against the watched scripts and are downloaded in full only on a
//! match. Peer resolution starts in the background as soon as the client is created.

use super::ChainClient;
use super::rpc::emit;
use super::store::IndexStore;
use super::types::{BackendError, BlockStamp, RawEvent};
use crate::config::SpvOptions;
use crate::wallet::NetworkKind;

use async_trait::async_trait;
use bitcoin::bip158::BlockFilter;
use bitcoin::block::Header;
use bitcoin::hashes::Hash;
use bitcoin::p2p::message::{NetworkMessage, RawNetworkMessage};
use bitcoin::p2p::message_blockdata::{GetHeadersMessage, Inventory};
use bitcoin::p2p::message_filter::GetCFilters;
use bitcoin::p2p::message_network::VersionMessage;
use bitcoin::p2p::{Address, Magic, ServiceFlags};
use bitcoin::{Block, BlockHash, ScriptBuf, consensus};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Basic filter type from BIP158
const BASIC_FILTER: u8 = 0;
const PROTOCOL_VERSION: u32 = 70016;
const USER_AGENT: &str = concat!("/wallet-sync-core:", env!("CARGO_PKG_VERSION"), "/");
const MAX_HEADERS: usize = 2000;
const MAX_PAYLOAD: usize = 4_000_000;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(60);
const IDLE_TIMEOUT: Duration = Duration::from_secs(600);

const MAINNET_PEER_HINTS: &[&str] = &["cfilters.ssgen.io"];
const TESTNET_PEER_HINTS: &[&str] = &["dex-test.ssgen.io"];
const SIMNET_CONNECT_PEERS: &[&str] = &["localhost:20575"];

const MAINNET_DNS_SEEDS: &[&str] = &[
	"seed.bitcoin.sipa.be",
	"dnsseed.bluematt.me",
	"seed.bitcoinstats.com",
	"seed.bitcoin.jonasschnelli.ch",
];
const TESTNET_DNS_SEEDS: &[&str] = &[
	"testnet-seed.bitcoin.jonasschnelli.ch",
	"seed.tbtc.petertodd.org",
	"testnet-seed.bluematt.me",
];

/// Where the SPV client looks for peers on a given network
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerPlan {
	/// Tried first, but discovery still runs
	pub hints: Vec<String>,
	/// When non-empty, the only peers ever contacted
	pub connect_only: Vec<String>,
	pub dns_seeds: Vec<String>,
}

impl PeerPlan {
	/// Build the peer plan for `network`. Configured peers replace the defaults.
	pub fn for_network(network: NetworkKind, overrides: &SpvOptions) -> Result<Self, BackendError> {
		let port = network.default_p2p_port();
		let (hints, connect_only, seeds): (&[&str], &[&str], &[&str]) = match network {
			NetworkKind::Main => (MAINNET_PEER_HINTS, &[], MAINNET_DNS_SEEDS),
			NetworkKind::Test => (TESTNET_PEER_HINTS, &[], TESTNET_DNS_SEEDS),
			NetworkKind::Simulation => (&[], SIMNET_CONNECT_PEERS, &[]),
		};

		let mut plan = Self {
			hints: hints.iter().map(|h| h.to_string()).collect(),
			connect_only: connect_only.iter().map(|h| h.to_string()).collect(),
			dns_seeds: seeds.iter().map(|s| s.to_string()).collect(),
		};

		if !overrides.peers.is_empty() {
			if overrides.connect_only {
				plan.connect_only = overrides.peers.clone();
				plan.hints.clear();
				plan.dns_seeds.clear();
			} else {
				plan.hints = overrides.peers.clone();
				plan.connect_only.clear();
			}
		}

		plan.hints = plan
			.hints
			.iter()
			.map(|a| normalize_peer(a, port))
			.collect::<Result<_, _>>()?;
		plan.connect_only = plan
			.connect_only
			.iter()
			.map(|a| normalize_peer(a, port))
			.collect::<Result<_, _>>()?;
		plan.dns_seeds = plan
			.dns_seeds
			.iter()
			.map(|a| normalize_peer(a, port))
			.collect::<Result<_, _>>()?;

		if plan.targets().is_empty() {
			return Err(BackendError::Config(format!(
				"No peers or discovery sources for {}",
				network
			)));
		}
		Ok(plan)
	}

	pub fn discovers(&self) -> bool {
		self.connect_only.is_empty() && !self.dns_seeds.is_empty()
	}

	/// Hosts to resolve, in preference order
	pub fn targets(&self) -> Vec<String> {
		if !self.connect_only.is_empty() {
			return self.connect_only.clone();
		}
		self.hints
			.iter()
			.chain(self.dns_seeds.iter())
			.cloned()
			.collect()
	}
}

/// Append the default port when `addr` has none and check the result is usable.
fn normalize_peer(addr: &str, default_port: u16) -> Result<String, BackendError> {
	let addr = addr.trim();
	if addr.parse::<SocketAddr>().is_ok() {
		return Ok(addr.to_string());
	}

	let invalid = || BackendError::Config(format!("Invalid peer address '{}'", addr));
	match addr.rsplit_once(':') {
		// A bare IPv6 address has colons but no port
		Some(_) if addr.parse::<std::net::Ipv6Addr>().is_ok() => {
			Ok(format!("[{}]:{}", addr, default_port))
		}
		Some((host, port)) => {
			if host.is_empty() || port.parse::<u16>().is_err() {
				return Err(invalid());
			}
			Ok(addr.to_string())
		}
		None if addr.is_empty() => Err(invalid()),
		None => Ok(format!("{}:{}", addr, default_port)),
	}
}

async fn resolve(targets: &[String]) -> Vec<SocketAddr> {
	let mut addresses = Vec::new();
	for target in targets {
		match tokio::net::lookup_host(target.as_str()).await {
			Ok(found) => {
				let found: Vec<SocketAddr> = found.collect();
				debug!("Resolved {} to {} addresses", target, found.len());
				for addr in found {
					if !addresses.contains(&addr) {
						addresses.push(addr);
					}
				}
			}
			Err(e) => warn!("Failed to resolve peer {}: {}", target, e),
		}
	}
	addresses
}

/// A framed wire-protocol connection to one peer
struct PeerConnection {
	addr: SocketAddr,
	stream: TcpStream,
	magic: Magic,
}

impl PeerConnection {
	async fn connect(addr: SocketAddr, network: NetworkKind) -> Result<Self, BackendError> {
		let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
			.await
			.map_err(|_| BackendError::Peer(format!("Connection to {} timed out", addr)))??;
		stream.set_nodelay(true)?;
		Ok(Self {
			addr,
			stream,
			magic: network.chain().magic(),
		})
	}

	async fn send(&mut self, message: NetworkMessage) -> Result<(), BackendError> {
		debug!("Sending {} to {}", message.cmd(), self.addr);
		let raw = RawNetworkMessage::new(self.magic, message);
		self.stream.write_all(&consensus::serialize(&raw)).await?;
		self.stream.flush().await?;
		Ok(())
	}

	async fn receive(&mut self) -> Result<NetworkMessage, BackendError> {
		let mut header = [0u8; 24];
		self.stream.read_exact(&mut header).await?;

		let len = u32::from_le_bytes([header[16], header[17], header[18], header[19]]) as usize;
		if len > MAX_PAYLOAD {
			return Err(BackendError::Peer(format!(
				"Peer {} sent an oversized message ({} bytes)",
				self.addr, len
			)));
		}

		let mut frame = Vec::with_capacity(24 + len);
		frame.extend_from_slice(&header);
		frame.resize(24 + len, 0);
		self.stream.read_exact(&mut frame[24..]).await?;

		let raw: RawNetworkMessage = consensus::deserialize(&frame)?;
		if *raw.magic() != self.magic {
			return Err(BackendError::Peer(format!(
				"Peer {} is on a different network",
				self.addr
			)));
		}
		Ok(raw.into_payload())
	}

	/// Receive until `pick` accepts a message, answering pings meanwhile.
	async fn await_message<T>(
		&mut self,
		wait: Duration,
		what: &str,
		mut pick: impl FnMut(NetworkMessage) -> Option<T>,
	) -> Result<T, BackendError> {
		let addr = self.addr;
		let receive = async {
			loop {
				match self.receive().await? {
					NetworkMessage::Ping(nonce) => self.send(NetworkMessage::Pong(nonce)).await?,
					message => {
						let cmd = message.cmd();
						match pick(message) {
							Some(found) => return Ok::<T, BackendError>(found),
							None => debug!("Ignoring {} from {} while waiting for {}", cmd, addr, what),
						}
					}
				}
			}
		};
		tokio::time::timeout(wait, receive)
			.await
			.map_err(|_| BackendError::Peer(format!("Timed out waiting for {} from {}", what, addr)))?
	}

	/// Version handshake. Returns the peer's advertised start height.
	async fn handshake(&mut self) -> Result<u32, BackendError> {
		let services = ServiceFlags::NONE;
		let mut version = VersionMessage::new(
			services,
			chrono::Utc::now().timestamp(),
			Address::new(&self.addr, ServiceFlags::NONE),
			Address::new(&SocketAddr::from(([0, 0, 0, 0], 0)), services),
			rand::random::<u64>(),
			USER_AGENT.to_string(),
			0,
		);
		version.version = PROTOCOL_VERSION;
		version.relay = false;
		self.send(NetworkMessage::Version(version)).await?;

		let mut peer_version: Option<VersionMessage> = None;
		let mut verack = false;
		let addr = self.addr;

		let exchange = async {
			while peer_version.is_none() || !verack {
				match self.receive().await? {
					NetworkMessage::Version(v) => {
						self.send(NetworkMessage::Verack).await?;
						peer_version = Some(v);
					}
					NetworkMessage::Verack => verack = true,
					NetworkMessage::Ping(nonce) => self.send(NetworkMessage::Pong(nonce)).await?,
					other => debug!("Ignoring {} from {} during handshake", other.cmd(), addr),
				}
			}
			Ok::<(), BackendError>(())
		};
		tokio::time::timeout(HANDSHAKE_TIMEOUT, exchange)
			.await
			.map_err(|_| BackendError::Peer(format!("Handshake with {} timed out", addr)))??;

		let peer_version = peer_version.ok_or_else(|| BackendError::Peer("Missing version".to_string()))?;
		if !peer_version.services.has(ServiceFlags::COMPACT_FILTERS) {
			return Err(BackendError::Peer(format!(
				"Peer {} does not serve compact filters",
				addr
			)));
		}

		info!(
			"Handshake with {} complete: {} at height {}",
			addr, peer_version.user_agent, peer_version.start_height
		);
		Ok(peer_version.start_height.max(0) as u32)
	}
}

/// Compact-filter SPV client
pub struct SpvClient {
	network: NetworkKind,
	plan: PeerPlan,
	candidates: Arc<Mutex<VecDeque<SocketAddr>>>,
	discovery: Mutex<Option<JoinHandle<()>>>,
	connected: AtomicU32,
	stopped: CancellationToken,
}

impl SpvClient {
	pub fn new(network: NetworkKind, options: &SpvOptions) -> Result<Self, BackendError> {
		let plan = PeerPlan::for_network(network, options)?;
		Ok(Self {
			network,
			plan,
			candidates: Arc::new(Mutex::new(VecDeque::new())),
			discovery: Mutex::new(None),
			connected: AtomicU32::new(0),
			stopped: CancellationToken::new(),
		})
	}

	pub fn plan(&self) -> &PeerPlan {
		&self.plan
	}

	/// Resolve peers in the background. Returns immediately.
	pub fn begin_discovery(&self) {
		let targets = self.plan.targets();
		let candidates = self.candidates.clone();
		let network = self.network;

		let handle = tokio::spawn(async move {
			let found = resolve(&targets).await;
			info!("Peer discovery on {} found {} candidates", network, found.len());
			let mut queue = candidates.lock().unwrap_or_else(|p| p.into_inner());
			for addr in found {
				if !queue.contains(&addr) {
					queue.push_back(addr);
				}
			}
		});

		let mut slot = self.discovery.lock().unwrap_or_else(|p| p.into_inner());
		if let Some(previous) = slot.replace(handle) {
			previous.abort();
		}
	}

	/// Next peer to try. Candidates rotate so a failing peer moves to the back.
	async fn next_peer(&self) -> Result<SocketAddr, BackendError> {
		let next = {
			let mut queue = self.candidates.lock().unwrap_or_else(|p| p.into_inner());
			queue.pop_front().inspect(|addr| queue.push_back(*addr))
		};
		if let Some(addr) = next {
			return Ok(addr);
		}

		let found = resolve(&self.plan.targets()).await;
		let mut queue = self.candidates.lock().unwrap_or_else(|p| p.into_inner());
		for addr in found {
			if !queue.contains(&addr) {
				queue.push_back(addr);
			}
		}
		queue
			.front()
			.copied()
			.ok_or_else(|| BackendError::Peer(format!("No reachable peers on {}", self.network)))
	}

	async fn session(
		&self,
		store: &IndexStore,
		events: &mpsc::Sender<RawEvent>,
	) -> Result<(), BackendError> {
		let addr = self.next_peer().await?;
		let mut peer = PeerConnection::connect(addr, self.network).await?;
		let start_height = peer.handshake().await?;
		self.connected.store(1, Ordering::SeqCst);
		emit(events, RawEvent::NetworkHeight { height: start_height }).await?;

		if store.tip().await?.is_none() {
			let genesis = bitcoin::constants::genesis_block(self.network.chain());
			store
				.connect_headers(&[BlockStamp {
					height: 0,
					hash: genesis.block_hash(),
				}])
				.await?;
		}

		sync_headers(&mut peer, store, events).await?;

		loop {
			let announced = peer
				.await_message(IDLE_TIMEOUT, "block announcement", |message| match message {
					NetworkMessage::Inv(inv) => inv
						.iter()
						.any(|i| matches!(i, Inventory::Block(_) | Inventory::WitnessBlock(_)))
						.then_some(()),
					NetworkMessage::Headers(headers) => (!headers.is_empty()).then_some(()),
					_ => None,
				})
				.await;
			announced?;
			sync_headers(&mut peer, store, events).await?;
		}
	}
}

/// Fetch headers from `peer` until caught up, connecting each to the store.
async fn sync_headers(
	peer: &mut PeerConnection,
	store: &IndexStore,
	events: &mpsc::Sender<RawEvent>,
) -> Result<(), BackendError> {
	let birthday = store.birthday().await?;

	loop {
		let locator = store.locator().await?;
		peer.send(NetworkMessage::GetHeaders(GetHeadersMessage::new(
			locator,
			BlockHash::all_zeros(),
		)))
		.await?;

		let headers = peer
			.await_message(RESPONSE_TIMEOUT, "headers", |message| match message {
				NetworkMessage::Headers(headers) => Some(headers),
				_ => None,
			})
			.await?;
		let batch = headers.len();
		debug!("Received {} headers from {}", batch, peer.addr);

		let mut pending: Vec<BlockStamp> = Vec::new();
		for header in headers {
			let tip = rewind_to_parent(store, events, &header, &pending).await?;
			trim_pending(&mut pending, tip);

			header
				.validate_pow(header.target())
				.map_err(|e| BackendError::Peer(format!("Invalid header from {}: {}", peer.addr, e)))?;

			let stamp = BlockStamp {
				height: tip.height + 1,
				hash: header.block_hash(),
			};

			if stamp.height < birthday {
				pending.push(stamp);
				continue;
			}

			flush(store, events, &mut pending).await?;
			let relevant = fetch_matching(peer, store, stamp).await?;
			let relevant = match relevant {
				Some(block) => store.connect_block(stamp, &block.txdata).await?,
				None => {
					store.connect_headers(&[stamp]).await?;
					Vec::new()
				}
			};
			emit(events, RawEvent::BlockConnected { stamp, relevant }).await?;
		}
		flush(store, events, &mut pending).await?;

		if batch < MAX_HEADERS {
			return Ok(());
		}
	}
}

/// The block `header` builds on, rewinding the store first when it forks off our chain.
async fn rewind_to_parent(
	store: &IndexStore,
	events: &mpsc::Sender<RawEvent>,
	header: &Header,
	pending: &[BlockStamp],
) -> Result<BlockStamp, BackendError> {
	if let Some(last) = pending.last() {
		if last.hash == header.prev_blockhash {
			return Ok(*last);
		}
	}

	let tip = store
		.tip()
		.await?
		.ok_or_else(|| BackendError::Peer("Store has no tip".to_string()))?;
	if pending.is_empty() && tip.hash == header.prev_blockhash {
		return Ok(tip);
	}

	if let Some(index) = pending.iter().position(|s| s.hash == header.prev_blockhash) {
		return Ok(pending[index]);
	}

	let fork_height = store.height_of(&header.prev_blockhash).await?.ok_or_else(|| {
		BackendError::Peer(format!(
			"Header {} does not connect to the local chain",
			header.block_hash()
		))
	})?;

	let mut tip = tip;
	while tip.height > fork_height {
		match store.disconnect_tip().await? {
			Some(stamp) => {
				emit(events, RawEvent::BlockDisconnected { stamp }).await?;
			}
			None => break,
		}
		tip = match store.tip().await? {
			Some(tip) => tip,
			None => break,
		};
	}
	info!("Rewound to fork point at height {}", fork_height);
	Ok(BlockStamp {
		height: fork_height,
		hash: header.prev_blockhash,
	})
}

// A fork inside the unflushed batch drops the headers above the fork point
fn trim_pending(pending: &mut Vec<BlockStamp>, parent: BlockStamp) {
	if let Some(index) = pending.iter().position(|s| s.hash == parent.hash) {
		pending.truncate(index + 1);
	} else if pending.iter().any(|s| s.height > parent.height) {
		pending.clear();
	}
}

async fn flush(
	store: &IndexStore,
	events: &mpsc::Sender<RawEvent>,
	pending: &mut Vec<BlockStamp>,
) -> Result<(), BackendError> {
	let Some(last) = pending.last().copied() else {
		return Ok(());
	};
	store.connect_headers(pending).await?;
	pending.clear();
	emit(
		events,
		RawEvent::BlockConnected {
			stamp: last,
			relevant: Vec::new(),
		},
	)
	.await
}

/// Check the block's filter against the watched scripts and download it on a match.
async fn fetch_matching(
	peer: &mut PeerConnection,
	store: &IndexStore,
	stamp: BlockStamp,
) -> Result<Option<Block>, BackendError> {
	let scripts: Vec<ScriptBuf> = store.watched_scripts().await?;
	if scripts.is_empty() {
		return Ok(None);
	}

	peer.send(NetworkMessage::GetCFilters(GetCFilters {
		filter_type: BASIC_FILTER,
		start_height: stamp.height,
		stop_hash: stamp.hash,
	}))
	.await?;

	let filter = peer
		.await_message(RESPONSE_TIMEOUT, "cfilter", |message| match message {
			NetworkMessage::CFilter(cf) if cf.block_hash == stamp.hash && cf.filter_type == BASIC_FILTER => {
				Some(cf.filter)
			}
			_ => None,
		})
		.await?;

	let matched = BlockFilter::new(&filter)
		.match_any(&stamp.hash, scripts.iter().map(|s| s.as_bytes()))
		.map_err(|e| BackendError::Peer(format!("Bad filter for {}: {}", stamp.hash, e)))?;
	if !matched {
		return Ok(None);
	}

	debug!("Filter match at height {}, fetching block", stamp.height);
	peer.send(NetworkMessage::GetData(vec![Inventory::WitnessBlock(stamp.hash)]))
		.await?;
	let block = peer
		.await_message(RESPONSE_TIMEOUT, "block", |message| match message {
			NetworkMessage::Block(block) if block.block_hash() == stamp.hash => Some(block),
			_ => None,
		})
		.await?;

	if !block.check_merkle_root() {
		return Err(BackendError::Peer(format!(
			"Block {} has an invalid merkle root",
			stamp.hash
		)));
	}
	Ok(Some(block))
}

#[async_trait]
impl ChainClient for SpvClient {
	fn name(&self) -> &str {
		"spv"
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
		self.connected.store(0, Ordering::SeqCst);
		result
	}

	async fn stop(&self) {
		self.stopped.cancel();
		let handle = self
			.discovery
			.lock()
			.unwrap_or_else(|p| p.into_inner())
			.take();
		if let Some(handle) = handle {
			handle.abort();
		}
		debug!("SPV client for {} stopped", self.network);
	}

	fn peer_count(&self) -> u32 {
		self.connected.load(Ordering::SeqCst)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_default_plans() {
		let main = PeerPlan::for_network(NetworkKind::Main, &SpvOptions::default()).unwrap();
		assert_eq!(main.hints, vec!["cfilters.ssgen.io:8333".to_string()]);
		assert!(main.connect_only.is_empty());
		assert!(main.discovers());

		let test = PeerPlan::for_network(NetworkKind::Test, &SpvOptions::default()).unwrap();
		assert_eq!(test.hints, vec!["dex-test.ssgen.io:18333".to_string()]);
		assert!(test.discovers());

		let sim = PeerPlan::for_network(NetworkKind::Simulation, &SpvOptions::default()).unwrap();
		assert_eq!(sim.connect_only, vec!["localhost:20575".to_string()]);
		assert!(!sim.discovers());
		assert_eq!(sim.targets(), vec!["localhost:20575".to_string()]);
	}

	#[test]
	fn test_overrides_replace_defaults() {
		let options = SpvOptions {
			peers: vec!["10.0.0.1".to_string(), "[::1]:9000".to_string()],
			connect_only: true,
		};
		let plan = PeerPlan::for_network(NetworkKind::Main, &options).unwrap();
		assert_eq!(
			plan.connect_only,
			vec!["10.0.0.1:8333".to_string(), "[::1]:9000".to_string()]
		);
		assert!(plan.hints.is_empty());
		assert!(!plan.discovers());

		let options = SpvOptions {
			peers: vec!["node.example:18333".to_string()],
			connect_only: false,
		};
		let plan = PeerPlan::for_network(NetworkKind::Test, &options).unwrap();
		assert_eq!(plan.targets()[0], "node.example:18333");
		assert!(plan.discovers());
	}

	#[test]
	fn test_invalid_peer_rejected() {
		let options = SpvOptions {
			peers: vec!["host:notaport".to_string()],
			connect_only: true,
		};
		assert!(matches!(
			PeerPlan::for_network(NetworkKind::Simulation, &options),
			Err(BackendError::Config(_))
		));
	}

	#[tokio::test]
	async fn test_stop_without_run() {
		let client = SpvClient::new(NetworkKind::Simulation, &SpvOptions::default()).unwrap();
		client.begin_discovery();
		client.stop().await;
		assert_eq!(client.peer_count(), 0);
		assert_eq!(client.name(), "spv");
	}

	fn stamp(height: u32) -> BlockStamp {
		BlockStamp {
			height,
			hash: BlockHash::from_byte_array([height as u8; 32]),
		}
	}

	fn header_on(prev_blockhash: BlockHash) -> Header {
		Header {
			version: bitcoin::block::Version::ONE,
			prev_blockhash,
			merkle_root: bitcoin::TxMerkleNode::all_zeros(),
			time: 0,
			bits: bitcoin::CompactTarget::from_consensus(0x207f_ffff),
			nonce: 0,
		}
	}

	async fn store_at(dir: &tempfile::TempDir, tip: u32) -> IndexStore {
		let store = IndexStore::open(
			dir.path(),
			crate::backend::store::StoreLayout::Spv,
			NetworkKind::Simulation,
			Default::default(),
		)
		.await
		.unwrap();
		let stamps: Vec<BlockStamp> = (1..=tip).map(stamp).collect();
		store.connect_headers(&stamps).await.unwrap();
		store
	}

	#[test]
	fn test_trim_pending_on_fork_inside_batch() {
		let mut pending = vec![stamp(4), stamp(5), stamp(6)];
		trim_pending(&mut pending, stamp(4));
		assert_eq!(pending, vec![stamp(4)]);

		// Parent below the batch invalidates all of it
		let mut pending = vec![stamp(4), stamp(5)];
		trim_pending(&mut pending, stamp(2));
		assert!(pending.is_empty());

		// Extending the batch keeps it
		let mut pending = vec![stamp(4), stamp(5)];
		trim_pending(&mut pending, stamp(5));
		assert_eq!(pending.len(), 2);
	}

	#[tokio::test]
	async fn test_fork_inside_pending_batch_resolves_to_batch_entry() {
		let dir = tempfile::TempDir::new().unwrap();
		let store = store_at(&dir, 3).await;
		let (tx, mut rx) = mpsc::channel(16);
		let pending = vec![stamp(4), stamp(5), stamp(6)];

		let parent = rewind_to_parent(&store, &tx, &header_on(stamp(4).hash), &pending)
			.await
			.unwrap();
		assert_eq!(parent, stamp(4));
		assert!(rx.try_recv().is_err());
		assert_eq!(store.tip().await.unwrap(), Some(stamp(3)));
	}

	#[tokio::test]
	async fn test_fork_below_tip_disconnects_in_order() {
		let dir = tempfile::TempDir::new().unwrap();
		let store = store_at(&dir, 5).await;
		let (tx, mut rx) = mpsc::channel(16);

		let parent = rewind_to_parent(&store, &tx, &header_on(stamp(3).hash), &[])
			.await
			.unwrap();
		assert_eq!(parent, stamp(3));
		assert_eq!(store.tip().await.unwrap(), Some(stamp(3)));

		let mut heights = Vec::new();
		while let Ok(event) = rx.try_recv() {
			match event {
				RawEvent::BlockDisconnected { stamp } => heights.push(stamp.height),
				other => panic!("unexpected event {:?}", other),
			}
		}
		assert_eq!(heights, vec![5, 4]);
	}

	#[tokio::test]
	async fn test_unconnected_header_is_rejected() {
		let dir = tempfile::TempDir::new().unwrap();
		let store = store_at(&dir, 5).await;
		let (tx, mut rx) = mpsc::channel(16);

		let stranger = BlockHash::from_byte_array([0xee; 32]);
		let result = rewind_to_parent(&store, &tx, &header_on(stranger), &[stamp(6)]).await;
		assert!(matches!(result, Err(BackendError::Peer(_))));
		assert!(rx.try_recv().is_err());
		assert_eq!(store.tip().await.unwrap(), Some(stamp(5)));
	}
}
