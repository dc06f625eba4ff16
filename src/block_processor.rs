//! The chain follower.
//!
//! Translates provider block-number notifications into cache updates and
//! durable head advances. The head checkpoint is written strictly after the
//! batch that set the head committed, so a crash (or a failing listener)
//! anywhere earlier makes the next run re-process the same head.

use std::sync::{
	atomic::{AtomicBool, AtomicU64, Ordering},
	Arc, Mutex,
};

use futures::{future::BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::{
	block_cache::{AddResult, BlockCache},
	block_item_store::BlockItemStore,
	errors::{Error, Result},
	events::{EventChannel, HandlerId},
	provider::{BlockFetcher, BlockPoller, BlockProvider},
	store::{KvStore, SubSpace},
	types::Block,
};

pub const BLOCK_PROCESSOR_SUB_SPACE: &str = "block-processor";

const HEAD_KEY: &[u8] = b"head";

#[derive(Debug, Serialize, Deserialize)]
struct HeadRecord {
	head: u64,
}

/// Durable singleton holding the height of the last fully-processed head.
pub struct BlockProcessorStore {
	space: SubSpace,
}

impl BlockProcessorStore {
	pub fn new(store: Arc<dyn KvStore>) -> Self {
		BlockProcessorStore { space: SubSpace::new(store, BLOCK_PROCESSOR_SUB_SPACE) }
	}

	pub fn get_head(&self) -> Result<Option<u64>> {
		self.space
			.get(HEAD_KEY)?
			.map(|bytes| {
				serde_json::from_slice::<HeadRecord>(&bytes)
					.map(|record| record.head)
					.map_err(Into::into)
			})
			.transpose()
	}

	pub fn set_head(&self, head: u64) -> Result<()> {
		self.space.put(HEAD_KEY, &serde_json::to_vec(&HeadRecord { head })?)
	}
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyncStatus {
	pub last_processed_head: Option<u64>,
	pub highest_observed: u64,
	pub synchronized: bool,
}

pub struct BlockProcessor {
	cache: Arc<BlockCache>,
	store: Arc<BlockItemStore>,
	processor_store: BlockProcessorStore,
	fetcher: BlockFetcher,
	block_sync_threshold: u64,

	// Strict serialization of notification processing.
	lock: tokio::sync::Mutex<()>,
	started: AtomicBool,
	highest_observed: AtomicU64,
	last_processed_head: Mutex<Option<u64>>,

	new_block: EventChannel<Block>,
	new_head: EventChannel<Block>,
	cache_subscription: Mutex<Option<HandlerId>>,
	poller_subscription: Mutex<Option<HandlerId>>,
}

impl BlockProcessor {
	pub fn new(
		cache: Arc<BlockCache>,
		store: Arc<BlockItemStore>,
		processor_store: BlockProcessorStore,
		provider: Arc<dyn BlockProvider>,
		block_sync_threshold: u64,
	) -> Self {
		BlockProcessor {
			cache,
			store,
			processor_store,
			fetcher: BlockFetcher::new(provider),
			block_sync_threshold,
			lock: tokio::sync::Mutex::new(()),
			started: AtomicBool::new(false),
			highest_observed: AtomicU64::new(0),
			last_processed_head: Mutex::new(None),
			new_block: EventChannel::new(),
			new_head: EventChannel::new(),
			cache_subscription: Mutex::new(None),
			poller_subscription: Mutex::new(None),
		}
	}

	/// `new_block`, proxied from the cache once the processor is started.
	/// Handlers run inside the batch that attached the block.
	pub fn subscribe_new_block<F>(&self, handler: F) -> HandlerId
	where
		F: Fn(Block) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync + 'static,
	{
		self.new_block.subscribe(handler)
	}

	/// `new_head`, emitted inside the head batch. For any block, its
	/// `new_block` is always delivered before its `new_head`.
	pub fn subscribe_new_head<F>(&self, handler: F) -> HandlerId
	where
		F: Fn(Block) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync + 'static,
	{
		self.new_head.subscribe(handler)
	}

	/// Catch up from the durable checkpoint (or the provider's current tip)
	/// and then follow the poller's notifications.
	///
	/// Re-processing the checkpointed head on every start is deliberate: it
	/// replays `new_head` for that block, and subscribers are expected to
	/// deduplicate through their own durable state.
	pub async fn start(self: &Arc<Self>, poller: &BlockPoller) -> Result<()> {
		self.started.store(true, Ordering::Relaxed);

		let this = self.clone();
		*self.cache_subscription.lock().expect("subscription lock poisoned") =
			Some(self.cache.subscribe_new_block(move |block| {
				let this = this.clone();
				async move { this.new_block.emit(block).await.map_err(anyhow::Error::new) }.boxed()
			}));

		let from = match self.processor_store.get_head()? {
			Some(head) => head,
			None => self.fetcher.block_number().await?,
		};
		info!("Catching up from block number {from}");
		match self.process_block_number(from).await {
			Ok(()) => {},
			Err(e) if e.is_block_fetching() => {
				warn!("Provider could not serve catch-up block {from}: {e}. Waiting for notifications.")
			},
			// Anything else during startup goes to the supervisor.
			Err(e) => return Err(e),
		}

		let this = self.clone();
		*self.poller_subscription.lock().expect("subscription lock poisoned") =
			Some(poller.subscribe_new_block_number(move |number| {
				let this = this.clone();
				async move {
					this.handle_notification(number).await;
					Ok(())
				}
				.boxed()
			}));
		Ok(())
	}

	/// Unsubscribes and waits for the in-flight critical section only; an
	/// open batch is never aborted from here.
	pub async fn stop(&self, poller: &BlockPoller) {
		if let Some(id) = self.poller_subscription.lock().expect("subscription lock poisoned").take()
		{
			poller.unsubscribe(id);
		}
		if let Some(id) = self.cache_subscription.lock().expect("subscription lock poisoned").take()
		{
			self.cache.unsubscribe_new_block(id);
		}
		let _guard = self.lock.lock().await;
		self.started.store(false, Ordering::Relaxed);
	}

	async fn handle_notification(&self, observed: u64) {
		match self.process_block_number(observed).await {
			Ok(()) => {},
			Err(e) if e.is_block_fetching() => {
				debug!("Transient fetch failure processing block number {observed}: {e}. The next notification retries.")
			},
			Err(e) => error!("Dropping block number notification {observed}: {e:#}"),
		}
	}

	/// Brings the cache up to `observed`, back-filling ancestry, and
	/// advances the head. Notifications are handled strictly in order; a
	/// concurrent caller waits for the lock rather than being coalesced.
	pub async fn process_block_number(&self, observed: u64) -> Result<()> {
		let _guard = self.lock.lock().await;
		self.highest_observed.fetch_max(observed, Ordering::Relaxed);

		let was_empty = self.cache.is_empty();
		let mut processing = self.cache.head_number().unwrap_or(observed);
		let mut should_process_head = false;
		let mut pivot: Option<Block> = None;

		// Work towards `observed` in slices of at most max_depth so that an
		// arbitrarily large gap never walks ancestry further than the cache
		// window admits.
		loop {
			processing = processing.saturating_add(self.cache.max_depth()).min(observed);
			let slice_pivot = self.fetcher.block_by_number(processing).await?;
			let mut cur = slice_pivot.clone();
			pivot = Some(slice_pivot);

			loop {
				let added = self
					.store
					.with_batch(|| async { self.cache.add_block(cur.clone()).await })
					.await?;
				match added {
					AddResult::Added => {
						should_process_head = true;
						break
					},
					AddResult::AddedDetached | AddResult::NotAddedAlreadyExistedDetached => {
						// Keep walking down until the ancestry connects.
						let parent_hash = cur.parent_hash.clone();
						cur = match self.cache.block_if_present(&parent_hash) {
							Some(parent) => parent,
							None => self.fetcher.block_by_hash(&parent_hash).await?,
						};
					},
					AddResult::NotAddedAlreadyExisted | AddResult::NotAddedBlockNumberTooLow =>
						break,
				}
			}

			if processing >= observed {
				break
			}
		}

		if should_process_head || was_empty {
			let pivot = pivot.ok_or_else(|| {
				Error::application("processed a notification without fetching a pivot")
			})?;
			self.process_new_head(pivot).await?;
		}
		Ok(())
	}

	/// Sets the cache head and emits `new_head` in one batch, then persists
	/// the checkpoint. Only a fully-committed batch may advance the
	/// checkpoint; a listener failure leaves it untouched so the head is
	/// re-processed later.
	async fn process_new_head(&self, head: Block) -> Result<()> {
		let started = self.started.load(Ordering::Relaxed);

		self.store
			.with_batch(|| async {
				self.cache.set_head(&head.hash)?;
				if started {
					self.new_head.emit(head.clone()).await?;
				}
				Ok(())
			})
			.await?;

		self.processor_store.set_head(head.number)?;
		*self.last_processed_head.lock().expect("head tracking lock poisoned") = Some(head.number);
		info!("New head {} at height {}", head.hash, head.number);
		Ok(())
	}

	pub fn sync_status(&self) -> SyncStatus {
		let last_processed_head =
			*self.last_processed_head.lock().expect("head tracking lock poisoned");
		let highest_observed = self.highest_observed.load(Ordering::Relaxed);
		SyncStatus {
			last_processed_head,
			highest_observed,
			synchronized: last_processed_head
				.map(|head| head.saturating_add(self.block_sync_threshold) >= highest_observed)
				.unwrap_or(false),
		}
	}
}

#[cfg(test)]
mod tests {
	use std::{
		collections::{BTreeMap, HashMap, HashSet},
		time::Duration,
	};

	use async_trait::async_trait;

	use super::*;
	use crate::{
		block_item_store::BLOCK_ITEM_STORE_SUB_SPACE,
		store::memory::MemoryStore,
		types::BlockHash,
	};

	#[derive(Default)]
	struct FakeChain {
		by_number: BTreeMap<u64, Block>,
		by_hash: HashMap<BlockHash, Block>,
		null_heights: HashSet<u64>,
	}

	/// Scripted provider: the canonical block per height is the last one
	/// put, and heights can be made to resolve to null to fake transient
	/// provider failures.
	#[derive(Default)]
	struct FakeProvider {
		chain: Mutex<FakeChain>,
	}

	impl FakeProvider {
		fn put_chain(&self, blocks: &[Block]) {
			let mut chain = self.chain.lock().unwrap();
			for block in blocks {
				chain.by_number.insert(block.number, block.clone());
				chain.by_hash.insert(block.hash.clone(), block.clone());
			}
		}

		fn set_null(&self, height: u64, null: bool) {
			let mut chain = self.chain.lock().unwrap();
			if null {
				chain.null_heights.insert(height);
			} else {
				chain.null_heights.remove(&height);
			}
		}
	}

	#[async_trait]
	impl BlockProvider for FakeProvider {
		async fn block_by_number(
			&self,
			number: u64,
			_include_tx: bool,
		) -> anyhow::Result<Option<Block>> {
			let chain = self.chain.lock().unwrap();
			if chain.null_heights.contains(&number) {
				return Ok(None)
			}
			Ok(chain.by_number.get(&number).cloned())
		}

		async fn block_by_hash(
			&self,
			hash: &BlockHash,
			_include_tx: bool,
		) -> anyhow::Result<Option<Block>> {
			let chain = self.chain.lock().unwrap();
			Ok(chain
				.by_hash
				.get(hash)
				.filter(|block| !chain.null_heights.contains(&block.number))
				.cloned())
		}

		async fn block_number(&self) -> anyhow::Result<u64> {
			Ok(self.chain.lock().unwrap().by_number.keys().max().copied().unwrap_or(0))
		}
	}

	struct Fixture {
		kv: Arc<dyn KvStore>,
		provider: Arc<FakeProvider>,
		cache: Arc<BlockCache>,
		processor: Arc<BlockProcessor>,
		poller: BlockPoller,
		new_blocks: Arc<Mutex<Vec<u64>>>,
		new_heads: Arc<Mutex<Vec<u64>>>,
	}

	fn fixture(max_depth: u64) -> Fixture {
		fixture_on(Arc::new(MemoryStore::new()), Arc::new(FakeProvider::default()), max_depth)
	}

	fn fixture_on(
		kv: Arc<dyn KvStore>,
		provider: Arc<FakeProvider>,
		max_depth: u64,
	) -> Fixture {
		let store =
			Arc::new(BlockItemStore::new(SubSpace::new(kv.clone(), BLOCK_ITEM_STORE_SUB_SPACE)));
		store.start().unwrap();
		let cache = Arc::new(BlockCache::new(max_depth, store.clone()));
		let processor = Arc::new(BlockProcessor::new(
			cache.clone(),
			store.clone(),
			BlockProcessorStore::new(kv.clone()),
			provider.clone(),
			5,
		));
		let poller = BlockPoller::new(provider.clone(), Duration::from_secs(3600));

		let new_blocks = Arc::new(Mutex::new(Vec::new()));
		{
			let new_blocks = new_blocks.clone();
			processor.subscribe_new_block(move |block| {
				let new_blocks = new_blocks.clone();
				async move {
					new_blocks.lock().unwrap().push(block.number);
					Ok(())
				}
				.boxed()
			});
		}
		let new_heads = Arc::new(Mutex::new(Vec::new()));
		{
			let new_heads = new_heads.clone();
			processor.subscribe_new_head(move |block| {
				let new_heads = new_heads.clone();
				async move {
					new_heads.lock().unwrap().push(block.number);
					Ok(())
				}
				.boxed()
			});
		}

		Fixture { kv, provider, cache, processor, poller, new_blocks, new_heads }
	}

	fn chain(name: &str, parent: &str, from: u64, to: u64) -> Vec<Block> {
		let mut parent = parent.to_string();
		(from..=to)
			.map(|number| {
				let hash = format!("0x{name}{number:02}");
				let block = Block::new(number, &hash, &parent);
				parent = hash;
				block
			})
			.collect()
	}

	#[tokio::test]
	async fn linear_tail_advances_block_by_block() {
		let fixture = fixture(5);
		let blocks = chain("a", "0xa00", 1, 5);
		fixture.provider.put_chain(&blocks[..1]);
		fixture.processor.start(&fixture.poller).await.unwrap();

		fixture.provider.put_chain(&blocks);
		for number in 2..=5 {
			fixture.processor.process_block_number(number).await.unwrap();
		}

		assert_eq!(*fixture.new_blocks.lock().unwrap(), vec![1, 2, 3, 4, 5]);
		assert_eq!(*fixture.new_heads.lock().unwrap(), vec![1, 2, 3, 4, 5]);
		assert_eq!(fixture.cache.head().unwrap().number, 5);
		assert_eq!(
			BlockProcessorStore::new(fixture.kv.clone()).get_head().unwrap(),
			Some(5)
		);
	}

	#[tokio::test]
	async fn large_gaps_are_sliced_by_max_depth() {
		let fixture = fixture(10);
		let genesis = chain("a", "0xgenesis", 0, 0);
		fixture.provider.put_chain(&genesis);
		fixture.processor.start(&fixture.poller).await.unwrap();

		let blocks = chain("a", genesis[0].hash.as_str(), 1, 30);
		fixture.provider.put_chain(&blocks);
		fixture.processor.process_block_number(30).await.unwrap();

		assert_eq!(*fixture.new_blocks.lock().unwrap(), (0..=30).collect::<Vec<u64>>());
		// One head advance per notification, regardless of gap size.
		assert_eq!(*fixture.new_heads.lock().unwrap(), vec![0, 30]);
		assert_eq!(
			BlockProcessorStore::new(fixture.kv.clone()).get_head().unwrap(),
			Some(30)
		);
	}

	#[tokio::test]
	async fn transient_provider_failure_leaves_ancestry_detached_until_retry() {
		let fixture = fixture(5);
		let base = chain("a", "0xa00", 1, 2);
		fixture.provider.put_chain(&base);
		fixture.processor.start(&fixture.poller).await.unwrap();
		fixture.processor.process_block_number(2).await.unwrap();

		let tail = chain("b", base[1].hash.as_str(), 3, 6);
		fixture.provider.put_chain(&tail);
		fixture.provider.set_null(3, true);

		// The walk dies fetching block 3; 4 and 5 stay detached.
		assert!(fixture
			.processor
			.process_block_number(5)
			.await
			.unwrap_err()
			.is_block_fetching());
		assert!(fixture.cache.has_block(&tail[2].hash, true));
		assert!(!fixture.cache.has_block(&tail[2].hash, false));
		assert!(fixture.cache.has_block(&tail[1].hash, true));
		assert!(fixture.cache.block_if_present(&tail[0].hash).is_none());
		assert_eq!(fixture.cache.head().unwrap().number, 2);

		// Provider recovers; the next notification attaches 3..6 in order.
		fixture.provider.set_null(3, false);
		fixture.processor.process_block_number(6).await.unwrap();

		assert_eq!(
			fixture.new_blocks.lock().unwrap().as_slice(),
			// The catch-up root first, then the recovered b-chain.
			&[2, 3, 4, 5, 6]
		);
		assert_eq!(fixture.cache.head().unwrap().number, 6);
		assert_eq!(
			BlockProcessorStore::new(fixture.kv.clone()).get_head().unwrap(),
			Some(6)
		);
	}

	#[tokio::test]
	async fn failing_head_listener_keeps_the_checkpoint_and_restart_reprocesses() {
		let kv: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
		let provider = Arc::new(FakeProvider::default());
		let blocks = chain("a", "0xa00", 1, 3);

		{
			let fixture = fixture_on(kv.clone(), provider.clone(), 5);
			provider.put_chain(&blocks[..1]);
			fixture.processor.start(&fixture.poller).await.unwrap();
			provider.put_chain(&blocks);
			fixture.processor.process_block_number(2).await.unwrap();

			// A listener that cannot stomach block 3.
			fixture.processor.subscribe_new_head(|block| {
				async move {
					if block.number == 3 {
						anyhow::bail!("not block 3, thanks")
					}
					Ok(())
				}
				.boxed()
			});
			assert!(fixture.processor.process_block_number(3).await.is_err());
			assert_eq!(
				BlockProcessorStore::new(kv.clone()).get_head().unwrap(),
				Some(2)
			);
		}

		// Restart over the same kv store, listeners healthy again.
		let fixture = fixture_on(kv.clone(), provider, 5);
		fixture.processor.start(&fixture.poller).await.unwrap();

		// The checkpointed head is re-processed and its new_head replayed.
		assert_eq!(*fixture.new_heads.lock().unwrap(), vec![2]);
		fixture.processor.process_block_number(3).await.unwrap();
		assert_eq!(*fixture.new_heads.lock().unwrap(), vec![2, 3]);
		assert_eq!(BlockProcessorStore::new(kv).get_head().unwrap(), Some(3));
	}

	#[tokio::test]
	async fn stale_notifications_change_nothing() {
		let fixture = fixture(5);
		let blocks = chain("a", "0xa00", 1, 3);
		fixture.provider.put_chain(&blocks[..1]);
		fixture.processor.start(&fixture.poller).await.unwrap();

		fixture.provider.put_chain(&blocks);
		for number in 2..=3 {
			fixture.processor.process_block_number(number).await.unwrap();
		}
		assert_eq!(fixture.cache.head().unwrap().number, 3);

		// A notification for an already-processed height is a no-op.
		fixture.processor.process_block_number(2).await.unwrap();
		assert_eq!(fixture.cache.head().unwrap().number, 3);
		assert_eq!(
			BlockProcessorStore::new(fixture.kv.clone()).get_head().unwrap(),
			Some(3)
		);
	}

	#[tokio::test]
	async fn sync_status_tracks_the_observed_tip() {
		let fixture = fixture(5);
		let blocks = chain("a", "0xa00", 1, 5);
		fixture.provider.put_chain(&blocks);
		fixture.processor.start(&fixture.poller).await.unwrap();

		let status = fixture.processor.sync_status();
		assert_eq!(status.last_processed_head, Some(5));
		assert!(status.synchronized);

		// The provider runs ahead; with threshold 5, a lag of 15 is too much.
		let tail = chain("a", blocks[4].hash.as_str(), 6, 20);
		fixture.provider.put_chain(&tail);
		fixture.provider.set_null(20, true);
		let _ = fixture.processor.process_block_number(20).await;
		assert!(!fixture.processor.sync_status().synchronized);
	}
}
