#![allow(dead_code)]

use std::{
	collections::{BTreeMap, HashMap, HashSet},
	path::Path,
	sync::{Arc, Mutex},
	time::Duration,
};

use async_trait::async_trait;
use futures::FutureExt;

use chaintail_engine::{
	action_store::ActionStore,
	block_cache::BlockCache,
	block_item_store::{BlockItemStore, BLOCK_ITEM_STORE_SUB_SPACE},
	block_processor::{BlockProcessor, BlockProcessorStore},
	machine::{BlockchainMachine, Component},
	provider::{BlockPoller, BlockProvider},
	store::{persistent::PersistentStore, KvStore, SubSpace},
	types::{Block, BlockHash},
};

/// Builds a linear chain `name<from> .. name<to>` hanging off `parent`.
pub fn chain(name: &str, parent: &str, from: u64, to: u64) -> Vec<Block> {
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

#[derive(Default)]
struct FakeChain {
	by_number: BTreeMap<u64, Block>,
	by_hash: HashMap<BlockHash, Block>,
	null_heights: HashSet<u64>,
}

/// Scripted provider. The canonical block at a height is the last one put,
/// so re-putting a fork reorganizes the served chain. Heights can be made to
/// resolve to null to fake transient provider failures.
#[derive(Default)]
pub struct FakeChainProvider {
	chain: Mutex<FakeChain>,
}

impl FakeChainProvider {
	pub fn put_chain(&self, blocks: &[Block]) {
		let mut chain = self.chain.lock().unwrap();
		for block in blocks {
			chain.by_number.insert(block.number, block.clone());
			chain.by_hash.insert(block.hash.clone(), block.clone());
		}
	}

	pub fn set_null(&self, height: u64, null: bool) {
		let mut chain = self.chain.lock().unwrap();
		if null {
			chain.null_heights.insert(height);
		} else {
			chain.null_heights.remove(&height);
		}
	}
}

#[async_trait]
impl BlockProvider for FakeChainProvider {
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

/// One process lifetime of the whole engine over a durable database.
/// Dropping it after `shutdown` releases the database for the next lifetime.
pub struct Engine {
	pub kv: Arc<dyn KvStore>,
	pub item_store: Arc<BlockItemStore>,
	pub action_store: Arc<ActionStore>,
	pub cache: Arc<BlockCache>,
	pub machine: Arc<BlockchainMachine>,
	pub processor: Arc<BlockProcessor>,
	pub poller: BlockPoller,
	pub new_blocks: Arc<Mutex<Vec<u64>>>,
	pub new_heads: Arc<Mutex<Vec<u64>>>,
}

impl Engine {
	pub fn build(
		db_path: &Path,
		provider: Arc<FakeChainProvider>,
		max_depth: u64,
		components: Vec<Arc<dyn Component>>,
	) -> Self {
		let kv: Arc<dyn KvStore> = Arc::new(PersistentStore::open(db_path).unwrap());

		let item_store =
			Arc::new(BlockItemStore::new(SubSpace::new(kv.clone(), BLOCK_ITEM_STORE_SUB_SPACE)));
		item_store.start().unwrap();
		let action_store = Arc::new(ActionStore::new(kv.clone(), "engine"));
		action_store.start().unwrap();

		let cache = Arc::new(BlockCache::new(max_depth, item_store.clone()));
		let machine = Arc::new(
			BlockchainMachine::new(item_store.clone(), action_store.clone(), components).unwrap(),
		);
		machine.attach(&cache);

		let processor = Arc::new(BlockProcessor::new(
			cache.clone(),
			item_store.clone(),
			BlockProcessorStore::new(kv.clone()),
			provider.clone(),
			5,
		));
		let poller = BlockPoller::new(provider, Duration::from_secs(3600));

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

		Engine {
			kv,
			item_store,
			action_store,
			cache,
			machine,
			processor,
			poller,
			new_blocks,
			new_heads,
		}
	}

	pub async fn start(&self) {
		self.machine.start();
		self.processor.start(&self.poller).await.unwrap();
	}

	pub fn persisted_head(&self) -> Option<u64> {
		BlockProcessorStore::new(self.kv.clone()).get_head().unwrap()
	}

	/// Stops the processor (breaking its subscription cycle with the cache)
	/// so that dropping the engine releases the database handle.
	pub async fn shutdown(self) {
		self.poller.stop();
		self.processor.stop(&self.poller).await;
		self.item_store.stop();
		self.action_store.stop();
	}
}

/// Lets spawned fire-and-forget action tasks run to completion.
pub async fn settle() {
	tokio::task::yield_now().await;
	tokio::time::sleep(Duration::from_millis(30)).await;
}
