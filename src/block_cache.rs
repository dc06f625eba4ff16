//! Bounded fork-aware view of recent blocks.
//!
//! The cache distinguishes attached blocks (reachable from a root through
//! present parents) from detached ones (parent unknown, typically because
//! ancestry is still being back-filled). Block bodies and attached flags are
//! persisted through the block item store; the tree index itself is rebuilt
//! each process lifetime by the processor re-walking ancestry from the
//! durable head checkpoint.

use std::{
	collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque},
	sync::{Arc, Mutex},
};

use futures::future::BoxFuture;

use crate::{
	block_item_store::BlockItemStore,
	constants::{ATTACHED_ITEM_KEY, BLOCK_ITEM_KEY},
	errors::{Error, Result},
	events::{EventChannel, HandlerId},
	types::{Block, BlockHash, ItemValue},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddResult {
	Added,
	AddedDetached,
	NotAddedAlreadyExisted,
	NotAddedAlreadyExistedDetached,
	NotAddedBlockNumberTooLow,
}

struct CacheEntry {
	height: u64,
	parent: BlockHash,
	attached: bool,
}

#[derive(Default)]
struct TreeIndex {
	entries: HashMap<BlockHash, CacheEntry>,
	heights: BTreeMap<u64, BTreeSet<BlockHash>>,
	children: HashMap<BlockHash, BTreeSet<BlockHash>>,
	max_height: Option<u64>,
	head: Option<BlockHash>,
}

impl TreeIndex {
	fn min_height(&self, max_depth: u64) -> u64 {
		self.max_height.map_or(0, |max| max.saturating_sub(max_depth))
	}

	fn insert(&mut self, block: &Block, attached: bool) {
		self.entries.insert(
			block.hash.clone(),
			CacheEntry { height: block.number, parent: block.parent_hash.clone(), attached },
		);
		self.heights.entry(block.number).or_default().insert(block.hash.clone());
		self.children
			.entry(block.parent_hash.clone())
			.or_default()
			.insert(block.hash.clone());
	}

	/// Hashes of the head's ancestry chain, the head included, as far back as
	/// the cache reaches.
	fn ancestry_hashes(&self, from: &BlockHash) -> HashSet<BlockHash> {
		let mut hashes = HashSet::new();
		let mut cursor = self.entries.contains_key(from).then(|| from.clone());
		while let Some(hash) = cursor {
			let entry = &self.entries[&hash];
			cursor = self.entries.contains_key(&entry.parent).then(|| entry.parent.clone());
			hashes.insert(hash);
		}
		hashes
	}
}

pub struct BlockCache {
	max_depth: u64,
	store: Arc<BlockItemStore>,
	index: Mutex<TreeIndex>,
	new_block: EventChannel<Block>,
}

impl BlockCache {
	/// `max_depth` is the deepest reorg the cache accommodates.
	pub fn new(max_depth: u64, store: Arc<BlockItemStore>) -> Self {
		BlockCache {
			max_depth,
			store,
			index: Mutex::new(TreeIndex::default()),
			new_block: EventChannel::new(),
		}
	}

	pub fn max_depth(&self) -> u64 {
		self.max_depth
	}

	pub fn subscribe_new_block<F>(&self, handler: F) -> HandlerId
	where
		F: Fn(Block) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync + 'static,
	{
		self.new_block.subscribe(handler)
	}

	pub fn unsubscribe_new_block(&self, id: HandlerId) {
		self.new_block.unsubscribe(id)
	}

	/// Adds a block, attaching it when its ancestry allows and cascading the
	/// attachment through any detached descendants. `new_block` is emitted,
	/// parent before child, for every block that becomes attached.
	///
	/// Must run inside an open block item batch: both the block records and
	/// any writes performed by `new_block` listeners belong to that batch.
	pub async fn add_block(&self, block: Block) -> Result<AddResult> {
		enum Outcome {
			Attached { flipped: Vec<(u64, BlockHash)> },
			Detached,
		}

		let outcome = {
			let mut index = self.index.lock().expect("block cache index lock poisoned");
			let index = &mut *index;

			if !index.entries.is_empty() && block.number < index.min_height(self.max_depth) {
				return Ok(AddResult::NotAddedBlockNumberTooLow)
			}
			if let Some(entry) = index.entries.get(&block.hash) {
				return Ok(if entry.attached {
					AddResult::NotAddedAlreadyExisted
				} else {
					AddResult::NotAddedAlreadyExistedDetached
				})
			}

			let is_first = index.entries.is_empty();
			let roots_a_fork = block.number == index.min_height(self.max_depth);
			let parent_attached = index
				.entries
				.get(&block.parent_hash)
				.map(|entry| entry.attached)
				.unwrap_or(false);

			if is_first || roots_a_fork || parent_attached {
				index.insert(&block, true);
				index.max_height = Some(index.max_height.map_or(block.number, |m| m.max(block.number)));

				// Attach detached descendants breadth-first so parents are
				// recorded (and emitted) before their children.
				let mut flipped = Vec::new();
				let mut queue = VecDeque::from([block.hash.clone()]);
				while let Some(hash) = queue.pop_front() {
					let children: Vec<BlockHash> = index
						.children
						.get(&hash)
						.map(|children| children.iter().cloned().collect())
						.unwrap_or_default();
					for child in children {
						let entry = index
							.entries
							.get_mut(&child)
							.expect("child index refers to a present entry");
						if !entry.attached {
							entry.attached = true;
							let height = entry.height;
							index.max_height =
								Some(index.max_height.map_or(height, |m| m.max(height)));
							flipped.push((height, child.clone()));
							queue.push_back(child);
						}
					}
				}
				Outcome::Attached { flipped }
			} else {
				index.insert(&block, false);
				Outcome::Detached
			}
		};

		match outcome {
			Outcome::Attached { flipped } => {
				self.store.put_block_item(
					block.number,
					&block.hash,
					BLOCK_ITEM_KEY,
					ItemValue::Block(block.clone()),
				)?;
				self.store.put_block_item(
					block.number,
					&block.hash,
					ATTACHED_ITEM_KEY,
					ItemValue::Attached(true),
				)?;
				for (height, hash) in &flipped {
					self.store.put_block_item(
						*height,
						hash,
						ATTACHED_ITEM_KEY,
						ItemValue::Attached(true),
					)?;
				}

				self.new_block.emit(block.clone()).await?;
				for (_, hash) in flipped {
					let descendant = self.stored_block(&hash)?;
					self.new_block.emit(descendant).await?;
				}
				Ok(AddResult::Added)
			},
			Outcome::Detached => {
				self.store.put_block_item(
					block.number,
					&block.hash,
					BLOCK_ITEM_KEY,
					ItemValue::Block(block.clone()),
				)?;
				self.store.put_block_item(
					block.number,
					&block.hash,
					ATTACHED_ITEM_KEY,
					ItemValue::Attached(false),
				)?;
				Ok(AddResult::AddedDetached)
			},
		}
	}

	fn stored_block(&self, hash: &BlockHash) -> Result<Block> {
		self.store
			.get_item(hash, BLOCK_ITEM_KEY)
			.as_ref()
			.and_then(ItemValue::as_block)
			.cloned()
			.ok_or_else(|| {
				Error::application(format!("cache index and item store disagree about {hash}"))
			})
	}

	pub fn has_block(&self, hash: &BlockHash, allow_pending: bool) -> bool {
		self.index
			.lock()
			.expect("block cache index lock poisoned")
			.entries
			.get(hash)
			.map(|entry| entry.attached || allow_pending)
			.unwrap_or(false)
	}

	pub fn get_block(&self, hash: &BlockHash) -> Result<Block> {
		if !self.index.lock().expect("block cache index lock poisoned").entries.contains_key(hash) {
			return Err(Error::application(format!("no block in cache with hash {hash}")))
		}
		self.stored_block(hash)
	}

	/// The block if the cache holds it, attached or not.
	pub fn block_if_present(&self, hash: &BlockHash) -> Option<Block> {
		self.has_block(hash, true).then(|| self.stored_block(hash)).transpose().ok().flatten()
	}

	/// Lazily walks parent links from `hash` (inclusive) to the oldest
	/// ancestor the cache holds. Empty if `hash` is absent.
	pub fn ancestry(&self, hash: &BlockHash) -> Ancestry<'_> {
		let start = self
			.index
			.lock()
			.expect("block cache index lock poisoned")
			.entries
			.contains_key(hash)
			.then(|| hash.clone());
		Ancestry { cache: self, cursor: start }
	}

	/// Nearest ancestor (the block itself included) at or above `min_height`
	/// satisfying `predicate`.
	pub fn find_ancestor(
		&self,
		hash: &BlockHash,
		predicate: impl Fn(&Block) -> bool,
		min_height: Option<u64>,
	) -> Option<Block> {
		self.ancestry(hash)
			.take_while(|block| min_height.map_or(true, |min| block.number >= min))
			.find(|block| predicate(block))
	}

	pub fn get_oldest_ancestor_in_cache(&self, hash: &BlockHash) -> Result<Block> {
		self.ancestry(hash)
			.last()
			.ok_or_else(|| Error::argument(format!("no block in cache with hash {hash}")))
	}

	/// Whether `add_block` would accept this block as attached or at least
	/// keep making progress: it either roots below the depth window or its
	/// parent is already present.
	pub fn can_attach_block(&self, block: &Block) -> bool {
		let index = self.index.lock().expect("block cache index lock poisoned");
		index.entries.is_empty() ||
			block.number <= index.min_height(self.max_depth) ||
			index.entries.contains_key(&block.parent_hash)
	}

	/// Designates the pruning anchor and prunes blocks below
	/// `max(max_height, head.number) - max_depth`. The head's own ancestry
	/// chain is retained across the full depth so `ancestry(head)` stays
	/// traversable; everything else below the threshold is deleted.
	///
	/// Must run inside an open block item batch.
	pub fn set_head(&self, hash: &BlockHash) -> Result<()> {
		let doomed: Vec<(u64, BlockHash)> = {
			let mut index = self.index.lock().expect("block cache index lock poisoned");
			let index = &mut *index;
			let head_height = index
				.entries
				.get(hash)
				.map(|entry| entry.height)
				.ok_or_else(|| Error::argument(format!("cannot set head to unknown block {hash}")))?;
			index.head = Some(hash.clone());

			let threshold = index
				.max_height
				.map_or(head_height, |m| m.max(head_height))
				.saturating_sub(self.max_depth);
			let retained = index.ancestry_hashes(hash);

			let doomed: Vec<(u64, BlockHash)> = index
				.heights
				.range(..threshold)
				.flat_map(|(&height, hashes)| {
					hashes
						.iter()
						.filter(|hash| !retained.contains(*hash))
						.map(move |hash| (height, hash.clone()))
				})
				.collect();

			for (height, hash) in &doomed {
				let parent = index.entries.remove(hash).map(|entry| entry.parent);
				index.children.remove(hash);
				if let Some(parent) = parent {
					if let Some(siblings) = index.children.get_mut(&parent) {
						siblings.remove(hash);
						if siblings.is_empty() {
							index.children.remove(&parent);
						}
					}
				}
				if let Some(hashes) = index.heights.get_mut(height) {
					hashes.remove(hash);
					if hashes.is_empty() {
						index.heights.remove(height);
					}
				}
			}
			doomed
		};

		for (height, hash) in doomed {
			self.store.delete_block_items(height, &hash)?;
		}
		Ok(())
	}

	pub fn head(&self) -> Result<Block> {
		let hash = self
			.index
			.lock()
			.expect("block cache index lock poisoned")
			.head
			.clone()
			.ok_or_else(|| Error::application("head read before set_head"))?;
		self.stored_block(&hash)
	}

	pub fn head_number(&self) -> Option<u64> {
		let index = self.index.lock().expect("block cache index lock poisoned");
		index.head.as_ref().and_then(|hash| index.entries.get(hash)).map(|entry| entry.height)
	}

	pub fn max_height(&self) -> Option<u64> {
		self.index.lock().expect("block cache index lock poisoned").max_height
	}

	/// `max(0, max_height - max_depth)`; zero while the cache is empty.
	pub fn min_height(&self) -> u64 {
		self.index.lock().expect("block cache index lock poisoned").min_height(self.max_depth)
	}

	pub fn is_empty(&self) -> bool {
		self.index.lock().expect("block cache index lock poisoned").entries.is_empty()
	}
}

pub struct Ancestry<'a> {
	cache: &'a BlockCache,
	cursor: Option<BlockHash>,
}

impl Iterator for Ancestry<'_> {
	type Item = Block;

	fn next(&mut self) -> Option<Self::Item> {
		let hash = self.cursor.take()?;
		let block = self.cache.stored_block(&hash).ok()?;
		self.cursor = {
			let index = self.cache.index.lock().expect("block cache index lock poisoned");
			index
				.entries
				.contains_key(&block.parent_hash)
				.then(|| block.parent_hash.clone())
		};
		Some(block)
	}
}
