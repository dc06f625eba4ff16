//! Item storage keyed by `(height, hash, item_key)`.
//!
//! The store keeps a full in-memory mirror of its durable sub-space. Writes
//! are only possible inside an exclusive batch: memory is updated eagerly,
//! the durable operations are staged, and the stage commits atomically when
//! the batch callback succeeds. After a failed commit the memory mirror is
//! untrusted and the process is expected to restart, which re-hydrates the
//! mirror from durable truth.

use std::{
	collections::{BTreeMap, BTreeSet, HashMap},
	future::Future,
	sync::Mutex,
};

use crate::{
	constants::{ATTACHED_ITEM_KEY, BLOCK_ITEM_KEY, STATE_KEY_SUFFIX},
	errors::{Error, Result},
	store::{BatchOp, SubSpace},
	types::{BlockAndAttached, BlockHash, ItemValue},
};

pub const BLOCK_ITEM_STORE_SUB_SPACE: &str = "block-item-store";

#[derive(Default)]
struct Index {
	by_hash: HashMap<BlockHash, HashMap<String, ItemValue>>,
	height_of: HashMap<BlockHash, u64>,
	heights: BTreeMap<u64, BTreeSet<BlockHash>>,
	has_any_anchor_states: bool,
}

pub struct BlockItemStore {
	space: SubSpace,
	index: Mutex<Index>,
	pending: Mutex<Option<Vec<BatchOp>>>,
	batch_lock: tokio::sync::Mutex<()>,
}

fn item_db_key(height: u64, hash: &BlockHash, item_key: &str) -> Vec<u8> {
	format!("{height}:{hash}:{item_key}").into_bytes()
}

impl BlockItemStore {
	pub fn new(space: SubSpace) -> Self {
		BlockItemStore {
			space,
			index: Mutex::new(Index::default()),
			pending: Mutex::new(None),
			batch_lock: tokio::sync::Mutex::new(()),
		}
	}

	/// Hydrates the memory mirror from the durable sub-space. Idempotent
	/// across restarts; an already-hydrated mirror is rebuilt from scratch.
	pub fn start(&self) -> Result<()> {
		let mut index = Index::default();
		for (key, value) in self.space.iterate()? {
			let key = String::from_utf8(key)
				.map_err(|e| Error::Store(format!("non-utf8 block item key: {e}")))?;
			let mut parts = key.splitn(3, ':');
			let (height, hash, item_key) = match (parts.next(), parts.next(), parts.next()) {
				(Some(height), Some(hash), Some(item_key)) => (
					height.parse::<u64>().map_err(|e| {
						Error::Store(format!("unparseable height in block item key {key:?}: {e}"))
					})?,
					BlockHash::new(hash),
					item_key.to_string(),
				),
				_ => return Err(Error::Store(format!("malformed block item key {key:?}"))),
			};
			let value: ItemValue = serde_json::from_slice(&value)?;

			if item_key.ends_with(STATE_KEY_SUFFIX) {
				index.has_any_anchor_states = true;
			}
			index.height_of.insert(hash.clone(), height);
			index.heights.entry(height).or_default().insert(hash.clone());
			index.by_hash.entry(hash).or_default().insert(item_key, value);
		}
		*self.index.lock().expect("block item index lock poisoned") = index;
		Ok(())
	}

	/// Drops any in-flight batch stage. Durable state is untouched.
	pub fn stop(&self) {
		*self.pending.lock().expect("block item batch stage lock poisoned") = None;
	}

	/// Runs `callback` with an open batch and commits the staged operations
	/// atomically when it succeeds. A callback error (or a commit failure)
	/// discards the stage and surfaces the error.
	///
	/// Only one batch may be open at a time. A second caller, including a
	/// re-entrant one from inside `callback`, fails immediately instead of
	/// queueing, so the caller can decide what to do.
	pub async fn with_batch<T, F, Fut>(&self, callback: F) -> Result<T>
	where
		F: FnOnce() -> Fut,
		Fut: Future<Output = Result<T>>,
	{
		let _guard = self
			.batch_lock
			.try_lock()
			.map_err(|_| Error::application("a block item batch is already open"))?;

		*self.pending.lock().expect("block item batch stage lock poisoned") = Some(Vec::new());

		let result = callback().await;

		let staged = self
			.pending
			.lock()
			.expect("block item batch stage lock poisoned")
			.take()
			.expect("batch stage cannot disappear while the batch lock is held");

		match result {
			Ok(value) => {
				self.space.write_batch(staged)?;
				Ok(value)
			},
			Err(e) => Err(e),
		}
	}

	/// Stages a write into the memory mirror and the open batch. Fails when
	/// no batch is open.
	pub fn put_block_item(
		&self,
		height: u64,
		hash: &BlockHash,
		item_key: &str,
		value: ItemValue,
	) -> Result<()> {
		let mut pending = self.pending.lock().expect("block item batch stage lock poisoned");
		let staged = pending
			.as_mut()
			.ok_or_else(|| Error::application("put_block_item called outside an open batch"))?;

		staged.push(BatchOp::Put {
			key: item_db_key(height, hash, item_key),
			value: serde_json::to_vec(&value)?,
		});

		let mut index = self.index.lock().expect("block item index lock poisoned");
		if item_key.ends_with(STATE_KEY_SUFFIX) {
			index.has_any_anchor_states = true;
		}
		index.height_of.insert(hash.clone(), height);
		index.heights.entry(height).or_default().insert(hash.clone());
		index
			.by_hash
			.entry(hash.clone())
			.or_default()
			.insert(item_key.to_string(), value);
		Ok(())
	}

	pub fn get_item(&self, hash: &BlockHash, item_key: &str) -> Option<ItemValue> {
		self.index
			.lock()
			.expect("block item index lock poisoned")
			.by_hash
			.get(hash)
			.and_then(|items| items.get(item_key))
			.cloned()
	}

	/// Every block recorded at `height`, paired with its attached flag.
	pub fn get_blocks_at_height(&self, height: u64) -> Vec<BlockAndAttached> {
		let index = self.index.lock().expect("block item index lock poisoned");
		let Some(hashes) = index.heights.get(&height) else { return Vec::new() };
		hashes
			.iter()
			.filter_map(|hash| {
				let items = index.by_hash.get(hash)?;
				let block = items.get(BLOCK_ITEM_KEY)?.as_block()?.clone();
				let attached = items
					.get(ATTACHED_ITEM_KEY)
					.and_then(ItemValue::as_attached)
					.unwrap_or(false);
				Some(BlockAndAttached { block, attached })
			})
			.collect()
	}

	/// Removes every item at `height` from the memory mirror and stages the
	/// matching durable deletes.
	pub fn delete_items_at_height(&self, height: u64) -> Result<()> {
		let hashes: Vec<BlockHash> = {
			let index = self.index.lock().expect("block item index lock poisoned");
			index.heights.get(&height).map(|hashes| hashes.iter().cloned().collect()).unwrap_or_default()
		};
		for hash in hashes {
			self.delete_block_items(height, &hash)?;
		}
		Ok(())
	}

	/// Removes every item of one block. Needed by pruning, which must delete
	/// non-ancestor blocks while retaining the head's ancestry at the same
	/// height.
	pub fn delete_block_items(&self, height: u64, hash: &BlockHash) -> Result<()> {
		let mut pending = self.pending.lock().expect("block item batch stage lock poisoned");
		let staged = pending
			.as_mut()
			.ok_or_else(|| Error::application("delete_block_items called outside an open batch"))?;

		let mut index = self.index.lock().expect("block item index lock poisoned");
		let Some(items) = index.by_hash.remove(hash) else { return Ok(()) };
		for item_key in items.keys() {
			staged.push(BatchOp::Delete { key: item_db_key(height, hash, item_key) });
		}
		index.height_of.remove(hash);
		if let Some(hashes) = index.heights.get_mut(&height) {
			hashes.remove(hash);
			if hashes.is_empty() {
				index.heights.remove(&height);
			}
		}
		Ok(())
	}

	pub fn has_any_anchor_states(&self) -> bool {
		self.index.lock().expect("block item index lock poisoned").has_any_anchor_states
	}
}
