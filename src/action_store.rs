//! Durable, memory-mirrored store of pending side-effect actions.
//!
//! Every stored item receives a fresh uuid at insertion time. The durable key
//! is `"<key>:<uuid>"`, which lets startup rebuild the whole mapping by
//! splitting on the final colon.

use std::{
	collections::HashMap,
	sync::{Arc, Mutex},
};

use itertools::Itertools;
use uuid::Uuid;

use crate::{
	errors::{Error, Result},
	store::{BatchOp, KvStore, SubSpace},
};

pub const ACTION_STORE_SUB_SPACE_PREFIX: &str = "cachedkeyvaluestore-";

#[derive(Debug, Clone, PartialEq)]
pub struct ItemAndId {
	pub id: Uuid,
	pub value: serde_json::Value,
}

pub struct ActionStore {
	space: SubSpace,
	index: Mutex<HashMap<String, HashMap<Uuid, serde_json::Value>>>,
}

fn action_db_key(key: &str, id: &Uuid) -> Vec<u8> {
	format!("{key}:{id}").into_bytes()
}

impl ActionStore {
	pub fn new(store: Arc<dyn KvStore>, name: &str) -> Self {
		ActionStore {
			space: SubSpace::new(store, &format!("{ACTION_STORE_SUB_SPACE_PREFIX}{name}")),
			index: Mutex::new(HashMap::new()),
		}
	}

	/// Hydrates the memory mirror from the durable sub-space.
	pub fn start(&self) -> Result<()> {
		let mut index: HashMap<String, HashMap<Uuid, serde_json::Value>> = HashMap::new();
		for (key, value) in self.space.iterate()? {
			let key = String::from_utf8(key)
				.map_err(|e| Error::Store(format!("non-utf8 action key: {e}")))?;
			let (outer, id) = key
				.rsplit_once(':')
				.ok_or_else(|| Error::Store(format!("malformed action key {key:?}")))?;
			let id = id
				.parse::<Uuid>()
				.map_err(|e| Error::Store(format!("unparseable action id in {key:?}: {e}")))?;
			let value: serde_json::Value = serde_json::from_slice(&value)?;
			index.entry(outer.to_string()).or_default().insert(id, value);
		}
		*self.index.lock().expect("action index lock poisoned") = index;
		Ok(())
	}

	pub fn stop(&self) {}

	/// Assigns a fresh id to every item, writes them in one atomic batch and
	/// mirrors them into memory only once the batch is durable.
	pub fn store_items(
		&self,
		key: &str,
		items: Vec<serde_json::Value>,
	) -> Result<Vec<ItemAndId>> {
		let wrapped: Vec<ItemAndId> = items
			.into_iter()
			.map(|value| ItemAndId { id: Uuid::new_v4(), value })
			.collect();

		self.space.write_batch(
			wrapped
				.iter()
				.map(|item| {
					Ok(BatchOp::Put {
						key: action_db_key(key, &item.id),
						value: serde_json::to_vec(&item.value)?,
					})
				})
				.collect::<Result<Vec<_>>>()?,
		)?;

		let mut index = self.index.lock().expect("action index lock poisoned");
		let entries = index.entry(key.to_string()).or_default();
		for item in &wrapped {
			entries.insert(item.id, item.value.clone());
		}
		Ok(wrapped)
	}

	/// Pending items for `key`, in stable id order.
	pub fn get_items(&self, key: &str) -> Vec<ItemAndId> {
		self.index
			.lock()
			.expect("action index lock poisoned")
			.get(key)
			.map(|entries| {
				entries
					.iter()
					.map(|(id, value)| ItemAndId { id: *id, value: value.clone() })
					.sorted_by_key(|item| item.id)
					.collect()
			})
			.unwrap_or_default()
	}

	/// Deletes from the durable store first, then unmirrors. A crash between
	/// the two leaves only a memory entry that the next restart discards.
	pub fn remove_item(&self, key: &str, item: &ItemAndId) -> Result<()> {
		self.space.delete(&action_db_key(key, &item.id))?;
		let mut index = self.index.lock().expect("action index lock poisoned");
		if let Some(entries) = index.get_mut(key) {
			entries.remove(&item.id);
			if entries.is_empty() {
				index.remove(key);
			}
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::store::memory::MemoryStore;

	fn new_store() -> (Arc<dyn KvStore>, ActionStore) {
		let kv: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
		let store = ActionStore::new(kv.clone(), "test");
		store.start().unwrap();
		(kv, store)
	}

	#[test]
	fn stored_items_get_distinct_ids_and_are_readable() {
		let (_, store) = new_store();
		let stored = store
			.store_items(
				"responder",
				vec![serde_json::json!({"act": 1}), serde_json::json!({"act": 2})],
			)
			.unwrap();

		assert_eq!(stored.len(), 2);
		assert_ne!(stored[0].id, stored[1].id);

		let read = store.get_items("responder");
		assert_eq!(read.len(), 2);
		for item in &stored {
			assert!(read.contains(item));
		}
	}

	#[test]
	fn items_survive_restart_and_removal_is_durable() {
		let (kv, store) = new_store();
		let stored = store
			.store_items("responder", vec![serde_json::json!("only")])
			.unwrap();

		let restarted = ActionStore::new(kv.clone(), "test");
		restarted.start().unwrap();
		assert_eq!(restarted.get_items("responder"), stored);

		restarted.remove_item("responder", &stored[0]).unwrap();
		assert!(restarted.get_items("responder").is_empty());

		let restarted_again = ActionStore::new(kv, "test");
		restarted_again.start().unwrap();
		assert!(restarted_again.get_items("responder").is_empty());
	}

	#[test]
	fn keys_do_not_observe_each_other() {
		let (_, store) = new_store();
		store.store_items("alpha", vec![serde_json::json!(1)]).unwrap();
		store.store_items("beta", vec![serde_json::json!(2)]).unwrap();

		assert_eq!(store.get_items("alpha").len(), 1);
		assert_eq!(store.get_items("beta").len(), 1);
		assert!(store.get_items("gamma").is_empty());
	}
}
