use std::{collections::BTreeMap, sync::RwLock};

use super::{BatchOp, KvStore};
use crate::errors::Result;

/// Ordered in-memory store used by unit tests and non-durable deployments.
#[derive(Default)]
pub struct MemoryStore {
	entries: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryStore {
	pub fn new() -> Self {
		Default::default()
	}
}

impl KvStore for MemoryStore {
	fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
		Ok(self.entries.read().expect("memory store lock poisoned").get(key).cloned())
	}

	fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
		self.entries
			.write()
			.expect("memory store lock poisoned")
			.insert(key.to_vec(), value.to_vec());
		Ok(())
	}

	fn delete(&self, key: &[u8]) -> Result<()> {
		self.entries.write().expect("memory store lock poisoned").remove(key);
		Ok(())
	}

	fn iterate_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
		Ok(self
			.entries
			.read()
			.expect("memory store lock poisoned")
			.range(prefix.to_vec()..)
			.take_while(|(key, _)| key.starts_with(prefix))
			.map(|(key, value)| (key.clone(), value.clone()))
			.collect())
	}

	fn write_batch(&self, ops: Vec<BatchOp>) -> Result<()> {
		let mut entries = self.entries.write().expect("memory store lock poisoned");
		for op in ops {
			match op {
				BatchOp::Put { key, value } => {
					entries.insert(key, value);
				},
				BatchOp::Delete { key } => {
					entries.remove(&key);
				},
			}
		}
		Ok(())
	}
}
