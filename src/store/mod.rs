//! Key-value storage capability.
//!
//! Sub-stores never see the shared handle directly; each derives a prefixed
//! [`SubSpace`] view so that key spaces cannot collide.

pub mod memory;
pub mod persistent;

use std::sync::Arc;

use crate::errors::Result;

#[derive(Debug, Clone, PartialEq)]
pub enum BatchOp {
	Put { key: Vec<u8>, value: Vec<u8> },
	Delete { key: Vec<u8> },
}

pub trait KvStore: Send + Sync {
	fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

	fn put(&self, key: &[u8], value: &[u8]) -> Result<()>;

	fn delete(&self, key: &[u8]) -> Result<()>;

	/// Ordered iteration over every key starting with `prefix`.
	fn iterate_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;

	/// Applies all operations atomically. Either every operation is durable
	/// afterwards or none is.
	fn write_batch(&self, ops: Vec<BatchOp>) -> Result<()>;
}

/// A namespaced view over a shared [`KvStore`] handle. Keys are transparently
/// prefixed with `"<name>:"` on the way in and stripped on the way out.
#[derive(Clone)]
pub struct SubSpace {
	store: Arc<dyn KvStore>,
	prefix: Vec<u8>,
}

impl SubSpace {
	pub fn new(store: Arc<dyn KvStore>, name: &str) -> Self {
		SubSpace { store, prefix: format!("{name}:").into_bytes() }
	}

	fn full_key(&self, key: &[u8]) -> Vec<u8> {
		[self.prefix.as_slice(), key].concat()
	}

	pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
		self.store.get(&self.full_key(key))
	}

	pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
		self.store.put(&self.full_key(key), value)
	}

	pub fn delete(&self, key: &[u8]) -> Result<()> {
		self.store.delete(&self.full_key(key))
	}

	/// Iterates the whole sub-space, yielding keys with the prefix stripped.
	pub fn iterate(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
		Ok(self
			.store
			.iterate_prefix(&self.prefix)?
			.into_iter()
			.map(|(key, value)| (key[self.prefix.len()..].to_vec(), value))
			.collect())
	}

	pub fn write_batch(&self, ops: Vec<BatchOp>) -> Result<()> {
		self.store.write_batch(
			ops.into_iter()
				.map(|op| match op {
					BatchOp::Put { key, value } => BatchOp::Put { key: self.full_key(&key), value },
					BatchOp::Delete { key } => BatchOp::Delete { key: self.full_key(&key) },
				})
				.collect(),
		)
	}
}
