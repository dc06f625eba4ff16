use std::{fmt, str::FromStr, sync::Arc};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::errors::Error;

/// Opaque block hash.
///
/// Providers disagree about hash casing, so the hash is normalized to
/// lowercase on construction and every comparison is effectively
/// case-insensitive.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockHash(Arc<str>);

impl BlockHash {
	pub fn new(hash: impl AsRef<str>) -> Self {
		BlockHash(hash.as_ref().to_lowercase().into())
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for BlockHash {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl fmt::Debug for BlockHash {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "BlockHash({})", self.0)
	}
}

impl FromStr for BlockHash {
	type Err = Error;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		if s.is_empty() {
			return Err(Error::argument("block hash must not be empty"))
		}
		Ok(BlockHash::new(s))
	}
}

impl From<&str> for BlockHash {
	fn from(s: &str) -> Self {
		BlockHash::new(s)
	}
}

impl Serialize for BlockHash {
	fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_str(&self.0)
	}
}

impl<'de> Deserialize<'de> for BlockHash {
	fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
		let raw = String::deserialize(deserializer)?;
		Ok(BlockHash::new(raw))
	}
}

/// A block stub as fetched from the provider. Immutable once constructed.
///
/// Transactions are carried opaquely so that domain components can inspect
/// them without the engine committing to a transaction schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
	pub number: u64,
	pub hash: BlockHash,
	pub parent_hash: BlockHash,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub transactions: Vec<serde_json::Value>,
}

impl Block {
	pub fn new(number: u64, hash: impl AsRef<str>, parent_hash: impl AsRef<str>) -> Self {
		Block {
			number,
			hash: BlockHash::new(hash),
			parent_hash: BlockHash::new(parent_hash),
			transactions: Vec::new(),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockAndAttached {
	pub block: Block,
	pub attached: bool,
}

/// Tagged sum of every value kind the block item store accepts.
///
/// The serde tag doubles as the deserializer registry: the stored bytes name
/// their own kind, and callers downcast through the accessors below.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ItemValue {
	Block(Block),
	Attached(bool),
	State(serde_json::Value),
	Json(serde_json::Value),
}

impl ItemValue {
	pub fn as_block(&self) -> Option<&Block> {
		match self {
			ItemValue::Block(block) => Some(block),
			_ => None,
		}
	}

	pub fn as_attached(&self) -> Option<bool> {
		match self {
			ItemValue::Attached(attached) => Some(*attached),
			_ => None,
		}
	}

	pub fn into_state(self) -> Option<serde_json::Value> {
		match self {
			ItemValue::State(state) => Some(state),
			_ => None,
		}
	}
}
