use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Engine error taxonomy.
///
/// `BlockFetching` is the only recoverable kind: the processor swallows it and
/// relies on the next provider notification to retry. Everything else either
/// indicates bad caller input, a programming bug, or an unclassified failure
/// that bubbles up to the supervisor.
#[derive(Debug, Error)]
pub enum Error {
	#[error("invalid argument: {0}")]
	Argument(String),

	#[error("application invariant violated: {0}")]
	Application(String),

	#[error("configuration error: {0}")]
	Configuration(String),

	#[error("recoverable block fetching failure: {0}")]
	BlockFetching(String),

	#[error("store failure: {0}")]
	Store(String),

	#[error(transparent)]
	Other(#[from] anyhow::Error),
}

impl Error {
	pub fn argument(message: impl Into<String>) -> Self {
		Error::Argument(message.into())
	}

	pub fn application(message: impl Into<String>) -> Self {
		Error::Application(message.into())
	}

	pub fn configuration(message: impl Into<String>) -> Self {
		Error::Configuration(message.into())
	}

	pub fn block_fetching(message: impl Into<String>) -> Self {
		Error::BlockFetching(message.into())
	}

	pub fn is_block_fetching(&self) -> bool {
		matches!(self, Error::BlockFetching(_))
	}
}

impl From<rocksdb::Error> for Error {
	fn from(e: rocksdb::Error) -> Self {
		Error::Store(e.to_string())
	}
}

impl From<serde_json::Error> for Error {
	fn from(e: serde_json::Error) -> Self {
		Error::Store(e.to_string())
	}
}
