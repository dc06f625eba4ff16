//! The chain provider capability and its recovery layer.
//!
//! Providers are flaky in well-known ways: a block that the tip just reorged
//! away resolves to null, and some nodes answer "unknown block" instead.
//! Both map to [`Error::BlockFetching`], which the processor treats as "give
//! up on this notification and retry from the next one".

use std::{
	sync::{
		atomic::{AtomicU64, Ordering},
		Arc, Mutex,
	},
	time::Duration,
};

use async_trait::async_trait;
use futures::future::BoxFuture;
use tracing::{trace, warn};

use crate::{
	errors::{Error, Result},
	events::{EventChannel, HandlerId},
	types::{Block, BlockHash},
	utils::make_periodic_tick,
};

/// The error message some providers use for blocks they cannot resolve.
pub const UNKNOWN_BLOCK_ERROR: &str = "unknown block";

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BlockProvider: Send + Sync {
	async fn block_by_number(&self, number: u64, include_tx: bool) -> anyhow::Result<Option<Block>>;

	async fn block_by_hash(
		&self,
		hash: &BlockHash,
		include_tx: bool,
	) -> anyhow::Result<Option<Block>>;

	async fn block_number(&self) -> anyhow::Result<u64>;
}

fn classify(e: anyhow::Error) -> Error {
	if e.to_string() == UNKNOWN_BLOCK_ERROR {
		Error::block_fetching(UNKNOWN_BLOCK_ERROR)
	} else {
		Error::Other(e)
	}
}

/// Provider wrapper that turns the recognized transient failures into
/// [`Error::BlockFetching`] and never returns a null block.
#[derive(Clone)]
pub struct BlockFetcher {
	provider: Arc<dyn BlockProvider>,
}

impl BlockFetcher {
	pub fn new(provider: Arc<dyn BlockProvider>) -> Self {
		BlockFetcher { provider }
	}

	pub async fn block_by_number(&self, number: u64) -> Result<Block> {
		self.provider
			.block_by_number(number, true)
			.await
			.map_err(classify)?
			.ok_or_else(|| Error::block_fetching(format!("no block at height {number}")))
	}

	pub async fn block_by_hash(&self, hash: &BlockHash) -> Result<Block> {
		self.provider
			.block_by_hash(hash, true)
			.await
			.map_err(classify)?
			.ok_or_else(|| Error::block_fetching(format!("no block with hash {hash}")))
	}

	pub async fn block_number(&self) -> Result<u64> {
		self.provider.block_number().await.map_err(Error::Other)
	}
}

/// Polls the provider's block number and drives `new_block_number`
/// subscribers, awaiting each so notifications are handled strictly in
/// order. Polling beats websocket subscriptions for liveness here: a missed
/// poll costs one interval, never a notification.
pub struct BlockPoller {
	provider: Arc<dyn BlockProvider>,
	poll_interval: Duration,
	new_block_number: Arc<EventChannel<u64>>,
	last_emitted: Arc<AtomicU64>,
	poll_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl BlockPoller {
	pub fn new(provider: Arc<dyn BlockProvider>, poll_interval: Duration) -> Self {
		BlockPoller {
			provider,
			poll_interval,
			new_block_number: Arc::new(EventChannel::new()),
			last_emitted: Arc::new(AtomicU64::new(0)),
			poll_task: Mutex::new(None),
		}
	}

	pub fn subscribe_new_block_number<F>(&self, handler: F) -> HandlerId
	where
		F: Fn(u64) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync + 'static,
	{
		self.new_block_number.subscribe(handler)
	}

	pub fn unsubscribe(&self, id: HandlerId) {
		self.new_block_number.unsubscribe(id)
	}

	/// Starts the poll loop. Handler failures are logged and do not stop the
	/// loop; the failed notification is simply superseded by the next one.
	pub fn start(&self) {
		let provider = self.provider.clone();
		let channel = self.new_block_number.clone();
		let last_emitted = self.last_emitted.clone();
		let poll_interval = self.poll_interval;

		let task = tokio::spawn(async move {
			let mut tick = make_periodic_tick(poll_interval, true);
			loop {
				tick.tick().await;
				match provider.block_number().await {
					Ok(number) => {
						if last_emitted.swap(number, Ordering::Relaxed) != number {
							trace!("Provider reports block number {number}");
							if let Err(e) = channel.emit(number).await {
								warn!("New block number handler failed for {number}: {e:#}");
							}
						}
					},
					Err(e) => {
						warn!("Failed to poll provider block number: {e:#}");
					},
				}
			}
		});
		*self.poll_task.lock().expect("poll task lock poisoned") = Some(task);
	}

	pub fn stop(&self) {
		if let Some(task) = self.poll_task.lock().expect("poll task lock poisoned").take() {
			task.abort();
		}
	}
}

#[cfg(test)]
mod tests {
	use futures::FutureExt;
	use mockall::predicate::eq;

	use super::*;

	#[tokio::test]
	async fn null_blocks_become_recoverable_errors() {
		let mut provider = MockBlockProvider::new();
		provider
			.expect_block_by_number()
			.with(eq(3), eq(true))
			.times(1)
			.returning(|_, _| Ok(None));

		let fetcher = BlockFetcher::new(Arc::new(provider));
		assert!(matches!(
			fetcher.block_by_number(3).await,
			Err(Error::BlockFetching(_))
		));
	}

	#[tokio::test]
	async fn unknown_block_errors_become_recoverable_errors() {
		let mut provider = MockBlockProvider::new();
		provider
			.expect_block_by_hash()
			.times(1)
			.returning(|_, _| Err(anyhow::anyhow!(UNKNOWN_BLOCK_ERROR)));

		let fetcher = BlockFetcher::new(Arc::new(provider));
		assert!(matches!(
			fetcher.block_by_hash(&BlockHash::new("0xa1")).await,
			Err(Error::BlockFetching(_))
		));
	}

	#[tokio::test]
	async fn other_errors_pass_through_unclassified() {
		let mut provider = MockBlockProvider::new();
		provider
			.expect_block_by_number()
			.times(1)
			.returning(|_, _| Err(anyhow::anyhow!("connection refused")));

		let fetcher = BlockFetcher::new(Arc::new(provider));
		assert!(matches!(
			fetcher.block_by_number(1).await,
			Err(Error::Other(_))
		));
	}

	#[tokio::test]
	async fn successful_fetches_unwrap_the_block() {
		let mut provider = MockBlockProvider::new();
		provider
			.expect_block_by_number()
			.with(eq(7), eq(true))
			.times(1)
			.returning(|_, _| Ok(Some(Block::new(7, "0xa7", "0xa6"))));

		let fetcher = BlockFetcher::new(Arc::new(provider));
		assert_eq!(fetcher.block_by_number(7).await.unwrap().number, 7);
	}

	#[tokio::test]
	async fn poller_notifies_once_per_new_number() {
		let mut provider = MockBlockProvider::new();
		// Same number twice, then progress.
		let mut numbers = vec![10u64, 10, 11].into_iter();
		provider
			.expect_block_number()
			.returning(move || Ok(numbers.next().unwrap_or(11)));

		let poller = BlockPoller::new(Arc::new(provider), Duration::from_millis(1));
		let seen = Arc::new(Mutex::new(Vec::new()));
		{
			let seen = seen.clone();
			poller.subscribe_new_block_number(move |number| {
				let seen = seen.clone();
				async move {
					seen.lock().unwrap().push(number);
					Ok(())
				}
				.boxed()
			});
		}

		poller.start();
		tokio::time::sleep(Duration::from_millis(50)).await;
		poller.stop();

		assert_eq!(*seen.lock().unwrap(), vec![10, 11]);
	}
}
