use std::{sync::Arc, time::Duration};

use anyhow::Context;
use clap::Parser;
use futures::FutureExt;
use tracing::info;

use chaintail_engine::{
	action_store::ActionStore,
	block_cache::BlockCache,
	block_item_store::{BlockItemStore, BLOCK_ITEM_STORE_SUB_SPACE},
	block_processor::{BlockProcessor, BlockProcessorStore},
	health::HealthChecker,
	logging,
	machine::BlockchainMachine,
	provider::{BlockPoller, BlockProvider},
	rpc::EthRpcClient,
	settings::{CommandLineOptions, Settings},
	store::{persistent::PersistentStore, KvStore, SubSpace},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let settings =
		Settings::new(CommandLineOptions::parse()).context("Failed to load settings")?;
	logging::init();
	info!("Starting the chaintail engine");

	let kv: Arc<dyn KvStore> = Arc::new(
		PersistentStore::open(&settings.db.path)
			.with_context(|| format!("Failed to open database at {}", settings.db.path.display()))?,
	);

	let item_store =
		Arc::new(BlockItemStore::new(SubSpace::new(kv.clone(), BLOCK_ITEM_STORE_SUB_SPACE)));
	item_store.start().context("Failed to hydrate the block item store")?;

	let action_store = Arc::new(ActionStore::new(kv.clone(), "engine"));
	action_store.start().context("Failed to hydrate the action store")?;

	let cache = Arc::new(BlockCache::new(settings.engine.max_depth, item_store.clone()));

	// Components are registered by the embedding service; the bare engine
	// follows the chain and keeps the block tree and checkpoint consistent.
	let machine =
		Arc::new(BlockchainMachine::new(item_store.clone(), action_store.clone(), vec![])?);
	machine.attach(&cache);
	machine.start();

	let provider: Arc<dyn BlockProvider> =
		Arc::new(EthRpcClient::new(&settings.provider.http_endpoint)?);
	let poller = BlockPoller::new(
		provider.clone(),
		Duration::from_secs(settings.provider.poll_interval_secs),
	);

	let processor = Arc::new(BlockProcessor::new(
		cache.clone(),
		item_store.clone(),
		BlockProcessorStore::new(kv.clone()),
		provider,
		settings.engine.block_sync_threshold,
	));
	processor.subscribe_new_head(|block| {
		async move {
			info!("Chain head advanced to {} at height {}", block.hash, block.number);
			Ok(())
		}
		.boxed()
	});

	processor.start(&poller).await.context("Failed to start the block processor")?;
	poller.start();

	if let Some(health_check_settings) = &settings.health_check {
		let health_checker = HealthChecker::new(health_check_settings).await?;
		tokio::spawn(health_checker.run());
	}

	tokio::signal::ctrl_c().await.context("Failed to listen for shutdown signal")?;
	info!("Shutting down");

	poller.stop();
	processor.stop(&poller).await;
	item_store.stop();
	action_store.stop();
	Ok(())
}
