//! The blockchain machine: derives per-component anchor state for every
//! attached block and fires side-effect actions when state changes.

pub mod component;
pub mod mapped;

use std::{
	collections::HashSet,
	sync::Arc,
};

use futures::FutureExt;
use tracing::{error, info, warn};

use crate::{
	action_store::{ActionStore, ItemAndId},
	block_cache::BlockCache,
	block_item_store::BlockItemStore,
	constants::STATE_KEY_SUFFIX,
	errors::{Error, Result},
	events::HandlerId,
	types::{Block, ItemValue},
};

pub use component::{erase, Component, ComponentSpec, Reducer};
pub use mapped::{MappedState, MappedStateReducer};

pub struct BlockchainMachine {
	store: Arc<BlockItemStore>,
	action_store: Arc<ActionStore>,
	components: Vec<Arc<dyn Component>>,
	lock: tokio::sync::Mutex<()>,
}

fn state_item_key(component_name: &str) -> String {
	format!("{component_name}{STATE_KEY_SUFFIX}")
}

impl BlockchainMachine {
	pub fn new(
		store: Arc<BlockItemStore>,
		action_store: Arc<ActionStore>,
		components: Vec<Arc<dyn Component>>,
	) -> Result<Self> {
		let mut names = HashSet::new();
		for component in &components {
			if !names.insert(component.name().to_string()) {
				return Err(Error::argument(format!(
					"duplicate component name {:?}",
					component.name()
				)))
			}
		}
		Ok(BlockchainMachine { store, action_store, components, lock: tokio::sync::Mutex::new(()) })
	}

	/// Subscribes the machine to the cache's `new_block` event. The handler
	/// runs inside whichever batch wraps the emission, so anchor states
	/// commit atomically with the block that produced them.
	pub fn attach(self: &Arc<Self>, cache: &BlockCache) -> HandlerId {
		let machine = self.clone();
		cache.subscribe_new_block(move |block| {
			let machine = machine.clone();
			async move {
				machine
					.set_state_and_detect_changes(&block)
					.await
					.map_err(anyhow::Error::new)
			}
			.boxed()
		})
	}

	/// Replays any actions persisted by a previous run. Delivery is
	/// at-least-once; idempotency is the component's responsibility.
	pub fn start(self: &Arc<Self>) {
		self.execute_existing_actions();
	}

	pub fn execute_existing_actions(self: &Arc<Self>) {
		for component in &self.components {
			let pending = self.action_store.get_items(component.name());
			if !pending.is_empty() {
				info!(
					component = component.name(),
					count = pending.len(),
					"Replaying persisted actions"
				);
			}
			for item in pending {
				self.spawn_action(component.clone(), item);
			}
		}
	}

	pub fn component_names(&self) -> Vec<&str> {
		self.components.iter().map(|component| component.name()).collect()
	}

	/// Computes the new anchor state of every component for `block` and
	/// fires the actions its change detectors produce.
	pub async fn set_state_and_detect_changes(self: &Arc<Self>, block: &Block) -> Result<()> {
		let _guard = self.lock.lock().await;

		// Whether any component has ever recorded state. Evaluated once so
		// that the first component's write does not make the later ones
		// believe a previous block exists.
		let first_block_ever = !self.store.has_any_anchor_states();

		for component in &self.components {
			let item_key = state_item_key(component.name());
			let parent_state = self
				.store
				.get_item(&block.parent_hash, &item_key)
				.and_then(ItemValue::into_state);

			let new_state = if first_block_ever {
				component.initial_state(block)?
			} else if let Some(parent_state) = parent_state {
				let new_state = component.reduce(&parent_state, block)?;
				let actions = component.detect_changes(&parent_state, &new_state)?;
				if !actions.is_empty() {
					// Durable before side-effects: a crash after this point
					// replays the actions instead of losing them.
					let stored = self.action_store.store_items(component.name(), actions)?;
					for item in stored {
						self.spawn_action(component.clone(), item);
					}
				}
				new_state
			} else {
				// Only reachable when a reorg exceeded the cache depth and
				// ancestry was re-rooted past this block's parent.
				error!(
					component = component.name(),
					block = %block.hash,
					height = block.number,
					"Parent anchor state missing; re-initializing from this block"
				);
				component.initial_state(block)?
			};

			self.store.put_block_item(
				block.number,
				&block.hash,
				&item_key,
				ItemValue::State(new_state),
			)?;
		}
		Ok(())
	}

	/// Fire-and-forget execution. The durable action is removed only after
	/// `apply_action` succeeds; failures leave it in place for replay.
	fn spawn_action(&self, component: Arc<dyn Component>, item: ItemAndId) {
		let action_store = self.action_store.clone();
		tokio::spawn(async move {
			match component.apply_action(item.value.clone()).await {
				Ok(()) => {
					if let Err(e) = action_store.remove_item(component.name(), &item) {
						warn!(
							component = component.name(),
							action = %item.id,
							"Failed to remove completed action: {e:#}"
						);
					}
				},
				Err(e) => {
					warn!(
						component = component.name(),
						action = %item.id,
						"Action failed and stays queued for replay: {e:#}"
					);
				},
			}
		});
	}
}
