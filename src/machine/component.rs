//! Component capability records.
//!
//! A component is a `{name, reducer, change detector, action applier}`
//! record. The typed [`ComponentSpec`] is what domain code implements; the
//! machine itself works against the object-safe [`Component`], which erases
//! states and actions to JSON at the store boundary.

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};

use crate::{
	errors::{Error, Result},
	types::Block,
};

/// Derives per-block state: `state(block) = reduce(state(parent), block)`,
/// seeded by `get_initial_state` at the first block the component ever sees.
pub trait Reducer: Send + Sync {
	type State: Serialize + DeserializeOwned + Send + Sync;

	fn get_initial_state(&self, block: &Block) -> Self::State;

	fn reduce(&self, prev_state: &Self::State, block: &Block) -> Self::State;
}

/// The typed capability record domain components implement.
#[async_trait]
pub trait ComponentSpec: Send + Sync {
	type Reducer: Reducer;
	type Action: Serialize + DeserializeOwned + Send + Sync;

	fn name(&self) -> &str;

	fn reducer(&self) -> &Self::Reducer;

	/// Actions to fire because state moved from `prev_state` to `new_state`.
	fn detect_changes(
		&self,
		prev_state: &<Self::Reducer as Reducer>::State,
		new_state: &<Self::Reducer as Reducer>::State,
	) -> Vec<Self::Action>;

	/// Executes one action. Runs concurrently with other actions and must be
	/// safe to invoke more than once for the same action.
	async fn apply_action(&self, action: Self::Action) -> anyhow::Result<()>;
}

/// Object-safe view of a component with JSON-erased state and actions.
#[async_trait]
pub trait Component: Send + Sync {
	fn name(&self) -> &str;

	fn initial_state(&self, block: &Block) -> Result<serde_json::Value>;

	fn reduce(&self, prev_state: &serde_json::Value, block: &Block)
		-> Result<serde_json::Value>;

	fn detect_changes(
		&self,
		prev_state: &serde_json::Value,
		new_state: &serde_json::Value,
	) -> Result<Vec<serde_json::Value>>;

	async fn apply_action(&self, action: serde_json::Value) -> anyhow::Result<()>;
}

struct Erased<C>(C);

fn to_json<T: Serialize>(value: &T) -> Result<serde_json::Value> {
	serde_json::to_value(value).map_err(Into::into)
}

fn from_json<T: DeserializeOwned>(value: &serde_json::Value) -> Result<T> {
	serde_json::from_value(value.clone())
		.map_err(|e| Error::Store(format!("stored value has an unexpected shape: {e}")))
}

#[async_trait]
impl<C: ComponentSpec> Component for Erased<C> {
	fn name(&self) -> &str {
		self.0.name()
	}

	fn initial_state(&self, block: &Block) -> Result<serde_json::Value> {
		to_json(&self.0.reducer().get_initial_state(block))
	}

	fn reduce(&self, prev_state: &serde_json::Value, block: &Block) -> Result<serde_json::Value> {
		to_json(&self.0.reducer().reduce(&from_json(prev_state)?, block))
	}

	fn detect_changes(
		&self,
		prev_state: &serde_json::Value,
		new_state: &serde_json::Value,
	) -> Result<Vec<serde_json::Value>> {
		self.0
			.detect_changes(&from_json(prev_state)?, &from_json(new_state)?)
			.iter()
			.map(to_json)
			.collect()
	}

	async fn apply_action(&self, action: serde_json::Value) -> anyhow::Result<()> {
		self.0.apply_action(from_json(&action)?).await
	}
}

/// Wraps a typed component for registration with the machine.
pub fn erase<C: ComponentSpec + 'static>(component: C) -> std::sync::Arc<dyn Component> {
	std::sync::Arc::new(Erased(component))
}
