//! Reducer adapter for families of per-id sub-states.

use std::collections::HashMap;

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use super::component::Reducer;
use crate::types::Block;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappedState<S, B> {
	pub items: HashMap<String, S>,
	pub base: B,
}

/// Maintains `state.items: id -> sub_state` over a dynamic set of
/// sub-objects, alongside a base state kept by an outer reducer.
///
/// On every `reduce`, ids with a prior sub-state are reduced by their
/// sub-reducer, newly-appearing ids are seeded with the sub-reducer's initial
/// state, and ids that left the iterable are dropped.
pub struct MappedStateReducer<Item, Sub, Outer, Items, IdOf, Factory>
where
	Sub: Reducer,
	Outer: Reducer,
	Items: Fn() -> Vec<Item> + Send + Sync,
	IdOf: Fn(&Item) -> String + Send + Sync,
	Factory: Fn(&Item) -> Sub + Send + Sync,
{
	items: Items,
	id_of: IdOf,
	factory: Factory,
	outer: Outer,
	_marker: std::marker::PhantomData<(fn() -> Item, fn() -> Sub)>,
}

impl<Item, Sub, Outer, Items, IdOf, Factory>
	MappedStateReducer<Item, Sub, Outer, Items, IdOf, Factory>
where
	Sub: Reducer,
	Outer: Reducer,
	Items: Fn() -> Vec<Item> + Send + Sync,
	IdOf: Fn(&Item) -> String + Send + Sync,
	Factory: Fn(&Item) -> Sub + Send + Sync,
{
	pub fn new(items: Items, id_of: IdOf, factory: Factory, outer: Outer) -> Self {
		MappedStateReducer { items, id_of, factory, outer, _marker: std::marker::PhantomData }
	}
}

impl<Item, Sub, Outer, Items, IdOf, Factory> Reducer
	for MappedStateReducer<Item, Sub, Outer, Items, IdOf, Factory>
where
	Sub: Reducer,
	Sub::State: Serialize + DeserializeOwned + Send + Sync,
	Outer: Reducer,
	Items: Fn() -> Vec<Item> + Send + Sync,
	IdOf: Fn(&Item) -> String + Send + Sync,
	Factory: Fn(&Item) -> Sub + Send + Sync,
{
	type State = MappedState<Sub::State, Outer::State>;

	fn get_initial_state(&self, block: &Block) -> Self::State {
		MappedState {
			items: (self.items)()
				.iter()
				.map(|item| {
					((self.id_of)(item), (self.factory)(item).get_initial_state(block))
				})
				.collect(),
			base: self.outer.get_initial_state(block),
		}
	}

	fn reduce(&self, prev_state: &Self::State, block: &Block) -> Self::State {
		MappedState {
			items: (self.items)()
				.iter()
				.map(|item| {
					let id = (self.id_of)(item);
					let sub = (self.factory)(item);
					let state = match prev_state.items.get(&id) {
						Some(prev_sub) => sub.reduce(prev_sub, block),
						None => sub.get_initial_state(block),
					};
					(id, state)
				})
				.collect(),
			base: self.outer.reduce(&prev_state.base, block),
		}
	}
}
