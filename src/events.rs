//! Ordered, awaited event channels.
//!
//! Unlike a broadcast channel, handlers here are awaited one at a time in
//! subscription order and a handler error propagates to the emitter. This is
//! what lets a failing listener abort the store batch that wraps the
//! emission.

use std::sync::{
	atomic::{AtomicU64, Ordering},
	Arc, Mutex,
};

use futures::future::BoxFuture;

use crate::errors::{Error, Result};

pub type HandlerId = u64;

type Handler<T> = Arc<dyn Fn(T) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

pub struct EventChannel<T> {
	handlers: Mutex<Vec<(HandlerId, Handler<T>)>>,
	next_id: AtomicU64,
}

impl<T> Default for EventChannel<T> {
	fn default() -> Self {
		EventChannel { handlers: Mutex::new(Vec::new()), next_id: AtomicU64::new(0) }
	}
}

impl<T: Clone + Send + 'static> EventChannel<T> {
	pub fn new() -> Self {
		Default::default()
	}

	pub fn subscribe<F>(&self, handler: F) -> HandlerId
	where
		F: Fn(T) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync + 'static,
	{
		let id = self.next_id.fetch_add(1, Ordering::Relaxed);
		self.handlers
			.lock()
			.expect("event handler list lock poisoned")
			.push((id, Arc::new(handler)));
		id
	}

	pub fn unsubscribe(&self, id: HandlerId) {
		self.handlers
			.lock()
			.expect("event handler list lock poisoned")
			.retain(|(handler_id, _)| *handler_id != id);
	}

	pub fn subscriber_count(&self) -> usize {
		self.handlers.lock().expect("event handler list lock poisoned").len()
	}

	/// Invokes every handler in subscription order, awaiting each. The first
	/// handler error aborts the emission and is returned to the emitter;
	/// later handlers are not invoked for this event.
	pub async fn emit(&self, event: T) -> Result<()> {
		let handlers: Vec<Handler<T>> = self
			.handlers
			.lock()
			.expect("event handler list lock poisoned")
			.iter()
			.map(|(_, handler)| handler.clone())
			.collect();

		for handler in handlers {
			handler(event.clone()).await.map_err(Error::Other)?;
		}
		Ok(())
	}
}
