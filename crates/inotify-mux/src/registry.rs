use std::{
	collections::HashMap,
	fmt,
	sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use crate::{event::Event, record::WatchHandle};

/// Callback invoked on the dispatcher task for every event of its watch.
pub type Handler = Arc<dyn Fn(Event) + Send + Sync + 'static>;

/// A live watch: the handler plus its removal policy.
#[derive(Clone)]
pub struct Subscription {
	handler: Handler,
	one_shot: bool,
}

impl Subscription {
	pub fn new(handler: impl Fn(Event) + Send + Sync + 'static, one_shot: bool) -> Self {
		Self {
			handler: Arc::new(handler),
			one_shot,
		}
	}

	#[must_use]
	pub const fn is_one_shot(&self) -> bool {
		self.one_shot
	}

	#[must_use]
	pub fn handler(&self) -> Handler {
		Arc::clone(&self.handler)
	}
}

impl fmt::Debug for Subscription {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Subscription")
			.field("one_shot", &self.one_shot)
			.finish_non_exhaustive()
	}
}

/// Thread safe map from watch descriptor to its subscription.
///
/// Cloning shares the same map. The lock is only ever held for the map operation itself,
/// never while a handler runs, so handlers may freely add or remove watches, their own
/// included.
#[derive(Debug, Clone, Default)]
pub struct WatchRegistry {
	subscriptions: Arc<Mutex<HashMap<WatchHandle, Subscription>>>,
}

impl WatchRegistry {
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	// Handlers never run under the lock, so a poisoned map is still consistent.
	fn lock(&self) -> MutexGuard<'_, HashMap<WatchHandle, Subscription>> {
		self.subscriptions
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
	}

	/// Installs `subscription`, returning the stale entry it replaced, if any.
	pub fn insert(&self, wd: WatchHandle, subscription: Subscription) -> Option<Subscription> {
		self.lock().insert(wd, subscription)
	}

	/// Runs `add` with the map locked and installs `subscription` under the handle it returns.
	///
	/// Holding the lock across the kernel call means the dispatcher can't look up the new
	/// handle before its subscription is in place.
	pub fn insert_with<E>(
		&self,
		add: impl FnOnce() -> Result<WatchHandle, E>,
		subscription: Subscription,
	) -> Result<(WatchHandle, Option<Subscription>), E> {
		let mut subscriptions = self.lock();
		let wd = add()?;
		Ok((wd, subscriptions.insert(wd, subscription)))
	}

	/// Idempotent, removing an absent watch is a no-op.
	pub fn remove(&self, wd: WatchHandle) -> Option<Subscription> {
		self.lock().remove(&wd)
	}

	#[must_use]
	pub fn lookup(&self, wd: WatchHandle) -> Option<Subscription> {
		self.lock().get(&wd).cloned()
	}

	#[must_use]
	pub fn contains(&self, wd: WatchHandle) -> bool {
		self.lock().contains_key(&wd)
	}

	#[must_use]
	pub fn len(&self) -> usize {
		self.lock().len()
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.lock().is_empty()
	}

	#[must_use]
	pub fn handles(&self) -> Vec<WatchHandle> {
		let mut handles = self.lock().keys().copied().collect::<Vec<_>>();
		handles.sort_unstable();
		handles
	}

	/// Resolves the handler for one dispatched event in a single critical section.
	///
	/// One-shot subscriptions are removed here, before the caller invokes the handler. With
	/// `drop_on_ignored`, an `Ignored` event removes the subscription the same way.
	pub fn take_for_dispatch(
		&self,
		wd: WatchHandle,
		event: &Event,
		drop_on_ignored: bool,
	) -> Option<Handler> {
		let mut subscriptions = self.lock();
		let one_shot = subscriptions.get(&wd)?.one_shot;

		if one_shot || (drop_on_ignored && matches!(event, Event::Ignored)) {
			subscriptions
				.remove(&wd)
				.map(|subscription| subscription.handler)
		} else {
			subscriptions.get(&wd).map(Subscription::handler)
		}
	}

	pub(crate) fn clear(&self) {
		self.lock().clear();
	}
}
