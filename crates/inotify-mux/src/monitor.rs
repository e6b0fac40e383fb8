use std::{
	fmt,
	path::Path,
	sync::{Arc, Mutex, PoisonError},
};

use async_channel as chan;
use tokio::{
	spawn,
	sync::{broadcast, watch},
	task::JoinHandle,
};
use tracing::{debug, error, info, instrument, trace, warn, Instrument};

use crate::{
	config::MonitorConfig,
	error::{Error, FileIOError, Result},
	event::Event,
	kernel::{InotifyChannel, KernelChannel},
	pipeline::{Dispatcher, FallbackHandler, LossLog, MonitorStatus, Reader},
	record::WatchHandle,
	registry::{Subscription, WatchRegistry},
	variety::EventVariety,
};

/// Subscription side of a [`Monitor`].
///
/// Cheap to clone and safe to use from any thread, including from inside a handler running on
/// the dispatcher, e.g. for a handler to remove its own watch. Unlike the monitor itself, a
/// handle does not keep the background tasks alive.
pub struct MonitorHandle<C = InotifyChannel> {
	channel: Arc<C>,
	registry: WatchRegistry,
	stop_tx: chan::Sender<()>,
}

impl<C> Clone for MonitorHandle<C> {
	fn clone(&self) -> Self {
		Self {
			channel: Arc::clone(&self.channel),
			registry: self.registry.clone(),
			stop_tx: self.stop_tx.clone(),
		}
	}
}

impl<C> fmt::Debug for MonitorHandle<C> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("MonitorHandle")
			.field("registry", &self.registry)
			.finish_non_exhaustive()
	}
}

impl<C: KernelChannel> MonitorHandle<C> {
	/// Starts watching `path` for the requested varieties.
	///
	/// Adding a watch for an inode that is already watched returns the existing handle, and its
	/// subscription is replaced by this one.
	#[instrument(skip(self, path, handler), fields(path = %path.as_ref().display()), err)]
	pub fn add_watch(
		&self,
		varieties: &[EventVariety],
		path: impl AsRef<Path>,
		handler: impl Fn(Event) + Send + Sync + 'static,
	) -> Result<WatchHandle> {
		let path = path.as_ref();

		if self.stop_tx.is_closed() {
			return Err(Error::Shutdown);
		}

		match path.try_exists() {
			Ok(true) => {}
			Ok(false) => return Err(Error::PathNotFound(path.into())),
			Err(e) => return Err(FileIOError::new(path, e, "stat").into()),
		}

		let mask = EventVariety::mask_of(varieties);
		let subscription = Subscription::new(handler, EventVariety::is_one_shot(varieties));

		let (wd, maybe_stale) = self
			.registry
			.insert_with(|| self.channel.add_watch(path, mask), subscription)?;

		if maybe_stale.is_some() {
			warn!(%wd, "Replaced the subscription of an already watched inode;");
		}

		debug!(%wd, mask = format_args!("{mask:#x}"), "Watch added");

		Ok(wd)
	}

	/// Stops delivering events for `wd` and removes the kernel watch.
	///
	/// Removing a watch that is already gone is a no-op, so this can race freely with one-shot
	/// and invalidation removals.
	#[instrument(skip(self))]
	pub fn remove_watch(&self, wd: WatchHandle) {
		if self.registry.remove(wd).is_none() {
			trace!("Watch was not registered, nothing to remove");
			return;
		}

		if let Err(e) = self.channel.remove_watch(wd) {
			// EINVAL: the kernel already dropped it, e.g. its target was deleted
			debug!(?e, "Kernel refused to remove watch;");
		} else {
			debug!("Watch removed");
		}
	}

	#[must_use]
	pub fn is_active(&self, wd: WatchHandle) -> bool {
		self.registry.contains(wd)
	}

	/// Handles of every live subscription, in ascending order.
	#[must_use]
	pub fn watches(&self) -> Vec<WatchHandle> {
		self.registry.handles()
	}
}

/// Owns the reader and dispatcher tasks bound to one kernel channel.
///
/// Dropping the monitor cancels both tasks; [`Monitor::shutdown`] does the same and waits for
/// them to finish.
pub struct Monitor<C = InotifyChannel> {
	handle: MonitorHandle<C>,
	status_tx: Arc<watch::Sender<MonitorStatus>>,
	errors_tx: broadcast::Sender<Arc<Error>>,
	tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Monitor<InotifyChannel> {
	/// Acquires an inotify channel and starts the background tasks.
	///
	/// `fallback` receives every event that no live subscription claims, queue overflows
	/// included. Must be called from within a tokio runtime.
	pub fn init(
		config: MonitorConfig,
		fallback: impl Fn(WatchHandle, Event) + Send + Sync + 'static,
	) -> Result<Self> {
		Ok(Self::init_with_channel(
			InotifyChannel::acquire()?,
			config,
			fallback,
		))
	}
}

impl<C: KernelChannel> Monitor<C> {
	/// Starts the background tasks on an already acquired channel.
	pub fn init_with_channel(
		channel: C,
		config: MonitorConfig,
		fallback: impl Fn(WatchHandle, Event) + Send + Sync + 'static,
	) -> Self {
		let MonitorConfig {
			queue_capacity,
			read_chunk_size,
			overflow_policy,
			auto_remove_invalidated,
			error_channel_capacity,
		} = config.normalized();

		let channel = Arc::new(channel);
		let registry = WatchRegistry::new();
		let fallback: FallbackHandler = Arc::new(fallback);

		let (batches_tx, batches_rx) = chan::bounded(queue_capacity);
		let (stop_tx, stop_rx) = chan::bounded(1);
		let (status_tx, _) = watch::channel(MonitorStatus::Running);
		let status_tx = Arc::new(status_tx);
		let (errors_tx, _) = broadcast::channel(error_channel_capacity);
		let losses = LossLog::default();

		let reader = Reader {
			channel: Arc::clone(&channel),
			batches_tx,
			stop_rx: stop_rx.clone(),
			status_tx: Arc::clone(&status_tx),
			losses: losses.clone(),
			read_chunk_size,
			overflow_policy,
		};

		let dispatcher = Dispatcher {
			registry: registry.clone(),
			fallback,
			batches_rx,
			stop_rx,
			errors_tx: errors_tx.clone(),
			losses,
			auto_remove_invalidated,
		};

		let tasks = vec![
			spawn(reader.run().instrument(tracing::info_span!("inotify_reader"))),
			spawn(dispatcher.run().instrument(tracing::info_span!("inotify_dispatcher"))),
		];

		info!(queue_capacity, read_chunk_size, "Inotify monitor started");

		Self {
			handle: MonitorHandle {
				channel,
				registry,
				stop_tx,
			},
			status_tx,
			errors_tx,
			tasks: Mutex::new(tasks),
		}
	}

	#[must_use]
	pub fn handle(&self) -> MonitorHandle<C> {
		self.handle.clone()
	}

	/// See [`MonitorHandle::add_watch`].
	pub fn add_watch(
		&self,
		varieties: &[EventVariety],
		path: impl AsRef<Path>,
		handler: impl Fn(Event) + Send + Sync + 'static,
	) -> Result<WatchHandle> {
		self.handle.add_watch(varieties, path, handler)
	}

	/// See [`MonitorHandle::remove_watch`].
	pub fn remove_watch(&self, wd: WatchHandle) {
		self.handle.remove_watch(wd);
	}

	#[must_use]
	pub fn is_active(&self, wd: WatchHandle) -> bool {
		self.handle.is_active(wd)
	}

	#[must_use]
	pub fn watches(&self) -> Vec<WatchHandle> {
		self.handle.watches()
	}

	#[must_use]
	pub fn status(&self) -> MonitorStatus {
		self.status_tx.borrow().clone()
	}

	/// Waits until the monitor stops running, either by shutdown or by failure.
	pub async fn wait_for_stop(&self) -> MonitorStatus {
		let mut status_rx = self.status_tx.subscribe();
		// The sender lives in `self`, so the channel can't close while we wait
		let res = status_rx.wait_for(|status| !status.is_running()).await;
		res.map_or(MonitorStatus::Stopped, |status| status.clone())
	}

	/// Non-fatal errors from the dispatcher, such as records that failed classification.
	#[must_use]
	pub fn errors(&self) -> broadcast::Receiver<Arc<Error>> {
		self.errors_tx.subscribe()
	}

	/// Cancels both background tasks and waits for them. Idempotent.
	///
	/// A handler already running is allowed to finish, records still queued are discarded.
	#[instrument(skip(self))]
	pub async fn shutdown(&self) {
		self.handle.stop_tx.close();

		let tasks = std::mem::take(
			&mut *self
				.tasks
				.lock()
				.unwrap_or_else(PoisonError::into_inner),
		);

		for task in tasks {
			if let Err(e) = task.await {
				error!(?e, "Failed to join inotify monitor task;");
			}
		}

		self.status_tx.send_if_modified(|status| {
			if status.is_running() {
				*status = MonitorStatus::Stopped;
				true
			} else {
				false
			}
		});

		// Handlers may hold monitor handles, clearing breaks those cycles
		self.handle.registry.clear();

		debug!("Inotify monitor shut down");
	}
}

impl<C> Drop for Monitor<C> {
	fn drop(&mut self) {
		self.handle.stop_tx.close();
		self.handle.registry.clear();
	}
}

impl<C> fmt::Debug for Monitor<C> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Monitor")
			.field("handle", &self.handle)
			.field("status", &*self.status_tx.borrow())
			.finish_non_exhaustive()
	}
}
