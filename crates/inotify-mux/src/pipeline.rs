//! Background half of the monitor: a reader task pulling bytes off the kernel channel and a
//! dispatcher task invoking handlers, joined by a bounded queue of record batches.
//!
//! There is exactly one dispatcher and handlers run synchronously on it, so every event is
//! delivered in the order the kernel produced it, across all watches. The flip side is that a
//! slow handler holds back delivery for every other watch.

use std::{
	collections::VecDeque,
	io,
	panic::{catch_unwind, AssertUnwindSafe},
	pin::pin,
	sync::{Arc, Mutex, PoisonError},
};

use async_channel as chan;
use futures::{stream, StreamExt};
use futures_concurrency::{future::Race, stream::Merge};
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, trace, warn};

use crate::{
	config::OverflowPolicy,
	error::Error,
	event::Event,
	kernel::KernelChannel,
	record::{RawRecord, Records, WatchHandle},
	registry::WatchRegistry,
};

/// Records from one kernel read, numbered in the order they were queued.
#[derive(Debug)]
pub(crate) struct Batch {
	pub(crate) seq: u64,
	pub(crate) records: Vec<RawRecord>,
}

/// Where `DropNewest` discarded records: each entry is the sequence number of the last batch
/// queued before the gap, with the amount of records lost there.
#[derive(Debug, Clone, Default)]
pub(crate) struct LossLog(Arc<Mutex<VecDeque<(u64, usize)>>>);

impl LossLog {
	fn record_after(&self, seq: u64, records: usize) {
		let mut gaps = self.0.lock().unwrap_or_else(PoisonError::into_inner);
		match gaps.back_mut() {
			Some((last, lost)) if *last == seq => *lost += records,
			_ => gaps.push_back((seq, records)),
		}
	}

	/// Removes and returns every gap that sits right after batches up to `seq`.
	fn take_through(&self, seq: u64) -> Vec<usize> {
		let mut gaps = self.0.lock().unwrap_or_else(PoisonError::into_inner);
		let mut taken = Vec::new();
		while let Some(&(gap_seq, lost)) = gaps.front() {
			if gap_seq > seq {
				break;
			}
			gaps.pop_front();
			taken.push(lost);
		}
		taken
	}
}

/// Catch-all receiving every event no live subscription claims.
pub type FallbackHandler = Arc<dyn Fn(WatchHandle, Event) + Send + Sync + 'static>;

/// Lifecycle of the background tasks.
#[derive(Debug, Clone)]
pub enum MonitorStatus {
	Running,
	/// Shut down on request.
	Stopped,
	/// The reader hit an unrecoverable error and the pipeline wound down.
	Failed(Arc<Error>),
}

impl MonitorStatus {
	#[must_use]
	pub const fn is_running(&self) -> bool {
		matches!(self, Self::Running)
	}
}

pub(crate) struct Reader<C> {
	pub(crate) channel: Arc<C>,
	pub(crate) batches_tx: chan::Sender<Batch>,
	pub(crate) stop_rx: chan::Receiver<()>,
	pub(crate) status_tx: Arc<watch::Sender<MonitorStatus>>,
	pub(crate) losses: LossLog,
	pub(crate) read_chunk_size: usize,
	pub(crate) overflow_policy: OverflowPolicy,
}

impl<C: KernelChannel> Reader<C> {
	pub(crate) async fn run(self) {
		let Self {
			channel,
			batches_tx,
			stop_rx,
			status_tx,
			losses,
			read_chunk_size,
			overflow_policy,
		} = self;

		let mut buf = vec![0; read_chunk_size];
		let mut next_seq = 0;

		debug!(read_chunk_size, ?overflow_policy, "Inotify reader started");

		loop {
			let read = (
				async { Some(channel.read_chunk(&mut buf).await) },
				async {
					stop_rx.recv().await.ok();
					None
				},
			)
				.race()
				.await;

			let Some(read) = read else {
				debug!("Inotify reader received stop signal");
				break;
			};

			let n = match read {
				Ok(n) if n > buf.len() => {
					error!(
						n,
						capacity = buf.len(),
						"Kernel channel reported more bytes than it was given;"
					);
					fail(
						&status_tx,
						Error::Read(io::Error::new(
							io::ErrorKind::InvalidData,
							format!("read reported {n} bytes into a {} byte buffer", buf.len()),
						)),
					);
					break;
				}
				Ok(n) => n,
				Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
				Err(e) => {
					error!(?e, "Fatal read error on inotify channel;");
					fail(&status_tx, Error::Read(e));
					break;
				}
			};

			let mut records = Vec::new();
			let mut maybe_decode_error = None;
			for res in Records::new(&buf[..n]) {
				match res {
					Ok(record) => records.push(record),
					Err(e) => maybe_decode_error = Some(e),
				}
			}

			if !records.is_empty() {
				trace!(records = records.len(), bytes = n, seq = next_seq, "Read record batch");

				let batch = Batch {
					seq: next_seq,
					records,
				};

				match enqueue(&batches_tx, &stop_rx, &losses, overflow_policy, batch).await {
					Enqueued::Queued => next_seq += 1,
					Enqueued::Dropped => {}
					Enqueued::Closed => break,
				}
			}

			if let Some(e) = maybe_decode_error {
				error!(?e, "Malformed record on inotify channel;");
				fail(&status_tx, e.into());
				break;
			}
		}

		batches_tx.close();
		debug!("Inotify reader stopped");
	}
}

enum Enqueued {
	Queued,
	Dropped,
	/// The dispatcher is gone or a stop was requested.
	Closed,
}

async fn enqueue(
	batches_tx: &chan::Sender<Batch>,
	stop_rx: &chan::Receiver<()>,
	losses: &LossLog,
	overflow_policy: OverflowPolicy,
	batch: Batch,
) -> Enqueued {
	match overflow_policy {
		OverflowPolicy::Backpressure => {
			let sent = (
				async { Some(batches_tx.send(batch).await.is_ok()) },
				async {
					stop_rx.recv().await.ok();
					None
				},
			)
				.race()
				.await;

			if sent == Some(true) {
				Enqueued::Queued
			} else {
				Enqueued::Closed
			}
		}

		OverflowPolicy::DropNewest => match batches_tx.try_send(batch) {
			Ok(()) => Enqueued::Queued,
			Err(chan::TrySendError::Full(batch)) => {
				// A full queue holds at least one batch, so `seq` is never 0 here
				let after = batch.seq.saturating_sub(1);
				losses.record_after(after, batch.records.len());
				warn!(
					records = batch.records.len(),
					after, "Dispatcher queue is full, dropping record batch;"
				);
				Enqueued::Dropped
			}
			Err(chan::TrySendError::Closed(_)) => Enqueued::Closed,
		},
	}
}

fn fail(status_tx: &watch::Sender<MonitorStatus>, e: Error) {
	status_tx.send_replace(MonitorStatus::Failed(Arc::new(e)));
}

pub(crate) struct Dispatcher {
	pub(crate) registry: WatchRegistry,
	pub(crate) fallback: FallbackHandler,
	pub(crate) batches_rx: chan::Receiver<Batch>,
	pub(crate) stop_rx: chan::Receiver<()>,
	pub(crate) errors_tx: broadcast::Sender<Arc<Error>>,
	pub(crate) losses: LossLog,
	pub(crate) auto_remove_invalidated: bool,
}

impl Dispatcher {
	pub(crate) async fn run(self) {
		enum StreamMessage {
			Batch(Batch),
			QueueClosed,
			Stop,
		}

		let mut msg_stream = pin!((
			self.batches_rx
				.clone()
				.map(StreamMessage::Batch)
				.chain(stream::once(async { StreamMessage::QueueClosed })),
			stream::once({
				let stop_rx = self.stop_rx.clone();
				async move { stop_rx.recv().await.ok() }
			})
			.map(|_| StreamMessage::Stop),
		)
			.merge());

		debug!("Inotify dispatcher started");

		'dispatch: while let Some(msg) = msg_stream.next().await {
			match msg {
				StreamMessage::Batch(Batch { seq, records }) => {
					for record in records {
						// Running handlers finish, the rest of the batch is abandoned
						if self.stop_rx.is_closed() {
							debug!("Inotify dispatcher stopping mid batch");
							break 'dispatch;
						}

						self.handle(record);
					}

					self.report_losses(seq);
				}

				StreamMessage::QueueClosed => {
					debug!("Record queue closed, inotify dispatcher exiting");
					break;
				}

				StreamMessage::Stop => {
					debug!("Inotify dispatcher received stop signal");
					break;
				}
			}
		}

		// Reaching here after a reader failure must also refuse new watches
		self.stop_rx.close();
	}

	fn handle(&self, record: RawRecord) {
		match self.dispatch(record) {
			Ok(()) => {}
			Err(Error::HandlerNotFound(wd)) => {
				trace!(%wd, "Record had no subscription and went to the fallback handler");
			}
			Err(e) => {
				error!(?e, "Failed to dispatch inotify record;");
				// No receivers is fine, the error was logged above
				self.errors_tx.send(Arc::new(e)).ok();
			}
		}
	}

	/// Classifies one record and hands it to its subscription, or to the fallback handler
	/// when no live subscription owns the watch.
	pub(crate) fn dispatch(&self, record: RawRecord) -> Result<(), Error> {
		let wd = record.wd;
		let event = Event::classify(record)?;

		let Some(handler) =
			self.registry
				.take_for_dispatch(wd, &event, self.auto_remove_invalidated)
		else {
			debug!(%wd, kind = event.kind(), "No subscription for watch, routing to fallback;");
			invoke(wd, || (self.fallback)(wd, event));
			return Err(Error::HandlerNotFound(wd));
		};

		invoke(wd, || handler(event));

		Ok(())
	}

	/// Reports, as a queue overflow, every gap that follows batch `seq`.
	fn report_losses(&self, seq: u64) {
		for lost in self.losses.take_through(seq) {
			warn!(lost, seq, "Records were dropped on a full queue, reporting overflow;");
			invoke(WatchHandle::SENTINEL, || {
				(self.fallback)(WatchHandle::SENTINEL, Event::QueueOverflow);
			});
		}
	}
}

fn invoke(wd: WatchHandle, f: impl FnOnce()) {
	if catch_unwind(AssertUnwindSafe(f)).is_err() {
		error!(%wd, "Watch handler panicked;");
	}
}

#[cfg(test)]
mod tests {
	use std::{ffi::OsString, sync::Mutex};

	use crate::registry::Subscription;

	use super::*;

	type Seen = Arc<Mutex<Vec<(WatchHandle, Event)>>>;

	fn dispatcher(auto_remove_invalidated: bool) -> (Dispatcher, Seen) {
		let fallback_seen = Seen::default();
		let (_batches_tx, batches_rx) = chan::bounded(1);
		let (_stop_tx, stop_rx) = chan::bounded(1);
		let (errors_tx, _) = broadcast::channel(1);

		let dispatcher = Dispatcher {
			registry: WatchRegistry::new(),
			fallback: Arc::new({
				let seen = Arc::clone(&fallback_seen);
				move |wd, event| seen.lock().unwrap().push((wd, event))
			}),
			batches_rx,
			stop_rx,
			errors_tx,
			losses: LossLog::default(),
			auto_remove_invalidated,
		};

		(dispatcher, fallback_seen)
	}

	fn created(wd: i32, name: &str) -> RawRecord {
		RawRecord {
			wd: WatchHandle::from_raw(wd),
			mask: libc::IN_CREATE,
			cookie: 0,
			name: Some(OsString::from(name)),
		}
	}

	fn recording(seen: &Seen, wd: WatchHandle) -> impl Fn(Event) + Send + Sync + 'static {
		let seen = Arc::clone(seen);
		move |event| seen.lock().unwrap().push((wd, event))
	}

	#[test]
	fn one_shot_fires_once_then_misses() {
		let (dispatcher, fallback_seen) = dispatcher(true);
		let seen = Seen::default();
		let wd = WatchHandle::from_raw(1);
		dispatcher
			.registry
			.insert(wd, Subscription::new(recording(&seen, wd), true));

		assert!(dispatcher.dispatch(created(1, "a")).is_ok());
		assert!(!dispatcher.registry.contains(wd));

		assert!(matches!(
			dispatcher.dispatch(created(1, "b")),
			Err(Error::HandlerNotFound(missed)) if missed == wd
		));

		assert_eq!(seen.lock().unwrap().len(), 1);
		assert_eq!(fallback_seen.lock().unwrap().len(), 1);
	}

	#[test]
	fn sentinel_overflow_reaches_fallback() {
		let (dispatcher, fallback_seen) = dispatcher(true);

		let overflow = RawRecord {
			wd: WatchHandle::SENTINEL,
			mask: libc::IN_Q_OVERFLOW,
			cookie: 0,
			name: None,
		};
		assert!(dispatcher.dispatch(overflow).is_err());

		assert_eq!(
			*fallback_seen.lock().unwrap(),
			vec![(WatchHandle::SENTINEL, Event::QueueOverflow)]
		);
	}

	#[test]
	fn classification_failure_skips_handler() {
		let (dispatcher, fallback_seen) = dispatcher(true);
		let seen = Seen::default();
		let wd = WatchHandle::from_raw(2);
		dispatcher
			.registry
			.insert(wd, Subscription::new(recording(&seen, wd), false));

		let nameless = RawRecord {
			wd,
			mask: libc::IN_DELETE,
			cookie: 0,
			name: None,
		};
		assert!(matches!(
			dispatcher.dispatch(nameless),
			Err(Error::Classify(_))
		));
		assert!(seen.lock().unwrap().is_empty());
		assert!(fallback_seen.lock().unwrap().is_empty());
		assert!(dispatcher.registry.contains(wd));
	}

	#[test]
	fn ignored_removes_subscription_before_delivery() {
		let (dispatcher, _) = dispatcher(true);
		let wd = WatchHandle::from_raw(3);
		let registry = dispatcher.registry.clone();
		let still_registered = Arc::new(Mutex::new(None));

		dispatcher.registry.insert(
			wd,
			Subscription::new(
				{
					let still_registered = Arc::clone(&still_registered);
					move |_| *still_registered.lock().unwrap() = Some(registry.contains(wd))
				},
				false,
			),
		);

		let ignored = RawRecord {
			wd,
			mask: libc::IN_IGNORED,
			cookie: 0,
			name: None,
		};
		assert!(dispatcher.dispatch(ignored).is_ok());
		assert_eq!(*still_registered.lock().unwrap(), Some(false));
	}

	#[test]
	fn panicking_handler_is_contained() {
		let (dispatcher, _) = dispatcher(true);
		let wd = WatchHandle::from_raw(4);
		dispatcher
			.registry
			.insert(wd, Subscription::new(|_| panic!("boom"), false));

		assert!(dispatcher.dispatch(created(4, "x")).is_ok());
		assert!(dispatcher.dispatch(created(4, "y")).is_ok());
	}

	#[test]
	fn losses_are_reported_at_their_gap() {
		let (dispatcher, fallback_seen) = dispatcher(true);

		dispatcher.losses.record_after(3, 2);
		dispatcher.losses.record_after(3, 1);
		dispatcher.losses.record_after(5, 4);

		dispatcher.report_losses(2);
		assert!(fallback_seen.lock().unwrap().is_empty());

		dispatcher.report_losses(3);
		dispatcher.report_losses(3);
		assert_eq!(
			*fallback_seen.lock().unwrap(),
			vec![(WatchHandle::SENTINEL, Event::QueueOverflow)]
		);

		dispatcher.report_losses(6);
		assert_eq!(fallback_seen.lock().unwrap().len(), 2);
	}

	#[test]
	fn gaps_merge_and_drain_in_order() {
		let losses = LossLog::default();
		losses.record_after(1, 1);
		losses.record_after(1, 2);
		losses.record_after(4, 5);

		assert_eq!(losses.take_through(0), Vec::<usize>::new());
		assert_eq!(losses.take_through(4), vec![3, 5]);
		assert!(losses.take_through(u64::MAX).is_empty());
	}
}
