#![allow(dead_code)]

use sd_inotify_mux::{Error, KernelChannel, RawRecord, WatchHandle};

use std::{
	ffi::OsString,
	io,
	path::{Path, PathBuf},
	sync::{
		atomic::{AtomicI32, Ordering},
		Arc, Mutex,
	},
	time::Duration,
};

use async_channel as chan;
use tokio::time::timeout;

pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

enum Chunk {
	Bytes(Vec<u8>),
	/// Claims this many bytes were read without writing any, like a broken channel would.
	Overreport(usize),
	Fail(io::ErrorKind),
}

#[derive(Debug, Default)]
pub struct KernelLog {
	pub added: Vec<(PathBuf, u32, WatchHandle)>,
	pub removed: Vec<WatchHandle>,
}

/// Kernel channel whose reads are scripted by the test through a [`Script`].
pub struct ScriptedChannel {
	chunks_rx: chan::Receiver<Chunk>,
	next_wd: AtomicI32,
	log: Arc<Mutex<KernelLog>>,
}

pub struct Script {
	chunks_tx: chan::Sender<Chunk>,
	pub log: Arc<Mutex<KernelLog>>,
}

impl ScriptedChannel {
	pub fn new() -> (Self, Script) {
		let (chunks_tx, chunks_rx) = chan::unbounded();
		let log = Arc::<Mutex<KernelLog>>::default();

		(
			Self {
				chunks_rx,
				next_wd: AtomicI32::new(1),
				log: Arc::clone(&log),
			},
			Script { chunks_tx, log },
		)
	}
}

impl KernelChannel for ScriptedChannel {
	fn add_watch(&self, path: &Path, mask: u32) -> Result<WatchHandle, Error> {
		let wd = WatchHandle::from_raw(self.next_wd.fetch_add(1, Ordering::Relaxed));
		self.log
			.lock()
			.unwrap()
			.added
			.push((path.to_path_buf(), mask, wd));
		Ok(wd)
	}

	fn remove_watch(&self, wd: WatchHandle) -> io::Result<()> {
		self.log.lock().unwrap().removed.push(wd);
		Ok(())
	}

	async fn read_chunk(&self, buf: &mut [u8]) -> io::Result<usize> {
		match self.chunks_rx.recv().await {
			Ok(Chunk::Bytes(chunk)) => {
				assert!(chunk.len() <= buf.len(), "scripted chunk larger than read buffer");
				buf[..chunk.len()].copy_from_slice(&chunk);
				Ok(chunk.len())
			}
			Ok(Chunk::Overreport(n)) => Ok(n),
			Ok(Chunk::Fail(kind)) => Err(io::Error::from(kind)),
			// Script dropped, behave like an idle kernel channel
			Err(_) => std::future::pending().await,
		}
	}
}

impl Script {
	/// Delivers `records` as the result of a single read.
	pub fn feed(&self, records: &[RawRecord]) {
		let mut chunk = Vec::new();
		for record in records {
			record.encode_into(&mut chunk);
		}
		self.feed_bytes(chunk);
	}

	pub fn feed_bytes(&self, chunk: Vec<u8>) {
		self.chunks_tx.try_send(Chunk::Bytes(chunk)).unwrap();
	}

	pub fn overreport(&self, n: usize) {
		self.chunks_tx.try_send(Chunk::Overreport(n)).unwrap();
	}

	pub fn fail_read(&self, kind: io::ErrorKind) {
		self.chunks_tx.try_send(Chunk::Fail(kind)).unwrap();
	}

	pub fn added(&self) -> Vec<WatchHandle> {
		self.log
			.lock()
			.unwrap()
			.added
			.iter()
			.map(|(_, _, wd)| *wd)
			.collect()
	}

	pub fn removed(&self) -> Vec<WatchHandle> {
		self.log.lock().unwrap().removed.clone()
	}
}

pub fn record(wd: WatchHandle, mask: u32, name: Option<&str>) -> RawRecord {
	RawRecord {
		wd,
		mask,
		cookie: 0,
		name: name.map(OsString::from),
	}
}

/// Handler forwarding every event into an unbounded channel.
pub fn forwarding<T: Send + 'static>(
	tx: chan::Sender<T>,
	f: impl Fn(sd_inotify_mux::Event) -> T + Send + Sync + 'static,
) -> impl Fn(sd_inotify_mux::Event) + Send + Sync + 'static {
	move |event| {
		tx.try_send(f(event)).unwrap();
	}
}

pub async fn recv<T>(rx: &chan::Receiver<T>) -> T {
	timeout(RECV_TIMEOUT, rx.recv())
		.await
		.expect("timed out waiting for an event")
		.expect("event channel closed")
}

/// Asserts nothing else shows up on `rx` for a short while.
pub async fn assert_quiet<T: std::fmt::Debug>(rx: &chan::Receiver<T>) {
	if let Ok(Ok(unexpected)) = timeout(Duration::from_millis(200), rx.recv()).await {
		panic!("unexpected event: {unexpected:?}");
	}
}
