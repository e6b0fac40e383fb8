use std::path::Path;

use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::{
	error::{FileIOError, Result},
	record::MAX_RECORD_SIZE,
};

const DEFAULT_QUEUE_CAPACITY: usize = 64;
const DEFAULT_READ_CHUNK_SIZE: usize = 64 * 1024;
const DEFAULT_ERROR_CHANNEL_CAPACITY: usize = 32;

/// What the reader does when the dispatcher queue is full.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
	/// Stop reading until the dispatcher catches up. Pending events pile up in the kernel,
	/// which reports its own `QueueOverflow` once its queue is exhausted.
	#[default]
	Backpressure,
	/// Discard the batch that did not fit. The loss is reported to the fallback handler as a
	/// `QueueOverflow` on the sentinel watch.
	DropNewest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
	/// Maximum amount of record batches waiting for the dispatcher.
	#[serde(default = "default_queue_capacity")]
	pub queue_capacity: usize,
	/// Maximum amount of bytes taken from the kernel per read.
	#[serde(default = "default_read_chunk_size")]
	pub read_chunk_size: usize,
	#[serde(default)]
	pub overflow_policy: OverflowPolicy,
	/// Drop a subscription as soon as the kernel reports its watch as `Ignored`.
	#[serde(default = "default_true")]
	pub auto_remove_invalidated: bool,
	#[serde(default = "default_error_channel_capacity")]
	pub error_channel_capacity: usize,
}

const fn default_queue_capacity() -> usize {
	DEFAULT_QUEUE_CAPACITY
}

const fn default_read_chunk_size() -> usize {
	DEFAULT_READ_CHUNK_SIZE
}

const fn default_error_channel_capacity() -> usize {
	DEFAULT_ERROR_CHANNEL_CAPACITY
}

const fn default_true() -> bool {
	true
}

impl Default for MonitorConfig {
	fn default() -> Self {
		Self {
			queue_capacity: DEFAULT_QUEUE_CAPACITY,
			read_chunk_size: DEFAULT_READ_CHUNK_SIZE,
			overflow_policy: OverflowPolicy::default(),
			auto_remove_invalidated: true,
			error_channel_capacity: DEFAULT_ERROR_CHANNEL_CAPACITY,
		}
	}
}

impl MonitorConfig {
	/// Reads a JSON config file, missing fields take their defaults.
	pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
		let path = path.as_ref();

		let data = fs::read(path)
			.await
			.map_err(|e| FileIOError::new(path, e, "read config"))?;

		Ok(serde_json::from_slice(&data)?)
	}

	/// Clamps values the pipeline can't work with: a read buffer must hold at least one
	/// maximal record and channels need room for at least one item.
	#[must_use]
	pub fn normalized(mut self) -> Self {
		self.read_chunk_size = self.read_chunk_size.max(MAX_RECORD_SIZE);
		self.queue_capacity = self.queue_capacity.max(1);
		self.error_channel_capacity = self.error_channel_capacity.max(1);
		self
	}
}
