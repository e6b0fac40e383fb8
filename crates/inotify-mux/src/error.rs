use std::{fmt, io, path::Path};

use thiserror::Error;

use crate::record::WatchHandle;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
	#[error("path not found: <path='{}'>", .0.display())]
	PathNotFound(Box<Path>),
	#[error("kernel resource limit exceeded ({limit}): {source}")]
	ResourceLimitExceeded {
		limit: ResourceLimit,
		#[source]
		source: io::Error,
	},
	#[error(transparent)]
	FileIO(#[from] FileIOError),

	#[error("failed to acquire inotify channel: {0}")]
	ChannelInit(#[source] io::Error),
	#[error("fatal read error on inotify channel: {0}")]
	Read(#[source] io::Error),
	#[error(transparent)]
	Decode(#[from] DecodeError),
	#[error(transparent)]
	Classify(#[from] ClassifyError),
	#[error("no handler registered for watch <wd='{0}'>")]
	HandlerNotFound(WatchHandle),

	#[error("monitor is shut down")]
	Shutdown,

	#[error("invalid monitor config: {0}")]
	Config(#[from] serde_json::Error),
}

/// Which kernel limit refused the request.
#[derive(Debug)]
pub enum ResourceLimit {
	/// `fs.inotify.max_user_instances`, or the process file descriptor table.
	Instances,
	/// `fs.inotify.max_user_watches`, hit while watching the given path.
	Watches(Box<Path>),
}

impl fmt::Display for ResourceLimit {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Instances => write!(f, "inotify instances"),
			Self::Watches(path) => write!(f, "inotify watches; path: '{}'", path.display()),
		}
	}
}

/// Malformed bytes coming out of the kernel channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeError {
	#[error("truncated record header at offset {offset}: {available} of {needed} bytes available")]
	TruncatedHeader {
		offset: usize,
		available: usize,
		needed: usize,
	},
	#[error("record name at offset {offset} declares {name_len} bytes but only {available} remain")]
	TruncatedName {
		offset: usize,
		name_len: usize,
		available: usize,
	},
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClassifyError {
	#[error("{kind} record for watch <wd='{wd}'> carries no name")]
	MissingName { kind: &'static str, wd: WatchHandle },
}

/// Filesystem or watch syscall failure on a specific path.
#[derive(Error, Debug)]
#[error("{operation} failed: {source}; path: '{}'", .path.display())]
pub struct FileIOError {
	pub path: Box<Path>,
	/// What was being attempted, e.g. the syscall name.
	pub operation: &'static str,
	#[source]
	pub source: io::Error,
}

impl FileIOError {
	pub fn new(path: impl AsRef<Path>, source: io::Error, operation: &'static str) -> Self {
		Self {
			path: path.as_ref().into(),
			operation,
			source,
		}
	}
}
