//! The kernel side of the multiplexer.
//!
//! [`KernelChannel`] is the seam between the pipeline and the operating system: acquiring the
//! inotify descriptor, issuing the watch syscalls and reading raw bytes. [`InotifyChannel`] is
//! the Linux implementation, tests substitute a scripted channel.

use std::{
	collections::HashMap,
	future::Future,
	io,
	os::fd::AsRawFd,
	path::Path,
	sync::{Mutex, PoisonError},
};

use inotify::{Inotify, WatchDescriptor, WatchMask};
use tokio::io::{unix::AsyncFd, Interest};
use tracing::trace;

use crate::{
	error::{Error, FileIOError, ResourceLimit, Result},
	record::WatchHandle,
};

pub trait KernelChannel: Send + Sync + 'static {
	/// Installs (or with `IN_MASK_ADD`, extends) a watch on `path`.
	fn add_watch(&self, path: &Path, mask: u32) -> Result<WatchHandle>;

	fn remove_watch(&self, wd: WatchHandle) -> io::Result<()>;

	/// Waits until the channel is readable, then reads whole records into `buf`.
	///
	/// Returns the amount of bytes read, never more than `buf.len()`.
	fn read_chunk(&self, buf: &mut [u8]) -> impl Future<Output = io::Result<usize>> + Send;
}

/// Non-blocking inotify instance registered with the tokio reactor.
///
/// Watches go through the `inotify` crate, reads are raw so the pipeline decodes the kernel's
/// bytes itself.
#[derive(Debug)]
pub struct InotifyChannel {
	inotify: AsyncFd<Inotify>,
	descriptors: Mutex<HashMap<WatchHandle, WatchDescriptor>>,
}

impl InotifyChannel {
	/// Must be called from within a tokio runtime.
	pub fn acquire() -> Result<Self> {
		let inotify = Inotify::init().map_err(|e| match e.raw_os_error() {
			Some(libc::EMFILE | libc::ENFILE | libc::ENOMEM) => Error::ResourceLimitExceeded {
				limit: ResourceLimit::Instances,
				source: e,
			},
			_ => Error::ChannelInit(e),
		})?;

		let raw_fd = inotify.as_raw_fd();
		let inotify =
			AsyncFd::with_interest(inotify, Interest::READABLE).map_err(Error::ChannelInit)?;

		trace!(fd = raw_fd, "Acquired inotify channel");

		Ok(Self {
			inotify,
			descriptors: Mutex::default(),
		})
	}
}

impl KernelChannel for InotifyChannel {
	fn add_watch(&self, path: &Path, mask: u32) -> Result<WatchHandle> {
		let descriptor = self
			.inotify
			.get_ref()
			.watches()
			.add(path, WatchMask::from_bits_truncate(mask))
			.map_err(|e| match e.raw_os_error() {
				Some(libc::ENOENT) => Error::PathNotFound(path.into()),
				Some(libc::ENOSPC | libc::ENOMEM) => Error::ResourceLimitExceeded {
					limit: ResourceLimit::Watches(path.into()),
					source: e,
				},
				_ => FileIOError::new(path, e, "inotify_add_watch").into(),
			})?;

		let wd = WatchHandle::from_raw(descriptor.get_watch_descriptor_id());

		// Same inode watched again hands back the same descriptor, overwriting is fine
		self.descriptors
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.insert(wd, descriptor);

		Ok(wd)
	}

	fn remove_watch(&self, wd: WatchHandle) -> io::Result<()> {
		let descriptor = self
			.descriptors
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.remove(&wd)
			.ok_or_else(|| io::Error::from_raw_os_error(libc::EINVAL))?;

		self.inotify.get_ref().watches().remove(descriptor)
	}

	async fn read_chunk(&self, buf: &mut [u8]) -> io::Result<usize> {
		loop {
			let mut guard = self.inotify.readable().await?;

			match guard.try_io(|inotify| {
				// SAFETY: `buf` is valid for writes of `buf.len()` bytes and the fd outlives the call
				let n = unsafe {
					libc::read(
						inotify.get_ref().as_raw_fd(),
						buf.as_mut_ptr().cast(),
						buf.len(),
					)
				};
				if n < 0 {
					Err(io::Error::last_os_error())
				} else {
					Ok(n.unsigned_abs())
				}
			}) {
				Ok(res) => return res,
				// Readiness was stale, the guard already cleared it
				Err(_would_block) => continue,
			}
		}
	}
}
