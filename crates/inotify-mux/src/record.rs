//! Raw inotify records and the decoder for the kernel's byte stream.
//!
//! Every record is a fixed `struct inotify_event` header followed by `len` bytes of
//! NUL-padded name:
//!
//! ```text
//! wd: i32 | mask: u32 | cookie: u32 | len: u32 | name: [u8; len]
//! ```
//!
//! Records are packed back to back in native byte order. The decoder walks them with an
//! explicit offset and checks bounds before every field read.

use std::{
	ffi::{OsStr, OsString},
	fmt,
	mem::size_of,
	os::unix::ffi::OsStrExt,
};

use static_assertions::const_assert_eq;

use crate::error::DecodeError;

/// Size of the fixed record header.
pub const HEADER_SIZE: usize = 16;

const_assert_eq!(HEADER_SIZE, size_of::<libc::inotify_event>());

const NAME_MAX: usize = 255;

/// Largest record the kernel may emit: header plus a maximal NUL terminated name.
pub const MAX_RECORD_SIZE: usize = HEADER_SIZE + NAME_MAX + 1;

/// Kernel watch descriptor.
///
/// Only unique among currently active watches, the kernel may hand out the same value again
/// after a watch is removed. `-1` is used by the kernel for records that belong to no watch,
/// such as queue overflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatchHandle(i32);

impl WatchHandle {
	pub const SENTINEL: Self = Self(-1);

	#[must_use]
	pub const fn from_raw(wd: i32) -> Self {
		Self(wd)
	}

	#[must_use]
	pub const fn as_raw(self) -> i32 {
		self.0
	}
}

impl fmt::Display for WatchHandle {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// A single undecoded kernel record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
	pub wd: WatchHandle,
	pub mask: u32,
	pub cookie: u32,
	pub name: Option<OsString>,
}

impl RawRecord {
	/// Appends this record to `buf` in the kernel's layout, padding the name the way the kernel
	/// does (NUL terminated, rounded up to a multiple of the header size).
	pub fn encode_into(&self, buf: &mut Vec<u8>) {
		let name = self.name.as_deref().map(OsStr::as_bytes).unwrap_or_default();
		let name_len = if name.is_empty() {
			0
		} else {
			(name.len() + 1).next_multiple_of(HEADER_SIZE)
		};

		buf.extend_from_slice(&self.wd.as_raw().to_ne_bytes());
		buf.extend_from_slice(&self.mask.to_ne_bytes());
		buf.extend_from_slice(&self.cookie.to_ne_bytes());
		buf.extend_from_slice(&u32::try_from(name_len).unwrap_or(u32::MAX).to_ne_bytes());
		buf.extend_from_slice(name);
		buf.resize(buf.len() + name_len - name.len(), 0);
	}
}

/// Iterator over the records packed in one read from the kernel channel.
///
/// Stops at the end of the buffer; a malformed record yields one error and ends iteration.
#[derive(Debug)]
pub struct Records<'buf> {
	buf: &'buf [u8],
	offset: usize,
	failed: bool,
}

impl<'buf> Records<'buf> {
	#[must_use]
	pub const fn new(buf: &'buf [u8]) -> Self {
		Self {
			buf,
			offset: 0,
			failed: false,
		}
	}

	fn next_record(&mut self) -> Result<RawRecord, DecodeError> {
		let remaining = &self.buf[self.offset..];
		if remaining.len() < HEADER_SIZE {
			return Err(DecodeError::TruncatedHeader {
				offset: self.offset,
				available: remaining.len(),
				needed: HEADER_SIZE,
			});
		}

		let (header, rest) = remaining.split_at(HEADER_SIZE);
		let wd = WatchHandle::from_raw(i32::from_ne_bytes(word_at(header, 0)));
		let mask = u32::from_ne_bytes(word_at(header, 4));
		let cookie = u32::from_ne_bytes(word_at(header, 8));
		let name_len = usize::try_from(u32::from_ne_bytes(word_at(header, 12)))
			.unwrap_or(usize::MAX);

		if rest.len() < name_len {
			return Err(DecodeError::TruncatedName {
				offset: self.offset,
				name_len,
				available: rest.len(),
			});
		}

		let padded = &rest[..name_len];
		let name = padded
			.iter()
			.position(|&byte| byte == 0)
			.map_or(padded, |end| &padded[..end]);

		self.offset += HEADER_SIZE + name_len;

		Ok(RawRecord {
			wd,
			mask,
			cookie,
			name: (!name.is_empty()).then(|| OsStr::from_bytes(name).to_os_string()),
		})
	}
}

impl Iterator for Records<'_> {
	type Item = Result<RawRecord, DecodeError>;

	fn next(&mut self) -> Option<Self::Item> {
		if self.failed || self.offset >= self.buf.len() {
			return None;
		}

		let res = self.next_record();
		self.failed = res.is_err();
		Some(res)
	}
}

/// Decodes every record in `buf`, in buffer order.
pub fn decode(buf: &[u8]) -> Result<Vec<RawRecord>, DecodeError> {
	Records::new(buf).collect()
}

// Callers guarantee `at + 4 <= bytes.len()`.
fn word_at(bytes: &[u8], at: usize) -> [u8; 4] {
	let mut word = [0; 4];
	word.copy_from_slice(&bytes[at..at + 4]);
	word
}
