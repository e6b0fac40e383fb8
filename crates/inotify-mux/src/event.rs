use std::ffi::OsString;

use crate::{error::ClassifyError, record::RawRecord};

/// Structured form of one kernel record.
///
/// `name` is the entry inside a watched directory the event refers to. Variants where it is
/// optional also fire for the watched object itself, in which case the kernel sends no name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
	Accessed {
		is_directory: bool,
		name: Option<OsString>,
	},
	Modified {
		is_directory: bool,
		name: Option<OsString>,
	},
	Attributes {
		is_directory: bool,
		name: Option<OsString>,
	},
	Closed {
		is_directory: bool,
		name: Option<OsString>,
		was_writable: bool,
	},
	Opened {
		is_directory: bool,
		name: Option<OsString>,
	},
	/// First half of a rename, `cookie` matches the `MovedIn` that follows if the destination
	/// is watched too.
	MovedOut {
		is_directory: bool,
		name: OsString,
		cookie: u32,
	},
	MovedIn {
		is_directory: bool,
		name: OsString,
		cookie: u32,
	},
	MovedSelf {
		is_directory: bool,
	},
	Created {
		is_directory: bool,
		name: OsString,
	},
	Deleted {
		is_directory: bool,
		name: OsString,
	},
	DeletedSelf,
	Unmounted,
	/// The kernel dropped events because its queue was full.
	QueueOverflow,
	/// The watch is gone, either removed explicitly or because its target disappeared.
	Ignored,
	Unknown {
		mask: u32,
		cookie: u32,
		name: Option<OsString>,
	},
}

impl Event {
	#[must_use]
	pub const fn kind(&self) -> &'static str {
		match self {
			Self::Accessed { .. } => "Accessed",
			Self::Modified { .. } => "Modified",
			Self::Attributes { .. } => "Attributes",
			Self::Closed { .. } => "Closed",
			Self::Opened { .. } => "Opened",
			Self::MovedOut { .. } => "MovedOut",
			Self::MovedIn { .. } => "MovedIn",
			Self::MovedSelf { .. } => "MovedSelf",
			Self::Created { .. } => "Created",
			Self::Deleted { .. } => "Deleted",
			Self::DeletedSelf => "DeletedSelf",
			Self::Unmounted => "Unmounted",
			Self::QueueOverflow => "QueueOverflow",
			Self::Ignored => "Ignored",
			Self::Unknown { .. } => "Unknown",
		}
	}

	/// Classifies a raw record by first match over the primary bits, in the order below.
	///
	/// `IS_DIR` is read independently and attached to every variant that carries it.
	pub fn classify(record: RawRecord) -> Result<Self, ClassifyError> {
		let RawRecord {
			wd,
			mask,
			cookie,
			name,
		} = record;

		let is_directory = mask & libc::IN_ISDIR != 0;
		let has = |bit: u32| mask & bit != 0;
		let required = |kind: &'static str, name: Option<OsString>| {
			name.ok_or(ClassifyError::MissingName { kind, wd })
		};

		let event = if has(libc::IN_ACCESS) {
			Self::Accessed { is_directory, name }
		} else if has(libc::IN_MODIFY) {
			Self::Modified { is_directory, name }
		} else if has(libc::IN_ATTRIB) {
			Self::Attributes { is_directory, name }
		} else if has(libc::IN_CLOSE) {
			Self::Closed {
				is_directory,
				name,
				was_writable: has(libc::IN_CLOSE_WRITE),
			}
		} else if has(libc::IN_OPEN) {
			Self::Opened { is_directory, name }
		} else if has(libc::IN_MOVED_FROM) {
			Self::MovedOut {
				is_directory,
				name: required("MovedOut", name)?,
				cookie,
			}
		} else if has(libc::IN_MOVED_TO) {
			Self::MovedIn {
				is_directory,
				name: required("MovedIn", name)?,
				cookie,
			}
		} else if has(libc::IN_MOVE_SELF) {
			Self::MovedSelf { is_directory }
		} else if has(libc::IN_CREATE) {
			Self::Created {
				is_directory,
				name: required("Created", name)?,
			}
		} else if has(libc::IN_DELETE) {
			Self::Deleted {
				is_directory,
				name: required("Deleted", name)?,
			}
		} else if has(libc::IN_DELETE_SELF) {
			Self::DeletedSelf
		} else if has(libc::IN_UNMOUNT) {
			Self::Unmounted
		} else if has(libc::IN_Q_OVERFLOW) {
			Self::QueueOverflow
		} else if has(libc::IN_IGNORED) {
			Self::Ignored
		} else {
			Self::Unknown { mask, cookie, name }
		};

		Ok(event)
	}
}
