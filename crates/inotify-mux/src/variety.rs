//! Event varieties requested when a watch is added.
//!
//! Bit values come straight from `libc`, so they follow whatever the target's kernel headers say.

/// One flag of the kernel-facing watch mask.
///
/// Besides the event kinds there are modifiers (`OnlyDir`, `NoSymlink`, `MaskAdd`) that only
/// change how the kernel installs the watch, and `OneShot`, which also makes the subscription
/// remove itself after its first event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventVariety {
	Access,
	Modify,
	Attrib,
	Close,
	CloseWrite,
	CloseNoWrite,
	Open,
	Move,
	MoveIn,
	MoveOut,
	MoveSelf,
	Create,
	Delete,
	DeleteSelf,
	OnlyDir,
	NoSymlink,
	MaskAdd,
	OneShot,
	AllEvents,
}

impl EventVariety {
	pub const ALL: [Self; 19] = [
		Self::Access,
		Self::Modify,
		Self::Attrib,
		Self::Close,
		Self::CloseWrite,
		Self::CloseNoWrite,
		Self::Open,
		Self::Move,
		Self::MoveIn,
		Self::MoveOut,
		Self::MoveSelf,
		Self::Create,
		Self::Delete,
		Self::DeleteSelf,
		Self::OnlyDir,
		Self::NoSymlink,
		Self::MaskAdd,
		Self::OneShot,
		Self::AllEvents,
	];

	#[must_use]
	pub const fn mask(self) -> u32 {
		match self {
			Self::Access => libc::IN_ACCESS,
			Self::Modify => libc::IN_MODIFY,
			Self::Attrib => libc::IN_ATTRIB,
			Self::Close => libc::IN_CLOSE,
			Self::CloseWrite => libc::IN_CLOSE_WRITE,
			Self::CloseNoWrite => libc::IN_CLOSE_NOWRITE,
			Self::Open => libc::IN_OPEN,
			Self::Move => libc::IN_MOVE,
			Self::MoveIn => libc::IN_MOVED_TO,
			Self::MoveOut => libc::IN_MOVED_FROM,
			Self::MoveSelf => libc::IN_MOVE_SELF,
			Self::Create => libc::IN_CREATE,
			Self::Delete => libc::IN_DELETE,
			Self::DeleteSelf => libc::IN_DELETE_SELF,
			Self::OnlyDir => libc::IN_ONLYDIR,
			Self::NoSymlink => libc::IN_DONT_FOLLOW,
			Self::MaskAdd => libc::IN_MASK_ADD,
			Self::OneShot => libc::IN_ONESHOT,
			Self::AllEvents => libc::IN_ALL_EVENTS,
		}
	}

	/// Bitwise union of every requested variety.
	pub fn mask_of<'a>(varieties: impl IntoIterator<Item = &'a Self>) -> u32 {
		varieties
			.into_iter()
			.fold(0, |mask, variety| mask | variety.mask())
	}

	pub fn is_one_shot<'a>(varieties: impl IntoIterator<Item = &'a Self>) -> bool {
		varieties.into_iter().any(|variety| *variety == Self::OneShot)
	}
}
