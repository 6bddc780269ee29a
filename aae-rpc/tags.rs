//! The closed set of single-byte message tags recognized by the exchange
//! protocol (specification §4.1).

use aae_util::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageTag {
	Init = 1,
	LockTree = 2,
	UpdateTree = 3,
	GetAaeBucket = 4,
	GetAaeSegment = 5,
	PutObj = 6,
	Complete = 7,
	Reply = 8,
}

impl MessageTag {
	pub const fn as_u8(self) -> u8 {
		self as u8
	}

	pub fn from_u8(b: u8) -> Result<Self, Error> {
		Ok(match b {
			1 => MessageTag::Init,
			2 => MessageTag::LockTree,
			3 => MessageTag::UpdateTree,
			4 => MessageTag::GetAaeBucket,
			5 => MessageTag::GetAaeSegment,
			6 => MessageTag::PutObj,
			7 => MessageTag::Complete,
			8 => MessageTag::Reply,
			other => return Err(Error::message(format!("unknown message tag {}", other))),
		})
	}

	/// Whether a send of this tag blocks until a `REPLY` frame arrives.
	pub const fn is_synchronous(self) -> bool {
		!matches!(self, MessageTag::PutObj | MessageTag::Complete)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn tag_round_trips() {
		for tag in [
			MessageTag::Init,
			MessageTag::LockTree,
			MessageTag::UpdateTree,
			MessageTag::GetAaeBucket,
			MessageTag::GetAaeSegment,
			MessageTag::PutObj,
			MessageTag::Complete,
			MessageTag::Reply,
		] {
			assert_eq!(MessageTag::from_u8(tag.as_u8()).unwrap(), tag);
		}
	}

	#[test]
	fn unknown_tag_is_rejected() {
		assert!(MessageTag::from_u8(200).is_err());
	}
}
