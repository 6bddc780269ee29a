//! Error taxonomy shared by the exchange engine, the Merkle helper and the
//! cascade topology model.

use std::borrow::Cow;

use err_derive::Error;

/// Why the tree service reported a lock could not be acquired, either
/// locally (`get_lock`) or on the remote sink (`LOCK_TREE` reply).
#[derive(Debug, Clone, Error)]
#[error(display = "{}", reason)]
pub struct LockError {
	pub reason: Cow<'static, str>,
}

impl LockError {
	pub fn new<S: Into<Cow<'static, str>>>(reason: S) -> Self {
		Self {
			reason: reason.into(),
		}
	}
}

/// The single error type propagated by the exchange engine, the Merkle
/// helper and their external collaborators.
///
/// Grouped by kind as in the error handling table of the specification:
/// every fatal variant maps to one termination reason for the owning task.
#[derive(Debug, Error)]
pub enum Error {
	/// Local `get_lock` was rejected, or the remote replied to `LOCK_TREE`
	/// with something other than `ok`.
	#[error(display = "lock failure: {}", _0)]
	Lock(#[error(source)] LockError),

	/// The tree service reported `not_responsible` for an `IndexN`.
	#[error(display = "not responsible for partition {} indexn {:?}", partition, index_n)]
	NotResponsible { partition: u64, index_n: (u64, u16) },

	/// The monitored tree-service process (or the remote mirror) exited.
	#[error(display = "peer process went down: {}", _0)]
	PeerDown(Cow<'static, str>),

	/// A reply frame carried an error, or the socket read/write failed.
	#[error(display = "transport error: {}", _0)]
	Transport(Cow<'static, str>),

	/// A helper sub-process (fold task, external map owner) died abnormally.
	#[error(display = "helper failure ({}): {}", kind, reason)]
	Helper {
		kind: Cow<'static, str>,
		reason: Cow<'static, str>,
	},

	/// `cancel_fullsync` was received.
	#[error(display = "cancelled")]
	Cancelled,

	/// Anything that doesn't fit the taxonomy above but is still fatal to
	/// the current task (encoding errors, I/O errors bridged in via `From`).
	#[error(display = "{}", _0)]
	Other(Cow<'static, str>),
}

impl Error {
	pub fn message<S: Into<Cow<'static, str>>>(s: S) -> Self {
		Error::Other(s.into())
	}

	/// The short reason code surfaced to the owning fullsync coordinator,
	/// matching the exit reasons named in the specification
	/// (`something_went_down`, `not_responsible`, ...).
	pub fn reason_code(&self) -> &'static str {
		match self {
			Error::Lock(_) => "lock_failure",
			Error::NotResponsible { .. } => "not_responsible",
			Error::PeerDown(_) => "something_went_down",
			Error::Transport(_) => "transport_error",
			Error::Helper { .. } => "helper_failure",
			Error::Cancelled => "cancelled",
			Error::Other(_) => "error",
		}
	}
}

impl From<std::io::Error> for Error {
	fn from(e: std::io::Error) -> Error {
		Error::Transport(format!("{}", e).into())
	}
}

impl From<rmp_serde::encode::Error> for Error {
	fn from(e: rmp_serde::encode::Error) -> Error {
		Error::Other(format!("encode error: {}", e).into())
	}
}

impl From<rmp_serde::decode::Error> for Error {
	fn from(e: rmp_serde::decode::Error) -> Error {
		Error::Other(format!("decode error: {}", e).into())
	}
}

pub type Result<T> = std::result::Result<T, Error>;
