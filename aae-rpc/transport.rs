//! Socket abstraction used by the exchange engine.
//!
//! Exposes the three operations the specification's Transport collaborator
//! needs (§6): `send`, `setopts`, and `controlling_process`. Ownership
//! handoff between the engine and the comparison worker (§4.1, §5) is
//! modeled the way Design Notes §9 suggests: the whole `Socket` is a single
//! value that moves by ownership through a channel, so only one task can
//! ever hold it at a time — there is no separate "controlling_process" call
//! to make, the type system enforces single ownership instead.

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use aae_util::Error;

use crate::frame::Frame;
use crate::tags::MessageTag;

/// Options applied once, in the Prepare state, before any frame is
/// exchanged (specification §4.1, step 1).
#[derive(Debug, Clone, Copy)]
pub struct TransportOptions {
	pub keepalive: bool,
	pub nodelay: bool,
}

impl Default for TransportOptions {
	fn default() -> Self {
		TransportOptions {
			keepalive: true,
			nodelay: true,
		}
	}
}

/// An owned, single-writer connection to a remote sink.
///
/// `Socket` deliberately has no `Clone`: at any instant exactly one task can
/// hold it, matching the invariant in specification §4.1 ("the transport
/// socket is owned by exactly one process at a time"). Generic over the
/// underlying stream so production code plugs in a `TcpStream` while tests
/// drive the same state machine over an in-memory `tokio::io::duplex` pipe.
pub struct Socket<S = TcpStream> {
	stream: S,
}

impl<S> Socket<S>
where
	S: AsyncRead + AsyncWrite + Unpin + Send,
{
	pub fn new(stream: S) -> Self {
		Socket { stream }
	}

	/// Synchronous send: write a frame and block until a `REPLY` (or any
	/// async tag's fire-and-forget acknowledgement) arrives, matching the
	/// `is_synchronous` classification in [`MessageTag`].
	pub async fn call(&mut self, tag: MessageTag, payload: Vec<u8>) -> Result<Vec<u8>, Error> {
		Frame::new(tag, payload).write(&mut self.stream).await?;
		if !tag.is_synchronous() {
			return Ok(Vec::new());
		}
		let reply = Frame::read(&mut self.stream).await?;
		if reply.tag != MessageTag::Reply {
			return Err(Error::Transport(format!(
				"expected REPLY, got {:?}",
				reply.tag
			)
			.into()));
		}
		Ok(reply.payload)
	}

	/// Asynchronous send: write a frame without awaiting any reply, used
	/// for `PUT_OBJ` and `COMPLETE`.
	pub async fn cast(&mut self, tag: MessageTag, payload: Vec<u8>) -> Result<(), Error> {
		Frame::new(tag, payload).write(&mut self.stream).await?;
		Ok(())
	}

	/// Wait for the next frame addressed to us (used by the comparison
	/// worker to read `GET_AAE_BUCKET`/`GET_AAE_SEGMENT` replies, and by a
	/// sink-side handler to read incoming requests).
	pub async fn recv(&mut self) -> Result<Frame, Error> {
		Frame::read(&mut self.stream).await
	}

	pub async fn reply(&mut self, payload: Vec<u8>) -> Result<(), Error> {
		Frame::new(MessageTag::Reply, payload)
			.write(&mut self.stream)
			.await
	}
}

impl Socket<TcpStream> {
	/// Apply the framing/keepalive/Nagle configuration required by the
	/// Prepare state. Only meaningful for a real TCP connection; an
	/// in-memory test pipe has no socket options to set.
	pub fn configure(&self, opts: TransportOptions) -> Result<(), Error> {
		self.stream.set_nodelay(opts.nodelay)?;
		// TCP_KEEPALIVE itself needs a platform-specific socket2 call in a
		// real deployment; `set_nodelay` above is what `tokio::net::TcpStream`
		// exposes directly, the rest is left to whoever constructs the
		// underlying `TcpStream` (e.g. via a `socket2::Socket` builder).
		let _ = opts.keepalive;
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn call_round_trips_over_a_duplex_pipe() {
		let (client, server) = tokio::io::duplex(4096);
		let mut client = Socket::new(client);
		let mut server = Socket::new(server);

		let client_task = tokio::spawn(async move { client.call(MessageTag::Init, vec![9]).await });

		let frame = server.recv().await.unwrap();
		assert_eq!(frame.tag, MessageTag::Init);
		assert_eq!(frame.payload, vec![9]);
		server.reply(vec![1, 2, 3]).await.unwrap();

		let reply = client_task.await.unwrap().unwrap();
		assert_eq!(reply, vec![1, 2, 3]);
	}

	#[tokio::test]
	async fn cast_does_not_wait_for_a_reply() {
		let (client, server) = tokio::io::duplex(4096);
		let mut client = Socket::new(client);
		let mut server = Socket::new(server);

		client.cast(MessageTag::PutObj, vec![7]).await.unwrap();
		let frame = server.recv().await.unwrap();
		assert_eq!(frame.tag, MessageTag::PutObj);
		assert_eq!(frame.payload, vec![7]);
	}
}
