//! Frame encoding: a 4-byte big-endian length prefix, a 1-byte message tag
//! header, then the payload — as required by the Prepare state's transport
//! configuration step (specification §4.1): "4-byte length prefix ...
//! 1-byte header split".

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use aae_util::Error;

use crate::tags::MessageTag;

#[derive(Debug, Clone)]
pub struct Frame {
	pub tag: MessageTag,
	pub payload: Vec<u8>,
}

impl Frame {
	pub fn new(tag: MessageTag, payload: Vec<u8>) -> Self {
		Frame { tag, payload }
	}

	pub fn empty(tag: MessageTag) -> Self {
		Frame {
			tag,
			payload: Vec::new(),
		}
	}

	fn to_bytes(&self) -> Vec<u8> {
		let len = 1 + self.payload.len();
		let mut out = Vec::with_capacity(4 + len);
		out.extend_from_slice(&(len as u32).to_be_bytes());
		out.push(self.tag.as_u8());
		out.extend_from_slice(&self.payload);
		out
	}

	pub async fn write<W: tokio::io::AsyncWrite + Unpin>(
		&self,
		w: &mut W,
	) -> Result<(), Error> {
		w.write_all(&self.to_bytes()).await?;
		w.flush().await?;
		Ok(())
	}

	pub async fn read<R: tokio::io::AsyncRead + Unpin>(r: &mut R) -> Result<Self, Error> {
		let mut len_buf = [0u8; 4];
		r.read_exact(&mut len_buf).await?;
		let len = u32::from_be_bytes(len_buf) as usize;
		if len == 0 {
			return Err(Error::Transport("empty frame".into()));
		}

		let mut body = vec![0u8; len];
		r.read_exact(&mut body).await?;

		let tag = MessageTag::from_u8(body[0])?;
		let payload = body[1..].to_vec();
		Ok(Frame { tag, payload })
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn frame_round_trips_over_a_pipe() {
		let (mut client, mut server) = tokio::io::duplex(4096);

		let frame = Frame::new(MessageTag::Init, vec![1, 2, 3, 4]);
		frame.write(&mut client).await.unwrap();

		let decoded = Frame::read(&mut server).await.unwrap();
		assert_eq!(decoded.tag, MessageTag::Init);
		assert_eq!(decoded.payload, vec![1, 2, 3, 4]);
	}

	#[tokio::test]
	async fn empty_payload_frame_round_trips() {
		let (mut client, mut server) = tokio::io::duplex(4096);

		Frame::empty(MessageTag::Complete)
			.write(&mut client)
			.await
			.unwrap();
		let decoded = Frame::read(&mut server).await.unwrap();
		assert_eq!(decoded.tag, MessageTag::Complete);
		assert!(decoded.payload.is_empty());
	}
}
