//! Hashing and term-encoding helpers shared across the workspace.
//!
//! Grounded on `garage_util::data`/`garage_util::encode`: a single hash
//! function used everywhere a content hash is needed, and a single
//! "nonversioned" MessagePack encoding used for anything the specification
//! calls an "encoded term".

use blake2::{Blake2b512, Digest};
use serde::{de::DeserializeOwned, Serialize};

use crate::error::Error;

pub type Hash = [u8; 32];

/// Hash an arbitrary byte string (an encoded object, in the caller's
/// terms) down to a fixed-size digest, as used by the Merkle helper's
/// `hash_object` step and by bucket/segment hash comparison.
pub fn hash_object(data: &[u8]) -> Hash {
	let mut hasher = Blake2b512::new();
	hasher.update(data);
	let full = hasher.finalize();
	let mut out = [0u8; 32];
	out.copy_from_slice(&full[..32]);
	out
}

/// Encode a value as a MessagePack term, matching the specification's
/// "length-prefixed encoded term" wording for reply payloads and keyfile
/// records.
pub fn encode_term<T: Serialize>(value: &T) -> Result<Vec<u8>, Error> {
	Ok(rmp_serde::to_vec(value)?)
}

pub fn decode_term<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, Error> {
	Ok(rmp_serde::from_slice(bytes)?)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn hash_is_deterministic_and_sensitive() {
		let a = hash_object(b"hello");
		let b = hash_object(b"hello");
		let c = hash_object(b"hellp");
		assert_eq!(a, b);
		assert_ne!(a, c);
	}

	#[test]
	fn term_round_trips() {
		let value = (vec![1u8, 2, 3], "bucket".to_string());
		let encoded = encode_term(&value).unwrap();
		let decoded: (Vec<u8>, String) = decode_term(&encoded).unwrap();
		assert_eq!(value, decoded);
	}
}
