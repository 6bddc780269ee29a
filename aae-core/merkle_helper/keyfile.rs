//! On-disk keyfile format for the Merkle Helper.
//!
//! Specification §3 leaves the keyfile's byte layout external ("length-
//! prefixed sequence of term(bkey, hash) records, ultimately sorted by
//! packed bkey"); this workspace picks the simplest concrete format that
//! satisfies it: a length-prefixed stream of `bincode`-encoded
//! `(Vec<u8>, [u8; 32])` records, sorted in memory rather than through an
//! external merge-sort (see DESIGN.md).

use std::io::SeekFrom;
use std::path::Path;

use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use aae_util::data::Hash;
use aae_util::Error;

/// One `(packed_bkey, hash)` record as stored in a keyfile.
pub type Record = (Vec<u8>, Hash);

fn encode_record(record: &Record) -> Result<Vec<u8>, Error> {
	bincode::serialize(record).map_err(|e| Error::message(format!("keyfile encode: {}", e)))
}

fn decode_record(bytes: &[u8]) -> Result<Record, Error> {
	bincode::deserialize(bytes).map_err(|e| Error::message(format!("keyfile decode: {}", e)))
}

/// Appends length-prefixed records to a file, used by `make_keylist` and
/// `merkle_to_keylist`. Records are buffered in memory and written to the
/// file in groups of `batch_size`, matching the `batch_size` configuration
/// field's documented use for "flushing offloaded keyfile records".
pub struct KeyfileWriter {
	file: File,
	batch_size: usize,
	buffer: Vec<u8>,
	buffered_records: usize,
}

impl KeyfileWriter {
	/// Creates a writer that flushes to disk after every record, the
	/// behavior callers that don't have a batch size opinion want.
	pub async fn create(path: &Path) -> Result<Self, Error> {
		Self::create_with_batch_size(path, 1).await
	}

	pub async fn create_with_batch_size(path: &Path, batch_size: usize) -> Result<Self, Error> {
		let file = File::create(path).await?;
		Ok(KeyfileWriter {
			file,
			batch_size: batch_size.max(1),
			buffer: Vec::new(),
			buffered_records: 0,
		})
	}

	pub async fn write_record(&mut self, record: &Record) -> Result<(), Error> {
		let body = encode_record(record)?;
		self.buffer
			.extend_from_slice(&(body.len() as u32).to_be_bytes());
		self.buffer.extend_from_slice(&body);
		self.buffered_records += 1;
		if self.buffered_records >= self.batch_size {
			self.flush_buffer().await?;
		}
		Ok(())
	}

	async fn flush_buffer(&mut self) -> Result<(), Error> {
		if !self.buffer.is_empty() {
			self.file.write_all(&self.buffer).await?;
			self.buffer.clear();
		}
		self.buffered_records = 0;
		Ok(())
	}

	pub async fn finish(mut self) -> Result<(), Error> {
		self.flush_buffer().await?;
		self.file.flush().await?;
		self.file.sync_all().await?;
		Ok(())
	}
}

/// Reads every record from a keyfile into memory. Keyfiles in this
/// workspace are small enough (bounded by one partition's keyspace) that an
/// in-memory sort is the grounded choice over standing up an external
/// merge-sort dependency (DESIGN.md).
pub async fn read_all(path: &Path) -> Result<Vec<Record>, Error> {
	let mut file = File::open(path).await?;
	file.seek(SeekFrom::Start(0)).await?;
	let mut out = Vec::new();
	loop {
		let mut len_buf = [0u8; 4];
		match file.read_exact(&mut len_buf).await {
			Ok(()) => {}
			Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
			Err(e) => return Err(e.into()),
		}
		let len = u32::from_be_bytes(len_buf) as usize;
		let mut body = vec![0u8; len];
		file.read_exact(&mut body).await?;
		out.push(decode_record(&body)?);
	}
	Ok(out)
}

/// Sorts a keyfile in place by packed bkey (the "sort it externally" step
/// of `make_keylist`, specification §4.2).
pub async fn sort_in_place(path: &Path) -> Result<(), Error> {
	let mut records = read_all(path).await?;
	records.sort_unstable_by(|a, b| a.0.cmp(&b.0));
	let mut writer = KeyfileWriter::create(path).await?;
	for record in &records {
		writer.write_record(record).await?;
	}
	writer.finish().await
}

/// Whether a keyfile is sorted by packed bkey, used by `merkle_to_keylist`
/// to confirm its output (specification §4.2: "Verify the result is
/// sorted").
pub fn is_sorted(records: &[Record]) -> bool {
	records.windows(2).all(|w| w[0].0 <= w[1].0)
}

#[cfg(test)]
mod tests {
	use super::*;
	use mktemp::Temp;

	#[tokio::test]
	async fn write_read_round_trips_and_sort_orders_by_key() {
		let dir = Temp::new_dir().unwrap();
		let path = dir.join("keys.dat");

		let mut writer = KeyfileWriter::create(&path).await.unwrap();
		writer.write_record(&(b"b".to_vec(), [2u8; 32])).await.unwrap();
		writer.write_record(&(b"a".to_vec(), [1u8; 32])).await.unwrap();
		writer.finish().await.unwrap();

		let records = read_all(&path).await.unwrap();
		assert_eq!(records.len(), 2);
		assert!(!is_sorted(&records));

		sort_in_place(&path).await.unwrap();
		let sorted = read_all(&path).await.unwrap();
		assert!(is_sorted(&sorted));
		assert_eq!(sorted[0].0, b"a".to_vec());
		assert_eq!(sorted[1].0, b"b".to_vec());
	}
}
