//! The legacy Merkle-file helper (specification §4.2): a one-shot worker
//! that builds and diffs on-disk sorted key/hash files. Grounded on
//! `garage_table::sync`'s root/intermediate/leaf Merkle diff walk for the
//! comparison semantics of `diff`, and on `aae_db::{Db, Tree}` for the
//! external key-ordered map backing `make_merkle`/`merkle_to_keylist`.

pub mod keyfile;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;
use tracing::*;

use aae_util::config::Config;
use aae_util::data::{hash_object, Hash};
use aae_util::Error;

use crate::types::Partition;
use crate::vnode::VnodeService;
use keyfile::{is_sorted, KeyfileWriter, Record};

/// Opaque reference returned immediately by every operation, and echoed back
/// in its terminal event (specification §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OpRef(u64);

fn next_op_ref() -> OpRef {
	static NEXT: AtomicU64 = AtomicU64::new(1);
	OpRef(NEXT.fetch_add(1, Ordering::Relaxed))
}

/// Tallies read errors by reason, reported alongside `diff_done`
/// (specification §4.2).
pub type ErrorHistogram = HashMap<String, u64>;

/// The result of a completed `diff` run.
#[derive(Debug, Clone)]
pub struct DiffReport {
	pub differing: u64,
	pub missing: u64,
	pub remote_reads: u64,
	pub local_reads: u64,
	pub errors: ErrorHistogram,
}

/// One divergent key found by `diff`, posted as it's found rather than
/// batched, matching `merkle_diff(bkey, vclock)` in specification §4.2.
#[derive(Debug, Clone)]
pub struct MerkleDiff {
	pub bkey: Vec<u8>,
	pub vclock: Vec<u8>,
}

/// Terminal events posted back to the owner, one per operation
/// (specification §4.2: "later posts one terminal event").
#[derive(Debug)]
pub enum HelperEvent {
	MerkleBuilt(OpRef),
	KeylistBuilt(OpRef),
	Converted(OpRef),
	MerkleDiffFound(OpRef, MerkleDiff),
	DiffDone(OpRef, DiffReport),
	Failed(OpRef, Error),
}

/// Runs the four Merkle Helper operations. One instance is shared (as an
/// `Arc`) by a fullsync coordinator; each operation spawns its own one-shot
/// task, matching the "created per fullsync operation, single-shot"
/// lifecycle of specification §3.
pub struct MerkleHelper {
	vnode: std::sync::Arc<dyn VnodeService>,
	events: mpsc::UnboundedSender<HelperEvent>,
	config: Config,
}

impl MerkleHelper {
	pub fn new(
		vnode: std::sync::Arc<dyn VnodeService>,
		events: mpsc::UnboundedSender<HelperEvent>,
		config: Config,
	) -> Self {
		MerkleHelper {
			vnode,
			events,
			config,
		}
	}

	fn reject_if_unavailable(&self, partition: Partition) -> Result<(), Error> {
		if !self.vnode.is_node_available(partition) {
			return Err(Error::PeerDown("node_not_available".into()));
		}
		Ok(())
	}

	/// Build (or rebuild) an external Merkle btree from a live fold over
	/// `partition`, buffering `(packed_bkey, hash)` pairs and flushing them
	/// to `db` once the buffer's packed-key bytes plus the 4-byte hash
	/// overhead per pair crosses `merkle_buffer_size` (specification §4.2).
	pub fn make_merkle(&self, partition: Partition, db: aae_db::Db) -> OpRef {
		let op = next_op_ref();
		let buffer_threshold = self.config.merkle_buffer_size;
		self.reject_and_spawn(op, partition, move |vnode, events| async move {
			let tree = db
				.open_tree("merkle")
				.map_err(|e| Error::Helper {
					kind: "merkle_store".into(),
					reason: format!("{}", e).into(),
				})?;

			let (tx, mut rx) = mpsc::unbounded_channel();
			let fold = tokio::spawn(async move { vnode.fold(partition, tx).await });

			let mut buffer: Vec<(Vec<u8>, Hash)> = Vec::new();
			let mut buffered_bytes = 0usize;
			while let Some((k, v)) = rx.recv().await {
				let hash = hash_object(&v);
				buffered_bytes += k.len() + 4;
				buffer.push((k, hash));
				if buffered_bytes >= buffer_threshold {
					flush_merkle_buffer(&tree, &mut buffer)?;
					buffered_bytes = 0;
				}
			}
			flush_merkle_buffer(&tree, &mut buffer)?;

			fold.await
				.map_err(|e| Error::Helper {
					kind: "fold_task".into(),
					reason: format!("{}", e).into(),
				})??;

			events.send(HelperEvent::MerkleBuilt(op)).ok();
			Ok(())
		});
		op
	}

	/// Stream a partition's keys into a fresh, unsorted keylist, then sort
	/// it in place (specification §4.2).
	pub fn make_keylist(&self, partition: Partition, path: PathBuf) -> OpRef {
		let op = next_op_ref();
		let batch_size = self.config.batch_size;
		self.reject_and_spawn(op, partition, move |vnode, events| async move {
			let mut writer = KeyfileWriter::create_with_batch_size(&path, batch_size).await?;
			let (tx, mut rx) = mpsc::unbounded_channel();
			let fold = tokio::spawn(async move { vnode.fold(partition, tx).await });

			while let Some((k, v)) = rx.recv().await {
				writer.write_record(&(k, hash_object(&v))).await?;
			}
			writer.finish().await?;

			fold.await
				.map_err(|e| Error::Helper {
					kind: "fold_task".into(),
					reason: format!("{}", e).into(),
				})??;

			keyfile::sort_in_place(&path).await?;
			events.send(HelperEvent::KeylistBuilt(op)).ok();
			Ok(())
		});
		op
	}

	/// Convert an external Merkle btree into the sorted keylist format
	/// (specification §4.2).
	pub fn merkle_to_keylist(&self, partition: Partition, merkle: aae_db::Tree, keylist: PathBuf) -> OpRef {
		let op = next_op_ref();
		let batch_size = self.config.batch_size;
		self.reject_and_spawn(op, partition, move |_vnode, events| async move {
			let mut writer = KeyfileWriter::create_with_batch_size(&keylist, batch_size).await?;
			let mut records: Vec<Record> = Vec::new();
			for entry in merkle.iter().map_err(|e| Error::Helper {
				kind: "merkle_store".into(),
				reason: format!("{}", e).into(),
			})? {
				let (k, v) = entry.map_err(|e| Error::Helper {
					kind: "merkle_store".into(),
					reason: format!("{}", e).into(),
				})?;
				if v.len() != 32 {
					return Err(Error::Helper {
						kind: "unsorted".into(),
						reason: format!("hash for key has unexpected length {}", v.len()).into(),
					});
				}
				let mut hash = [0u8; 32];
				hash.copy_from_slice(&v);
				records.push((k, hash));
			}

			if !is_sorted(&records) {
				return Err(Error::Helper {
					kind: "unsorted".into(),
					reason: "external map iterated out of key order".into(),
				});
			}

			for record in &records {
				writer.write_record(record).await?;
			}
			writer.finish().await?;

			events.send(HelperEvent::Converted(op)).ok();
			Ok(())
		});
		op
	}

	/// Merge-walk two sorted keyfiles, posting one [`HelperEvent::MerkleDiffFound`]
	/// per divergence found, then [`HelperEvent::DiffDone`] with the tallies
	/// (specification §4.2). Both input files are deleted when the walk
	/// ends, regardless of outcome.
	pub fn diff(&self, partition: Partition, remote: PathBuf, ours: PathBuf) -> OpRef {
		let op = next_op_ref();
		self.reject_and_spawn(op, partition, move |vnode, events| async move {
			let result = run_diff(partition, &remote, &ours, &vnode, &events, op).await;
			tokio::fs::remove_file(&remote).await.ok();
			tokio::fs::remove_file(&ours).await.ok();
			result
		});
		op
	}

	fn reject_and_spawn<F, Fut>(&self, op: OpRef, partition: Partition, body: F)
	where
		F: FnOnce(std::sync::Arc<dyn VnodeService>, mpsc::UnboundedSender<HelperEvent>) -> Fut
			+ Send
			+ 'static,
		Fut: std::future::Future<Output = Result<(), Error>> + Send + 'static,
	{
		if let Err(e) = self.reject_if_unavailable(partition) {
			self.events.send(HelperEvent::Failed(op, e)).ok();
			return;
		}
		let vnode = self.vnode.clone();
		let events = self.events.clone();
		let events_for_err = events.clone();
		tokio::spawn(async move {
			if let Err(e) = body(vnode, events).await {
				events_for_err.send(HelperEvent::Failed(op, e)).ok();
			}
		});
	}
}

/// Inserts every buffered `(packed_bkey, hash)` pair into the external map
/// and empties the buffer, the flush step of `make_merkle`'s buffering
/// (specification §4.2).
fn flush_merkle_buffer(tree: &aae_db::Tree, buffer: &mut Vec<(Vec<u8>, Hash)>) -> Result<(), Error> {
	for (k, hash) in buffer.drain(..) {
		tree.insert(&k, hash).map_err(|e| Error::Helper {
			kind: "merkle_store".into(),
			reason: format!("{}", e).into(),
		})?;
	}
	Ok(())
}

async fn run_diff(
	_partition: Partition,
	remote_path: &Path,
	our_path: &Path,
	vnode: &std::sync::Arc<dyn VnodeService>,
	events: &mpsc::UnboundedSender<HelperEvent>,
	op: OpRef,
) -> Result<(), Error> {
	let remote = keyfile::read_all(remote_path).await?;
	let ours = keyfile::read_all(our_path).await?;

	let mut report = DiffReport {
		differing: 0,
		missing: 0,
		remote_reads: remote.len() as u64,
		local_reads: ours.len() as u64,
		errors: HashMap::new(),
	};

	let mut ri = 0usize;
	let mut li = 0usize;
	while ri < remote.len() {
		let (rk, rh) = &remote[ri];
		match ours.get(li) {
			Some((lk, lh)) if rk == lk => {
				if rh != lh {
					post_diff(vnode, events, op, rk, &mut report).await;
					report.differing += 1;
				}
				ri += 1;
				li += 1;
			}
			Some((lk, _)) if rk < lk => {
				post_diff(vnode, events, op, rk, &mut report).await;
				report.missing += 1;
				ri += 1;
			}
			Some((lk, _)) if rk > lk => {
				// local has a key the remote lacks at this position: possible
				// deletion, skip (specification §4.2 merge-walk table).
				li += 1;
				let _ = lk;
			}
			Some(_) => unreachable!(),
			None => {
				post_diff(vnode, events, op, rk, &mut report).await;
				report.missing += 1;
				ri += 1;
			}
		}
	}

	events.send(HelperEvent::DiffDone(op, report)).ok();
	Ok(())
}

async fn post_diff(
	vnode: &std::sync::Arc<dyn VnodeService>,
	events: &mpsc::UnboundedSender<HelperEvent>,
	op: OpRef,
	bkey: &[u8],
	report: &mut DiffReport,
) {
	let vclock = match vnode
		.get_vclocks(&[crate::types::Bkey(bkey.to_vec())])
		.await
	{
		Ok(mut v) => v.pop().map(|(_, vc)| vc).unwrap_or_default(),
		Err(e) => {
			*report
				.errors
				.entry(e.reason_code().to_string())
				.or_insert(0) += 1;
			Vec::new()
		}
	};
	events
		.send(HelperEvent::MerkleDiffFound(
			op,
			MerkleDiff {
				bkey: bkey.to_vec(),
				vclock,
			},
		))
		.ok();
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::testing::MockVnodeService;
	use mktemp::Temp;
	use std::sync::Arc;

	#[tokio::test]
	async fn make_keylist_produces_a_sorted_file() {
		let dir = Temp::new_dir().unwrap();
		let path = dir.join("keylist.dat");

		let vnode: Arc<dyn VnodeService> = Arc::new(MockVnodeService::with_entries(vec![
			(b"zzz".to_vec(), b"v1".to_vec()),
			(b"aaa".to_vec(), b"v2".to_vec()),
		]));
		let (tx, mut rx) = mpsc::unbounded_channel();
		let helper = MerkleHelper::new(vnode, tx, Config::default());

		let op = helper.make_keylist(1, path.clone());
		let event = rx.recv().await.unwrap();
		match event {
			HelperEvent::KeylistBuilt(got) => assert_eq!(got, op),
			other => panic!("unexpected event: {:?}", other),
		}

		let records = keyfile::read_all(&path).await.unwrap();
		assert!(is_sorted(&records));
		assert_eq!(records.len(), 2);
	}

	#[tokio::test]
	async fn diff_reports_remote_missing_and_differing_keys() {
		let dir = Temp::new_dir().unwrap();
		let remote_path = dir.join("remote.dat");
		let ours_path = dir.join("ours.dat");

		let mut remote = KeyfileWriter::create(&remote_path).await.unwrap();
		remote.write_record(&(b"a".to_vec(), [1u8; 32])).await.unwrap();
		remote.write_record(&(b"b".to_vec(), [2u8; 32])).await.unwrap();
		remote.finish().await.unwrap();

		let mut ours = KeyfileWriter::create(&ours_path).await.unwrap();
		ours.write_record(&(b"b".to_vec(), [9u8; 32])).await.unwrap();
		ours.finish().await.unwrap();

		let vnode: Arc<dyn VnodeService> = Arc::new(MockVnodeService::with_entries(vec![]));
		let (tx, mut rx) = mpsc::unbounded_channel();
		let helper = MerkleHelper::new(vnode, tx, Config::default());

		let op = helper.diff(1, remote_path.clone(), ours_path.clone());

		let mut diffs = Vec::new();
		let report = loop {
			match rx.recv().await.unwrap() {
				HelperEvent::MerkleDiffFound(got, diff) => {
					assert_eq!(got, op);
					diffs.push(diff.bkey);
				}
				HelperEvent::DiffDone(got, report) => {
					assert_eq!(got, op);
					break report;
				}
				other => panic!("unexpected event: {:?}", other),
			}
		};

		assert_eq!(diffs, vec![b"a".to_vec(), b"b".to_vec()]);
		assert_eq!(report.missing, 1);
		assert_eq!(report.differing, 1);
		assert!(!remote_path.exists());
		assert!(!ours_path.exists());
	}

	#[tokio::test]
	async fn merkle_to_keylist_converts_a_sorted_external_map() {
		let dir = Temp::new_dir().unwrap();
		let db_dir = dir.join("db");
		let keylist_path = dir.join("keylist.dat");

		let db = aae_db::sled_adapter::SledDb::new(aae_db::sled_adapter::sled::open(&db_dir).unwrap());
		let tree = db.open_tree("merkle").unwrap();
		tree.insert(b"aaa", [1u8; 32]).unwrap();
		tree.insert(b"bbb", [2u8; 32]).unwrap();

		let vnode: Arc<dyn VnodeService> = Arc::new(MockVnodeService::with_entries(vec![]));
		let (tx, mut rx) = mpsc::unbounded_channel();
		let helper = MerkleHelper::new(vnode, tx, Config::default());

		let op = helper.merkle_to_keylist(1, tree, keylist_path.clone());
		let event = rx.recv().await.unwrap();
		match event {
			HelperEvent::Converted(got) => assert_eq!(got, op),
			other => panic!("unexpected event: {:?}", other),
		}

		let records = keyfile::read_all(&keylist_path).await.unwrap();
		assert_eq!(records.len(), 2);
		assert!(is_sorted(&records));
		assert_eq!(records[0].0, b"aaa".to_vec());
		assert_eq!(records[1].0, b"bbb".to_vec());
	}
}
