//! In-crate mocks of the three external collaborator traits (specification
//! §6), used to exercise the exchange engine and Merkle Helper end-to-end
//! without a real hash-tree/vnode/object-store stack. Gated the way
//! production code elsewhere in the pack gates test-only constructors,
//! rather than confined to `#[cfg(test)]` modules, so other crates in this
//! workspace can reuse them under a `testing` feature.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use aae_util::data::Hash;
use aae_util::Error;

use crate::hashtree::{DiffSink, HashTreeService, RemoteCallback};
use crate::objhelper::{ObjectHelper, ReplHelperOutcome};
use crate::types::{Bkey, IndexN, KeyDiff, Partition};
use crate::vnode::{FoldedEntry, VnodeService};

/// A `VnodeService` backed by in-memory maps: one for `fold`'s source data,
/// one for `get`'s `(bucket, key) -> object` lookup.
pub struct MockVnodeService {
	fold_entries: Vec<FoldedEntry>,
	objects: HashMap<(Vec<u8>, Vec<u8>), Vec<u8>>,
	available: bool,
}

impl MockVnodeService {
	pub fn with_entries(entries: Vec<FoldedEntry>) -> Self {
		MockVnodeService {
			fold_entries: entries,
			objects: HashMap::new(),
			available: true,
		}
	}

	pub fn with_object(bucket: &[u8], key: &[u8], object: Vec<u8>) -> Self {
		let mut objects = HashMap::new();
		objects.insert((bucket.to_vec(), key.to_vec()), object);
		MockVnodeService {
			fold_entries: Vec::new(),
			objects,
			available: true,
		}
	}

	pub fn unavailable() -> Self {
		MockVnodeService {
			fold_entries: Vec::new(),
			objects: HashMap::new(),
			available: false,
		}
	}
}

#[async_trait]
impl VnodeService for MockVnodeService {
	async fn fold(&self, _partition: Partition, tx: mpsc::UnboundedSender<FoldedEntry>) -> Result<(), Error> {
		for entry in self.fold_entries.clone() {
			if tx.send(entry).is_err() {
				break;
			}
		}
		Ok(())
	}

	async fn get(&self, bucket: &[u8], key: &[u8]) -> Result<Option<Vec<u8>>, Error> {
		Ok(self.objects.get(&(bucket.to_vec(), key.to_vec())).cloned())
	}

	async fn get_vclocks(&self, bkeys: &[Bkey]) -> Result<Vec<(Bkey, Vec<u8>)>, Error> {
		Ok(bkeys.iter().cloned().map(|b| (b, vec![1])).collect())
	}

	fn responsible_preflists(&self, _partition: Partition) -> Vec<IndexN> {
		vec![IndexN { index: 0, n: 3 }]
	}

	fn is_node_available(&self, _partition: Partition) -> bool {
		self.available
	}
}

/// A `HashTreeService` whose `compare` just replays a fixed script of diffs
/// into the sink — the actual segmented-comparison algorithm is a Non-goal
/// (specification §7), so tests only need to exercise the shape of the
/// interaction, not a real tree walk.
pub struct MockHashTreeService {
	lock_ok: bool,
	update_result: Mutex<HashMap<IndexN, bool>>,
	diffs: Mutex<HashMap<IndexN, Vec<KeyDiff>>>,
	alive_tx: watch::Sender<bool>,
	alive_rx: watch::Receiver<bool>,
}

impl MockHashTreeService {
	pub fn new() -> Self {
		let (alive_tx, alive_rx) = watch::channel(true);
		MockHashTreeService {
			lock_ok: true,
			update_result: Mutex::new(HashMap::new()),
			diffs: Mutex::new(HashMap::new()),
			alive_tx,
			alive_rx,
		}
	}

	pub fn with_lock_failure() -> Self {
		let mut s = Self::new();
		s.lock_ok = false;
		s
	}

	pub fn set_update_result(&self, index_n: IndexN, built: bool) {
		self.update_result.lock().unwrap().insert(index_n, built);
	}

	pub fn set_diffs(&self, index_n: IndexN, diffs: Vec<KeyDiff>) {
		self.diffs.lock().unwrap().insert(index_n, diffs);
	}

	pub fn kill(&self) {
		self.alive_tx.send(false).ok();
	}
}

impl Default for MockHashTreeService {
	fn default() -> Self {
		Self::new()
	}
}

#[async_trait]
impl HashTreeService for MockHashTreeService {
	async fn get_lock(&self, _partition: Partition) -> Result<(), Error> {
		if self.lock_ok {
			Ok(())
		} else {
			Err(Error::Lock(aae_util::error::LockError::new("mock lock denied")))
		}
	}

	async fn update(&self, _partition: Partition, index_n: IndexN) -> Result<bool, Error> {
		Ok(*self
			.update_result
			.lock()
			.unwrap()
			.get(&index_n)
			.unwrap_or(&true))
	}

	async fn compare(
		&self,
		_partition: Partition,
		index_n: IndexN,
		_callback: &mut dyn RemoteCallback,
		sink: &mut dyn DiffSink,
	) -> Result<(), Error> {
		let diffs = self
			.diffs
			.lock()
			.unwrap()
			.get(&index_n)
			.cloned()
			.unwrap_or_default();
		sink.accept(diffs).await
	}

	fn monitor(&self, _partition: Partition) -> watch::Receiver<bool> {
		self.alive_rx.clone()
	}
}

/// An `ObjectHelper` whose `repl_helper_send` outcome is fixed at
/// construction, for tests that need to control replication fan-out
/// (specification §8, scenario 3). `binpack_bkey`/`binunpack_bkey` defer to
/// [`crate::objhelper::DefaultObjectHelper`].
pub struct MockObjectHelper {
	outcome: ReplHelperOutcome,
	inner: crate::objhelper::DefaultObjectHelper,
}

impl MockObjectHelper {
	pub fn always(outcome: ReplHelperOutcome) -> Self {
		MockObjectHelper {
			outcome,
			inner: crate::objhelper::DefaultObjectHelper,
		}
	}
}

#[async_trait]
impl ObjectHelper for MockObjectHelper {
	async fn repl_helper_send(&self, _object: &[u8]) -> Result<ReplHelperOutcome, Error> {
		Ok(self.outcome.clone())
	}

	fn encode_obj_msg(&self, wire_version: &str, object: &[u8]) -> Result<Vec<u8>, Error> {
		self.inner.encode_obj_msg(wire_version, object)
	}

	fn binpack_bkey(&self, bucket: &[u8], key: &[u8]) -> Result<Bkey, Error> {
		self.inner.binpack_bkey(bucket, key)
	}

	fn binunpack_bkey(&self, bkey: &Bkey) -> Result<(Vec<u8>, Vec<u8>), Error> {
		self.inner.binunpack_bkey(bkey)
	}
}

/// A `RemoteCallback` that never gets called — used when a test's
/// `HashTreeService` replays a fixed diff script instead of actually
/// querying buckets/segments.
pub struct NullRemoteCallback;

#[async_trait]
impl RemoteCallback for NullRemoteCallback {
	async fn get_bucket(
		&mut self,
		_level: u32,
		_bucket: u32,
		_index_n: IndexN,
	) -> Result<Vec<(u32, Hash)>, Error> {
		Ok(Vec::new())
	}

	async fn key_hashes(&mut self, _segment: u32, _index_n: IndexN) -> Result<Vec<(Bkey, Hash)>, Error> {
		Ok(Vec::new())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	struct RecordingSink(Vec<KeyDiff>);

	#[async_trait]
	impl DiffSink for RecordingSink {
		async fn accept(&mut self, diffs: Vec<KeyDiff>) -> Result<(), Error> {
			self.0.extend(diffs);
			Ok(())
		}
	}

	#[tokio::test]
	async fn mock_hash_tree_replays_configured_diffs() {
		let index_n = IndexN { index: 0, n: 3 };
		let tree = MockHashTreeService::new();
		tree.set_diffs(
			index_n,
			vec![KeyDiff::Missing(Bkey(b"k".to_vec()))],
		);

		let mut callback = NullRemoteCallback;
		let mut sink = RecordingSink(Vec::new());
		tree.compare(1, index_n, &mut callback, &mut sink)
			.await
			.unwrap();

		assert_eq!(sink.0, vec![KeyDiff::Missing(Bkey(b"k".to_vec()))]);
	}
}
