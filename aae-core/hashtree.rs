//! Hash-tree collaborator (specification §6): the local Merkle implementation
//! the exchange engine locks, rebuilds and drives a segmented comparison
//! against. Building and diffing the tree itself is explicitly out of scope
//! (§7 Non-goals) — this module only defines the boundary the engine talks
//! to, plus the callback types a comparison run is driven through.

use async_trait::async_trait;
use tokio::sync::watch;

use aae_util::data::Hash;
use aae_util::Error;

use crate::types::{Bkey, IndexN, KeyDiff, Partition};

/// Issued by the comparison worker to pull bucket- and segment-level data
/// from the remote side over the socket it was handed (specification §4.1,
/// "a remote callback that issues `GET_AAE_BUCKET` and `GET_AAE_SEGMENT`
/// requests"). One instance is constructed per key-exchange run.
#[async_trait]
pub trait RemoteCallback: Send {
	/// Bucket-level hashes one level down from `level` in the tree rooted at
	/// `bucket`, for the given preflist.
	async fn get_bucket(
		&mut self,
		level: u32,
		bucket: u32,
		index_n: IndexN,
	) -> Result<Vec<(u32, Hash)>, Error>;

	/// Leaf-level `(key, hash)` pairs for one segment.
	async fn key_hashes(
		&mut self,
		segment: u32,
		index_n: IndexN,
	) -> Result<Vec<(Bkey, Hash)>, Error>;
}

/// Receives batches of [`KeyDiff`] as the comparison walk discovers them and
/// performs the replication accounting described in specification §4.1,
/// "Diff accumulation". Implemented once for production (forwarding
/// `PUT_OBJ` frames over the socket handed to the worker) and once per test
/// scenario.
#[async_trait]
pub trait DiffSink: Send {
	async fn accept(&mut self, diffs: Vec<KeyDiff>) -> Result<(), Error>;
}

/// The external hash-tree process. `get_lock` and `update` are called
/// directly by the engine (Prepare and UpdateTrees); `compare` is handed
/// off, together with the socket, to a spawned comparison worker
/// (specification §4.1, KeyExchange) and is the one operation this module
/// deliberately does not implement the internals of.
#[async_trait]
pub trait HashTreeService: Send + Sync {
	/// Acquire the local tree lock for `partition`. Failure maps to
	/// [`aae_util::error::LockError`].
	async fn get_lock(&self, partition: Partition) -> Result<(), Error>;

	/// Rebuild the tree for one preflist. `Ok(true)` means the tree was
	/// rebuilt (`TreeBuilt`); `Ok(false)` means the local node is no longer
	/// responsible for `index_n` (`not_responsible`).
	async fn update(&self, partition: Partition, index_n: IndexN) -> Result<bool, Error>;

	/// Drive a segmented comparison for one preflist to completion, calling
	/// back into `callback` for remote data and into `sink` for each batch
	/// of diffs found. Building the actual comparison algorithm is a
	/// Non-goal; implementations here only need to be faithful enough to
	/// drive the two callbacks in the right shape.
	async fn compare(
		&self,
		partition: Partition,
		index_n: IndexN,
		callback: &mut dyn RemoteCallback,
		sink: &mut dyn DiffSink,
	) -> Result<(), Error>;

	/// A liveness channel for the tree-service process backing `partition`.
	/// The engine watches this alongside its event channel to satisfy the
	/// "monitor exits mid-update" edge case (specification §4.1): the
	/// channel flips to `false` (or is dropped) when the process backing
	/// the tree goes away.
	fn monitor(&self, partition: Partition) -> watch::Receiver<bool>;
}
