//! Vnode collaborator (specification §6): the local object store the
//! exchange engine reads from to satisfy a divergence found during
//! KeyExchange, and the folder the Merkle helper streams keys from when it
//! rebuilds a keyfile from live storage.

use async_trait::async_trait;
use tokio::sync::mpsc;

use aae_util::Error;

use crate::types::{Bkey, IndexN, Partition};

/// One `(key, value)` pair observed while folding over a partition's
/// storage, as streamed to [`VnodeService::fold`]'s channel.
pub type FoldedEntry = (Vec<u8>, Vec<u8>);

/// The local object store. `fold` is the only streaming operation: the
/// Merkle helper spawns one folder per `make_merkle`/`make_keylist` run and
/// consumes its channel until the vnode closes it (specification §5).
#[async_trait]
pub trait VnodeService: Send + Sync {
	/// Stream every `(key, value)` pair owned by `partition` into `tx`,
	/// closing it when the fold completes. Errors encountered mid-fold are
	/// surfaced as the function's return value, not through the channel.
	async fn fold(&self, partition: Partition, tx: mpsc::UnboundedSender<FoldedEntry>) -> Result<(), Error>;

	/// Fetch one object by its already-decoded `(bucket, key)` pair.
	/// `Ok(None)` means the key is no longer present locally (the race
	/// described in specification §4.1's diff-accumulation edge cases).
	async fn get(&self, bucket: &[u8], key: &[u8]) -> Result<Option<Vec<u8>>, Error>;

	/// The vector clock attached to each of `bkeys`, for keys the Merkle
	/// Helper's `diff` found with mismatched hashes (specification §4.2).
	/// Opaque: vclock encoding is a Non-goal.
	async fn get_vclocks(&self, bkeys: &[Bkey]) -> Result<Vec<(Bkey, Vec<u8>)>, Error>;

	/// The ordered preflists this node is currently responsible for within
	/// `partition`, computed once at engine start (specification §3).
	fn responsible_preflists(&self, partition: Partition) -> Vec<IndexN>;

	/// Pre-check gating every operation: is the node that owns `partition`
	/// currently reachable? (specification §7, "every operation rejects a
	/// partition whose owner node is not currently reachable").
	fn is_node_available(&self, partition: Partition) -> bool;
}
