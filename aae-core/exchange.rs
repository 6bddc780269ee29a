//! The exchange engine: a per-partition finite state machine that
//! negotiates a lock with a remote sink, drives hash-tree rebuilds, and
//! streams divergent objects (specification §4.1).
//!
//! The original accumulates all of this as ad-hoc process state threaded
//! through message handlers; here the four states (`Prepare`, `UpdateTrees`,
//! `KeyExchange`, `Stopped`) are an explicit enum and the whole thing is
//! driven by a typed `mpsc` channel, per Design Notes §9.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tracing::*;

use aae_rpc::{MessageTag, Socket, TransportOptions};
use aae_util::config::Config;
use aae_util::data::{decode_term, encode_term};
use aae_util::Error;

use crate::hashtree::{DiffSink, HashTreeService, RemoteCallback};
use crate::objhelper::ObjectHelper;
use crate::types::{Bkey, DiffAccumulator, IndexN, KeyDiff, Partition};
use crate::vnode::VnodeService;

/// The four states a session moves through (specification §4.1). `Stopped`
/// is terminal; the engine's run loop exits once it's reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
	Prepare,
	UpdateTrees,
	KeyExchange,
	Stopped,
}

/// Events the engine reacts to. `StartExchange` and `StartKeyExchange` are
/// self-sent to move the loop forward without blocking the state machine on
/// its own continuation; everything else arrives from the comparison
/// worker, the caller, or a liveness monitor.
pub enum EngineEvent {
	StartExchange,
	StartKeyExchange,
	TreeBuilt(Partition, IndexN),
	NotResponsible(Partition, IndexN),
	/// The spawned local tree update task failed outright (as opposed to
	/// reporting `not_responsible`): fatal, since nothing would ever post
	/// the `TreeBuilt` this state is waiting for.
	LocalUpdateFailed(Partition, IndexN, Error),
	/// The comparison worker's handoff request: send it the socket.
	WorkerReady(oneshot::Sender<Socket>),
	/// The comparison worker is done with this `IndexN`: hands the socket
	/// back, along with the accumulated diff count.
	Done(Socket, DiffAccumulator),
	CancelFullsync,
	TreeDown,
	GetStatus(oneshot::Sender<EngineStatus>),
}

/// A snapshot of engine progress, returned to a status query.
#[derive(Debug, Clone)]
pub struct EngineStatus {
	pub partition: Partition,
	pub state: EngineState,
	pub remaining: usize,
}

/// What the engine reports back to whoever started the fullsync once this
/// partition's session ends (specification §4.1 and §7's error table).
#[derive(Debug)]
pub enum FullsyncOutcome {
	Complete { partition: Partition },
	Failed { partition: Partition, reason: Error },
}

/// Drives one partition's exchange against one remote cluster.
pub struct ExchangeEngine {
	partition: Partition,
	remote_cluster: String,
	wire_version: &'static str,
	state: EngineState,
	remaining: VecDeque<IndexN>,
	built: u8,
	socket: Option<Socket>,
	events_tx: mpsc::UnboundedSender<EngineEvent>,
	events_rx: mpsc::UnboundedReceiver<EngineEvent>,
	tree_service: Arc<dyn HashTreeService>,
	vnode: Arc<dyn VnodeService>,
	objhelper: Arc<dyn ObjectHelper>,
	owner: mpsc::UnboundedSender<FullsyncOutcome>,
	tree_monitor: watch::Receiver<bool>,
	state_timeout: Duration,
	/// Set when `CancelFullsync` arrives while the comparison worker holds
	/// the socket (`KeyExchange`'s `WorkerReady`..`Done` window). Honored as
	/// soon as the socket comes back via `Done`, instead of failing the
	/// handoff the worker is mid-flight on.
	cancel_pending: bool,
}

impl ExchangeEngine {
	/// Build a new session. `index_ns` is the full, already-ordered list of
	/// preflists this partition will walk (specification §3); `socket` is
	/// the already-connected, already-owned transport to the remote sink.
	#[allow(clippy::too_many_arguments)]
	pub fn new(
		partition: Partition,
		remote_cluster: String,
		wire_version: &'static str,
		index_ns: Vec<IndexN>,
		socket: Socket,
		tree_service: Arc<dyn HashTreeService>,
		vnode: Arc<dyn VnodeService>,
		objhelper: Arc<dyn ObjectHelper>,
		owner: mpsc::UnboundedSender<FullsyncOutcome>,
		config: Config,
	) -> (Self, mpsc::UnboundedSender<EngineEvent>) {
		let (events_tx, events_rx) = mpsc::unbounded_channel();
		let tree_monitor = tree_service.monitor(partition);
		let engine = ExchangeEngine {
			partition,
			remote_cluster,
			wire_version,
			state: EngineState::Prepare,
			remaining: index_ns.into(),
			built: 0,
			socket: Some(socket),
			events_tx: events_tx.clone(),
			events_rx,
			tree_service,
			vnode,
			objhelper,
			owner,
			tree_monitor,
			state_timeout: Duration::from_millis(config.anti_entropy_timeout_ms),
			cancel_pending: false,
		};
		(engine, events_tx)
	}

	pub fn status(&self) -> EngineStatus {
		EngineStatus {
			partition: self.partition,
			state: self.state,
			remaining: self.remaining.len(),
		}
	}

	/// Run the state machine to completion. Consumes `self`: a session is
	/// one-shot, matching specification §4.1 ("Stopped" is terminal).
	pub async fn run(mut self) {
		if !self.vnode.is_node_available(self.partition) {
			warn!(
				"partition {} owner unreachable, not starting fullsync against {}",
				self.partition, self.remote_cluster
			);
			self.owner
				.send(FullsyncOutcome::Failed {
					partition: self.partition,
					reason: Error::PeerDown("owner node unreachable".into()),
				})
				.ok();
			return;
		}

		self.events_tx.send(EngineEvent::StartExchange).ok();

		while self.state != EngineState::Stopped {
			tokio::select! {
				event = tokio::time::timeout(self.state_timeout, self.events_rx.recv()) => {
					let event = match event {
						Ok(Some(e)) => e,
						Ok(None) => break,
						Err(_) => {
							let state = self.state;
							self.fail(Error::PeerDown(format!(
								"timed out waiting for a transition out of {:?}",
								state
							).into())).await;
							break;
						}
					};
					if let Err(e) = self.handle_event(event).await {
						self.fail(e).await;
						break;
					}
				}
				changed = self.tree_monitor.changed(), if self.state != EngineState::KeyExchange => {
					if changed.is_err() || !*self.tree_monitor.borrow() {
						self.fail(Error::PeerDown("tree service process exited".into())).await;
						break;
					}
				}
			}
		}
	}

	async fn fail(&mut self, reason: Error) {
		error!(
			"fullsync partition {} against {} failed: {}",
			self.partition, self.remote_cluster, reason
		);
		if let Some(socket) = self.socket.as_mut() {
			socket.cast(MessageTag::Complete, Vec::new()).await.ok();
		}
		self.owner
			.send(FullsyncOutcome::Failed {
				partition: self.partition,
				reason,
			})
			.ok();
		self.state = EngineState::Stopped;
	}

	/// Sends COMPLETE if the engine currently owns the socket. During
	/// `KeyExchange`'s `WorkerReady`..`Done` window the socket is held by
	/// the comparison worker, so there is nothing to send on yet; returns
	/// `false` in that case so the caller can defer instead.
	async fn try_send_complete(&mut self) -> bool {
		match self.socket.as_mut() {
			Some(socket) => {
				socket.cast(MessageTag::Complete, Vec::new()).await.ok();
				true
			}
			None => false,
		}
	}

	async fn send_complete(&mut self) -> Result<(), Error> {
		let socket = self
			.socket
			.as_mut()
			.expect("engine holds the socket outside of KeyExchange");
		socket.cast(MessageTag::Complete, Vec::new()).await
	}

	async fn handle_event(&mut self, event: EngineEvent) -> Result<(), Error> {
		match event {
			EngineEvent::CancelFullsync => {
				if self.try_send_complete().await {
					self.owner
						.send(FullsyncOutcome::Failed {
							partition: self.partition,
							reason: Error::Cancelled,
						})
						.ok();
					self.state = EngineState::Stopped;
				} else {
					// Comparison worker holds the socket; honor the
					// cancellation once it hands it back via `Done`.
					self.cancel_pending = true;
				}
				return Ok(());
			}
			EngineEvent::GetStatus(reply) => {
				reply.send(self.status()).ok();
				return Ok(());
			}
			EngineEvent::TreeDown => {
				return Err(Error::PeerDown("tree service process exited".into()));
			}
			_ => {}
		}

		// The `select!` in `run` only polls the monitor between events, so a
		// death that lands while an event is already queued could otherwise
		// race with it. Re-checking here at the top of every dispatch makes
		// the "tree dies between Prepare and UpdateTrees" edge case
		// deterministic instead of depending on `select!`'s scheduling.
		if self.state != EngineState::KeyExchange {
			self.check_alive()?;
		}

		match self.state {
			EngineState::Prepare => self.handle_prepare(event).await,
			EngineState::UpdateTrees => self.handle_update_trees(event).await,
			EngineState::KeyExchange => self.handle_key_exchange(event).await,
			EngineState::Stopped => Ok(()),
		}
	}

	fn check_alive(&self) -> Result<(), Error> {
		if *self.tree_monitor.borrow() {
			Ok(())
		} else {
			Err(Error::PeerDown("tree service process exited".into()))
		}
	}

	async fn handle_prepare(&mut self, event: EngineEvent) -> Result<(), Error> {
		if !matches!(event, EngineEvent::StartExchange) {
			return Ok(());
		}

		self.tree_service
			.get_lock(self.partition)
			.await
			.map_err(|_| {
				Error::Lock(aae_util::error::LockError::new(format!(
					"local lock unavailable for partition {}",
					self.partition
				)))
			})?;

		let timeout = self.state_timeout;
		let socket = self.socket.as_mut().expect("engine owns socket in Prepare");
		socket.configure(TransportOptions::default())?;
		call_with_timeout(
			timeout,
			socket,
			MessageTag::Init,
			encode_term(&self.partition)?,
		)
		.await?;
		let reply = call_with_timeout(timeout, socket, MessageTag::LockTree, Vec::new()).await?;
		let accepted: bool = decode_term(&reply)?;
		if !accepted {
			self.send_complete().await.ok();
			return Err(Error::Lock(aae_util::error::LockError::new(
				"remote rejected LOCK_TREE",
			)));
		}

		info!(
			"partition {} locked against {}, entering UpdateTrees",
			self.partition, self.remote_cluster
		);
		self.built = 0;
		self.state = EngineState::UpdateTrees;
		self.events_tx.send(EngineEvent::StartExchange).ok();
		Ok(())
	}

	async fn handle_update_trees(&mut self, event: EngineEvent) -> Result<(), Error> {
		match event {
			EngineEvent::StartExchange => {
				let head = match self.remaining.front().copied() {
					Some(h) => h,
					None => {
						self.send_complete().await.ok();
						self.owner
							.send(FullsyncOutcome::Complete {
								partition: self.partition,
							})
							.ok();
						self.state = EngineState::Stopped;
						return Ok(());
					}
				};

				let tree_service = self.tree_service.clone();
				let partition = self.partition;
				let self_tx = self.events_tx.clone();
				tokio::spawn(async move {
					match tree_service.update(partition, head).await {
						Ok(true) => {
							self_tx.send(EngineEvent::TreeBuilt(partition, head)).ok();
						}
						Ok(false) => {
							self_tx
								.send(EngineEvent::NotResponsible(partition, head))
								.ok();
						}
						Err(e) => {
							self_tx
								.send(EngineEvent::LocalUpdateFailed(partition, head, e))
								.ok();
						}
					}
				});

				let timeout = self.state_timeout;
				let socket = self
					.socket
					.as_mut()
					.expect("engine owns socket in UpdateTrees");
				let reply = call_with_timeout(
					timeout,
					socket,
					MessageTag::UpdateTree,
					encode_term(&head)?,
				)
				.await?;
				let remote_built: bool = decode_term(&reply)?;
				if !remote_built {
					self.send_complete().await.ok();
					return Err(Error::NotResponsible {
						partition: self.partition,
						index_n: (head.index, head.n),
					});
				}
				self.built += 1;
				if self.built >= 2 {
					self.enter_key_exchange();
				}
				Ok(())
			}
			EngineEvent::TreeBuilt(p, idx) if self.is_current(p, idx) => {
				self.built += 1;
				if self.built >= 2 {
					self.enter_key_exchange();
				}
				Ok(())
			}
			EngineEvent::NotResponsible(p, idx) if self.is_current(p, idx) => {
				self.send_complete().await.ok();
				Err(Error::NotResponsible {
					partition: p,
					index_n: (idx.index, idx.n),
				})
			}
			EngineEvent::LocalUpdateFailed(p, idx, e) if self.is_current(p, idx) => {
				self.send_complete().await.ok();
				Err(Error::Helper {
					kind: "local_tree_update".into(),
					reason: format!("{}", e).into(),
				})
			}
			_ => Ok(()),
		}
	}

	fn is_current(&self, partition: Partition, index_n: IndexN) -> bool {
		partition == self.partition && self.remaining.front() == Some(&index_n)
	}

	fn enter_key_exchange(&mut self) {
		self.built = 0;
		self.state = EngineState::KeyExchange;
		self.events_tx.send(EngineEvent::StartKeyExchange).ok();
	}

	/// Only two message kinds advance this state: the worker's handoff
	/// request and its completion. Everything else arriving here is stale
	/// (a late `TreeBuilt`/`NotResponsible` from the previous `IndexN`) and
	/// is dropped, matching the "tight selective receive" in specification
	/// §4.1.
	async fn handle_key_exchange(&mut self, event: EngineEvent) -> Result<(), Error> {
		match event {
			EngineEvent::StartKeyExchange => {
				let head = *self
					.remaining
					.front()
					.expect("KeyExchange only entered with a current IndexN");
				let tree_service = self.tree_service.clone();
				let vnode = self.vnode.clone();
				let objhelper = self.objhelper.clone();
				let partition = self.partition;
				let wire_version = self.wire_version;
				let self_tx = self.events_tx.clone();
				tokio::spawn(run_comparison_worker(
					partition,
					head,
					tree_service,
					vnode,
					objhelper,
					wire_version,
					self_tx,
				));
				Ok(())
			}
			EngineEvent::WorkerReady(reply) => {
				let socket = self
					.socket
					.take()
					.expect("engine holds the socket until handoff");
				reply
					.send(socket)
					.map_err(|_| Error::Transport("comparison worker dropped before handoff".into()))?;
				Ok(())
			}
			EngineEvent::Done(socket, acc) => {
				self.socket = Some(socket);
				if self.cancel_pending {
					self.send_complete().await.ok();
					self.owner
						.send(FullsyncOutcome::Failed {
							partition: self.partition,
							reason: Error::Cancelled,
						})
						.ok();
					self.state = EngineState::Stopped;
					return Ok(());
				}
				let head = self.remaining.pop_front();
				info!(
					"partition {} indexn {:?} repaired {} keys",
					self.partition,
					head,
					acc.count()
				);
				self.built = 0;
				self.state = EngineState::UpdateTrees;
				self.events_tx.send(EngineEvent::StartExchange).ok();
				Ok(())
			}
			_ => Ok(()),
		}
	}
}

/// Wraps a synchronous request/reply round-trip in the configured per-state
/// timeout (specification §6's `anti_entropy_timeout_ms`), so a remote that
/// stops replying mid-exchange fails the session instead of hanging it.
async fn call_with_timeout(
	timeout: Duration,
	socket: &mut Socket,
	tag: MessageTag,
	payload: Vec<u8>,
) -> Result<Vec<u8>, Error> {
	match tokio::time::timeout(timeout, socket.call(tag, payload)).await {
		Ok(result) => result,
		Err(_) => Err(Error::Transport(
			format!("timed out waiting for a reply to {:?}", tag).into(),
		)),
	}
}

/// Runs for the lifetime of one `IndexN`'s comparison. Requests the socket
/// from the engine, drives `HashTreeService::compare` against it, and hands
/// the socket back along with the accumulated diff count (specification
/// §4.1, steps 2-5).
async fn run_comparison_worker(
	partition: Partition,
	index_n: IndexN,
	tree_service: Arc<dyn HashTreeService>,
	vnode: Arc<dyn VnodeService>,
	objhelper: Arc<dyn ObjectHelper>,
	wire_version: &'static str,
	engine: mpsc::UnboundedSender<EngineEvent>,
) {
	let (given_tx, given_rx) = oneshot::channel();
	if engine.send(EngineEvent::WorkerReady(given_tx)).is_err() {
		return;
	}
	let socket = match given_rx.await {
		Ok(s) => s,
		Err(_) => return,
	};
	let socket = Arc::new(Mutex::new(socket));

	let mut callback = SocketRemoteCallback {
		socket: socket.clone(),
	};
	let mut sink = ReplicatingDiffSink {
		socket: socket.clone(),
		vnode,
		objhelper,
		wire_version,
		accumulator: DiffAccumulator::Empty,
	};

	if let Err(e) = tree_service
		.compare(partition, index_n, &mut callback, &mut sink)
		.await
	{
		warn!(
			"comparison for partition {} indexn {:?} ended early: {}",
			partition, index_n, e
		);
	}

	let acc = sink.accumulator;
	let socket = Arc::try_unwrap(socket)
		.unwrap_or_else(|_| panic!("comparison worker is the sole socket owner at handback"))
		.into_inner();
	engine.send(EngineEvent::Done(socket, acc)).ok();
}

/// Issues `GET_AAE_BUCKET`/`GET_AAE_SEGMENT` over the socket handed to this
/// worker (specification §4.1).
struct SocketRemoteCallback {
	socket: Arc<Mutex<Socket>>,
}

#[async_trait::async_trait]
impl RemoteCallback for SocketRemoteCallback {
	async fn get_bucket(
		&mut self,
		level: u32,
		bucket: u32,
		index_n: IndexN,
	) -> Result<Vec<(u32, aae_util::data::Hash)>, Error> {
		let payload = encode_term(&(level, bucket, index_n))?;
		let mut socket = self.socket.lock().await;
		let reply = socket.call(MessageTag::GetAaeBucket, payload).await?;
		decode_term(&reply)
	}

	async fn key_hashes(
		&mut self,
		segment: u32,
		index_n: IndexN,
	) -> Result<Vec<(Bkey, aae_util::data::Hash)>, Error> {
		let payload = encode_term(&(segment, index_n))?;
		let mut socket = self.socket.lock().await;
		let reply = socket.call(MessageTag::GetAaeSegment, payload).await?;
		decode_term(&reply)
	}
}

/// Replicates every divergent key over the worker's socket and folds the
/// replicated count into a [`DiffAccumulator`] (specification §4.1, "Diff
/// accumulation").
struct ReplicatingDiffSink {
	socket: Arc<Mutex<Socket>>,
	vnode: Arc<dyn VnodeService>,
	objhelper: Arc<dyn ObjectHelper>,
	wire_version: &'static str,
	accumulator: DiffAccumulator,
}

#[async_trait::async_trait]
impl DiffSink for ReplicatingDiffSink {
	async fn accept(&mut self, diffs: Vec<KeyDiff>) -> Result<(), Error> {
		for diff in diffs {
			let sent = match diff {
				KeyDiff::Missing(bkey) | KeyDiff::Different(bkey) => self.replicate(&bkey).await?,
				KeyDiff::RemoteMissing(_) => 0,
			};
			self.accumulator = std::mem::replace(&mut self.accumulator, DiffAccumulator::Empty).add(sent);
		}
		Ok(())
	}
}

impl ReplicatingDiffSink {
	async fn replicate(&mut self, bkey: &Bkey) -> Result<u64, Error> {
		let (bucket, key) = self.objhelper.binunpack_bkey(bkey)?;
		let object = match self.vnode.get(&bucket, &key).await {
			Ok(Some(object)) => object,
			Ok(None) => {
				warn!("key disappeared before replication, skipping");
				return Ok(0);
			}
			Err(e) => {
				warn!("object fetch failed, skipping: {}", e);
				return Ok(0);
			}
		};

		match self.objhelper.repl_helper_send(&object).await? {
			crate::objhelper::ReplHelperOutcome::Cancel => Ok(0),
			crate::objhelper::ReplHelperOutcome::Objects(supplementary) => {
				let mut socket = self.socket.lock().await;
				let mut sent = 0u64;
				for o in &supplementary {
					let payload = self.objhelper.encode_obj_msg(self.wire_version, o)?;
					socket.cast(MessageTag::PutObj, payload).await?;
					sent += 1;
				}
				let payload = self.objhelper.encode_obj_msg(self.wire_version, &object)?;
				socket.cast(MessageTag::PutObj, payload).await?;
				sent += 1;
				Ok(sent)
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use tokio::net::{TcpListener, TcpStream};

	use crate::objhelper::{DefaultObjectHelper, ObjectHelper, ReplHelperOutcome};
	use crate::testing::{MockHashTreeService, MockObjectHelper, MockVnodeService};

	async fn tcp_pair() -> (Socket, Socket) {
		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap();
		let connect = TcpStream::connect(addr);
		let (accept, connect) = tokio::join!(listener.accept(), connect);
		let (accepted, _) = accept.unwrap();
		(Socket::new(accepted), Socket::new(connect.unwrap()))
	}

	fn sample_index_n() -> IndexN {
		IndexN { index: 0, n: 3 }
	}

	/// Drives the engine's socket through Prepare + the first UpdateTrees
	/// round-trip, then hands control to `after` for whatever the scenario
	/// needs next on the fake-remote side. Returns the fake-remote socket.
	async fn drive_prepare_and_update(remote: &mut Socket, update_tree_reply: bool) {
		let init = remote.recv().await.unwrap();
		assert_eq!(init.tag, MessageTag::Init);
		remote.reply(encode_term(&true).unwrap()).await.unwrap();

		let lock = remote.recv().await.unwrap();
		assert_eq!(lock.tag, MessageTag::LockTree);
		remote.reply(encode_term(&true).unwrap()).await.unwrap();

		let update = remote.recv().await.unwrap();
		assert_eq!(update.tag, MessageTag::UpdateTree);
		remote
			.reply(encode_term(&update_tree_reply).unwrap())
			.await
			.unwrap();
	}

	#[tokio::test]
	async fn empty_diff_completes_with_no_put_obj_frames() {
		let (engine_socket, mut remote) = tcp_pair().await;
		let index_n = sample_index_n();

		let tree = Arc::new(MockHashTreeService::new());
		let vnode = Arc::new(MockVnodeService::with_entries(vec![]));
		let objhelper = Arc::new(DefaultObjectHelper);
		let (owner_tx, mut owner_rx) = mpsc::unbounded_channel();

		let (engine, _events_tx) = ExchangeEngine::new(
			1,
			"remote-cluster".to_string(),
			"w1",
			vec![index_n],
			engine_socket,
			tree,
			vnode,
			objhelper,
			owner_tx,
			Config::default(),
		);
		let run = tokio::spawn(engine.run());

		drive_prepare_and_update(&mut remote, true).await;
		let complete = remote.recv().await.unwrap();
		assert_eq!(complete.tag, MessageTag::Complete);

		run.await.unwrap();
		match owner_rx.recv().await.unwrap() {
			FullsyncOutcome::Complete { partition } => assert_eq!(partition, 1),
			other => panic!("unexpected outcome: {:?}", other),
		}
	}

	#[tokio::test]
	async fn single_remote_missing_key_sends_one_put_obj() {
		let (engine_socket, mut remote) = tcp_pair().await;
		let index_n = sample_index_n();
		let bkey = DefaultObjectHelper.binpack_bkey(b"b", b"k").unwrap();

		let tree = Arc::new(MockHashTreeService::new());
		tree.set_diffs(index_n, vec![KeyDiff::Missing(bkey)]);
		let vnode = Arc::new(MockVnodeService::with_object(b"b", b"k", b"object-bytes".to_vec()));
		let objhelper = Arc::new(DefaultObjectHelper);
		let (owner_tx, mut owner_rx) = mpsc::unbounded_channel();

		let (engine, _events_tx) = ExchangeEngine::new(
			1,
			"remote-cluster".to_string(),
			"w1",
			vec![index_n],
			engine_socket,
			tree,
			vnode,
			objhelper,
			owner_tx,
			Config::default(),
		);
		let run = tokio::spawn(engine.run());

		drive_prepare_and_update(&mut remote, true).await;

		let put_obj = remote.recv().await.unwrap();
		assert_eq!(put_obj.tag, MessageTag::PutObj);

		let complete = remote.recv().await.unwrap();
		assert_eq!(complete.tag, MessageTag::Complete);

		run.await.unwrap();
		match owner_rx.recv().await.unwrap() {
			FullsyncOutcome::Complete { .. } => {}
			other => panic!("unexpected outcome: {:?}", other),
		}
	}

	#[tokio::test]
	async fn supplementary_objects_are_sent_before_the_primary() {
		let (engine_socket, mut remote) = tcp_pair().await;
		let index_n = sample_index_n();
		let bkey = DefaultObjectHelper.binpack_bkey(b"b", b"k").unwrap();

		let tree = Arc::new(MockHashTreeService::new());
		tree.set_diffs(index_n, vec![KeyDiff::Different(bkey)]);
		let vnode = Arc::new(MockVnodeService::with_object(b"b", b"k", b"O".to_vec()));
		let objhelper = Arc::new(MockObjectHelper::always(ReplHelperOutcome::Objects(vec![
			b"O1".to_vec(),
			b"O2".to_vec(),
		])));
		let (owner_tx, _owner_rx) = mpsc::unbounded_channel();

		let (engine, _events_tx) = ExchangeEngine::new(
			1,
			"remote-cluster".to_string(),
			"w1",
			vec![index_n],
			engine_socket,
			tree,
			vnode,
			objhelper,
			owner_tx,
			Config::default(),
		);
		let run = tokio::spawn(engine.run());

		drive_prepare_and_update(&mut remote, true).await;

		let mut received = Vec::new();
		for _ in 0..3 {
			let frame = remote.recv().await.unwrap();
			assert_eq!(frame.tag, MessageTag::PutObj);
			let (_wire, object): (String, serde_bytes::ByteBuf) = decode_term(&frame.payload).unwrap();
			received.push(object.into_vec());
		}
		assert_eq!(received, vec![b"O1".to_vec(), b"O2".to_vec(), b"O".to_vec()]);

		let complete = remote.recv().await.unwrap();
		assert_eq!(complete.tag, MessageTag::Complete);
		run.await.unwrap();
	}

	#[tokio::test]
	async fn not_responsible_stops_the_engine_with_that_reason() {
		let (engine_socket, mut remote) = tcp_pair().await;
		let index_n = sample_index_n();

		let tree = Arc::new(MockHashTreeService::new());
		let vnode = Arc::new(MockVnodeService::with_entries(vec![]));
		let objhelper = Arc::new(DefaultObjectHelper);
		let (owner_tx, mut owner_rx) = mpsc::unbounded_channel();

		let (engine, _events_tx) = ExchangeEngine::new(
			1,
			"remote-cluster".to_string(),
			"w1",
			vec![index_n],
			engine_socket,
			tree,
			vnode,
			objhelper,
			owner_tx,
			Config::default(),
		);
		let run = tokio::spawn(engine.run());

		drive_prepare_and_update(&mut remote, false).await;
		let complete = remote.recv().await.unwrap();
		assert_eq!(complete.tag, MessageTag::Complete);

		run.await.unwrap();
		match owner_rx.recv().await.unwrap() {
			FullsyncOutcome::Failed { reason, .. } => {
				assert_eq!(reason.reason_code(), "not_responsible");
			}
			other => panic!("unexpected outcome: {:?}", other),
		}
	}

	#[tokio::test]
	async fn cancellation_mid_update_stops_normally_with_no_put_obj() {
		let (engine_socket, mut remote) = tcp_pair().await;
		let index_n = sample_index_n();

		let tree = Arc::new(MockHashTreeService::new());
		let vnode = Arc::new(MockVnodeService::with_entries(vec![]));
		let objhelper = Arc::new(DefaultObjectHelper);
		let (owner_tx, mut owner_rx) = mpsc::unbounded_channel();

		let (engine, events_tx) = ExchangeEngine::new(
			1,
			"remote-cluster".to_string(),
			"w1",
			vec![index_n],
			engine_socket,
			tree,
			vnode,
			objhelper,
			owner_tx,
			Config::default(),
		);
		let run = tokio::spawn(engine.run());

		let init = remote.recv().await.unwrap();
		assert_eq!(init.tag, MessageTag::Init);
		remote.reply(encode_term(&true).unwrap()).await.unwrap();
		let lock = remote.recv().await.unwrap();
		assert_eq!(lock.tag, MessageTag::LockTree);
		remote.reply(encode_term(&true).unwrap()).await.unwrap();

		events_tx.send(EngineEvent::CancelFullsync).ok();

		let complete = remote.recv().await.unwrap();
		assert_eq!(complete.tag, MessageTag::Complete);

		run.await.unwrap();
		match owner_rx.recv().await.unwrap() {
			FullsyncOutcome::Failed { reason, .. } => {
				assert_eq!(reason.reason_code(), "cancelled");
			}
			other => panic!("unexpected outcome: {:?}", other),
		}
	}

	#[tokio::test]
	async fn tree_process_death_between_prepare_and_update_trees() {
		let (engine_socket, mut remote) = tcp_pair().await;
		let index_n = sample_index_n();

		let tree = Arc::new(MockHashTreeService::new());
		let vnode = Arc::new(MockVnodeService::with_entries(vec![]));
		let objhelper = Arc::new(DefaultObjectHelper);
		let (owner_tx, mut owner_rx) = mpsc::unbounded_channel();

		let (engine, _events_tx) = ExchangeEngine::new(
			1,
			"remote-cluster".to_string(),
			"w1",
			vec![index_n],
			engine_socket,
			tree.clone(),
			vnode,
			objhelper,
			owner_tx,
			Config::default(),
		);
		let run = tokio::spawn(engine.run());

		let init = remote.recv().await.unwrap();
		assert_eq!(init.tag, MessageTag::Init);
		remote.reply(encode_term(&true).unwrap()).await.unwrap();
		let lock = remote.recv().await.unwrap();
		assert_eq!(lock.tag, MessageTag::LockTree);
		remote.reply(encode_term(&true).unwrap()).await.unwrap();

		// Prepare is done and UpdateTrees's entry event is already queued;
		// kill the tree now so the liveness check at the top of the next
		// dispatch catches it deterministically.
		tree.kill();

		let complete = remote.recv().await.unwrap();
		assert_eq!(complete.tag, MessageTag::Complete);

		run.await.unwrap();
		match owner_rx.recv().await.unwrap() {
			FullsyncOutcome::Failed { reason, .. } => {
				assert_eq!(reason.reason_code(), "something_went_down");
			}
			other => panic!("unexpected outcome: {:?}", other),
		}
	}
}
