//! Cascade Topology (specification §4.3): an in-memory directed graph of
//! cluster-to-cluster replication relationships, with tie-broken
//! shortest-path next-hop selection.
//!
//! Grounded on the pack's `HashMap<K, HashSet<K>>` adjacency-list idiom for
//! directed graphs and BFS shortest-path; no retrieved teacher file
//! implements a tie-broken next-hop selector like `choose_nexts`, so that
//! algorithm is built directly from specification §4.3's rules (see
//! DESIGN.md). Per Design Notes §9 ("global mutable graph ... rewrite as a
//! shared structure behind a mutex, or as a copy-on-write snapshot"),
//! queries here return owned snapshots rather than a live, racy handle.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

/// An opaque, totally-ordered cluster identifier.
pub type ClusterName = String;

/// A mutable directed graph of cascade relationships. Not `Sync` by itself;
/// callers that need concurrent access wrap it behind a `Mutex` or an actor
/// task, per Design Notes §9.
#[derive(Debug, Default, Clone)]
pub struct Graph {
	out_edges: HashMap<ClusterName, HashSet<ClusterName>>,
}

impl Graph {
	pub fn new() -> Self {
		Graph::default()
	}

	/// Add a vertex with no edges, if it doesn't already exist.
	pub fn add_vertex(&mut self, cluster: &str) {
		self.out_edges.entry(cluster.to_string()).or_default();
	}

	/// Remove a vertex and every edge incident to it, in either direction.
	pub fn drop_vertex(&mut self, cluster: &str) {
		self.out_edges.remove(cluster);
		for sinks in self.out_edges.values_mut() {
			sinks.remove(cluster);
		}
	}

	/// Add an edge `source -> sink`, creating either endpoint if absent.
	pub fn add_edge(&mut self, source: &str, sink: &str) {
		self.out_edges.entry(sink.to_string()).or_default();
		self.out_edges
			.entry(source.to_string())
			.or_default()
			.insert(sink.to_string());
	}

	pub fn drop_edge(&mut self, source: &str, sink: &str) {
		if let Some(sinks) = self.out_edges.get_mut(source) {
			sinks.remove(sink);
		}
	}

	/// Remove every edge pointing at `sink`.
	pub fn drop_out_edges(&mut self, sink: &str) {
		for sinks in self.out_edges.values_mut() {
			sinks.remove(sink);
		}
	}

	/// Every vertex in the graph.
	pub fn clusters(&self) -> BTreeSet<ClusterName> {
		self.out_edges.keys().cloned().collect()
	}

	/// An ordered mapping from source to its sorted sink set.
	pub fn cascades(&self) -> HashMap<ClusterName, BTreeSet<ClusterName>> {
		self.out_edges
			.iter()
			.map(|(source, sinks)| (source.clone(), sinks.iter().cloned().collect()))
			.collect()
	}

	fn out_neighbours(&self, cluster: &str) -> BTreeSet<ClusterName> {
		self.out_edges
			.get(cluster)
			.map(|s| s.iter().cloned().collect())
			.unwrap_or_default()
	}

	fn in_neighbours(&self, cluster: &str) -> BTreeSet<ClusterName> {
		self.out_edges
			.iter()
			.filter(|(_, sinks)| sinks.contains(cluster))
			.map(|(source, _)| source.clone())
			.collect()
	}

	/// Shortest path from `from` to `to`, by number of edges, or `None` if
	/// unreachable. `from == to` yields the single-vertex path.
	pub fn path(&self, from: &str, to: &str) -> Option<Vec<ClusterName>> {
		if from == to {
			return Some(vec![from.to_string()]);
		}
		let mut visited: HashSet<ClusterName> = HashSet::new();
		let mut queue: VecDeque<ClusterName> = VecDeque::new();
		let mut parent: HashMap<ClusterName, ClusterName> = HashMap::new();

		visited.insert(from.to_string());
		queue.push_back(from.to_string());

		while let Some(node) = queue.pop_front() {
			for next in self.out_neighbours(&node) {
				if visited.insert(next.clone()) {
					parent.insert(next.clone(), node.clone());
					if next == to {
						let mut path = vec![next.clone()];
						let mut cur = next;
						while let Some(p) = parent.get(&cur) {
							path.push(p.clone());
							cur = p.clone();
						}
						path.reverse();
						return Some(path);
					}
					queue.push_back(next);
				}
			}
		}
		None
	}

	/// Shortest-path distance (edge count) from `from` to `to`, or `None` if
	/// unreachable.
	fn distance(&self, from: &str, to: &str) -> Option<usize> {
		self.path(from, to).map(|p| p.len() - 1)
	}

	/// Valid next hops for a message that started its cascade at `started`
	/// and has reached `current` (specification §4.3).
	pub fn choose_nexts(&self, started: &str, current: &str) -> BTreeSet<ClusterName> {
		let candidates = self.out_neighbours(current);

		if started == current {
			return candidates;
		}

		let h = match self.distance(started, current) {
			Some(h) => h,
			None => return BTreeSet::new(),
		};

		candidates
			.into_iter()
			.filter(|n| n != started)
			.filter(|n| self.keep_candidate(started, current, n, h))
			.collect()
	}

	fn keep_candidate(&self, started: &str, current: &str, n: &str, h: usize) -> bool {
		for m in self.in_neighbours(n) {
			if m == current {
				continue;
			}
			if m == started {
				return false;
			}
			let q = match self.distance(started, &m) {
				Some(q) => q,
				None => continue,
			};
			if q < h {
				return false;
			}
			if q == h && m.as_str() < current {
				return false;
			}
		}
		true
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn choose_nexts_at_origin_is_every_out_neighbour() {
		let mut g = Graph::new();
		g.add_edge("A", "B");
		g.add_edge("A", "C");
		assert_eq!(
			g.choose_nexts("A", "A"),
			["B", "C"].iter().map(|s| s.to_string()).collect()
		);
	}

	#[test]
	fn simple_chain_forwards_to_the_next_hop() {
		let mut g = Graph::new();
		g.add_edge("A", "B");
		g.add_edge("B", "C");
		assert_eq!(
			g.choose_nexts("A", "B"),
			["C"].iter().map(|s| s.to_string()).collect::<BTreeSet<_>>()
		);
		assert_eq!(
			g.path("A", "C"),
			Some(vec!["A".to_string(), "B".to_string(), "C".to_string()])
		);
	}

	#[test]
	fn origin_direct_edge_wins_over_relay() {
		let mut g = Graph::new();
		g.add_edge("A", "B");
		g.add_edge("A", "C");
		g.add_edge("B", "C");
		assert!(g.choose_nexts("A", "B").is_empty());
	}

	#[test]
	fn add_edge_creates_absent_endpoints() {
		let mut g = Graph::new();
		g.add_edge("X", "Y");
		assert_eq!(
			g.clusters(),
			["X", "Y"].iter().map(|s| s.to_string()).collect()
		);
	}

	#[test]
	fn drop_vertex_removes_incident_edges() {
		let mut g = Graph::new();
		g.add_edge("A", "B");
		g.add_edge("B", "A");
		g.drop_vertex("B");
		assert!(!g.clusters().contains("B"));
		assert!(g.path("A", "B").is_none());
	}
}
