//! Graph (spec.md §4.5): an in-memory directed multigraph over node
//! addresses, built by inserting every surviving node found by the
//! scanner. The rebuilt forest (`forest.rs`) walks this graph backward from
//! leaves to find candidate roots; nothing here knows about trees or COW
//! ancestry, only edges.
//!
//! New module — the teacher never needed a structure like this since it
//! only ever walked one known-good tree at a time (`tree.rs::BtrfsTreeIter`).
//! The acyclic-DFS check in [`Graph::final_check`] is a standard three-color
//! (white/gray/black) depth-first search over the edge set.

use std::collections::{HashMap, HashSet};

use crate::addr::{Generation, Key, LogicalAddr, ObjID};
use crate::error::GraphError;
use crate::node::{Node, NodeBody};

/// Where an edge originates: either a real node slot, or the filesystem's
/// superblock (spec.md §4.5 "a distinguished superblock pseudo-origin").
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EdgeOrigin {
    Node { addr: LogicalAddr, slot: u32 },
    Root { tree: ObjID },
    Superblock,
}

#[derive(Clone, Copy, Debug)]
pub struct Edge {
    pub from: EdgeOrigin,
    pub from_tree: ObjID,
    pub to: LogicalAddr,
    pub to_level: u8,
    pub to_generation: Generation,
    pub to_key: Option<Key>,
}

#[derive(Clone)]
pub struct Vertex {
    pub level: u8,
    pub generation: Generation,
    pub owner: ObjID,
    pub item_keys: Vec<Key>,
}

/// A node read while resolving a dangling edge, kept so `final_check` can
/// report *why* a target was unreachable instead of just that it was.
#[derive(Clone)]
pub struct BadNode {
    pub addr: LogicalAddr,
    pub error: String,
}

#[derive(Default)]
pub struct Graph {
    vertices: HashMap<LogicalAddr, Vertex>,
    edges: Vec<Edge>,
    /// out-edges indexed by source node address, for backward (leaf->root)
    /// traversal in `forest.rs`.
    edges_by_target: HashMap<LogicalAddr, Vec<usize>>,
    edges_by_source: HashMap<LogicalAddr, Vec<usize>>,
    pub bad_nodes: Vec<BadNode>,
}

impl Graph {
    pub fn new() -> Graph {
        Graph::default()
    }

    /// Seeds the graph with the four superblock-origin edges (spec.md §4.5
    /// `NewGraph`). A zero root is skipped, matching "If a superblock root
    /// is zero, no edge."
    pub fn seed_from_superblock(&mut self, sb: &crate::structures::SuperBlock) {
        self.add_superblock_edge(ObjID::ROOT_TREE, sb.root, sb.root_level, sb.generation);
        self.add_superblock_edge(ObjID::CHUNK_TREE, sb.chunk_root, sb.chunk_root_level, sb.chunk_root_generation);
        self.add_superblock_edge(ObjID::TREE_LOG, sb.log_root, sb.log_root_level, sb.generation);
        self.add_superblock_edge(
            ObjID::BLOCK_GROUP_TREE,
            sb.block_group_root,
            sb.block_group_root_level,
            sb.block_group_root_generation,
        );
    }

    pub(crate) fn add_superblock_edge(&mut self, tree: ObjID, root: u64, level: u8, generation: u64) {
        if root == 0 {
            return;
        }
        self.edges.push(Edge {
            from: EdgeOrigin::Superblock,
            from_tree: tree,
            to: LogicalAddr::from(root),
            to_level: level,
            to_generation: Generation::from(generation),
            to_key: None,
        });
        self.reindex_last_edge();
    }

    fn reindex_last_edge(&mut self) {
        let idx = self.edges.len() - 1;
        let to = self.edges[idx].to;
        self.edges_by_target.entry(to).or_default().push(idx);
        if let EdgeOrigin::Node { addr, .. } = self.edges[idx].from {
            self.edges_by_source.entry(addr).or_default().push(idx);
        }
    }

    /// Records `node`'s vertex and, depending on level, its outgoing edges
    /// (spec.md §4.5 `InsertNode`).
    pub fn insert_node(&mut self, node: &Node) {
        let item_keys = match &node.body {
            NodeBody::Leaf(items) => items.iter().map(|i| i.key).collect(),
            NodeBody::Interior(kps) => kps.iter().map(|k| k.key).collect(),
        };
        self.vertices.insert(
            node.addr,
            Vertex {
                level: node.level,
                generation: node.generation,
                owner: node.owner,
                item_keys,
            },
        );

        match &node.body {
            NodeBody::Leaf(items) => {
                for item in items.iter() {
                    if let crate::items::ItemBody::Root(root) = &item.body {
                        // A ROOT_ITEM establishes a tree's root rather than
                        // linking to a same-tree child: it must not make
                        // `forest.rs::walk_backward` climb past the
                        // subvolume boundary into the root tree's own
                        // ancestry, so it gets the dedicated `Root` origin
                        // (spec.md §4.5) instead of `Node`.
                        self.edges.push(Edge {
                            from: EdgeOrigin::Root { tree: item.key.objectid },
                            from_tree: item.key.objectid,
                            to: LogicalAddr::from(root.bytenr),
                            to_level: root.level,
                            to_generation: Generation::from(root.generation),
                            to_key: None,
                        });
                        self.reindex_last_edge();
                    }
                }
            }
            NodeBody::Interior(kps) => {
                for (slot, kp) in kps.iter().enumerate() {
                    self.edges.push(Edge {
                        from: EdgeOrigin::Node {
                            addr: node.addr,
                            slot: slot as u32,
                        },
                        from_tree: node.owner,
                        to: kp.child,
                        to_level: node.level - 1,
                        to_generation: kp.generation,
                        to_key: Some(kp.key),
                    });
                    self.reindex_last_edge();
                }
            }
        }
    }

    pub fn vertex(&self, addr: LogicalAddr) -> Option<&Vertex> {
        self.vertices.get(&addr)
    }

    pub fn has_vertex(&self, addr: LogicalAddr) -> bool {
        self.vertices.contains_key(&addr)
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    /// Out-edges whose source is `addr` (interior key-pointers out of this
    /// node, or the ROOT_ITEM edges it emits if it's a leaf).
    pub fn out_edges(&self, addr: LogicalAddr) -> impl Iterator<Item = &Edge> {
        self.edges_by_source
            .get(&addr)
            .into_iter()
            .flatten()
            .map(move |&i| &self.edges[i])
    }

    /// Edges whose target is `addr` — the backward direction `forest.rs`
    /// walks to find candidate roots for a leaf.
    pub fn in_edges(&self, addr: LogicalAddr) -> impl Iterator<Item = &Edge> {
        self.edges_by_target
            .get(&addr)
            .into_iter()
            .flatten()
            .map(move |&i| &self.edges[i])
    }

    /// Verifies every edge target is reachable (reading it off the real
    /// filesystem if it wasn't already in the scan) and that the resulting
    /// graph is acyclic (spec.md §4.5 `FinalCheck`).
    ///
    /// `read_target` is given an address and should attempt to read+decode
    /// the node there with no expectations; a successful-but-previously-
    /// unseen node is a fatal inconsistency (spec.md §4.5: "if it succeeds
    /// and the target wasn't in the scan, that's a fatal inconsistency") —
    /// the scan should have found everything the graph now claims exists.
    pub fn final_check(
        &mut self,
        mut read_target: impl FnMut(LogicalAddr) -> Result<Option<Node>, String>,
    ) -> Result<(), GraphError> {
        let targets: Vec<LogicalAddr> = self.edges.iter().map(|e| e.to).collect();
        for target in targets {
            if target.as_u64() == 0 {
                continue;
            }
            if self.vertices.contains_key(&target) {
                continue;
            }
            match read_target(target) {
                Ok(Some(_node)) => return Err(GraphError::UnscannedNode { addr: target }),
                Ok(None) => {
                    self.bad_nodes.push(BadNode {
                        addr: target,
                        error: "no such node".to_string(),
                    });
                }
                Err(e) => {
                    self.bad_nodes.push(BadNode { addr: target, error: e });
                }
            }
        }

        self.detect_cycles()
    }

    fn detect_cycles(&self) -> Result<(), GraphError> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unvisited,
            OnStack,
            Done,
        }
        let mut marks: HashMap<LogicalAddr, Mark> = HashMap::new();
        for &start in self.vertices.keys() {
            if marks.get(&start).copied().unwrap_or(Mark::Unvisited) != Mark::Unvisited {
                continue;
            }
            let mut stack = vec![(start, self.out_edges(start).map(|e| e.to).collect::<Vec<_>>().into_iter())];
            let mut path = vec![start];
            marks.insert(start, Mark::OnStack);
            'dfs: while let Some((_node, iter)) = stack.last_mut() {
                for next in iter.by_ref() {
                    match marks.get(&next).copied().unwrap_or(Mark::Unvisited) {
                        Mark::OnStack => {
                            let mut cycle_path: Vec<LogicalAddr> =
                                path.iter().skip_while(|&&a| a != next).copied().collect();
                            cycle_path.push(next);
                            return Err(GraphError::TreeLoop { path: cycle_path });
                        }
                        Mark::Done => continue,
                        Mark::Unvisited => {
                            marks.insert(next, Mark::OnStack);
                            path.push(next);
                            stack.push((next, self.out_edges(next).map(|e| e.to).collect::<Vec<_>>().into_iter()));
                            continue 'dfs;
                        }
                    }
                }
                let (done, _) = stack.pop().unwrap();
                marks.insert(done, Mark::Done);
                path.pop();
            }
        }
        Ok(())
    }

    /// Verifies the expectation a single edge's target carries, surfacing
    /// mismatches as "broken edges" (spec.md §4.5 "Expectation-check for
    /// edges") rather than failing the whole walk.
    pub fn edge_is_consistent(&self, e: &Edge) -> bool {
        match self.vertices.get(&e.to) {
            None => false,
            Some(v) => {
                if v.level != e.to_level || v.generation != e.to_generation {
                    return false;
                }
                if let Some(expect_key) = e.to_key {
                    if v.item_keys.first().copied() != Some(expect_key) {
                        return false;
                    }
                }
                true
            }
        }
    }

    pub fn distinct_targets(&self) -> HashSet<LogicalAddr> {
        self.edges.iter().map(|e| e.to).collect()
    }

    /// Every known leaf-level node address — the candidate set `forest.rs`
    /// indexes items from.
    pub fn leaves(&self) -> impl Iterator<Item = LogicalAddr> + '_ {
        self.vertices.iter().filter(|(_, v)| v.level == 0).map(|(&addr, _)| addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{KeyPtrEntry, Node};

    fn interior_node(addr: i64, child: i64, key: Key) -> Node {
        Node {
            addr: LogicalAddr::new(addr),
            generation: Generation::new(1),
            owner: ObjID::FS_TREE,
            level: 1,
            flags: 0,
            body: NodeBody::Interior(vec![KeyPtrEntry {
                key,
                child: LogicalAddr::new(child),
                generation: Generation::new(1),
            }]),
        }
    }

    fn leaf_node(addr: i64) -> Node {
        Node {
            addr: LogicalAddr::new(addr),
            generation: Generation::new(1),
            owner: ObjID::FS_TREE,
            level: 0,
            flags: 0,
            body: NodeBody::Leaf(vec![]),
        }
    }

    #[test]
    fn insert_interior_node_adds_one_edge_per_keyptr() {
        let mut g = Graph::new();
        let key = Key::new(ObjID::FS_TREE, 1, 0);
        g.insert_node(&interior_node(0x1000, 0x2000, key));
        assert_eq!(g.edges().len(), 1);
        assert_eq!(g.edges()[0].to, LogicalAddr::new(0x2000));
    }

    #[test]
    fn acyclic_graph_passes_final_check() {
        let mut g = Graph::new();
        let key = Key::new(ObjID::FS_TREE, 1, 0);
        g.insert_node(&interior_node(0x1000, 0x2000, key));
        g.insert_node(&leaf_node(0x2000));
        assert!(g.final_check(|_| Ok(None)).is_ok());
    }

    #[test]
    fn cycle_is_detected() {
        let mut g = Graph::new();
        let key_a = Key::new(ObjID::FS_TREE, 1, 0);
        let key_b = Key::new(ObjID::FS_TREE, 1, 1);
        g.insert_node(&interior_node(0x1000, 0x2000, key_a));
        g.insert_node(&interior_node(0x2000, 0x1000, key_b));
        let err = g.final_check(|_| Ok(None)).unwrap_err();
        assert!(matches!(err, GraphError::TreeLoop { .. }));
    }

    #[test]
    fn unscanned_but_readable_target_is_a_fatal_inconsistency() {
        let mut g = Graph::new();
        let key = Key::new(ObjID::FS_TREE, 1, 0);
        g.insert_node(&interior_node(0x1000, 0x2000, key));
        // 0x2000 was never given to insert_node, but read_target claims it
        // reads back fine — the scan should have found it already.
        let err = g.final_check(|_| Ok(Some(leaf_node(0x2000)))).unwrap_err();
        assert!(matches!(err, GraphError::UnscannedNode { addr } if addr == LogicalAddr::new(0x2000)));
    }

    #[test]
    fn unreadable_target_is_recorded_as_a_bad_node_not_an_error() {
        let mut g = Graph::new();
        let key = Key::new(ObjID::FS_TREE, 1, 0);
        g.insert_node(&interior_node(0x1000, 0x2000, key));
        assert!(g.final_check(|_| Err("device gone".to_string())).is_ok());
        assert_eq!(g.bad_nodes.len(), 1);
        assert_eq!(g.bad_nodes[0].addr, LogicalAddr::new(0x2000));
    }
}
