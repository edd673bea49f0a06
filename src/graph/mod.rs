//! Call graph of one target function per session.
//!
//! Nodes live in an arena owned by the [`Graph`]; children keep the order
//! in which they were first seen and point back to their parent by index.

mod build;
mod print;

pub use build::build_graphs;
pub use print::{print_graph, time_unit};

use std::collections::HashMap;

/// Index of a node in its graph's arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(usize);

impl NodeId {
    pub const ROOT: NodeId = NodeId(0);
}

#[derive(Debug, Clone, Default)]
pub struct GraphNode {
    pub addr: u64,
    pub call_count: u64,
    /// Total duration of all calls through this node
    pub self_time: u64,
    pub child_time: u64,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
}

impl GraphNode {
    /// Number of distinct callees
    pub fn edge_count(&self) -> usize {
        self.children.len()
    }
}

/// A distinct call chain that reached the target function
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backtrace {
    /// Outermost caller first, the target itself last
    pub addrs: Vec<u64>,
    pub hit_count: u64,
    pub time: u64,
}

/// Position of one thread inside the graph
#[derive(Debug, Clone, Default)]
struct Cursor {
    /// Nesting level of the target function
    enabled: u32,
    /// Open calls from the root down to the current node
    path: Vec<NodeId>,
    backtrace: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct Graph {
    /// Index of the session in the session table
    pub session: usize,
    pub func: String,
    nodes: Vec<GraphNode>,
    backtraces: Vec<Backtrace>,
    cursors: HashMap<u32, Cursor>,
}

impl Graph {
    pub fn new(session: usize, func: impl Into<String>) -> Self {
        Graph {
            session,
            func: func.into(),
            nodes: vec![GraphNode::default()],
            backtraces: Vec::new(),
            cursors: HashMap::new(),
        }
    }

    pub fn root(&self) -> &GraphNode {
        &self.nodes[NodeId::ROOT.0]
    }

    pub fn node(&self, id: NodeId) -> &GraphNode {
        &self.nodes[id.0]
    }

    pub fn backtraces(&self) -> &[Backtrace] {
        &self.backtraces
    }

    /// Any thread is currently inside the target function
    pub fn is_active(&self) -> bool {
        self.cursors.values().any(|c| c.enabled > 0)
    }

    /// Account an entry of thread `tid` into `addr`.
    ///
    /// `chain` holds the addresses of the thread's open calls including
    /// this one; it becomes a backtrace when the target is entered.
    pub fn enter(&mut self, tid: u32, addr: u64, chain: &[u64], is_target: bool) {
        let mut cursor = self.cursors.remove(&tid).unwrap_or_default();

        if cursor.enabled > 0
            && let Some(&curr) = cursor.path.last()
        {
            cursor.path.push(self.add_child(curr, addr));
        }

        if is_target {
            if cursor.enabled == 0 {
                cursor.backtrace = self.save_backtrace(chain);

                let root = &mut self.nodes[NodeId::ROOT.0];
                root.addr = addr;
                root.call_count += 1;
                cursor.path = vec![NodeId::ROOT];
            }
            cursor.enabled += 1;
        }

        self.cursors.insert(tid, cursor);
    }

    /// Account the exit of the innermost call of thread `tid`
    pub fn exit(&mut self, tid: u32, self_time: u64, child_time: u64, is_target: bool) {
        let Some(cursor) = self.cursors.get_mut(&tid) else {
            return;
        };
        if cursor.enabled == 0 {
            return;
        }

        if let Some(curr) = cursor.path.pop() {
            let node = &mut self.nodes[curr.0];
            node.self_time += self_time;
            node.child_time += child_time;
        }

        if is_target {
            cursor.enabled -= 1;
            if cursor.enabled == 0
                && let Some(bt) = cursor.backtrace.take()
            {
                self.backtraces[bt].time += self_time;
            }
        }
    }

    /// Forget the innermost `levels` calls of thread `tid` after a longjmp;
    /// they never return.
    pub fn unwind(&mut self, tid: u32, levels: usize) {
        let Some(cursor) = self.cursors.get_mut(&tid) else {
            return;
        };
        if cursor.enabled == 0 {
            return;
        }

        let len = cursor.path.len().saturating_sub(levels);
        cursor.path.truncate(len);

        // jumped out of the target itself
        if cursor.path.is_empty() {
            cursor.enabled = 0;
            cursor.backtrace = None;
        }
    }

    fn add_child(&mut self, parent: NodeId, addr: u64) -> NodeId {
        let existing = self.nodes[parent.0]
            .children
            .iter()
            .copied()
            .find(|&id| self.nodes[id.0].addr == addr);

        let id = existing.unwrap_or_else(|| {
            let id = NodeId(self.nodes.len());
            self.nodes.push(GraphNode {
                addr,
                parent: Some(parent),
                ..Default::default()
            });
            self.nodes[parent.0].children.push(id);
            id
        });

        self.nodes[id.0].call_count += 1;
        id
    }

    fn save_backtrace(&mut self, chain: &[u64]) -> Option<usize> {
        if chain.is_empty() {
            return None;
        }

        let idx = match self.backtraces.iter().position(|bt| bt.addrs == chain) {
            Some(idx) => idx,
            None => {
                self.backtraces.push(Backtrace {
                    addrs: chain.to_vec(),
                    hit_count: 0,
                    time: 0,
                });
                self.backtraces.len() - 1
            }
        };

        self.backtraces[idx].hit_count += 1;
        Some(idx)
    }
}
