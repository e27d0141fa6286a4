//! Per-thread free lists for derivation-tree nodes.
//!
//! Derivation and extraction churn through huge numbers of small short-lived
//! nodes. Each thread keeps one pool per node variant; recycled boxes keep
//! their child-vector and string capacity, so the hot paths mostly stop
//! touching the global allocator. Pools are created lazily on first use and
//! drained when the owning thread exits.

use std::cell::RefCell;
use std::collections::VecDeque;

use crate::derivation::{BranchNode, GrammarId, Node, TerminalNode};

/// Default cap on entries retained per pool.
pub const DEFAULT_POOL_CAP: usize = 10_485_760;

#[derive(Debug)]
struct Pool {
    free: VecDeque<Box<Node>>,
    cap: usize,
    /// Nodes handed out from the free list.
    recycled: u64,
    /// Nodes that had to be freshly allocated.
    fresh: u64,
}

impl Pool {
    fn new(cap: usize) -> Self {
        Self { free: VecDeque::new(), cap, recycled: 0, fresh: 0 }
    }

    fn pop(&mut self) -> Option<Box<Node>> {
        let node = self.free.pop_front();
        if node.is_some() {
            self.recycled += 1;
        } else {
            self.fresh += 1;
        }
        node
    }

    fn push(&mut self, node: Box<Node>) -> bool {
        if self.free.len() >= self.cap {
            return false;
        }
        self.free.push_back(node);
        true
    }
}

/// Usage counters for one thread's pools.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub pooled: usize,
    pub recycled: u64,
    pub fresh: u64,
}

/// The three per-variant pools owned by a single thread.
#[derive(Debug)]
pub struct NodePools {
    terminal: Pool,
    nonterminal: Pool,
    sequence: Pool,
}

impl NodePools {
    fn new(cap: usize) -> Self {
        Self { terminal: Pool::new(cap), nonterminal: Pool::new(cap), sequence: Pool::new(cap) }
    }

    pub fn new_terminal(&mut self, grammar_id: GrammarId, content: &str) -> Box<Node> {
        match self.terminal.pop() {
            Some(mut node) => {
                if let Node::Terminal(t) = node.as_mut() {
                    t.grammar_id = grammar_id;
                    t.content.clear();
                    t.content.push_str(content);
                }
                node
            }
            None => Box::new(Node::Terminal(TerminalNode {
                grammar_id,
                content: content.to_owned(),
            })),
        }
    }

    pub fn new_nonterminal(&mut self, grammar_id: GrammarId) -> Box<Node> {
        match self.nonterminal.pop() {
            Some(mut node) => {
                if let Node::NonTerminal(b) = node.as_mut() {
                    b.grammar_id = grammar_id;
                }
                node
            }
            None => Box::new(Node::NonTerminal(BranchNode { grammar_id, children: Vec::new() })),
        }
    }

    pub fn new_sequence(&mut self, grammar_id: GrammarId) -> Box<Node> {
        match self.sequence.pop() {
            Some(mut node) => {
                if let Node::Sequence(b) = node.as_mut() {
                    b.grammar_id = grammar_id;
                }
                node
            }
            None => Box::new(Node::Sequence(BranchNode { grammar_id, children: Vec::new() })),
        }
    }

    /// Returns a subtree to the pools. Children are detached iteratively and
    /// recycled variant by variant; anything over a pool's cap is dropped.
    pub fn release(&mut self, root: Box<Node>) {
        let mut stack = vec![root];
        while let Some(mut node) = stack.pop() {
            if let Some(branch) = node.branch_mut() {
                stack.append(&mut branch.children);
            }
            let pool = match node.as_ref() {
                Node::Terminal(_) => &mut self.terminal,
                Node::NonTerminal(_) => &mut self.nonterminal,
                Node::Sequence(_) => &mut self.sequence,
            };
            // push keeps the box; an over-cap node falls out of scope here.
            let _ = pool.push(node);
        }
    }

    /// Fills each pool with `count` fresh nodes up front.
    pub fn prealloc(&mut self, count: usize) {
        for _ in 0..count.min(self.terminal.cap) {
            self.terminal.free.push_back(Box::new(Node::Terminal(TerminalNode::default())));
        }
        for _ in 0..count.min(self.nonterminal.cap) {
            self.nonterminal.free.push_back(Box::new(Node::NonTerminal(BranchNode::default())));
        }
        for _ in 0..count.min(self.sequence.cap) {
            self.sequence.free.push_back(Box::new(Node::Sequence(BranchNode::default())));
        }
    }

    pub fn stats(&self) -> [PoolStats; 3] {
        [&self.terminal, &self.nonterminal, &self.sequence].map(|pool| PoolStats {
            pooled: pool.free.len(),
            recycled: pool.recycled,
            fresh: pool.fresh,
        })
    }
}

thread_local! {
    static POOLS: RefCell<NodePools> = RefCell::new(NodePools::new(DEFAULT_POOL_CAP));
}

/// Runs `f` with the calling thread's pools. The pools are created on first
/// access and torn down (freeing every retained node) when the thread exits.
pub fn with_pools<R>(f: impl FnOnce(&mut NodePools) -> R) -> R {
    POOLS.with(|pools| f(&mut pools.borrow_mut()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recycles_released_nodes() {
        let mut pools = NodePools::new(16);
        let node = pools.new_terminal(4, "abc");
        pools.release(node);
        assert_eq!(pools.stats()[0].pooled, 1);

        let node = pools.new_terminal(9, "xyz");
        assert_eq!(pools.stats()[0].recycled, 1);
        match node.as_ref() {
            Node::Terminal(t) => {
                assert_eq!(t.grammar_id, 9);
                assert_eq!(t.content, "xyz");
            }
            other => panic!("expected terminal, got {other:?}"),
        }
    }

    #[test]
    fn release_detaches_children_into_their_pools() {
        let mut pools = NodePools::new(16);
        let mut root = pools.new_nonterminal(1);
        let mut seq = pools.new_sequence(2);
        seq.branch_mut().unwrap().children.push(pools.new_terminal(3, "t"));
        root.branch_mut().unwrap().children.push(seq);

        pools.release(root);
        let stats = pools.stats();
        assert_eq!(stats[0].pooled, 1);
        assert_eq!(stats[1].pooled, 1);
        assert_eq!(stats[2].pooled, 1);

        // Recycled branch nodes come back without children.
        let again = pools.new_sequence(7);
        assert!(again.children().is_empty());
    }

    #[test]
    fn cap_bounds_retention() {
        let mut pools = NodePools::new(2);
        for _ in 0..5 {
            let node = pools.new_terminal(1, "x");
            pools.release(node);
        }
        assert!(pools.stats()[0].pooled <= 2);
    }

    #[test]
    fn prealloc_fills_pools() {
        let mut pools = NodePools::new(8);
        pools.prealloc(4);
        let stats = pools.stats();
        assert_eq!(stats.map(|s| s.pooled), [4, 4, 4]);
        let _ = pools.new_sequence(1);
        assert_eq!(pools.stats()[2].recycled, 1);
    }
}
