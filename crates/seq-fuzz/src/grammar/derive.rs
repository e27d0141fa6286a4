//! Random bounded derivation: the three-phase worklist that grows a
//! derivation tree to a target number of sequence atoms.
//!
//! Phase one expands only along expansions that can still produce sequence
//! atoms until the target is reached. Phase two drains the remaining
//! sequence frontier while avoiding further growth. Phase three resolves
//! every leftover non-terminal down to terminal leaves.

use std::collections::VecDeque;

use rand::Rng;
use rand_mt::Mt;
use thiserror::Error;

use crate::derivation::{CopyCounts, Node, NodeKind};
use crate::slab::NodePools;

use super::tree::{ExpansionId, ExpansionKind, GrammarTree, NodeFlags, NodeId, SymbolKind};

#[derive(Debug, Error)]
pub enum DeriveError {
    #[error("grammar has no root symbol")]
    NoRoot,
    #[error("node {0} carries the sequence flag but no expansion produces sequences")]
    InconsistentSequenceFlags(NodeId),
}

/// Node under construction; children are arena indices. Parents always come
/// before their children, which lets the final assembly run back to front.
#[derive(Debug)]
struct ArenaNode {
    kind: NodeKind,
    grammar_id: NodeId,
    content: String,
    children: Vec<usize>,
}

/// Worklist state for one derivation run.
pub(crate) struct SequenceBuilder<'g> {
    tree: &'g GrammarTree,
    rng: Mt,
    arena: Vec<ArenaNode>,
    /// Frontier that can still produce sequence atoms.
    q_sequence: VecDeque<(usize, NodeId)>,
    /// Every other open non-terminal.
    q_nonterminal: VecDeque<(usize, NodeId)>,
    sequences: i64,
    target: i64,
}

impl<'g> SequenceBuilder<'g> {
    pub(crate) fn new(
        tree: &'g GrammarTree,
        rng: Mt,
        target: i64,
        produced: i64,
    ) -> Self {
        Self {
            tree,
            rng,
            arena: Vec::new(),
            q_sequence: VecDeque::new(),
            q_nonterminal: VecDeque::new(),
            sequences: produced,
            target,
        }
    }

    /// Seeds the worklist with the grammar root. Returns false when the root
    /// resolves to a bare terminal (the arena then holds just that leaf).
    pub(crate) fn seed_root(&mut self) -> Result<(), DeriveError> {
        let root = self.tree.root.ok_or(DeriveError::NoRoot)?;
        let node = self.tree.node(root);
        match node.kind {
            SymbolKind::Terminal => {
                self.arena.push(ArenaNode {
                    kind: NodeKind::Terminal,
                    grammar_id: root,
                    content: node.identifier.clone(),
                    children: Vec::new(),
                });
            }
            SymbolKind::Sequence => {
                self.arena.push(ArenaNode {
                    kind: NodeKind::NonTerminal,
                    grammar_id: root,
                    content: String::new(),
                    children: Vec::new(),
                });
                self.sequences += 1;
                self.q_sequence.push_back((0, root));
            }
            SymbolKind::NonTerminal => {
                self.arena.push(ArenaNode {
                    kind: NodeKind::NonTerminal,
                    grammar_id: root,
                    content: String::new(),
                    children: Vec::new(),
                });
                self.q_sequence.push_back((0, root));
            }
        }
        Ok(())
    }

    /// Seeds the worklist with a placeholder for an existing anchor node;
    /// the anchor's fresh children are collected under arena index 0.
    pub(crate) fn seed_anchor(&mut self, grammar_node: NodeId) {
        self.arena.push(ArenaNode {
            kind: NodeKind::NonTerminal,
            grammar_id: grammar_node,
            content: String::new(),
            children: Vec::new(),
        });
        let flags = self.tree.node(grammar_node).flags;
        if flags.contains(NodeFlags::PRODUCE_SEQUENCE) {
            self.q_sequence.push_back((0, grammar_node));
        } else if flags.contains(NodeFlags::PRODUCE_NONTERMINALS) {
            self.q_nonterminal.push_back((0, grammar_node));
        }
    }

    pub(crate) fn sequences(&self) -> i64 {
        self.sequences
    }

    /// Runs the three phases to completion.
    pub(crate) fn run(&mut self) -> Result<(), DeriveError> {
        self.grow_sequences()?;
        self.finish_sequence_frontier();
        self.finish_nonterminals();
        Ok(())
    }

    /// Phase one: expand the sequence frontier, preferring expansions that
    /// directly produce the most sequence atoms, until the target is met.
    fn grow_sequences(&mut self) -> Result<(), DeriveError> {
        while self.sequences < self.target && !self.q_sequence.is_empty() {
            for _ in 0..self.q_sequence.len() {
                let (slot, grammar_id) = self.q_sequence.pop_front().expect("frontier non-empty");
                let node = self.tree.node(grammar_id);
                let expansions = node.expansions.clone();

                let direct: Vec<ExpansionId> = expansions
                    .iter()
                    .copied()
                    .filter(|id| self.tree.expansion(*id).seq_nonterminals > 0)
                    .collect();
                let choice = if !direct.is_empty() {
                    if direct.iter().any(|id| self.tree.expansion(*id).weight > 0.0) {
                        self.pick_weighted(&direct)
                    } else {
                        // Unweighted: the first one producing the most atoms.
                        direct
                            .iter()
                            .rev()
                            .copied()
                            .max_by_key(|id| self.tree.expansion(*id).seq_nonterminals)
                            .expect("direct non-empty")
                    }
                } else {
                    let flagged: Vec<ExpansionId> = expansions
                        .iter()
                        .copied()
                        .filter(|id| {
                            self.tree.expansion(*id).flags.contains(NodeFlags::PRODUCE_SEQUENCE)
                        })
                        .collect();
                    if !flagged.is_empty() {
                        self.pick_weighted(&flagged)
                    } else if node.is_sequence()
                        || !node.flags.contains(NodeFlags::PRODUCE_SEQUENCE)
                    {
                        // No sequence production possible from here; treat it
                        // like any other open non-terminal.
                        self.q_nonterminal.push_back((slot, grammar_id));
                        continue;
                    } else {
                        return Err(DeriveError::InconsistentSequenceFlags(grammar_id));
                    }
                };
                self.instantiate(slot, choice, true);
            }
        }
        Ok(())
    }

    /// Phase two: drain the sequence frontier, preferring expansions that do
    /// not add sequence atoms.
    fn finish_sequence_frontier(&mut self) {
        while let Some((slot, grammar_id)) = self.q_sequence.pop_front() {
            let expansions = self.tree.node(grammar_id).expansions.clone();
            let lean: Vec<ExpansionId> = expansions
                .iter()
                .copied()
                .filter(|id| !self.tree.expansion(*id).flags.contains(NodeFlags::PRODUCE_SEQUENCE))
                .collect();
            let choice = if !lean.is_empty() {
                self.pick_weighted(&lean)
            } else {
                self.pick_weighted(&expansions)
            };
            self.instantiate(slot, choice, false);
        }
    }

    /// Phase three: resolve every remaining non-terminal to terminals.
    fn finish_nonterminals(&mut self) {
        while let Some((slot, grammar_id)) = self.q_nonterminal.pop_front() {
            let expansions = self.tree.node(grammar_id).expansions.clone();
            let choice = self.pick_weighted(&expansions);
            self.instantiate(slot, choice, false);
        }
    }

    /// Weighted cumulative choice; uniform when no weights are set.
    fn pick_weighted(&mut self, candidates: &[ExpansionId]) -> ExpansionId {
        debug_assert!(!candidates.is_empty());
        let total: f32 = candidates.iter().map(|id| self.tree.expansion(*id).weight).sum();
        if total == 0.0 {
            return candidates[self.rng.random_range(0..candidates.len())];
        }
        let target = self.rng.random_range(0.0..1.0f32) * total;
        let mut cumulative = 0.0f32;
        for &id in candidates {
            cumulative += self.tree.expansion(id).weight;
            if cumulative >= target {
                return id;
            }
        }
        *candidates.last().expect("candidates non-empty")
    }

    /// Expands `slot` with `expansion`, appending fresh arena nodes and
    /// routing them into the queues. During phase one (`growing`) new
    /// sequence producers go back onto the sequence frontier; afterwards
    /// everything lands on the plain non-terminal queue.
    fn instantiate(&mut self, slot: usize, expansion: ExpansionId, growing: bool) {
        match self.tree.expansion(expansion).kind.clone() {
            ExpansionKind::Nodes(members) => {
                for member in members {
                    self.emit(slot, member, growing);
                }
            }
            ExpansionKind::Repeat { node, min } => {
                // Fill eagerly up to the target, but never run dry below the
                // lower bound.
                let mut copies = if growing { (self.target - self.sequences).max(0) } else { 0 };
                if copies == 0 && min == 1 {
                    copies = 1;
                }
                for _ in 0..copies {
                    self.emit(slot, node, growing);
                }
            }
        }
    }

    fn emit(&mut self, slot: usize, member: NodeId, growing: bool) {
        let child = self.tree.node(member);
        let index = self.arena.len();
        match child.kind {
            SymbolKind::Terminal => {
                let content = self.sample_terminal(member);
                self.arena.push(ArenaNode {
                    kind: NodeKind::Terminal,
                    grammar_id: member,
                    content,
                    children: Vec::new(),
                });
                self.arena[slot].children.push(index);
            }
            SymbolKind::Sequence | SymbolKind::NonTerminal => {
                let kind = if child.kind == SymbolKind::Sequence {
                    self.sequences += 1;
                    NodeKind::Sequence
                } else {
                    NodeKind::NonTerminal
                };
                self.arena.push(ArenaNode {
                    kind,
                    grammar_id: member,
                    content: String::new(),
                    children: Vec::new(),
                });
                self.arena[slot].children.push(index);
                if growing && child.flags.contains(NodeFlags::PRODUCE_SEQUENCE) {
                    self.q_sequence.push_back((index, member));
                } else {
                    self.q_nonterminal.push_back((index, member));
                }
            }
        }
    }

    /// Terminal content: character classes sample from their range, anything
    /// else copies the identifier verbatim.
    fn sample_terminal(&mut self, member: NodeId) -> String {
        let node = self.tree.node(member);
        if node.flags.contains(NodeFlags::TERMINAL_CHAR_CLASS) {
            let c = if node.flags.contains(NodeFlags::CHAR_CLASS_ASCII) {
                self.rng.random_range(0x01..=0x7Eu8) as char
            } else if node.flags.contains(NodeFlags::CHAR_CLASS_ALPHA) {
                let v = self.rng.random_range(0..52u8);
                if v < 26 { (b'A' + v) as char } else { (b'a' + v - 26) as char }
            } else if node.flags.contains(NodeFlags::CHAR_CLASS_ALNUM) {
                let v = self.rng.random_range(0..62u8);
                if v < 26 {
                    (b'A' + v) as char
                } else if v < 52 {
                    (b'a' + v - 26) as char
                } else {
                    (b'0' + v - 52) as char
                }
            } else if node.flags.contains(NodeFlags::CHAR_CLASS_DIGIT) {
                self.rng.random_range(b'0'..=b'9') as char
            } else {
                return node.identifier.clone();
            };
            return c.to_string();
        }
        node.identifier.clone()
    }

    /// Assembles the arena into an owned node tree through the pools.
    /// Children always sit behind their parents, so a single reverse sweep
    /// suffices.
    pub(crate) fn assemble(self, pools: &mut NodePools) -> (Box<Node>, CopyCounts) {
        let mut counts = CopyCounts { nodes: self.arena.len() as i64, sequence_nodes: 0 };
        let mut built: Vec<Option<Box<Node>>> = (0..self.arena.len()).map(|_| None).collect();
        for index in (0..self.arena.len()).rev() {
            let entry = &self.arena[index];
            let mut node = match entry.kind {
                NodeKind::Terminal => pools.new_terminal(entry.grammar_id, &entry.content),
                NodeKind::NonTerminal => pools.new_nonterminal(entry.grammar_id),
                NodeKind::Sequence => {
                    counts.sequence_nodes += 1;
                    pools.new_sequence(entry.grammar_id)
                }
            };
            if let Some(branch) = node.branch_mut() {
                branch.children.reserve(entry.children.len());
                for &child in &entry.children {
                    branch.children.push(built[child].take().expect("child behind parent"));
                }
            }
            built[index] = Some(node);
        }
        (built[0].take().expect("arena root"), counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::derivation::materialize_sequence;
    use crate::grammar::tree::SymbolKind;
    use crate::slab;

    fn grammar(rules: &[(&str, &str, SymbolKind)]) -> GrammarTree {
        let mut tree = GrammarTree::default();
        for (symbol, derivation, kind) in rules {
            tree.add_symbol(symbol, derivation, *kind);
        }
        let root = tree.find_node("'start").unwrap();
        tree.set_root(root);
        assert!(tree.construct());
        tree.simplify_sequences();
        tree.fix_root();
        tree
    }

    fn derive(tree: &GrammarTree, target: i64, seed: u32) -> (Box<Node>, CopyCounts) {
        let mut builder = SequenceBuilder::new(tree, Mt::new(seed), target, 0);
        builder.seed_root().unwrap();
        builder.run().unwrap();
        slab::with_pools(|pools| builder.assemble(pools))
    }

    #[test]
    fn single_terminal_grammar_derives_its_word() {
        let tree = grammar(&[("'start", "\"a\"", SymbolKind::NonTerminal)]);
        let (root, counts) = derive(&tree, 1, 7);
        assert_eq!(counts.sequence_nodes, 0);
        assert_eq!(materialize_sequence(&root), vec!["a".to_owned()]);
        slab::with_pools(|pools| pools.release(root));
    }

    #[test]
    fn simple_repeat_grammar_hits_target_exactly() {
        let tree = grammar(&[
            ("'start", "'SEQ_x ~ 'start | 'SEQ_x", SymbolKind::NonTerminal),
            ("'SEQ_x", "\"x\"", SymbolKind::Sequence),
        ]);
        assert!(tree.simple);
        let (root, counts) = derive(&tree, 3, 1234);
        assert_eq!(counts.sequence_nodes, 3);
        assert_eq!(materialize_sequence(&root), vec!["x", "x", "x"]);
        slab::with_pools(|pools| pools.release(root));
    }

    #[test]
    fn derivation_is_deterministic_per_seed() {
        let tree = grammar(&[
            ("'start", "'SEQ_s ~ 'start | 'SEQ_s", SymbolKind::NonTerminal),
            ("'SEQ_s", "\"a\" | \"b\" | \"c\" ~ [:digit:]", SymbolKind::Sequence),
        ]);
        let (first, _) = derive(&tree, 16, 99);
        let (second, _) = derive(&tree, 16, 99);
        let (different, _) = derive(&tree, 16, 100);
        assert_eq!(materialize_sequence(&first), materialize_sequence(&second));
        assert_ne!(materialize_sequence(&first), materialize_sequence(&different));
        slab::with_pools(|pools| {
            pools.release(first);
            pools.release(second);
            pools.release(different);
        });
    }

    #[test]
    fn sequence_count_stays_within_expansion_bound() {
        // Every step adds at most two atoms, so the overshoot is bounded by
        // the largest expansion's sequence production. The empty alternative
        // lets the leftover frontier finish without growing further.
        let tree = grammar(&[
            ("'start", "'SEQ_p ~ 'SEQ_p ~ 'start | 'SEQ_p | ", SymbolKind::NonTerminal),
            ("'SEQ_p", "\"p\"", SymbolKind::Sequence),
        ]);
        for seed in 0..8u32 {
            let (root, counts) = derive(&tree, 9, seed);
            assert!(
                (9..=11).contains(&counts.sequence_nodes),
                "count {} out of bounds",
                counts.sequence_nodes
            );
            slab::with_pools(|pools| pools.release(root));
        }
    }

    #[test]
    fn weights_bias_alternative_choice() {
        let tree = grammar(&[
            ("'start", "'SEQ_w ~ 'start | 'SEQ_w", SymbolKind::NonTerminal),
            ("'SEQ_w", "\"hot\" ~ 'WGT_0.99 | \"cold\" ~ 'WGT_0.01", SymbolKind::Sequence),
        ]);
        let (root, _) = derive(&tree, 64, 2024);
        let tokens = materialize_sequence(&root);
        let hot = tokens.iter().filter(|t| t.as_str() == "hot").count();
        assert!(hot > 48, "expected heavy bias, got {hot}/64");
        slab::with_pools(|pools| pools.release(root));
    }

    #[test]
    fn char_classes_sample_their_ranges() {
        let tree = grammar(&[
            ("'start", "'SEQ_d ~ 'start | 'SEQ_d", SymbolKind::NonTerminal),
            ("'SEQ_d", "[:digit:]", SymbolKind::Sequence),
        ]);
        let (root, _) = derive(&tree, 32, 5);
        for token in materialize_sequence(&root) {
            assert!(token.chars().all(|c| c.is_ascii_digit()), "bad token {token}");
        }
        slab::with_pools(|pools| pools.release(root));
    }
}
