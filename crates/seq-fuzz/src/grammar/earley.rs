//! Earley parsing over sequence atoms.
//!
//! Used only by the general extraction path. The input alphabet is the
//! grammar-node ids of sequence atoms; sequence nodes act as the terminals
//! of the sequence-level grammar, ordinary terminals consume nothing. The
//! parser never touches the grammar and allocates no derivation nodes; it
//! returns a parse tree over grammar-node ids.

use ahash::AHashSet;
use derive_new::new as New;

use super::tree::{ExpansionId, ExpansionKind, GrammarTree, NodeId, SymbolKind};

/// One node of a parse tree. Sequence leaves consume exactly one input atom.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseTree {
    pub node: NodeId,
    pub children: Vec<ParseTree>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct Item {
    expansion: ExpansionId,
    dot: usize,
    origin: usize,
}

#[derive(Debug, New)]
pub struct EarleyParser<'g> {
    tree: &'g GrammarTree,
    input: Vec<NodeId>,
    /// Completed nonterminal spans `(node, start, end)`.
    #[new(default)]
    nt_spans: AHashSet<(NodeId, usize, usize)>,
    /// Completed expansion spans `(expansion, start, end)`.
    #[new(default)]
    exp_spans: AHashSet<(ExpansionId, usize, usize)>,
}

impl EarleyParser<'_> {
    fn members(&self, expansion: ExpansionId) -> &[NodeId] {
        match &self.tree.expansion(expansion).kind {
            ExpansionKind::Nodes(nodes) => nodes,
            // Repeat expansions only exist in simple grammars, which never
            // reach the Earley path.
            ExpansionKind::Repeat { .. } => &[],
        }
    }

    fn kind(&self, node: NodeId) -> SymbolKind {
        self.tree.node(node).kind
    }

    /// Runs recognition and, on success, reconstructs the first parse tree.
    pub fn parse(&mut self) -> Option<ParseTree> {
        let root = self.tree.root?;
        self.recognize(root);
        let length = self.input.len();
        if !self.nt_spans.contains(&(root, 0, length)) {
            return None;
        }
        let mut active = AHashSet::new();
        let mut failed = AHashSet::new();
        self.build_node(root, 0, length, &mut active, &mut failed)
    }

    fn recognize(&mut self, root: NodeId) {
        let length = self.input.len();
        let mut chart: Vec<Vec<Item>> = vec![Vec::new(); length + 1];
        let mut seen: Vec<AHashSet<Item>> = vec![AHashSet::new(); length + 1];
        // Nonterminals already completed with an empty span at the current
        // position, for the classic nullable-prediction corner.
        let mut nulled: Vec<AHashSet<NodeId>> = vec![AHashSet::new(); length + 1];

        let mut push = |chart: &mut Vec<Vec<Item>>, seen: &mut Vec<AHashSet<Item>>, at: usize, item: Item| {
            if seen[at].insert(item) {
                chart[at].push(item);
            }
        };

        for &expansion in &self.tree.node(root).expansions {
            push(&mut chart, &mut seen, 0, Item { expansion, dot: 0, origin: 0 });
        }

        for position in 0..=length {
            let mut index = 0;
            while index < chart[position].len() {
                let item = chart[position][index];
                index += 1;
                let members = self.members(item.expansion);
                match members.get(item.dot).copied() {
                    None => {
                        // Complete.
                        let parent = self.tree.expansion(item.expansion).parent;
                        self.exp_spans.insert((item.expansion, item.origin, position));
                        self.nt_spans.insert((parent, item.origin, position));
                        if item.origin == position {
                            nulled[position].insert(parent);
                        }
                        let mut back = 0;
                        while back < chart[item.origin].len() {
                            let waiting = chart[item.origin][back];
                            back += 1;
                            if self.members(waiting.expansion).get(waiting.dot).copied()
                                == Some(parent)
                            {
                                push(
                                    &mut chart,
                                    &mut seen,
                                    position,
                                    Item { dot: waiting.dot + 1, ..waiting },
                                );
                            }
                        }
                    }
                    Some(symbol) => match self.kind(symbol) {
                        SymbolKind::Sequence => {
                            // Scan: sequence atoms are the parse alphabet.
                            if position < length && self.input[position] == symbol {
                                push(
                                    &mut chart,
                                    &mut seen,
                                    position + 1,
                                    Item { dot: item.dot + 1, ..item },
                                );
                            }
                        }
                        SymbolKind::Terminal => {
                            // Plain terminals hold no sequence atoms.
                            push(&mut chart, &mut seen, position, Item { dot: item.dot + 1, ..item });
                        }
                        SymbolKind::NonTerminal => {
                            for &expansion in &self.tree.node(symbol).expansions {
                                push(
                                    &mut chart,
                                    &mut seen,
                                    position,
                                    Item { expansion, dot: 0, origin: position },
                                );
                            }
                            if nulled[position].contains(&symbol) {
                                push(&mut chart, &mut seen, position, Item { dot: item.dot + 1, ..item });
                            }
                        }
                    },
                }
            }
        }
    }

    fn build_node(
        &self,
        node: NodeId,
        start: usize,
        end: usize,
        active: &mut AHashSet<(NodeId, usize, usize)>,
        failed: &mut AHashSet<(u64, usize, usize)>,
    ) -> Option<ParseTree> {
        if !self.nt_spans.contains(&(node, start, end)) || !active.insert((node, start, end)) {
            return None;
        }
        let mut result = None;
        for &expansion in &self.tree.node(node).expansions {
            if !self.exp_spans.contains(&(expansion, start, end)) {
                continue;
            }
            if let Some(children) = self.match_members(expansion, 0, start, end, active, failed) {
                result = Some(ParseTree { node, children });
                break;
            }
        }
        active.remove(&(node, start, end));
        result
    }

    fn match_members(
        &self,
        expansion: ExpansionId,
        member: usize,
        position: usize,
        end: usize,
        active: &mut AHashSet<(NodeId, usize, usize)>,
        failed: &mut AHashSet<(u64, usize, usize)>,
    ) -> Option<Vec<ParseTree>> {
        let key = (expansion << 16 | member as u64, position, end);
        if failed.contains(&key) {
            return None;
        }
        let members = self.members(expansion);
        let Some(&symbol) = members.get(member) else {
            return (position == end).then(Vec::new);
        };
        let found = match self.kind(symbol) {
            SymbolKind::Terminal => self
                .match_members(expansion, member + 1, position, end, active, failed)
                .map(|mut rest| {
                    rest.insert(0, ParseTree { node: symbol, children: Vec::new() });
                    rest
                }),
            SymbolKind::Sequence => {
                if position < end && self.input[position] == symbol {
                    self.match_members(expansion, member + 1, position + 1, end, active, failed)
                        .map(|mut rest| {
                            rest.insert(0, ParseTree { node: symbol, children: Vec::new() });
                            rest
                        })
                } else {
                    None
                }
            }
            SymbolKind::NonTerminal => (position..=end).find_map(|split| {
                let subtree = self.build_node(symbol, position, split, active, failed)?;
                let mut rest =
                    self.match_members(expansion, member + 1, split, end, active, failed)?;
                rest.insert(0, subtree);
                Some(rest)
            }),
        };
        if found.is_none() {
            failed.insert(key);
        }
        found
    }
}
