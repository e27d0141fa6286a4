//! The grammar graph: an id-keyed arena of nodes and expansions.
//!
//! Nodes and expansions reference each other in both directions (children
//! and parent back-edges), so everything lives in two arenas and every edge
//! is an id. The graph is built from parsed rules, then normalized in
//! passes: flag propagation, pruning, regex simplification, root fixing and
//! parse-node insertion for the Earley path.

use ahash::AHashSet;
use indexmap::{IndexMap, IndexSet};
use tracing::{debug, warn};

use crate::grammar::parse;

pub type NodeId = u64;
pub type ExpansionId = u64;

bitflags::bitflags! {
    /// What a node or expansion can produce, plus terminal character-class
    /// markers.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct NodeFlags: u64 {
        const PRODUCE_TERMINALS = 0x1;
        const PRODUCE_NONTERMINALS = 0x2;
        const PRODUCE_SEQUENCE = 0x4;
        const PRODUCE_EMPTY_WORD = 0x8;
        const TERMINAL_CHAR_CLASS = 0x10;
        const CHAR_CLASS_ASCII = 0x20;
        const CHAR_CLASS_ALPHA = 0x40;
        const CHAR_CLASS_ALNUM = 0x80;
        const CHAR_CLASS_DIGIT = 0x100;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SymbolKind {
    Terminal,
    #[default]
    NonTerminal,
    /// A non-terminal whose appearance corresponds to one token of the
    /// materialized input.
    Sequence,
}

impl SymbolKind {
    pub const fn encode(self) -> u32 {
        match self {
            SymbolKind::Terminal => 0,
            SymbolKind::NonTerminal => 1,
            SymbolKind::Sequence => 2,
        }
    }

    pub fn decode(value: u32) -> Option<Self> {
        match value {
            0 => Some(SymbolKind::Terminal),
            1 => Some(SymbolKind::NonTerminal),
            2 => Some(SymbolKind::Sequence),
            _ => None,
        }
    }

    const fn produce_flag(self) -> NodeFlags {
        match self {
            SymbolKind::Terminal => NodeFlags::PRODUCE_TERMINALS,
            SymbolKind::NonTerminal => NodeFlags::PRODUCE_NONTERMINALS,
            SymbolKind::Sequence => NodeFlags::PRODUCE_SEQUENCE,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct GrammarNode {
    pub id: NodeId,
    pub identifier: String,
    /// Raw right-hand side; emptied once the node has been constructed.
    pub derivation: String,
    pub kind: SymbolKind,
    pub expansions: Vec<ExpansionId>,
    pub parents: IndexSet<ExpansionId>,
    pub flags: NodeFlags,
    pub reachable: bool,
    pub producing: bool,
    pub remove: bool,
}

impl GrammarNode {
    pub fn is_leaf(&self) -> bool {
        self.kind == SymbolKind::Terminal
    }

    pub fn is_sequence(&self) -> bool {
        self.kind == SymbolKind::Sequence
    }

    fn is_constructed(&self) -> bool {
        self.derivation.is_empty()
            && if self.is_leaf() { self.expansions.is_empty() } else { !self.expansions.is_empty() }
    }

    pub fn display_name(&self) -> String {
        match self.kind {
            SymbolKind::Terminal => format!("T_{}", self.identifier),
            SymbolKind::NonTerminal => format!("NT_{}", self.identifier),
            SymbolKind::Sequence => format!("SEQ_{}", self.identifier),
        }
    }
}

/// One alternative of a non-terminal's right-hand side.
#[derive(Debug, Clone)]
pub struct GrammarExpansion {
    pub id: ExpansionId,
    pub parent: NodeId,
    pub kind: ExpansionKind,
    pub weight: f32,
    pub flags: NodeFlags,
    pub producing: bool,
    pub remove: bool,
    pub nonterminals: i32,
    pub seq_nonterminals: i32,
    pub terminals: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExpansionKind {
    /// Ordered concatenation of nodes. Empty produces the empty word.
    Nodes(Vec<NodeId>),
    /// Kleene repetition of a single node: star for `min == 0`, plus for
    /// `min == 1`.
    Repeat { node: NodeId, min: u32 },
}

impl GrammarExpansion {
    fn new(id: ExpansionId, parent: NodeId, kind: ExpansionKind, weight: f32) -> Self {
        Self {
            id,
            parent,
            kind,
            weight,
            flags: NodeFlags::empty(),
            producing: false,
            remove: false,
            nonterminals: 0,
            seq_nonterminals: 0,
            terminals: 0,
        }
    }

    pub fn is_repeat(&self) -> bool {
        matches!(self.kind, ExpansionKind::Repeat { .. })
    }

    pub fn node_ids(&self) -> &[NodeId] {
        match &self.kind {
            ExpansionKind::Nodes(nodes) => nodes,
            ExpansionKind::Repeat { .. } => &[],
        }
    }
}

fn detect_char_class(identifier: &str) -> NodeFlags {
    let mut flags = NodeFlags::empty();
    if let Some(open) = identifier.find("[:")
        && identifier[open..].contains(":]")
    {
        flags |= NodeFlags::TERMINAL_CHAR_CLASS;
        if identifier.contains("[:ascii:]") {
            flags |= NodeFlags::CHAR_CLASS_ASCII;
        } else if identifier.contains("[:alpha:]") {
            flags |= NodeFlags::CHAR_CLASS_ALPHA;
        } else if identifier.contains("[:alnum:]") {
            flags |= NodeFlags::CHAR_CLASS_ALNUM;
        } else if identifier.contains("[:digit:]") {
            flags |= NodeFlags::CHAR_CLASS_DIGIT;
        }
    }
    flags
}

/// The grammar graph plus its bookkeeping sets.
#[derive(Debug, Clone, Default)]
pub struct GrammarTree {
    pub nodes: IndexMap<NodeId, GrammarNode>,
    pub expansions: IndexMap<ExpansionId, GrammarExpansion>,
    pub nonterminals: IndexSet<NodeId>,
    pub terminals: IndexSet<NodeId>,
    /// Rules in source order, for round-trip printing.
    pub rule_order: Vec<NodeId>,
    pub root: Option<NodeId>,
    /// Synthetic wrapper nodes inserted for the Earley parser.
    pub parse_nodes: AHashSet<NodeId>,
    pub next_id: u64,
    pub cycles: i32,
    pub valid: bool,
    /// True iff the whole sequence level collapsed to a single regex.
    pub simple: bool,
}

impl GrammarTree {
    pub fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    pub fn node(&self, id: NodeId) -> &GrammarNode {
        &self.nodes[&id]
    }

    pub fn expansion(&self, id: ExpansionId) -> &GrammarExpansion {
        &self.expansions[&id]
    }

    /// Registers a rule symbol with its raw right-hand side.
    pub fn add_symbol(&mut self, symbol: &str, derivation: &str, kind: SymbolKind) -> NodeId {
        let mut identifier = symbol.to_owned();
        let mut derivation = derivation.to_owned();
        parse::remove_whitespace_outside_quotes(&mut identifier);
        parse::remove_whitespace_outside_quotes(&mut derivation);
        debug!(symbol = %identifier, rhs = %derivation, "adding rule symbol");

        let id = self.next_id();
        let node = GrammarNode { id, identifier, derivation, kind, ..GrammarNode::default() };
        self.nodes.insert(id, node);
        self.nonterminals.insert(id);
        self.rule_order.push(id);
        id
    }

    pub fn find_node(&self, identifier: &str) -> Option<NodeId> {
        self.nonterminals
            .iter()
            .copied()
            .find(|id| self.nodes.get(id).is_some_and(|n| n.identifier == identifier))
    }

    pub fn set_root(&mut self, id: NodeId) {
        self.root = Some(id);
    }

    /// Replaces the raw right-hand sides with actual expansions, then runs
    /// flag propagation and pruning. Returns false when a referenced symbol
    /// does not exist.
    pub fn construct(&mut self) -> bool {
        let mut complete = true;
        let rule_ids: Vec<NodeId> = self.nonterminals.iter().copied().collect();
        for node_id in rule_ids {
            if self.nodes[&node_id].is_constructed() {
                continue;
            }
            let derivation = std::mem::take(&mut self.nodes.get_mut(&node_id).unwrap().derivation);
            for alternative in parse::split_outside_quotes(&derivation, "|", false) {
                let mut weight = 0.0f32;
                let mut members: Vec<NodeId> = Vec::new();
                for production in parse::split_outside_quotes(&alternative, "~", true) {
                    if let Some(wgt) = parse::parse_weight(&production) {
                        weight = wgt;
                    } else if parse::is_nonterminal_reference(&production) {
                        match self.find_node(&production) {
                            Some(child) => members.push(child),
                            None => {
                                warn!(symbol = %production, "unknown symbol in derivation");
                                complete = false;
                            }
                        }
                    } else if parse::is_empty_production(&production) {
                        // An empty alternative derives the empty word.
                    } else {
                        let identifier = parse::unescape_terminal(&production);
                        let terminal_id = self.next_id();
                        let terminal = GrammarNode {
                            id: terminal_id,
                            identifier,
                            kind: SymbolKind::Terminal,
                            flags: NodeFlags::PRODUCE_TERMINALS,
                            producing: true,
                            ..GrammarNode::default()
                        };
                        self.terminals.insert(terminal_id);
                        self.nodes.insert(terminal_id, terminal);
                        members.push(terminal_id);
                    }
                }
                let expansion_id = self.next_id();
                for &member in &members {
                    self.nodes.get_mut(&member).unwrap().parents.insert(expansion_id);
                }
                let expansion =
                    GrammarExpansion::new(expansion_id, node_id, ExpansionKind::Nodes(members), weight);
                self.expansions.insert(expansion_id, expansion);
                self.nodes.get_mut(&node_id).unwrap().expansions.push(expansion_id);
            }
            if !self.nodes[&node_id].is_constructed() {
                warn!(node = %self.nodes[&node_id].identifier, "rule produced no expansions");
                complete = false;
            }
        }

        self.gather_flags();
        self.prune(false);
        complete && self.root.is_some_and(|root| self.nodes.contains_key(&root))
    }

    // ---- flag propagation -------------------------------------------------

    /// Recomputes reachability, productivity, flag sets and the per-expansion
    /// symbol counts for the whole graph, starting from the root.
    pub fn gather_flags(&mut self) {
        for node in self.nodes.values_mut() {
            node.reachable = false;
            node.producing = false;
            node.remove = false;
            node.flags = NodeFlags::empty();
        }
        for expansion in self.expansions.values_mut() {
            expansion.flags = NodeFlags::empty();
            expansion.producing = false;
            expansion.remove = false;
            expansion.nonterminals = 0;
            expansion.seq_nonterminals = 0;
            expansion.terminals = 0;
        }
        let Some(root) = self.root else { return };
        let mut finished = AHashSet::new();
        let mut path = AHashSet::new();
        self.gather_node_flags(root, &mut path, &mut finished);
    }

    fn gather_node_flags(
        &mut self,
        id: NodeId,
        path: &mut AHashSet<u64>,
        finished: &mut AHashSet<u64>,
    ) {
        let node = self.nodes.get_mut(&id).expect("node in arena");
        node.reachable = true;
        path.insert(id);
        if node.is_leaf() {
            node.producing = true;
            node.flags |= NodeFlags::PRODUCE_TERMINALS | detect_char_class(&node.identifier);
            finished.insert(id);
            path.remove(&id);
            return;
        }

        let expansions = node.expansions.clone();
        // A cycling expansion cannot finitely produce anything on its own, so
        // it is treated as non-producing for this traversal. A useful node
        // always has another producing path.
        let mut skip = AHashSet::new();
        for expansion_id in &expansions {
            if !finished.contains(expansion_id) {
                if path.contains(expansion_id) {
                    skip.insert(*expansion_id);
                    self.cycles += 1;
                } else {
                    self.gather_expansion_flags(*expansion_id, path, finished);
                }
            }
        }

        let mut producing = false;
        let mut flags = self.nodes[&id].kind.produce_flag();
        for expansion_id in &expansions {
            if skip.contains(expansion_id) {
                continue;
            }
            let expansion = &self.expansions[expansion_id];
            producing |= expansion.producing;
            flags |= expansion.flags;
        }
        let node = self.nodes.get_mut(&id).unwrap();
        node.producing = producing;
        node.flags = flags;
        finished.insert(id);
        path.remove(&id);
    }

    fn gather_expansion_flags(
        &mut self,
        id: ExpansionId,
        path: &mut AHashSet<u64>,
        finished: &mut AHashSet<u64>,
    ) {
        path.insert(id);
        let kind = self.expansions[&id].kind.clone();
        let member_ids: Vec<NodeId> = match &kind {
            ExpansionKind::Nodes(nodes) => nodes.clone(),
            ExpansionKind::Repeat { node, .. } => vec![*node],
        };

        let mut producing = true;
        let mut flags = NodeFlags::empty();
        let mut nonterminals = 0;
        let mut seq_nonterminals = 0;
        let mut terminals = 0;
        for member in member_ids {
            if !finished.contains(&member) {
                self.gather_node_flags(member, path, finished);
            }
            let node = &self.nodes[&member];
            producing &= node.producing;
            flags |= node.flags;
            match node.kind {
                SymbolKind::NonTerminal => {
                    flags |= NodeFlags::PRODUCE_NONTERMINALS;
                    nonterminals += 1;
                }
                SymbolKind::Sequence => flags |= NodeFlags::PRODUCE_SEQUENCE,
                SymbolKind::Terminal => {
                    flags |= NodeFlags::PRODUCE_TERMINALS;
                    terminals += 1;
                }
            }
            if node.flags.contains(NodeFlags::PRODUCE_SEQUENCE) {
                seq_nonterminals += 1;
            }
        }
        match kind {
            ExpansionKind::Nodes(nodes) if nodes.is_empty() => flags |= NodeFlags::PRODUCE_EMPTY_WORD,
            ExpansionKind::Repeat { min: 0, .. } => flags |= NodeFlags::PRODUCE_EMPTY_WORD,
            _ => {}
        }

        let expansion = self.expansions.get_mut(&id).unwrap();
        expansion.producing = producing;
        expansion.flags = flags;
        expansion.nonterminals = nonterminals;
        expansion.seq_nonterminals = seq_nonterminals;
        expansion.terminals = terminals;
        finished.insert(id);
        path.remove(&id);
    }

    // ---- pruning ----------------------------------------------------------

    /// Removes everything that is unreachable or non-producing, propagating
    /// removal up and down until a fixed point. Afterwards every remaining
    /// node is reachable and producing and every remaining expansion is
    /// producing.
    pub fn prune(&mut self, prune_all: bool) {
        #[derive(Clone, Copy)]
        enum Obj {
            Node(NodeId),
            Exp(ExpansionId),
        }

        let Some(root) = self.root else { return };
        let mut to_remove: AHashSet<u64> = AHashSet::new();
        let mut touched: AHashSet<u64> = AHashSet::new();
        let mut stack: Vec<Obj> = vec![Obj::Node(root)];

        for &id in self.nonterminals.iter().chain(self.terminals.iter()) {
            if !self.nodes[&id].reachable {
                stack.push(Obj::Node(id));
            }
        }
        for (&id, expansion) in &self.expansions {
            if !self.nodes.contains_key(&expansion.parent) {
                stack.push(Obj::Exp(id));
            }
        }

        while let Some(obj) = stack.pop() {
            match obj {
                Obj::Node(id) => {
                    let Some(node) = self.nodes.get(&id) else { continue };
                    if !node.producing || node.remove || !node.reachable || prune_all {
                        if !node.producing {
                            warn!(node = %node.display_name(), "not producing, removing");
                        } else if !node.reachable {
                            warn!(node = %node.display_name(), "not reachable, removing");
                        }
                        let parents: Vec<ExpansionId> = node.parents.iter().copied().collect();
                        let expansions = node.expansions.clone();
                        {
                            let node = self.nodes.get_mut(&id).unwrap();
                            node.parents.clear();
                            node.expansions.clear();
                            node.remove = true;
                        }
                        to_remove.insert(id);
                        for parent in parents {
                            if let Some(exp) = self.expansions.get_mut(&parent) {
                                exp.remove = true;
                                stack.push(Obj::Exp(parent));
                            }
                        }
                        for expansion in expansions {
                            if let Some(exp) = self.expansions.get_mut(&expansion) {
                                exp.remove = true;
                                stack.push(Obj::Exp(expansion));
                            }
                        }
                    } else {
                        for &expansion in &node.expansions {
                            if touched.insert(expansion) {
                                stack.push(Obj::Exp(expansion));
                            }
                        }
                    }
                }
                Obj::Exp(id) => {
                    let Some(expansion) = self.expansions.get(&id) else { continue };
                    let members: Vec<NodeId> = match &expansion.kind {
                        ExpansionKind::Nodes(nodes) => nodes.clone(),
                        ExpansionKind::Repeat { node, .. } => vec![*node],
                    };
                    if expansion.remove || !expansion.producing || prune_all {
                        if !expansion.producing {
                            warn!(expansion = id, "not producing, removing");
                        }
                        to_remove.insert(id);
                        let parent = expansion.parent;
                        if let Some(parent_node) = self.nodes.get_mut(&parent) {
                            parent_node.expansions.retain(|&e| e != id);
                        }
                        for member in members {
                            let root_id = self.root;
                            if let Some(node) = self.nodes.get_mut(&member)
                                && !node.remove
                            {
                                node.parents.shift_remove(&id);
                                if node.parents.is_empty() && Some(node.id) != root_id {
                                    node.remove = true;
                                    stack.push(Obj::Node(member));
                                }
                            }
                        }
                    } else {
                        for member in members {
                            if touched.insert(member) {
                                stack.push(Obj::Node(member));
                            }
                        }
                    }
                }
            }
        }

        self.nodes.retain(|id, _| !to_remove.contains(id));
        self.expansions.retain(|id, _| !to_remove.contains(id));
        self.nonterminals.retain(|id| !to_remove.contains(id));
        self.terminals.retain(|id| !to_remove.contains(id));
        if let Some(root) = self.root
            && !self.nodes.contains_key(&root)
        {
            self.root = None;
        }
    }

    // ---- simple-grammar detection and rewrite -----------------------------

    /// Detects grammars whose entire sequence level collapses to a single
    /// regex over one sequence atom, and rewrites the matching rules to
    /// [`ExpansionKind::Repeat`]. Enables O(1) extraction and extension
    /// without the Earley parser.
    pub fn simplify_sequences(&mut self) -> bool {
        let Some(root) = self.root else { return false };
        if !self.nodes[&root].flags.contains(NodeFlags::PRODUCE_SEQUENCE) {
            return false;
        }

        // Rules at or below the sequence level never need rewriting.
        let mut handled: Vec<bool> = self
            .rule_order
            .iter()
            .map(|id| {
                self.nodes
                    .get(id)
                    .is_none_or(|n| n.is_sequence() || !n.flags.contains(NodeFlags::PRODUCE_SEQUENCE))
            })
            .collect();

        // Trivial forwarders A := B are resolved by substitution.
        let mut forward: IndexMap<NodeId, NodeId> = IndexMap::new();
        for (index, &rule) in self.rule_order.iter().enumerate() {
            if handled[index] {
                continue;
            }
            let node = &self.nodes[&rule];
            if node.is_sequence() {
                continue;
            }
            if let [only] = node.expansions[..]
                && let ExpansionKind::Nodes(members) = &self.expansions[&only].kind
                && let [target] = members[..]
            {
                handled[index] = true;
                forward.insert(rule, target);
            }
        }

        let representative = |mut id: NodeId| {
            let mut steps = 0;
            while let Some(&next) = forward.get(&id) {
                id = next;
                steps += 1;
                if steps > forward.len() {
                    break;
                }
            }
            id
        };
        let equal = |lhs: NodeId, rhs: NodeId| lhs == rhs || representative(lhs) == representative(rhs);

        let mut candidates: Vec<NodeId> = Vec::new();
        let mut simple = true;
        for (index, &rule) in self.rule_order.iter().enumerate() {
            if !handled[index] {
                if self.regex_shape(rule, &equal).is_some() {
                    handled[index] = true;
                    candidates.push(rule);
                } else {
                    simple = false;
                }
            }
        }
        if !simple {
            return false;
        }

        self.resolve_forwarders();
        for rule in candidates {
            let Some((child, min)) = self.regex_shape(rule, |a, b| a == b) else {
                warn!(rule, "regex shape vanished after forwarder resolution");
                continue;
            };
            let regex_id = self.next_id();
            let old_expansions = self.nodes[&rule].expansions.clone();
            for expansion_id in old_expansions {
                let members: Vec<NodeId> = self.expansions[&expansion_id].node_ids().to_vec();
                for member in members {
                    if let Some(node) = self.nodes.get_mut(&member) {
                        node.parents.shift_remove(&expansion_id);
                    }
                }
                self.expansions.shift_remove(&expansion_id);
            }
            let regex = GrammarExpansion::new(
                regex_id,
                rule,
                ExpansionKind::Repeat { node: child, min },
                0.0,
            );
            self.expansions.insert(regex_id, regex);
            self.nodes.get_mut(&child).unwrap().parents.insert(regex_id);
            let node = self.nodes.get_mut(&rule).unwrap();
            node.expansions = vec![regex_id];
        }

        self.gather_flags();
        self.prune(false);
        self.simple = true;
        true
    }

    /// Matches one rule against the accepted Kleene shapes. Returns the
    /// repeated child and the lower bound.
    fn regex_shape(&self, rule: NodeId, equal: impl Fn(NodeId, NodeId) -> bool) -> Option<(NodeId, u32)> {
        let node = &self.nodes[&rule];
        let [first, second] = node.expansions[..] else { return None };
        let lists: [&[NodeId]; 2] =
            [self.expansions[&first].node_ids(), self.expansions[&second].node_ids()];

        let matches = |single: &[NodeId], pair: &[NodeId], min: u32| -> Option<(NodeId, u32)> {
            let &[a, b] = pair else { return None };
            match single {
                // star: the other alternative is empty
                [] if min == 0 => {
                    if equal(a, rule) {
                        Some((b, 0))
                    } else if equal(b, rule) {
                        Some((a, 0))
                    } else {
                        None
                    }
                }
                // plus: the other alternative is the repeated atom itself
                &[base] if min == 1 => {
                    if equal(a, rule) && equal(b, base) {
                        Some((b, 1))
                    } else if equal(b, rule) && equal(a, base) {
                        Some((a, 1))
                    } else if equal(a, base) && equal(b, base) {
                        Some((base, 1))
                    } else {
                        None
                    }
                }
                _ => None,
            }
        };

        match (lists[0].len(), lists[1].len()) {
            (1, 2) => matches(lists[0], lists[1], 1),
            (2, 1) => matches(lists[1], lists[0], 1),
            (0, 2) => matches(lists[0], lists[1], 0),
            (2, 0) => matches(lists[1], lists[0], 0),
            _ => None,
        }
    }

    /// Rewrites every `A := B` forwarder so that all references to A point
    /// directly at B; A itself is left for the pruning pass.
    fn resolve_forwarders(&mut self) {
        let rules: Vec<NodeId> = self.rule_order.clone();
        for rule in rules {
            let Some(node) = self.nodes.get(&rule) else { continue };
            if node.is_sequence() {
                continue;
            }
            let [only] = node.expansions[..] else { continue };
            let ExpansionKind::Nodes(members) = &self.expansions[&only].kind else { continue };
            let [target] = members[..] else { continue };

            self.nodes.get_mut(&target).unwrap().parents.shift_remove(&only);
            let parents: Vec<ExpansionId> = self.nodes[&rule].parents.iter().copied().collect();
            if parents.is_empty() {
                if self.root == Some(rule) {
                    self.root = Some(target);
                }
            } else {
                for parent in parents {
                    let expansion = self.expansions.get_mut(&parent).unwrap();
                    if let ExpansionKind::Nodes(members) = &mut expansion.kind {
                        for member in members.iter_mut() {
                            if *member == rule {
                                *member = target;
                            }
                        }
                    }
                    self.nodes.get_mut(&target).unwrap().parents.insert(parent);
                }
                self.nodes.get_mut(&rule).unwrap().parents.clear();
            }
            self.nodes.get_mut(&rule).unwrap().expansions.clear();
            self.expansions.shift_remove(&only);
        }
    }

    // ---- root normalization and parse preparation -------------------------

    /// Wraps the root in a fresh `'FixedStart` non-terminal when it has more
    /// than one expansion, more than one child, or resolves to a single
    /// terminal. Simple grammars keep their root as the regex anchor.
    pub fn fix_root(&mut self) {
        if self.simple {
            return;
        }
        let Some(root) = self.root else { return };
        let needs_fix = {
            let node = &self.nodes[&root];
            match node.expansions[..] {
                [] => false,
                [only] => match self.expansions[&only].node_ids() {
                    [single] => self.nodes[single].is_leaf(),
                    members => members.len() > 1,
                },
                _ => true,
            }
        };
        if !needs_fix {
            return;
        }

        let node_id = self.next_id();
        let expansion_id = self.next_id();
        let wrapper = GrammarNode {
            id: node_id,
            identifier: "'FixedStart".to_owned(),
            derivation: String::new(),
            kind: SymbolKind::NonTerminal,
            expansions: vec![expansion_id],
            ..GrammarNode::default()
        };
        let mut expansion =
            GrammarExpansion::new(expansion_id, node_id, ExpansionKind::Nodes(vec![root]), 0.0);
        expansion.nonterminals = 1;
        self.nodes.insert(node_id, wrapper);
        self.expansions.insert(expansion_id, expansion);
        self.nodes.get_mut(&root).unwrap().parents.insert(expansion_id);
        self.nonterminals.insert(node_id);
        self.rule_order.push(node_id);
        self.root = Some(node_id);
        self.gather_flags();
    }

    /// Inserts a synthetic wrapper `PN := S` between every sequence node S
    /// and its parents, giving the Earley parser a uniform anchor per
    /// sequence atom. Only meaningful on the parse copy of the graph.
    pub fn insert_parse_nodes(&mut self) {
        if self.simple {
            return;
        }
        let sequence_nodes: Vec<NodeId> = self
            .nonterminals
            .iter()
            .copied()
            .filter(|id| self.nodes[id].is_sequence())
            .collect();
        for sequence in sequence_nodes {
            let wrapper_id = self.next_id();
            let expansion_id = self.next_id();
            let parents: Vec<ExpansionId> =
                self.nodes[&sequence].parents.iter().copied().collect();
            for &parent in &parents {
                let expansion = self.expansions.get_mut(&parent).unwrap();
                match &mut expansion.kind {
                    ExpansionKind::Nodes(members) => {
                        for member in members.iter_mut() {
                            if *member == sequence {
                                *member = wrapper_id;
                            }
                        }
                    }
                    ExpansionKind::Repeat { node, .. } => {
                        if *node == sequence {
                            *node = wrapper_id;
                        }
                    }
                }
            }

            let wrapper = GrammarNode {
                id: wrapper_id,
                identifier: format!("'ParseNode{wrapper_id}"),
                derivation: String::new(),
                kind: SymbolKind::NonTerminal,
                expansions: vec![expansion_id],
                parents: parents.iter().copied().collect(),
                ..GrammarNode::default()
            };
            let mut expansion = GrammarExpansion::new(
                expansion_id,
                wrapper_id,
                ExpansionKind::Nodes(vec![sequence]),
                0.0,
            );
            expansion.nonterminals = 1;
            self.nodes.insert(wrapper_id, wrapper);
            self.expansions.insert(expansion_id, expansion);
            self.nonterminals.insert(wrapper_id);
            self.parse_nodes.insert(wrapper_id);
            self.rule_order.push(wrapper_id);

            let node = self.nodes.get_mut(&sequence).unwrap();
            node.parents.clear();
            node.parents.insert(expansion_id);
        }

        // The root must not itself be a sequence atom.
        if let Some(root) = self.root
            && self.nodes[&root].is_sequence()
            && let Some(&parent_expansion) = self.nodes[&root].parents.first()
        {
            self.root = Some(self.expansions[&parent_expansion].parent);
        }
        self.gather_flags();
    }

    // ---- rendering --------------------------------------------------------

    /// Renders the grammar back to its textual form, rules in source order.
    pub fn render(&self) -> String {
        let mut out = String::from("Grammar(\n");
        for id in &self.rule_order {
            let Some(node) = self.nodes.get(id) else { continue };
            out.push('\t');
            out.push_str(&node.identifier);
            out.push_str(" := ");
            for (index, expansion_id) in node.expansions.iter().enumerate() {
                if index > 0 {
                    out.push_str(" | ");
                }
                out.push_str(&self.render_expansion(*expansion_id));
            }
            out.push_str(",\n");
        }
        out.push_str(")\n");
        out
    }

    fn render_expansion(&self, id: ExpansionId) -> String {
        let expansion = &self.expansions[&id];
        match &expansion.kind {
            ExpansionKind::Nodes(members) => {
                let mut out = String::new();
                for (index, member) in members.iter().enumerate() {
                    if index > 0 {
                        out.push_str(" ~ ");
                    }
                    let node = &self.nodes[member];
                    if node.is_leaf() {
                        out.push('"');
                        out.push_str(&node.identifier);
                        out.push('"');
                    } else {
                        out.push_str(&node.identifier);
                    }
                }
                out
            }
            ExpansionKind::Repeat { node, min } => {
                let child = &self.nodes[node];
                let rendered = if child.is_leaf() {
                    format!("\"{}\"", child.identifier)
                } else {
                    child.identifier.clone()
                };
                format!("{rendered}{}", if *min == 0 { "*" } else { "+" })
            }
        }
    }

    pub fn memory_size(&self) -> usize {
        self.nodes
            .values()
            .map(|n| size_of::<GrammarNode>() + n.identifier.len() + n.expansions.len() * 8)
            .sum::<usize>()
            + self.expansions.len() * size_of::<GrammarExpansion>()
            + self.rule_order.len() * 8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(rules: &[(&str, &str, SymbolKind)]) -> GrammarTree {
        let mut tree = GrammarTree::default();
        for (symbol, derivation, kind) in rules {
            tree.add_symbol(symbol, derivation, *kind);
        }
        let root = tree.find_node("'start").unwrap();
        tree.set_root(root);
        tree.valid = tree.construct();
        tree
    }

    #[test]
    fn constructs_single_terminal_rule() {
        let tree = build(&[("'start", "\"a\"", SymbolKind::NonTerminal)]);
        assert!(tree.valid);
        let root = tree.root.unwrap();
        let node = tree.node(root);
        assert_eq!(node.expansions.len(), 1);
        let expansion = tree.expansion(node.expansions[0]);
        assert_eq!(expansion.terminals, 1);
        assert!(node.producing && node.reachable);
    }

    #[test]
    fn every_surviving_node_is_reachable_and_producing() {
        // 'dead recurses forever and must be pruned.
        let tree = build(&[
            ("'start", "'a | 'dead", SymbolKind::NonTerminal),
            ("'a", "\"x\"", SymbolKind::NonTerminal),
            ("'dead", "'dead ~ \"y\"", SymbolKind::NonTerminal),
        ]);
        assert!(tree.valid);
        assert!(tree.find_node("'dead").is_none());
        for node in tree.nodes.values() {
            assert!(node.reachable, "{} not reachable", node.identifier);
            assert!(node.producing, "{} not producing", node.identifier);
        }
        for expansion in tree.expansions.values() {
            assert!(expansion.producing);
            for member in expansion.node_ids() {
                assert!(tree.nodes.contains_key(member));
            }
        }
    }

    #[test]
    fn empty_alternative_sets_empty_word_flag() {
        let tree = build(&[
            ("'start", "'list", SymbolKind::NonTerminal),
            ("'list", " | \"x\" ~ 'list", SymbolKind::NonTerminal),
        ]);
        assert!(tree.valid);
        let list = tree.find_node("'list").unwrap();
        let flags = tree.node(list).flags;
        assert!(flags.contains(NodeFlags::PRODUCE_EMPTY_WORD));
    }

    #[test]
    fn detects_kleene_plus_grammar() {
        let mut tree = build(&[
            ("'start", "'SEQ_x ~ 'start | 'SEQ_x", SymbolKind::NonTerminal),
            ("'SEQ_x", "\"x\"", SymbolKind::Sequence),
        ]);
        assert!(tree.valid);
        assert!(tree.simplify_sequences());
        assert!(tree.simple);

        let root = tree.root.unwrap();
        let node = tree.node(root);
        assert_eq!(node.expansions.len(), 1);
        let expansion = tree.expansion(node.expansions[0]);
        match expansion.kind {
            ExpansionKind::Repeat { node: child, min } => {
                assert_eq!(min, 1);
                assert!(tree.node(child).is_sequence());
            }
            ref other => panic!("expected repeat, got {other:?}"),
        }
    }

    #[test]
    fn detects_kleene_star_grammar() {
        let mut tree = build(&[
            ("'start", " | 'SEQ_e ~ 'start", SymbolKind::NonTerminal),
            ("'SEQ_e", "\"e\"", SymbolKind::Sequence),
        ]);
        assert!(tree.valid);
        assert!(tree.simplify_sequences());
        let root = tree.root.unwrap();
        let expansion = tree.expansion(tree.node(root).expansions[0]);
        assert!(matches!(expansion.kind, ExpansionKind::Repeat { min: 0, .. }));
        assert!(expansion.flags.contains(NodeFlags::PRODUCE_EMPTY_WORD));
    }

    #[test]
    fn forwarders_are_followed_when_matching_shapes() {
        let mut tree = build(&[
            ("'start", "'rep", SymbolKind::NonTerminal),
            ("'rep", "'SEQ_t | 'SEQ_t ~ 'rep", SymbolKind::NonTerminal),
            ("'SEQ_t", "\"t\"", SymbolKind::Sequence),
        ]);
        assert!(tree.valid);
        assert!(tree.simplify_sequences());
        assert!(tree.simple);
    }

    #[test]
    fn rejects_grammars_with_real_structure() {
        let mut tree = build(&[
            ("'start", "'SEQ_a ~ 'SEQ_b | 'SEQ_a", SymbolKind::NonTerminal),
            ("'SEQ_a", "\"a\"", SymbolKind::Sequence),
            ("'SEQ_b", "\"b\"", SymbolKind::Sequence),
        ]);
        assert!(tree.valid);
        assert!(!tree.simplify_sequences());
        assert!(!tree.simple);
    }

    #[test]
    fn random_candidate_rules_simplify_iff_shape_matches() {
        // All four plus orderings must be accepted.
        for rhs in
            ["'SEQ_s | 'start ~ 'SEQ_s", "'SEQ_s | 'SEQ_s ~ 'start", "'start ~ 'SEQ_s | 'SEQ_s", "'SEQ_s ~ 'start | 'SEQ_s"]
        {
            let mut tree = build(&[
                ("'start", rhs, SymbolKind::NonTerminal),
                ("'SEQ_s", "\"s\"", SymbolKind::Sequence),
            ]);
            assert!(tree.valid, "rhs {rhs}");
            assert!(tree.simplify_sequences(), "rhs {rhs}");
        }
        // A three-membered alternative is not a regex shape.
        let mut tree = build(&[
            ("'start", "'SEQ_s | 'SEQ_s ~ 'SEQ_s ~ 'start", SymbolKind::NonTerminal),
            ("'SEQ_s", "\"s\"", SymbolKind::Sequence),
        ]);
        assert!(tree.valid);
        assert!(!tree.simplify_sequences());
    }

    #[test]
    fn fix_root_wraps_branching_roots() {
        let mut tree = build(&[
            ("'start", "'a | 'b", SymbolKind::NonTerminal),
            ("'a", "\"a\"", SymbolKind::NonTerminal),
            ("'b", "\"b\"", SymbolKind::NonTerminal),
        ]);
        assert!(tree.valid);
        let old_root = tree.root.unwrap();
        tree.fix_root();
        let new_root = tree.root.unwrap();
        assert_ne!(old_root, new_root);
        assert_eq!(tree.node(new_root).identifier, "'FixedStart");
        assert_eq!(tree.expansion(tree.node(new_root).expansions[0]).node_ids(), &[old_root]);
    }

    #[test]
    fn parse_nodes_wrap_every_sequence_atom() {
        let mut tree = build(&[
            ("'start", "'SEQ_a ~ 'SEQ_b | 'SEQ_a", SymbolKind::NonTerminal),
            ("'SEQ_a", "\"a\"", SymbolKind::Sequence),
            ("'SEQ_b", "\"b\"", SymbolKind::Sequence),
        ]);
        assert!(tree.valid);
        tree.fix_root();
        let mut parse_tree = tree.clone();
        parse_tree.insert_parse_nodes();
        assert_eq!(parse_tree.parse_nodes.len(), 2);
        // No expansion above the sequence level references a sequence node
        // directly any more.
        for expansion in parse_tree.expansions.values() {
            if parse_tree.parse_nodes.contains(&expansion.parent) {
                continue;
            }
            for member in expansion.node_ids() {
                assert!(
                    !parse_tree.nodes[member].is_sequence(),
                    "raw sequence reference survived"
                );
            }
        }
    }

    #[test]
    fn render_round_trips_rule_order() {
        let tree = build(&[
            ("'start", "'a ~ \"lit\"", SymbolKind::NonTerminal),
            ("'a", "\"x\" | \"y\"", SymbolKind::NonTerminal),
        ]);
        let rendered = tree.render();
        assert!(rendered.starts_with("Grammar(\n"));
        assert!(rendered.contains("'start := 'a ~ \"lit\","));
        assert!(rendered.contains("'a := \"x\" | \"y\","));
    }

    #[test]
    fn char_class_flags() {
        assert!(detect_char_class("[:ascii:]").contains(NodeFlags::CHAR_CLASS_ASCII));
        assert!(detect_char_class("[:digit:]").contains(NodeFlags::CHAR_CLASS_DIGIT));
        assert!(detect_char_class("plain").is_empty());
    }
}
