//! Derivation trees: the tagged node model and the persisted tree form.
//!
//! Node payloads are never serialized. A tree that carries `regenerate` can
//! be rebuilt on demand from its grammar id, stored seed and target length
//! (or from its parent linkage for extracted/extended trees), so the on-disk
//! record is only the reconstruction metadata.

use std::any::Any;
use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use smallvec::SmallVec;

use crate::codec::{CodecError, CodecResult, Decoder, Encoder};
use crate::slab;
use crate::store::{Data, Form, FormCore, FormFlags, FormId, FormType, LoadResolver, read_version};

/// Identifier of a grammar-graph node, distinct from [`FormId`].
pub type GrammarId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Terminal,
    NonTerminal,
    Sequence,
}

/// One node of a derivation tree. Terminal nodes carry produced text and no
/// children; non-terminal and sequence nodes carry ordered children.
#[derive(Debug)]
pub enum Node {
    Terminal(TerminalNode),
    NonTerminal(BranchNode),
    Sequence(BranchNode),
}

#[derive(Debug, Default)]
pub struct TerminalNode {
    pub grammar_id: GrammarId,
    pub content: String,
}

#[derive(Debug, Default)]
pub struct BranchNode {
    pub grammar_id: GrammarId,
    pub children: Vec<Box<Node>>,
}

/// Allocation counts reported by tree copies for bulk accounting.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CopyCounts {
    pub nodes: i64,
    pub sequence_nodes: i64,
}

impl Node {
    pub fn kind(&self) -> NodeKind {
        match self {
            Node::Terminal(_) => NodeKind::Terminal,
            Node::NonTerminal(_) => NodeKind::NonTerminal,
            Node::Sequence(_) => NodeKind::Sequence,
        }
    }

    pub fn grammar_id(&self) -> GrammarId {
        match self {
            Node::Terminal(t) => t.grammar_id,
            Node::NonTerminal(b) | Node::Sequence(b) => b.grammar_id,
        }
    }

    pub fn children(&self) -> &[Box<Node>] {
        match self {
            Node::Terminal(_) => &[],
            Node::NonTerminal(b) | Node::Sequence(b) => &b.children,
        }
    }

    pub fn branch_mut(&mut self) -> Option<&mut BranchNode> {
        match self {
            Node::Terminal(_) => None,
            Node::NonTerminal(b) | Node::Sequence(b) => Some(b),
        }
    }

    /// Deep copy through the calling thread's node pools. Returns the new
    /// root together with allocation counts. Iterative so that deeply
    /// right-recursive trees cannot exhaust the stack.
    pub fn copy_with_pools(&self, pools: &mut slab::NodePools) -> (Box<Node>, CopyCounts) {
        struct Flat<'a> {
            src: &'a Node,
            child_slots: Vec<usize>,
        }

        let mut flat: Vec<Flat<'_>> = vec![Flat { src: self, child_slots: Vec::new() }];
        let mut stack = vec![0usize];
        while let Some(index) = stack.pop() {
            let src = flat[index].src;
            let mut slots = Vec::with_capacity(src.children().len());
            for child in src.children() {
                let slot = flat.len();
                flat.push(Flat { src: child.as_ref(), child_slots: Vec::new() });
                slots.push(slot);
                stack.push(slot);
            }
            flat[index].child_slots = slots;
        }

        let mut counts = CopyCounts { nodes: flat.len() as i64, sequence_nodes: 0 };
        let mut built: Vec<Option<Box<Node>>> = (0..flat.len()).map(|_| None).collect();
        for index in (0..flat.len()).rev() {
            let entry = &flat[index];
            let node = match entry.src {
                Node::Terminal(t) => pools.new_terminal(t.grammar_id, &t.content),
                Node::NonTerminal(b) => {
                    let mut copy = pools.new_nonterminal(b.grammar_id);
                    fill_children(&mut copy, &entry.child_slots, &mut built);
                    copy
                }
                Node::Sequence(b) => {
                    counts.sequence_nodes += 1;
                    let mut copy = pools.new_sequence(b.grammar_id);
                    fill_children(&mut copy, &entry.child_slots, &mut built);
                    copy
                }
            };
            built[index] = Some(node);
        }
        let root = built[0].take().expect("root slot is always built");
        (root, counts)
    }

    /// Plain-allocation deep copy for diagnostic paths; bypasses the pools.
    pub fn copy_plain(&self) -> (Box<Node>, CopyCounts) {
        let mut counts = CopyCounts { nodes: 1, sequence_nodes: 0 };
        let root = copy_plain_node(self, &mut counts);
        (root, counts)
    }
}

fn copy_plain_node(node: &Node, counts: &mut CopyCounts) -> Box<Node> {
    match node {
        Node::Terminal(t) => Box::new(Node::Terminal(TerminalNode {
            grammar_id: t.grammar_id,
            content: t.content.clone(),
        })),
        Node::NonTerminal(b) | Node::Sequence(b) => {
            if node.kind() == NodeKind::Sequence {
                counts.sequence_nodes += 1;
            }
            let children = b
                .children
                .iter()
                .map(|child| {
                    counts.nodes += 1;
                    copy_plain_node(child, counts)
                })
                .collect();
            let branch = BranchNode { grammar_id: b.grammar_id, children };
            Box::new(match node.kind() {
                NodeKind::Sequence => Node::Sequence(branch),
                _ => Node::NonTerminal(branch),
            })
        }
    }
}

fn fill_children(node: &mut Node, slots: &[usize], built: &mut [Option<Box<Node>>]) {
    let branch = node.branch_mut().expect("branch node");
    branch.children.clear();
    branch
        .children
        .extend(slots.iter().map(|&slot| built[slot].take().expect("child built before parent")));
}

/// Materializes the token sequence of a tree by a left-to-right walk over
/// its sequence nodes: each sequence node yields one token holding the
/// terminal content beneath it. A tree without any sequence node yields its
/// whole terminal content as a single token.
pub fn materialize_sequence(root: &Node) -> Vec<String> {
    fn walk(node: &Node, current: Option<usize>, tokens: &mut Vec<String>) {
        match node {
            Node::Terminal(t) => {
                if let Some(index) = current {
                    tokens[index].push_str(&t.content);
                }
            }
            Node::Sequence(b) => {
                tokens.push(String::new());
                let index = tokens.len() - 1;
                for child in &b.children {
                    walk(child, Some(index), tokens);
                }
            }
            Node::NonTerminal(b) => {
                for child in &b.children {
                    walk(child, current, tokens);
                }
            }
        }
    }

    let mut tokens = Vec::new();
    walk(root, None, &mut tokens);
    if tokens.is_empty() {
        let mut yield_all = String::new();
        collect_terminals(root, &mut yield_all);
        if !yield_all.is_empty() || matches!(root, Node::Terminal(_)) {
            tokens.push(yield_all);
        }
    }
    tokens
}

fn collect_terminals(node: &Node, out: &mut String) {
    match node {
        Node::Terminal(t) => out.push_str(&t.content),
        Node::NonTerminal(b) | Node::Sequence(b) => {
            for child in &b.children {
                collect_terminals(child, out);
            }
        }
    }
}

/// How a tree relates to the tree it was produced from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParentMethod {
    /// Subset of a parent tree, produced by extraction.
    #[default]
    DeltaDebug,
    /// Produced by extending a parent tree.
    Extension,
}

impl ParentMethod {
    fn encode(self) -> u8 {
        match self {
            ParentMethod::DeltaDebug => 0,
            ParentMethod::Extension => 1,
        }
    }

    fn decode(value: u8) -> CodecResult<Self> {
        match value {
            0 => Ok(ParentMethod::DeltaDebug),
            1 => Ok(ParentMethod::Extension),
            other => Err(CodecError::BadDiscriminant {
                what: "ParentMethod",
                value: other as i64,
            }),
        }
    }
}

pub type Segments = SmallVec<[(i64, i64); 4]>;

/// Linkage back to the tree this one was derived from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParentInfo {
    pub method: ParentMethod,
    pub parent_id: FormId,
    /// Segments `(begin, length)` over the parent's sequence nodes.
    pub segments: Segments,
    /// Upper bound of the parent sequence considered, for trimmed sources.
    pub stop: i64,
    /// Whether `segments` describes the complement of the selection.
    pub complement: bool,
    /// Parent sequence length, kept for length arithmetic on freed parents.
    pub length: i64,
}

#[derive(Debug, Default)]
pub struct TreeState {
    pub root: Option<Box<Node>>,
    pub nodes: i64,
    pub sequence_nodes: i64,
    pub valid: bool,
    pub regenerate: bool,
    pub grammar_id: FormId,
    pub seed: u32,
    pub target_len: i32,
    pub parent: ParentInfo,
    pub input_id: FormId,
}

impl TreeState {
    /// Releases the node subtree back to the calling thread's pools.
    pub fn release_nodes(&mut self) {
        if let Some(root) = self.root.take() {
            slab::with_pools(|pools| pools.release(root));
        }
        self.nodes = 0;
        self.sequence_nodes = 0;
        self.valid = false;
    }
}

const CLASS_VERSION: i32 = 0x2;

/// The persisted derivation-tree form.
#[derive(Debug, Default)]
pub struct DerivationTree {
    core: FormCore,
    state: RwLock<TreeState>,
}

impl DerivationTree {
    pub fn read(&self) -> RwLockReadGuard<'_, TreeState> {
        self.state.read()
    }

    /// Write access; the form is tainted as changed.
    pub fn write(&self) -> RwLockWriteGuard<'_, TreeState> {
        self.core.set_changed();
        self.state.write()
    }

    pub fn is_valid(&self) -> bool {
        self.state.read().valid
    }

    pub fn sequence_len(&self) -> i64 {
        self.state.read().sequence_nodes
    }

    pub fn regenerate(&self) -> bool {
        self.state.read().regenerate
    }

    pub fn set_regenerate(&self, value: bool) {
        self.core.set_changed();
        self.state.write().regenerate = value;
    }

    pub fn input_id(&self) -> FormId {
        self.state.read().input_id
    }

    pub fn set_input_id(&self, id: FormId) {
        self.core.set_changed();
        self.state.write().input_id = id;
    }

    /// Copies all metadata and the node subtree into `other`.
    pub fn deep_copy(&self, other: &DerivationTree) {
        let src = self.state.read();
        let mut dst = other.write();
        dst.release_nodes();
        dst.nodes = src.nodes;
        dst.sequence_nodes = src.sequence_nodes;
        dst.valid = src.valid;
        dst.regenerate = src.regenerate;
        dst.grammar_id = src.grammar_id;
        dst.seed = src.seed;
        dst.target_len = src.target_len;
        dst.parent = src.parent.clone();
        dst.input_id = src.input_id;
        dst.root = src
            .root
            .as_ref()
            .map(|root| slab::with_pools(|pools| root.copy_with_pools(pools)).0);
    }

    pub fn print_form(&self) -> String {
        let state = self.state.read();
        format!(
            "[DevTree<{:#x}><parent {:#x}><len {}><valid {}><regen {}>]",
            self.core.form_id(),
            state.parent.parent_id,
            state.sequence_nodes,
            state.valid,
            state.regenerate,
        )
    }
}

impl Form for DerivationTree {
    fn form_type(&self) -> FormType {
        FormType::DevTree
    }

    fn core(&self) -> &FormCore {
        &self.core
    }

    fn write_data(&self, enc: &mut Encoder) -> CodecResult<()> {
        enc.write_i32(CLASS_VERSION)?;
        self.core.write_envelope(enc)?;

        let state = self.state.read();
        let mut block = Encoder::bounded(1 << 16);
        block.write_u64(state.grammar_id)?;
        block.write_bool(state.regenerate)?;
        block.write_u32(state.seed)?;
        block.write_i32(state.target_len)?;
        block.write_u8(state.parent.method.encode())?;
        block.write_u64(state.parent.parent_id)?;
        block.write_u64(state.parent.segments.len() as u64)?;
        for &(begin, length) in &state.parent.segments {
            block.write_i64(begin)?;
            block.write_i64(length)?;
        }
        block.write_i64(state.parent.length)?;
        block.write_i64(state.parent.stop)?;
        block.write_bool(state.parent.complement)?;
        block.write_u64(state.input_id)?;
        enc.write_block(block)
    }

    fn read_data(&self, dec: &mut Decoder<'_>, _resolver: &mut LoadResolver) -> CodecResult<()> {
        let version = read_version(dec, &[0x1, CLASS_VERSION])?;
        self.core.read_envelope(dec)?;

        let mut state = self.state.write();
        match version {
            0x1 => {
                state.grammar_id = dec.read_u64()?;
                state.regenerate = dec.read_bool()?;
                state.seed = dec.read_u32()?;
                state.target_len = dec.read_i32()?;
                state.parent.parent_id = dec.read_u64()?;
                let begin = dec.read_i64()?;
                let length = dec.read_i64()?;
                state.parent.segments = Segments::from_slice(&[(begin, length)]);
                state.parent.stop = dec.read_i64()?;
                state.parent.complement = dec.read_bool()?;
                state.input_id = dec.read_u64()?;
            }
            _ => {
                let mut block = dec.read_block()?;
                state.grammar_id = block.read_u64()?;
                state.regenerate = block.read_bool()?;
                state.seed = block.read_u32()?;
                state.target_len = block.read_i32()?;
                state.parent.method = ParentMethod::decode(block.read_u8()?)?;
                state.parent.parent_id = block.read_u64()?;
                let count = block.read_u64()?;
                state.parent.segments.clear();
                for _ in 0..count {
                    let begin = block.read_i64()?;
                    let length = block.read_i64()?;
                    state.parent.segments.push((begin, length));
                }
                state.parent.length = block.read_i64()?;
                state.parent.stop = block.read_i64()?;
                state.parent.complement = block.read_bool()?;
                state.input_id = block.read_u64()?;
            }
        }
        Ok(())
    }

    fn can_delete(&self, data: &Data) -> bool {
        let input_id = self.state.read().input_id;
        if input_id != 0
            && let Some(input) = data.lookup_form::<crate::input::Input>(input_id)
            && input.derived_inputs() > 0
        {
            return false;
        }
        true
    }

    fn clear(&self) {
        self.state.write().release_nodes();
        *self.state.write() = TreeState::default();
        self.core.clear();
    }

    fn free_memory(&self) {
        if self.core.has_flag(FormFlags::DO_NOT_FREE) {
            return;
        }
        let mut state = self.state.write();
        if let Some(root) = state.root.take() {
            slab::with_pools(|pools| pools.release(root));
        }
        state.nodes = 0;
        state.valid = false;
        // The sequence count survives; length arithmetic on freed parents
        // still needs it.
    }

    fn freed(&self) -> bool {
        self.state.read().nodes == 0
    }

    fn memory_size(&self) -> usize {
        let state = self.state.read();
        size_of::<Self>()
            + state.parent.segments.len() * size_of::<(i64, i64)>()
            + state.nodes as usize * (size_of::<Node>() + size_of::<Box<Node>>())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::resolver::LoadResolver;

    fn sample_tree() -> Box<Node> {
        let mut root = Box::new(Node::NonTerminal(BranchNode { grammar_id: 1, children: vec![] }));
        for i in 0..3u64 {
            let seq = Node::Sequence(BranchNode {
                grammar_id: 2,
                children: vec![Box::new(Node::Terminal(TerminalNode {
                    grammar_id: 3,
                    content: format!("tok{i}"),
                }))],
            });
            root.branch_mut().unwrap().children.push(Box::new(seq));
        }
        root
    }

    #[test]
    fn copy_counts_every_node() {
        let tree = sample_tree();
        let (copy, counts) = slab::with_pools(|pools| tree.copy_with_pools(pools));
        assert_eq!(counts.nodes, 7);
        assert_eq!(counts.sequence_nodes, 3);
        assert_eq!(copy.children().len(), 3);
        let first = &copy.children()[0];
        assert_eq!(first.kind(), NodeKind::Sequence);
        match first.children()[0].as_ref() {
            Node::Terminal(t) => assert_eq!(t.content, "tok0"),
            other => panic!("expected terminal, got {other:?}"),
        }
        slab::with_pools(|pools| {
            pools.release(copy);
            pools.release(tree);
        });
    }

    #[test]
    fn metadata_round_trip() {
        let tree = DerivationTree::default();
        tree.core().set_form_id(105);
        {
            let mut state = tree.write();
            state.grammar_id = 101;
            state.seed = 0xfeed_beef;
            state.target_len = 17;
            state.regenerate = true;
            state.input_id = 240;
            state.parent = ParentInfo {
                method: ParentMethod::Extension,
                parent_id: 104,
                segments: Segments::from_slice(&[(0, 5), (9, 2)]),
                stop: 11,
                complement: true,
                length: 12,
            };
        }

        let mut enc = Encoder::new();
        tree.write_data(&mut enc).unwrap();
        let bytes = enc.into_bytes();

        let loaded = DerivationTree::default();
        let mut resolver = LoadResolver::new();
        loaded.read_data(&mut Decoder::new(&bytes), &mut resolver).unwrap();

        let a = tree.read();
        let b = loaded.read();
        assert_eq!(loaded.core().form_id(), 105);
        assert_eq!(a.grammar_id, b.grammar_id);
        assert_eq!(a.seed, b.seed);
        assert_eq!(a.target_len, b.target_len);
        assert_eq!(a.regenerate, b.regenerate);
        assert_eq!(a.input_id, b.input_id);
        assert_eq!(a.parent, b.parent);
    }

    #[test]
    fn deep_copy_carries_nodes_and_metadata() {
        let tree = DerivationTree::default();
        {
            let mut state = tree.write();
            state.root = Some(sample_tree());
            state.nodes = 7;
            state.sequence_nodes = 3;
            state.valid = true;
            state.seed = 9;
        }
        let other = DerivationTree::default();
        tree.deep_copy(&other);
        let state = other.read();
        assert!(state.valid);
        assert_eq!(state.seed, 9);
        assert_eq!(state.root.as_ref().unwrap().children().len(), 3);
    }
}
