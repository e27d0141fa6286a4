//! The grammar engine: parsing, normalization, random derivation,
//! extraction and extension of derivation trees.
//!
//! A grammar form owns two graphs: the generation graph used by
//! derivation, and (for non-simple grammars) a parse-prepared deep copy
//! with synthetic wrapper nodes, used only by the Earley extraction path.

use std::any::Any;
use std::path::Path;
use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard};
use rand::Rng;
use rand_mt::Mt;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::codec::{CodecResult, Decoder, Encoder};
use crate::derivation::{DerivationTree, Node, NodeKind, ParentMethod};
use crate::settings::SettingsValues;
use crate::slab;
use crate::store::{Form, FormCore, FormType, LoadResolver, read_version};

pub mod derive;
pub mod earley;
pub mod extract;
pub mod parse;
pub mod tree;

use derive::SequenceBuilder;
use tree::{ExpansionKind, GrammarExpansion, GrammarNode, GrammarTree, NodeFlags, SymbolKind};

#[derive(Debug, Error)]
pub enum GrammarError {
    #[error("no balanced Grammar( ... ) block found")]
    NoGrammarBlock,
    #[error("the grammar does not define the root symbol 'start")]
    MissingStart,
    #[error("the grammar graph did not survive construction")]
    Invalid,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Extension and backtracking ranges, taken from the settings when the
/// grammar is wired into a session.
#[derive(Debug, Clone, Copy, Default)]
struct GenerationParams {
    extension_min: i32,
    extension_max: i32,
    backtrack_min: i32,
    backtrack_max: i32,
}

const CLASS_VERSION: i32 = 0x2;

/// The persisted grammar form.
#[derive(Debug, Default)]
pub struct Grammar {
    core: FormCore,
    tree: RwLock<GrammarTree>,
    parse_tree: RwLock<Option<GrammarTree>>,
    params: RwLock<GenerationParams>,
}

impl Grammar {
    /// Parses a grammar from its textual form and runs the full
    /// normalization pipeline. On error the grammar stays invalid.
    pub fn parse_text(&self, text: &str) -> Result<(), GrammarError> {
        self.core.set_changed();
        *self.parse_tree.write() = None;
        *self.tree.write() = GrammarTree::default();

        let block = parse::extract_grammar_block(text).ok_or(GrammarError::NoGrammarBlock)?;
        let rules = parse::split_rules(&block);
        let mut tree = GrammarTree::default();
        for rule in &rules {
            let kind = if rule.sequence { SymbolKind::Sequence } else { SymbolKind::NonTerminal };
            tree.add_symbol(&rule.symbol, &rule.derivation, kind);
        }
        let root = tree.find_node("'start").ok_or(GrammarError::MissingStart)?;
        tree.set_root(root);

        tree.valid = tree.construct();
        if tree.valid {
            tree.simplify_sequences();
            tree.fix_root();
        }
        let valid = tree.valid && tree.root.is_some();
        if valid && !tree.simple {
            let mut parse_tree = tree.clone();
            parse_tree.insert_parse_nodes();
            *self.parse_tree.write() = Some(parse_tree);
        }
        info!(rules = rules.len(), simple = tree.simple, valid, "grammar constructed");
        *self.tree.write() = tree;
        if valid { Ok(()) } else { Err(GrammarError::Invalid) }
    }

    pub fn load_file(&self, path: &Path) -> Result<(), GrammarError> {
        let text = std::fs::read_to_string(path)?;
        info!(path = %path.display(), "reading grammar");
        self.parse_text(&text)
    }

    pub fn is_valid(&self) -> bool {
        self.tree.read().valid
    }

    pub fn is_simple(&self) -> bool {
        self.tree.read().simple
    }

    pub fn tree(&self) -> RwLockReadGuard<'_, GrammarTree> {
        self.tree.read()
    }

    /// Renders the generation graph (or the parse-prepared copy) back to
    /// grammar text.
    pub fn render(&self, parse_graph: bool) -> String {
        if parse_graph {
            match self.parse_tree.read().as_ref() {
                Some(tree) => tree.render(),
                None => "Grammar(\n)\n".to_owned(),
            }
        } else {
            self.tree.read().render()
        }
    }

    pub fn set_generation_params(&self, settings: &SettingsValues) {
        self.core.set_changed();
        *self.params.write() = GenerationParams {
            extension_min: settings.extension_min,
            extension_max: settings.extension_max,
            backtrack_min: settings.backtrack_min,
            backtrack_max: settings.backtrack_max,
        };
    }

    /// Randomly derives a tree with `target_len` sequence atoms. Success is
    /// encoded in `dest`'s valid bit; the seed and target are stored so the
    /// tree can be regenerated on demand.
    pub fn derive(&self, dest: &DerivationTree, target_len: i32, seed: u32) {
        let tree = self.tree.read();
        {
            let mut state = dest.write();
            state.release_nodes();
            state.grammar_id = self.core.form_id();
            state.seed = seed;
            state.target_len = target_len;
        }
        if !tree.valid {
            warn!("derive called on an invalid grammar");
            return;
        }

        let mut builder =
            SequenceBuilder::new(&tree, Mt::new(seed), target_len as i64, 0);
        if let Err(error) = builder.seed_root().and_then(|()| builder.run()) {
            warn!(%error, "derivation failed");
            return;
        }
        let produced = builder.sequences();
        let (root, counts) = slab::with_pools(|pools| builder.assemble(pools));

        let mut state = dest.write();
        state.root = Some(root);
        state.nodes = counts.nodes;
        state.sequence_nodes = produced;
        state.valid = true;
        state.regenerate = true;
        drop(state);
        debug!(form = %dest.print_form(), target_len, "derivation done");
    }

    /// Re-derives a tree from its stored seed and target length.
    pub fn regenerate(&self, tree_form: &DerivationTree) {
        let (seed, target_len) = {
            let state = tree_form.read();
            (state.seed, state.target_len)
        };
        self.derive(tree_form, target_len, seed);
    }

    /// Extracts the sequence atoms selected by `segments` from `source`
    /// into `dest`. See [`extract::extract_into`] for the two paths.
    pub fn extract(
        &self,
        source: &DerivationTree,
        dest: &DerivationTree,
        segments: &[(i64, i64)],
        stop: i64,
        complement: bool,
    ) {
        let tree = self.tree.read();
        if !tree.valid {
            warn!("extract called on an invalid grammar");
            return;
        }
        let parse_tree = self.parse_tree.read();
        extract::extract_into(&tree, parse_tree.as_ref(), source, dest, segments, stop, complement);
    }

    /// Extends `source` to `target_len` sequence atoms, optionally dropping
    /// a random backtrack suffix first. `trimmed_length` carries the
    /// trimmed length of the source input when it was trimmed. Returns the
    /// number of atoms backtracked, or `None` when `dest` stays invalid.
    pub fn extend(
        &self,
        source: &DerivationTree,
        trimmed_length: Option<i64>,
        dest: &DerivationTree,
        backtrack: bool,
        target_len: i32,
        seed: u32,
    ) -> Option<i64> {
        let tree = self.tree.read();
        if !tree.valid {
            warn!("extend called on an invalid grammar");
            return None;
        }
        let source_len = source.sequence_len();
        {
            let mut state = dest.write();
            state.release_nodes();
            state.grammar_id = self.core.form_id();
            state.seed = seed;
            state.target_len = target_len;
            state.parent.method = ParentMethod::Extension;
            state.parent.parent_id = source.core().form_id();
            state.parent.length = source_len;
            state.valid = false;
        }

        let mut rng = Mt::new(seed);
        let params = *self.params.read();
        let (low, high) = if backtrack {
            (params.backtrack_min, params.backtrack_max)
        } else {
            (params.extension_min, params.extension_max)
        };
        let track_back = if high > low { rng.random_range(low..=high) } else { low } as i64;

        if let Some(trimmed) = trimmed_length {
            if trimmed - track_back < 1 {
                return None;
            }
            let parse_tree = self.parse_tree.read();
            extract::extract_into(
                &tree,
                parse_tree.as_ref(),
                source,
                dest,
                &[(0, trimmed - track_back)],
                source_len,
                false,
            );
            if !dest.is_valid() {
                return None;
            }
        } else if track_back > 0 {
            if source_len - track_back < 1 {
                return None;
            }
            let parse_tree = self.parse_tree.read();
            extract::extract_into(
                &tree,
                parse_tree.as_ref(),
                source,
                dest,
                &[(0, source_len - track_back)],
                source_len,
                false,
            );
            if !dest.is_valid() {
                return None;
            }
        } else {
            let source_state = source.read();
            let Some(source_root) = source_state.root.as_ref() else {
                warn!(form = %source.print_form(), "source tree holds no nodes");
                return None;
            };
            let (root, counts) = slab::with_pools(|pools| source_root.copy_with_pools(pools));
            let mut state = dest.write();
            state.root = Some(root);
            state.nodes = counts.nodes;
            state.sequence_nodes = counts.sequence_nodes;
        }

        let backtracked = source_len - dest.sequence_len();

        // Locate the node the fresh derivation grows from.
        let anchor = {
            let state = dest.read();
            let root = state.root.as_ref()?;
            if tree.simple {
                tree.root.map(|symbol| (Vec::new(), symbol))
            } else {
                find_extension_anchor(&tree, root)
            }
        };
        let Some((anchor_path, anchor_symbol)) = anchor else {
            warn!("no extension anchor admits further sequence production");
            dest.write().valid = false;
            return None;
        };

        let produced = dest.sequence_len();
        let mut builder =
            SequenceBuilder::new(&tree, rng, target_len as i64, produced);
        builder.seed_anchor(anchor_symbol);
        if let Err(error) = builder.run() {
            warn!(%error, "extension derivation failed");
            return None;
        }
        let (fresh_root, counts) = slab::with_pools(|pools| builder.assemble(pools));

        let mut state = dest.write();
        let anchor = node_at_path_mut(state.root.as_mut().expect("root present"), &anchor_path);
        match (anchor.branch_mut(), *fresh_root) {
            (Some(branch), Node::NonTerminal(placeholder)) => {
                branch.children.extend(placeholder.children);
            }
            _ => {
                warn!("extension anchor is not a branch node");
                state.valid = false;
                return None;
            }
        }
        state.nodes += counts.nodes - 1;
        state.sequence_nodes += counts.sequence_nodes;
        state.valid = true;
        state.regenerate = true;
        state.parent.method = ParentMethod::Extension;
        drop(state);
        debug!(form = %dest.print_form(), backtracked, "extension done");
        Some(backtracked)
    }
}

/// Finds the lowest node on the right-most path that admits an expansion
/// with two or more sequence-producing children. Returns the child-index
/// path to it plus its grammar symbol.
fn find_extension_anchor(tree: &GrammarTree, root: &Node) -> Option<(Vec<usize>, tree::NodeId)> {
    let mut path: Vec<usize> = Vec::new();
    let mut entries: Vec<(tree::NodeId, NodeKind)> = Vec::new();
    let mut current = root;
    'descend: loop {
        for (index, child) in current.children().iter().enumerate().rev() {
            match child.kind() {
                NodeKind::Sequence => {
                    path.push(index);
                    entries.push((child.grammar_id(), NodeKind::Sequence));
                    break 'descend;
                }
                NodeKind::NonTerminal => {
                    path.push(index);
                    entries.push((child.grammar_id(), NodeKind::NonTerminal));
                    current = child.as_ref();
                    continue 'descend;
                }
                NodeKind::Terminal => continue,
            }
        }
        break;
    }

    for depth in (0..entries.len()).rev() {
        let (symbol, kind) = entries[depth];
        if kind != NodeKind::NonTerminal {
            continue;
        }
        let Some(node) = tree.nodes.get(&symbol) else { continue };
        let admits = node.expansions.iter().any(|expansion_id| {
            tree.expansion(*expansion_id)
                .node_ids()
                .iter()
                .filter(|member| tree.node(**member).flags.contains(NodeFlags::PRODUCE_SEQUENCE))
                .count()
                >= 2
        });
        if admits {
            return Some((path[..=depth].to_vec(), symbol));
        }
    }
    None
}

fn node_at_path_mut<'n>(root: &'n mut Node, path: &[usize]) -> &'n mut Node {
    let mut current = root;
    for &index in path {
        current = current.branch_mut().expect("path through branch nodes").children[index].as_mut();
    }
    current
}

// ---- serialization --------------------------------------------------------

const NODE_VERSION: i32 = 0x1;
const EXPANSION_VERSION: i32 = 0x2;
const REPEAT_VERSION: i32 = 0x1;

fn write_node(enc: &mut Encoder, node: &GrammarNode) -> CodecResult<()> {
    enc.write_i32(NODE_VERSION)?;
    enc.write_str(&node.identifier)?;
    enc.write_str(&node.derivation)?;
    enc.write_u64(node.id)?;
    enc.write_u64_seq(node.expansions.iter().copied())?;
    enc.write_u64(node.flags.bits())?;
    enc.write_u32(node.kind.encode())?;
    enc.write_u64_seq(node.parents.iter().copied())?;
    enc.write_bool(node.reachable)?;
    enc.write_bool(node.producing)?;
    enc.write_bool(node.remove)
}

fn read_node(dec: &mut Decoder<'_>) -> CodecResult<GrammarNode> {
    read_version(dec, &[NODE_VERSION])?;
    let identifier = dec.read_string()?;
    let derivation = dec.read_string()?;
    let id = dec.read_u64()?;
    let expansions = dec.read_u64_seq()?;
    let flags = NodeFlags::from_bits_retain(dec.read_u64()?);
    let kind = SymbolKind::decode(dec.read_u32()?).unwrap_or_default();
    let parents = dec.read_u64_seq()?.into_iter().collect();
    Ok(GrammarNode {
        id,
        identifier,
        derivation,
        kind,
        expansions,
        parents,
        flags,
        reachable: dec.read_bool()?,
        producing: dec.read_bool()?,
        remove: dec.read_bool()?,
    })
}

fn write_expansion(enc: &mut Encoder, expansion: &GrammarExpansion) -> CodecResult<()> {
    match &expansion.kind {
        ExpansionKind::Nodes(members) => {
            enc.write_i32(EXPANSION_VERSION)?;
            enc.write_u64_seq(members.iter().copied())?;
        }
        ExpansionKind::Repeat { node, min } => {
            enc.write_i32(REPEAT_VERSION)?;
            enc.write_u64(*node)?;
            enc.write_u32(*min)?;
        }
    }
    enc.write_f32(expansion.weight)?;
    enc.write_u64(expansion.id)?;
    enc.write_bool(expansion.producing)?;
    enc.write_u64(expansion.flags.bits())?;
    enc.write_bool(expansion.remove)?;
    enc.write_u64(expansion.parent)?;
    enc.write_i32(expansion.nonterminals)?;
    enc.write_i32(expansion.seq_nonterminals)?;
    enc.write_i32(expansion.terminals)
}

fn read_expansion(dec: &mut Decoder<'_>, repeat: bool) -> CodecResult<GrammarExpansion> {
    let kind = if repeat {
        read_version(dec, &[REPEAT_VERSION])?;
        let node = dec.read_u64()?;
        let min = dec.read_u32()?;
        ExpansionKind::Repeat { node, min }
    } else {
        read_version(dec, &[EXPANSION_VERSION])?;
        ExpansionKind::Nodes(dec.read_u64_seq()?)
    };
    let weight = dec.read_f32()?;
    let id = dec.read_u64()?;
    let producing = dec.read_bool()?;
    let flags = NodeFlags::from_bits_retain(dec.read_u64()?);
    let remove = dec.read_bool()?;
    let parent = dec.read_u64()?;
    Ok(GrammarExpansion {
        id,
        parent,
        kind,
        weight,
        flags,
        producing,
        remove,
        nonterminals: dec.read_i32()?,
        seq_nonterminals: dec.read_i32()?,
        terminals: dec.read_i32()?,
    })
}

impl Form for Grammar {
    fn form_type(&self) -> FormType {
        FormType::Grammar
    }

    fn core(&self) -> &FormCore {
        &self.core
    }

    fn write_data(&self, enc: &mut Encoder) -> CodecResult<()> {
        enc.write_i32(CLASS_VERSION)?;
        self.core.write_envelope(enc)?;

        let tree = self.tree.read();
        enc.write_u64(tree.next_id)?;
        enc.write_i32(tree.cycles)?;
        enc.write_bool(tree.valid)?;
        enc.write_u64(tree.root.unwrap_or(0))?;
        enc.write_u64_seq(tree.rule_order.iter().copied())?;
        enc.write_u64(tree.nodes.len() as u64)?;
        for (id, node) in &tree.nodes {
            enc.write_u64(*id)?;
            write_node(enc, node)?;
        }
        enc.write_u64(tree.expansions.len() as u64)?;
        for (id, expansion) in &tree.expansions {
            enc.write_bool(expansion.is_repeat())?;
            enc.write_u64(*id)?;
            write_expansion(enc, expansion)?;
        }
        enc.write_u64_seq(tree.nonterminals.iter().copied())?;
        enc.write_u64_seq(tree.terminals.iter().copied())?;
        let params = self.params.read();
        enc.write_i32(params.extension_min)?;
        enc.write_i32(params.extension_max)?;
        enc.write_i32(params.backtrack_min)?;
        enc.write_i32(params.backtrack_max)?;
        enc.write_bool(tree.simple)
    }

    fn read_data(&self, dec: &mut Decoder<'_>, _resolver: &mut LoadResolver) -> CodecResult<()> {
        read_version(dec, &[CLASS_VERSION])?;
        self.core.read_envelope(dec)?;

        let mut tree = GrammarTree::default();
        tree.next_id = dec.read_u64()?;
        tree.cycles = dec.read_i32()?;
        tree.valid = dec.read_bool()?;
        let root = dec.read_u64()?;
        tree.root = (root != 0).then_some(root);
        tree.rule_order = dec.read_u64_seq()?;
        let node_count = dec.read_u64()?;
        for _ in 0..node_count {
            let id = dec.read_u64()?;
            tree.nodes.insert(id, read_node(dec)?);
        }
        let expansion_count = dec.read_u64()?;
        for _ in 0..expansion_count {
            let repeat = dec.read_bool()?;
            let id = dec.read_u64()?;
            tree.expansions.insert(id, read_expansion(dec, repeat)?);
        }
        tree.nonterminals = dec.read_u64_seq()?.into_iter().collect();
        tree.terminals = dec.read_u64_seq()?.into_iter().collect();
        let mut params = self.params.write();
        params.extension_min = dec.read_i32()?;
        params.extension_max = dec.read_i32()?;
        params.backtrack_min = dec.read_i32()?;
        params.backtrack_max = dec.read_i32()?;
        drop(params);
        tree.simple = dec.read_bool()?;

        // The parse graph is never persisted; rebuild it.
        if tree.valid && !tree.simple {
            let mut parse_tree = tree.clone();
            parse_tree.insert_parse_nodes();
            *self.parse_tree.write() = Some(parse_tree);
        } else {
            *self.parse_tree.write() = None;
        }
        *self.tree.write() = tree;
        Ok(())
    }

    fn clear(&self) {
        *self.tree.write() = GrammarTree::default();
        *self.parse_tree.write() = None;
        *self.params.write() = GenerationParams::default();
        self.core.clear();
    }

    fn memory_size(&self) -> usize {
        size_of::<Self>()
            + self.tree.read().memory_size()
            + self.parse_tree.read().as_ref().map_or(0, GrammarTree::memory_size)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
