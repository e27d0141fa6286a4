//! Extraction: building a new derivation tree whose sequence atoms are a
//! selected subset of another tree's atoms.
//!
//! Simple grammars take the fast path: the selected subtrees are adopted
//! directly under a fresh root, with only an id check against the regex
//! atom. Everything else goes through the Earley parser on the
//! parse-prepared graph to find a derivation that covers exactly the
//! selected atoms.

use tracing::{debug, warn};

use crate::derivation::{DerivationTree, Node, ParentMethod, Segments};
use crate::slab::{self, NodePools};
use crate::store::Form;

use super::earley::{EarleyParser, ParseTree};
use super::tree::{ExpansionKind, GrammarTree, NodeId};

/// Collects a tree's sequence nodes in left-to-right order.
pub(crate) fn gather_sequence_nodes(root: &Node) -> Vec<&Node> {
    let mut sequence_nodes = Vec::new();
    let mut stack = vec![root];
    while let Some(node) = stack.pop() {
        if matches!(node, Node::Sequence(_)) {
            sequence_nodes.push(node);
        }
        // Children in reverse so the stack walks left to right; terminals
        // cannot hold sequence atoms.
        for child in node.children().iter().rev() {
            if !matches!(child.as_ref(), Node::Terminal(_)) {
                stack.push(child.as_ref());
            }
        }
    }
    sequence_nodes
}

/// Indices selected by a segment list, honoring `stop` and `complement`.
/// `None` when a segment reaches outside the source.
fn select_indices(
    segments: &[(i64, i64)],
    stop: i64,
    complement: bool,
    available: i64,
) -> Option<Vec<usize>> {
    let mut selected = Vec::new();
    if complement {
        let mut index = 0i64;
        let mut segment = 0usize;
        while index < stop && segment < segments.len() {
            while index < stop && index < segments[segment].0 {
                selected.push(index as usize);
                index += 1;
            }
            index = segments[segment].0 + segments[segment].1;
            segment += 1;
        }
        while index < stop {
            selected.push(index as usize);
            index += 1;
        }
    } else {
        for &(begin, length) in segments {
            if begin < 0 || length < 0 {
                return None;
            }
            for index in begin..begin + length {
                selected.push(index as usize);
            }
        }
    }
    if selected.iter().any(|&index| index as i64 >= available) {
        return None;
    }
    Some(selected)
}

/// Extracts the selected sequence subtrees of `source` into `dest`. Success
/// is encoded in `dest`'s valid bit.
pub(crate) fn extract_into(
    generation_tree: &GrammarTree,
    parse_tree: Option<&GrammarTree>,
    source: &DerivationTree,
    dest: &DerivationTree,
    segments: &[(i64, i64)],
    stop: i64,
    complement: bool,
) {
    if segments.is_empty() {
        warn!("extraction called with an empty segment list");
        return;
    }
    if generation_tree.simple {
        extract_simple(generation_tree, source, dest, segments, stop, complement);
    } else if let Some(parse_tree) = parse_tree {
        if let [(begin, length)] = segments[..] {
            extract_earley(parse_tree, source, dest, begin, length, stop, complement);
        } else {
            warn!("multi-segment extraction requires a simple grammar");
        }
    } else {
        warn!("grammar has no parse graph, cannot extract");
    }
}

fn init_dest(
    source: &DerivationTree,
    dest: &DerivationTree,
    segments: &[(i64, i64)],
    stop: i64,
    complement: bool,
) {
    let source_state = source.read();
    let mut state = dest.write();
    state.parent.parent_id = source.core().form_id();
    state.parent.segments = Segments::from_slice(segments);
    state.parent.stop = stop;
    state.parent.complement = complement;
    state.parent.method = ParentMethod::DeltaDebug;
    state.grammar_id = source_state.grammar_id;
    state.sequence_nodes = 0;
}

fn extract_simple(
    tree: &GrammarTree,
    source: &DerivationTree,
    dest: &DerivationTree,
    segments: &[(i64, i64)],
    stop: i64,
    complement: bool,
) {
    init_dest(source, dest, segments, stop, complement);

    let source_state = source.read();
    let Some(source_root) = source_state.root.as_ref() else {
        warn!(form = %source.print_form(), "source tree holds no nodes");
        return;
    };
    let sequence_nodes = gather_sequence_nodes(source_root);
    if sequence_nodes.len() as i64 != source_state.sequence_nodes {
        warn!(
            counted = sequence_nodes.len(),
            recorded = source_state.sequence_nodes,
            "sequence-node accounting is off, refusing to extract"
        );
        return;
    }

    let Some(selected) = select_indices(segments, stop, complement, sequence_nodes.len() as i64)
    else {
        warn!("segment list reaches outside the source sequence");
        return;
    };
    if selected.is_empty() {
        return;
    }

    // The whole sequence level is one regex; every selected atom must be an
    // instance of its repeated node.
    let Some(root_id) = tree.root else { return };
    let root_expansions = &tree.node(root_id).expansions;
    let [root_expansion] = root_expansions[..] else { return };
    let ExpansionKind::Repeat { node: atom, .. } = tree.expansion(root_expansion).kind else {
        return;
    };
    if sequence_nodes[selected[0]].grammar_id() != atom
        || selected.iter().any(|&index| sequence_nodes[index].grammar_id() != atom)
    {
        warn!("selected atoms do not match the regex atom");
        return;
    }

    let mut state = dest.write();
    slab::with_pools(|pools| {
        let mut root = pools.new_nonterminal(root_id);
        let branch = root.branch_mut().expect("fresh branch node");
        let mut nodes = 1i64;
        for &index in &selected {
            let (copy, counts) = sequence_nodes[index].copy_with_pools(pools);
            nodes += counts.nodes;
            branch.children.push(copy);
        }
        state.root = Some(root);
        state.nodes = nodes;
    });
    state.sequence_nodes = selected.len() as i64;
    state.valid = true;
    state.regenerate = true;
    debug!(
        extracted = state.sequence_nodes,
        from = source_state.sequence_nodes,
        "simple extraction done"
    );
}

fn extract_earley(
    parse_tree: &GrammarTree,
    source: &DerivationTree,
    dest: &DerivationTree,
    begin: i64,
    length: i64,
    stop: i64,
    complement: bool,
) {
    init_dest(source, dest, &[(begin, length)], stop, complement);

    let source_state = source.read();
    let Some(source_root) = source_state.root.as_ref() else {
        warn!(form = %source.print_form(), "source tree holds no nodes");
        return;
    };
    let sequence_nodes = gather_sequence_nodes(source_root);

    let mut input: Vec<NodeId> = Vec::new();
    let mut targets: Vec<&Node> = Vec::new();
    for index in 0..stop {
        let inside = index >= begin && index < begin + length;
        if inside != complement {
            let Some(node) = sequence_nodes.get(index as usize) else {
                warn!("segment list reaches outside the source sequence");
                return;
            };
            input.push(node.grammar_id());
            targets.push(node);
        }
    }

    let Some(parse) = EarleyParser::new(parse_tree, input).parse() else {
        // No derivation covers the selection.
        let mut state = dest.write();
        state.valid = false;
        state.regenerate = false;
        return;
    };

    let mut builder = DevBuilder {
        parse_tree,
        targets: &targets,
        next_target: 0,
        nodes: 0,
        sequences: 0,
    };
    let root = slab::with_pools(|pools| builder.build(&parse, pools));

    let mut state = dest.write();
    state.root = Some(root);
    state.nodes = builder.nodes;
    state.sequence_nodes = builder.sequences;
    if builder.next_target == targets.len() {
        state.valid = true;
        state.regenerate = true;
    } else {
        state.valid = false;
        state.regenerate = false;
    }
}

struct DevBuilder<'a> {
    parse_tree: &'a GrammarTree,
    targets: &'a [&'a Node],
    next_target: usize,
    nodes: i64,
    sequences: i64,
}

impl DevBuilder<'_> {
    /// Turns a parse tree into derivation nodes. Parse-node wrappers are
    /// elided by binding the wrapper to its only child; at each sequence
    /// position the corresponding source subtree is copied in.
    fn build(&mut self, parse: &ParseTree, pools: &mut NodePools) -> Box<Node> {
        let mut parse = parse;
        while self.parse_tree.parse_nodes.contains(&parse.node) {
            parse = &parse.children[0];
        }
        let grammar_node = self.parse_tree.node(parse.node);
        self.nodes += 1;
        if grammar_node.is_sequence() {
            self.sequences += 1;
            let source = self.targets[self.next_target];
            self.next_target += 1;
            let mut node = pools.new_sequence(source.grammar_id());
            let branch = node.branch_mut().expect("fresh branch node");
            for child in source.children() {
                let (copy, counts) = child.copy_with_pools(pools);
                self.nodes += counts.nodes;
                branch.children.push(copy);
            }
            node
        } else if grammar_node.is_leaf() {
            pools.new_terminal(parse.node, &grammar_node.identifier)
        } else {
            let mut node = pools.new_nonterminal(parse.node);
            let mut children = Vec::with_capacity(parse.children.len());
            for child in &parse.children {
                children.push(self.build(child, pools));
            }
            node.branch_mut().expect("fresh branch node").children = children;
            node
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::derivation::materialize_sequence;
    use crate::grammar::derive::SequenceBuilder;
    use crate::grammar::tree::SymbolKind;
    use rand_mt::Mt;

    fn simple_grammar() -> GrammarTree {
        let mut tree = GrammarTree::default();
        tree.add_symbol("'start", "'SEQ_x ~ 'start | 'SEQ_x", SymbolKind::NonTerminal);
        tree.add_symbol("'SEQ_x", "\"x\" | \"y\"", SymbolKind::Sequence);
        let root = tree.find_node("'start").unwrap();
        tree.set_root(root);
        assert!(tree.construct());
        assert!(tree.simplify_sequences());
        tree
    }

    fn derive_form(tree: &GrammarTree, target: i64, seed: u32) -> DerivationTree {
        let form = DerivationTree::default();
        form.core().set_form_id(200);
        let mut builder = SequenceBuilder::new(tree, Mt::new(seed), target, 0);
        builder.seed_root().unwrap();
        builder.run().unwrap();
        let produced = builder.sequences();
        let (root, counts) = slab::with_pools(|pools| builder.assemble(pools));
        let mut state = form.write();
        state.root = Some(root);
        state.nodes = counts.nodes;
        state.sequence_nodes = produced;
        state.valid = true;
        state.seed = seed;
        drop(state);
        form
    }

    #[test]
    fn middle_segment_extraction() {
        let tree = simple_grammar();
        let source = derive_form(&tree, 3, 41);
        let source_tokens = {
            let state = source.read();
            materialize_sequence(state.root.as_ref().unwrap())
        };

        let dest = DerivationTree::default();
        extract_into(&tree, None, &source, &dest, &[(1, 1)], 3, false);
        assert!(dest.is_valid());
        assert_eq!(dest.sequence_len(), 1);

        let state = dest.read();
        let tokens = materialize_sequence(state.root.as_ref().unwrap());
        assert_eq!(tokens, vec![source_tokens[1].clone()]);
        assert_eq!(state.parent.parent_id, 200);
        assert_eq!(state.parent.method, ParentMethod::DeltaDebug);
    }

    #[test]
    fn complement_extraction_keeps_the_rest() {
        let tree = simple_grammar();
        let source = derive_form(&tree, 4, 42);
        let source_tokens = {
            let state = source.read();
            materialize_sequence(state.root.as_ref().unwrap())
        };

        let dest = DerivationTree::default();
        extract_into(&tree, None, &source, &dest, &[(1, 2)], 4, true);
        assert!(dest.is_valid());
        assert_eq!(dest.sequence_len(), 2);
        let state = dest.read();
        let tokens = materialize_sequence(state.root.as_ref().unwrap());
        assert_eq!(tokens, vec![source_tokens[0].clone(), source_tokens[3].clone()]);
    }

    #[test]
    fn out_of_range_segment_fails() {
        let tree = simple_grammar();
        let source = derive_form(&tree, 3, 43);
        let dest = DerivationTree::default();
        extract_into(&tree, None, &source, &dest, &[(2, 5)], 3, false);
        assert!(!dest.is_valid());
    }

    #[test]
    fn empty_selection_fails() {
        let tree = simple_grammar();
        let source = derive_form(&tree, 2, 44);
        let dest = DerivationTree::default();
        extract_into(&tree, None, &source, &dest, &[(0, 0)], 2, false);
        assert!(!dest.is_valid());
    }

    fn balanced_grammar() -> (GrammarTree, GrammarTree) {
        let mut tree = GrammarTree::default();
        tree.add_symbol(
            "'start",
            "'SEQ_a ~ 'SEQ_b | 'SEQ_a ~ 'start ~ 'SEQ_b",
            SymbolKind::NonTerminal,
        );
        tree.add_symbol("'SEQ_a", "\"a\"", SymbolKind::Sequence);
        tree.add_symbol("'SEQ_b", "\"b\"", SymbolKind::Sequence);
        let root = tree.find_node("'start").unwrap();
        tree.set_root(root);
        assert!(tree.construct());
        assert!(!tree.simplify_sequences());
        tree.fix_root();
        let mut parse_tree = tree.clone();
        parse_tree.insert_parse_nodes();
        (tree, parse_tree)
    }

    /// Hand-built `aabb` tree for the balanced grammar:
    /// `FixedStart → 'start → [a, 'start → [a, b], b]`.
    fn balanced_source(tree: &GrammarTree) -> DerivationTree {
        use crate::derivation::{BranchNode, TerminalNode};

        let seq_a = tree.find_node("'SEQ_a").unwrap();
        let seq_b = tree.find_node("'SEQ_b").unwrap();
        let start = tree.find_node("'start").unwrap();
        let fixed = tree.root.unwrap();
        let term_a = tree.expansion(tree.node(seq_a).expansions[0]).node_ids()[0];
        let term_b = tree.expansion(tree.node(seq_b).expansions[0]).node_ids()[0];

        let atom = |seq: NodeId, term: NodeId, text: &str| {
            Box::new(Node::Sequence(BranchNode {
                grammar_id: seq,
                children: vec![Box::new(Node::Terminal(TerminalNode {
                    grammar_id: term,
                    content: text.to_owned(),
                }))],
            }))
        };
        let inner = Box::new(Node::NonTerminal(BranchNode {
            grammar_id: start,
            children: vec![atom(seq_a, term_a, "a"), atom(seq_b, term_b, "b")],
        }));
        let outer = Box::new(Node::NonTerminal(BranchNode {
            grammar_id: start,
            children: vec![atom(seq_a, term_a, "a"), inner, atom(seq_b, term_b, "b")],
        }));
        let root =
            Box::new(Node::NonTerminal(BranchNode { grammar_id: fixed, children: vec![outer] }));

        let form = DerivationTree::default();
        form.core().set_form_id(201);
        let mut state = form.write();
        assert_eq!(materialize_sequence(&root), vec!["a", "a", "b", "b"]);
        state.root = Some(root);
        state.nodes = 11;
        state.sequence_nodes = 4;
        state.valid = true;
        drop(state);
        form
    }

    #[test]
    fn earley_extraction_of_an_inner_pair() {
        let (tree, parse_tree) = balanced_grammar();
        let source = balanced_source(&tree);

        let dest = DerivationTree::default();
        extract_into(&tree, Some(&parse_tree), &source, &dest, &[(1, 2)], 4, false);
        assert!(dest.is_valid());
        assert_eq!(dest.sequence_len(), 2);
        let state = dest.read();
        assert_eq!(materialize_sequence(state.root.as_ref().unwrap()), vec!["a", "b"]);
        assert_eq!(state.parent.segments.as_slice(), &[(1, 2)]);
    }

    #[test]
    fn earley_extraction_rejects_uncoverable_selections() {
        let (tree, parse_tree) = balanced_grammar();
        let source = balanced_source(&tree);

        // The complement of the first atom is "abb", which the pair grammar
        // cannot derive.
        let dest = DerivationTree::default();
        extract_into(&tree, Some(&parse_tree), &source, &dest, &[(0, 1)], 4, true);
        assert!(!dest.is_valid());
        assert!(!dest.regenerate());
    }
}
