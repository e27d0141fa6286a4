//! The exclusion tree: a shared radix trie over input token sequences that
//! records oracle verdicts, so no already-decided prefix is ever explored
//! again.
//!
//! Sequences are stored as interned atoms (see [`crate::session`]), making
//! every step of a walk an integer comparison. A decided verdict (passing
//! or failing) subsumes all extensions, so the subtree under a freshly
//! decided leaf is erased eagerly.

use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use ahash::AHashMap;
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::codec::{CodecResult, Decoder, Encoder};
use crate::oracle::OracleResult;
use crate::session::{AtomId, SessionData};
use crate::settings::Settings;
use crate::store::{
    Data, Form, FormCore, FormId, FormType, LoadResolver, read_version, static_ids,
};

const ROOT_ID: u64 = 0;

#[derive(Debug)]
struct TreeNode {
    id: u64,
    atom: AtomId,
    /// Rough visit count; advisory only, updated without synchronization
    /// beyond the atomic itself.
    visits: AtomicU64,
    children: Vec<u64>,
    is_leaf: bool,
    result: OracleResult,
    input_id: FormId,
}

impl TreeNode {
    fn new(id: u64, atom: AtomId) -> Self {
        Self {
            id,
            atom,
            visits: AtomicU64::new(0),
            children: Vec::new(),
            is_leaf: false,
            result: OracleResult::Undefined,
            input_id: 0,
        }
    }
}

#[derive(Debug)]
struct TreeState {
    nodes: AHashMap<u64, TreeNode>,
    next_id: u64,
    depth: i64,
    leaf_count: u64,
    session_id: FormId,
}

impl Default for TreeState {
    fn default() -> Self {
        let mut nodes = AHashMap::new();
        nodes.insert(ROOT_ID, TreeNode::new(ROOT_ID, 0));
        Self { nodes, next_id: 1, depth: 0, leaf_count: 0, session_id: 0 }
    }
}

impl TreeState {
    fn child_with_atom(&self, parent: u64, atom: AtomId) -> Option<u64> {
        self.nodes[&parent].children.iter().copied().find(|id| self.nodes[id].atom == atom)
    }

    /// Erases the whole subtree under `node`; the node itself stays.
    fn delete_children(&mut self, node: u64) {
        let mut stack = std::mem::take(&mut self.nodes.get_mut(&node).expect("node present").children);
        while let Some(id) = stack.pop() {
            if let Some(removed) = self.nodes.remove(&id) {
                if removed.is_leaf {
                    self.leaf_count -= 1;
                }
                stack.extend(removed.children);
            }
        }
    }
}

const CLASS_VERSION: i32 = 0x1;

/// The persisted exclusion-tree form (singleton id 6).
#[derive(Debug, Default)]
pub struct ExclusionTree {
    core: FormCore,
    state: RwLock<TreeState>,
}

impl ExclusionTree {
    /// Wires the tree to the session data holding the atom table.
    pub fn init(&self, session_id: FormId) {
        self.core.set_changed();
        self.state.write().session_id = session_id;
    }

    fn session(&self, data: &Data) -> Option<Arc<SessionData>> {
        let id = self.state.read().session_id;
        let session = data.lookup_form::<SessionData>(id);
        if session.is_none() {
            warn!(session_id = id, "exclusion tree has no session data");
        }
        session
    }

    fn disabled(data: &Data) -> bool {
        data.lookup_form::<Settings>(static_ids::SETTINGS)
            .is_some_and(|settings| settings.disable_exclusion_tree())
    }

    /// Records the verdict for a token sequence. Decided verdicts become
    /// leaves and drop their subtree; everything below would yield the same
    /// decision.
    pub fn add_sequence(
        &self,
        data: &Data,
        tokens: &[String],
        input_id: FormId,
        result: OracleResult,
    ) {
        if tokens.is_empty() || Self::disabled(data) {
            return;
        }
        let Some(session) = self.session(data) else { return };
        let atoms: Vec<AtomId> = tokens.iter().map(|token| session.intern_atom(token)).collect();

        self.core.set_changed();
        let mut state = self.state.write();
        let mut node = ROOT_ID;
        let mut walked = 0i64;
        for atom in atoms {
            if let Some(child) = state.child_with_atom(node, atom) {
                let child_node = &state.nodes[&child];
                if child_node.is_leaf && child_node.result.is_decided() {
                    // Already decided by a prefix.
                    return;
                }
                node = child;
            } else {
                state.next_id += 1;
                let id = state.next_id - 1;
                state.nodes.insert(id, TreeNode::new(id, atom));
                state.nodes.get_mut(&node).expect("parent present").children.push(id);
                node = id;
            }
            walked += 1;
        }

        if result.is_decided() {
            let had_children = !state.nodes[&node].children.is_empty();
            {
                let entry = state.nodes.get_mut(&node).expect("node present");
                entry.result = result;
                entry.is_leaf = true;
                entry.input_id = input_id;
            }
            state.leaf_count += 1;
            if had_children {
                state.delete_children(node);
                debug!(node, "dropped subsumed subtree");
            }
        } else {
            let entry = state.nodes.get_mut(&node).expect("node present");
            entry.result = result;
            entry.input_id = input_id;
        }
        if state.depth < walked {
            state.depth = walked;
        }
    }

    /// Whether the sequence has a decided prefix (or is itself recorded as
    /// unfinished at full length). Returns the deciding input's id.
    pub fn has_prefix(&self, data: &Data, tokens: &[String]) -> (bool, FormId) {
        if Self::disabled(data) {
            return (false, 0);
        }
        let Some(session) = self.session(data) else { return (false, 0) };

        let state = self.state.read();
        let mut node = ROOT_ID;
        for (position, token) in tokens.iter().enumerate() {
            let Some(atom) = session.atom_id(token) else { return (false, 0) };
            let Some(child) = state.child_with_atom(node, atom) else { return (false, 0) };
            let child_node = &state.nodes[&child];
            if child_node.is_leaf {
                child_node.visits.fetch_add(1, Ordering::Relaxed);
                return (true, child_node.input_id);
            }
            node = child;
            // An unfinished exact-length match blocks running the same test
            // again.
            if position + 1 == tokens.len()
                && state.nodes[&node].result == OracleResult::Unfinished
            {
                return (true, state.nodes[&node].input_id);
            }
        }
        (false, 0)
    }

    /// As [`Self::has_prefix`], but on undecided walks continues with a
    /// breadth-first search below the reached node and reports the shortest
    /// decided (or unfinished) extension.
    pub fn has_prefix_and_shortest_extension(
        &self,
        data: &Data,
        tokens: &[String],
    ) -> (bool, FormId, bool, FormId) {
        if Self::disabled(data) {
            return (false, 0, false, 0);
        }
        let Some(session) = self.session(data) else { return (false, 0, false, 0) };

        let state = self.state.read();
        let mut node = ROOT_ID;
        for (position, token) in tokens.iter().enumerate() {
            let Some(atom) = session.atom_id(token) else { return (false, 0, false, 0) };
            let Some(child) = state.child_with_atom(node, atom) else {
                return (false, 0, false, 0);
            };
            let child_node = &state.nodes[&child];
            if child_node.is_leaf {
                child_node.visits.fetch_add(1, Ordering::Relaxed);
                return (true, child_node.input_id, false, 0);
            }
            node = child;
            if position + 1 == tokens.len()
                && state.nodes[&node].result == OracleResult::Unfinished
            {
                return (true, state.nodes[&node].input_id, false, 0);
            }
        }

        // Nothing known about the sequence itself; the shortest decided
        // extension is the nearest leaf or unfinished node below.
        let mut queue = std::collections::VecDeque::from([node]);
        while let Some(current) = queue.pop_front() {
            let entry = &state.nodes[&current];
            if entry.is_leaf || entry.result == OracleResult::Unfinished {
                return (false, 0, true, entry.input_id);
            }
            queue.extend(entry.children.iter().copied());
        }
        (false, 0, false, 0)
    }

    pub fn depth(&self) -> i64 {
        self.state.read().depth
    }

    /// Number of stored nodes, the root excluded.
    pub fn node_count(&self) -> u64 {
        self.state.read().nodes.len() as u64 - 1
    }

    pub fn leaf_count(&self) -> u64 {
        self.state.read().leaf_count
    }
}

impl Form for ExclusionTree {
    fn form_type(&self) -> FormType {
        FormType::ExclTree
    }

    fn core(&self) -> &FormCore {
        &self.core
    }

    fn write_data(&self, enc: &mut Encoder) -> CodecResult<()> {
        enc.write_i32(CLASS_VERSION)?;
        self.core.write_envelope(enc)?;

        let state = self.state.read();
        enc.write_u64(state.next_id)?;
        let root = &state.nodes[&ROOT_ID];
        enc.write_u64_seq(root.children.iter().copied())?;
        enc.write_bool(root.is_leaf)?;
        enc.write_u64(state.nodes.len() as u64 - 1)?;
        // Stable order keeps identical stores byte-identical across saves.
        let mut ids: Vec<u64> = state.nodes.keys().copied().filter(|&id| id != ROOT_ID).collect();
        ids.sort_unstable();
        for id in ids {
            let node = &state.nodes[&id];
            enc.write_u64(node.id)?;
            enc.write_u64(node.atom)?;
            enc.write_u64(node.visits.load(Ordering::Relaxed))?;
            enc.write_u64_seq(node.children.iter().copied())?;
            enc.write_bool(node.is_leaf)?;
            enc.write_i32(node.result.encode())?;
            enc.write_u64(node.input_id)?;
        }
        enc.write_i64(state.depth)?;
        enc.write_u64(state.leaf_count)?;
        enc.write_u64(state.session_id)
    }

    fn read_data(&self, dec: &mut Decoder<'_>, _resolver: &mut LoadResolver) -> CodecResult<()> {
        read_version(dec, &[CLASS_VERSION])?;
        self.core.read_envelope(dec)?;

        let mut state = TreeState::default();
        state.next_id = dec.read_u64()?;
        let root_children = dec.read_u64_seq()?;
        let root_is_leaf = dec.read_bool()?;
        {
            let root = state.nodes.get_mut(&ROOT_ID).expect("root present");
            root.children = root_children;
            root.is_leaf = root_is_leaf;
        }
        let count = dec.read_u64()?;
        for _ in 0..count {
            let id = dec.read_u64()?;
            let atom = dec.read_u64()?;
            let visits = dec.read_u64()?;
            let children = dec.read_u64_seq()?;
            let is_leaf = dec.read_bool()?;
            let result = OracleResult::decode(dec.read_i32()?)?;
            let input_id = dec.read_u64()?;
            let node = TreeNode {
                id,
                atom,
                visits: AtomicU64::new(visits),
                children,
                is_leaf,
                result,
                input_id,
            };
            state.nodes.insert(id, node);
        }
        state.depth = dec.read_i64()?;
        state.leaf_count = dec.read_u64()?;
        state.session_id = dec.read_u64()?;

        // Drop edges to nodes that did not survive the save.
        let known: Vec<u64> = state.nodes.keys().copied().collect();
        for id in known {
            let missing: Vec<u64> = state.nodes[&id]
                .children
                .iter()
                .copied()
                .filter(|child| !state.nodes.contains_key(child))
                .collect();
            if !missing.is_empty() {
                warn!(node = id, ?missing, "cannot resolve exclusion-tree children");
                state
                    .nodes
                    .get_mut(&id)
                    .expect("node present")
                    .children
                    .retain(|child| !missing.contains(child));
            }
        }
        *self.state.write() = state;
        Ok(())
    }

    fn clear(&self) {
        *self.state.write() = TreeState::default();
        self.core.clear();
    }

    fn memory_size(&self) -> usize {
        let state = self.state.read();
        size_of::<Self>()
            + state
                .nodes
                .values()
                .map(|n| size_of::<TreeNode>() + n.children.len() * size_of::<u64>())
                .sum::<usize>()
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
    use crate::settings::SettingsValues;

    fn tokens(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| (*s).to_owned()).collect()
    }

    fn setup() -> (Data, Arc<ExclusionTree>) {
        let data = Data::new();
        let session = data.create_form::<SessionData>();
        let _settings = data.create_form::<Settings>();
        let tree = data.create_form::<ExclusionTree>();
        tree.init(session.core().form_id());
        (data, tree)
    }

    #[test]
    fn decided_prefixes_subsume_extensions() {
        let (data, tree) = setup();
        tree.add_sequence(&data, &tokens(&["a", "b"]), 500, OracleResult::Passing);
        tree.add_sequence(&data, &tokens(&["a", "c"]), 501, OracleResult::Unfinished);

        assert_eq!(tree.has_prefix(&data, &tokens(&["a", "b", "x"])), (true, 500));
        assert_eq!(tree.has_prefix(&data, &tokens(&["a", "c"])), (true, 501));
        assert_eq!(tree.has_prefix(&data, &tokens(&["a", "d"])), (false, 0));
        // The unfinished entry does not block proper extensions.
        assert_eq!(tree.has_prefix(&data, &tokens(&["a", "c", "x"])), (false, 0));
    }

    #[test]
    fn adding_a_decided_input_prunes_its_subtree() {
        let (data, tree) = setup();
        tree.add_sequence(&data, &tokens(&["a", "b", "c"]), 600, OracleResult::Unfinished);
        tree.add_sequence(&data, &tokens(&["a", "b", "d"]), 601, OracleResult::Unfinished);
        assert_eq!(tree.node_count(), 4);

        tree.add_sequence(&data, &tokens(&["a", "b"]), 602, OracleResult::Failing);
        assert_eq!(tree.node_count(), 2);
        assert_eq!(tree.leaf_count(), 1);
        assert_eq!(tree.has_prefix(&data, &tokens(&["a", "b", "c"])), (true, 602));
    }

    #[test]
    fn inputs_below_a_decided_prefix_are_not_recorded() {
        let (data, tree) = setup();
        tree.add_sequence(&data, &tokens(&["p"]), 700, OracleResult::Passing);
        tree.add_sequence(&data, &tokens(&["p", "q"]), 701, OracleResult::Failing);
        assert_eq!(tree.node_count(), 1);
        assert_eq!(tree.has_prefix(&data, &tokens(&["p", "q"])), (true, 700));
    }

    #[test]
    fn undefined_results_do_not_decide() {
        let (data, tree) = setup();
        tree.add_sequence(&data, &tokens(&["u", "v"]), 800, OracleResult::Undefined);
        assert_eq!(tree.has_prefix(&data, &tokens(&["u", "v"])), (false, 0));
        assert_eq!(tree.leaf_count(), 0);
    }

    #[test]
    fn shortest_extension_is_found_breadth_first() {
        let (data, tree) = setup();
        tree.add_sequence(&data, &tokens(&["a", "b", "c", "d"]), 900, OracleResult::Passing);
        tree.add_sequence(&data, &tokens(&["a", "e"]), 901, OracleResult::Failing);

        let (has_prefix, prefix_id, has_extension, extension_id) =
            tree.has_prefix_and_shortest_extension(&data, &tokens(&["a"]));
        assert!(!has_prefix);
        assert_eq!(prefix_id, 0);
        assert!(has_extension);
        assert_eq!(extension_id, 901);

        let decided = tree.has_prefix_and_shortest_extension(&data, &tokens(&["a", "e", "f"]));
        assert_eq!(decided, (true, 901, false, 0));
    }

    #[test]
    fn depth_tracks_the_longest_insertion() {
        let (data, tree) = setup();
        assert_eq!(tree.depth(), 0);
        tree.add_sequence(&data, &tokens(&["1", "2", "3"]), 1000, OracleResult::Unfinished);
        assert_eq!(tree.depth(), 3);
        tree.add_sequence(&data, &tokens(&["1"]), 1001, OracleResult::Unfinished);
        assert_eq!(tree.depth(), 3);
    }

    #[test]
    fn disabling_turns_the_tree_off() {
        let (data, tree) = setup();
        let settings = data.lookup_form::<Settings>(static_ids::SETTINGS).unwrap();
        settings.update(SettingsValues {
            disable_exclusion_tree: true,
            ..SettingsValues::default()
        });
        tree.add_sequence(&data, &tokens(&["a"]), 1100, OracleResult::Passing);
        assert_eq!(tree.node_count(), 0);
        assert_eq!(tree.has_prefix(&data, &tokens(&["a"])), (false, 0));
    }

    #[test]
    fn state_survives_serialization() {
        let (data, tree) = setup();
        tree.add_sequence(&data, &tokens(&["a", "b"]), 1200, OracleResult::Passing);
        tree.add_sequence(&data, &tokens(&["a", "c"]), 1201, OracleResult::Unfinished);

        let mut enc = Encoder::new();
        tree.write_data(&mut enc).unwrap();
        let bytes = enc.into_bytes();

        let loaded = ExclusionTree::default();
        let mut resolver = LoadResolver::new();
        loaded.read_data(&mut Decoder::new(&bytes), &mut resolver).unwrap();
        assert_eq!(loaded.node_count(), tree.node_count());
        assert_eq!(loaded.leaf_count(), 1);
        assert_eq!(loaded.depth(), 2);
        assert_eq!(loaded.has_prefix(&data, &tokens(&["a", "b", "z"])), (true, 1200));
    }
}
