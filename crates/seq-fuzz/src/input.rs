//! The input form: an ordered token sequence with its scoring metadata,
//! trimming state and links to the derivation tree it came from and the
//! test that executed it.

use std::any::Any;
use std::collections::VecDeque;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use itertools::Itertools;
use parking_lot::RwLock;
use tracing::warn;

use crate::codec::{CodecResult, Decoder, Encoder};
use crate::derivation::{DerivationTree, Segments, materialize_sequence};
use crate::oracle::OracleResult;
use crate::store::{Form, FormCore, FormFlags, FormId, FormType, LoadResolver, read_version};

bitflags::bitflags! {
    /// Input-specific bits of the shared form flag space.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct InputFlags: u64 {
        /// Duplicate of an existing input; may be discarded.
        const DUPLICATE = 1 << 2;
        /// This input has already been delta debugged.
        const DELTA_DEBUGGED = 1 << 3;
        /// Generated from the grammar.
        const GENERATED_GRAMMAR = 1 << 4;
        /// Generated as an extension of an existing input.
        const GENERATED_GRAMMAR_PARENT = 1 << 5;
        /// Generated by backtracking on an existing input.
        const GENERATED_GRAMMAR_PARENT_BACKTRACK = 1 << 6;
        /// Produced by splitting another input.
        const GENERATED_DELTA_DEBUGGING = 1 << 7;
        /// Per-position score arrays must survive `free_memory`.
        const KEEP_INDIVIDUAL_SCORES = 1 << 8;
    }
}

/// How this input was carved out of its parent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParentSplit {
    pub parent_id: FormId,
    /// Segments `(begin, length)` over the parent sequence.
    pub segments: Segments,
    /// Whether the segments describe the complement.
    pub complement: bool,
    /// Sequence atoms backtracked when this input was produced.
    pub backtrack: i32,
}

#[derive(Debug, Default)]
struct InputState {
    sequence: Vec<String>,
    /// Sequence as originally generated; only set while trimmed.
    original_sequence: Vec<String>,
    has_finished: bool,
    trimmed: bool,
    trimmed_length: i64,
    execution_time: Duration,
    exit_code: i32,
    primary_score: f64,
    secondary_score: f64,
    primary_individual: VecDeque<f64>,
    secondary_individual: VecDeque<f64>,
    enable_primary_individual: bool,
    enable_secondary_individual: bool,
    string_rep: Option<String>,
    python_rep: Option<String>,
    generated: bool,
    parent: ParentSplit,
    generation_id: FormId,
    generation_time: Duration,
    oracle_result: OracleResult,
    derive_id: FormId,
    test_id: FormId,
}

const CLASS_VERSION: i32 = 0x3;

#[derive(Debug)]
pub struct Input {
    core: FormCore,
    state: RwLock<InputState>,
    derived_inputs: AtomicU64,
    derived_fails: AtomicU64,
    /// Times this input was re-run; runtime only, never persisted.
    retries: AtomicU64,
}

impl Default for Input {
    fn default() -> Self {
        Self {
            core: FormCore::default(),
            state: RwLock::new(InputState { trimmed_length: -1, exit_code: -1, ..InputState::default() }),
            derived_inputs: AtomicU64::new(0),
            derived_fails: AtomicU64::new(0),
            retries: AtomicU64::new(0),
        }
    }
}

impl Input {
    pub fn set_input_flag(&self, flag: InputFlags) {
        self.core.set_flag(FormFlags::from_bits_retain(flag.bits()));
    }

    pub fn has_input_flag(&self, flag: InputFlags) -> bool {
        self.core.has_flag(FormFlags::from_bits_retain(flag.bits()))
    }

    /// Appends a token to the sequence.
    pub fn add_entry(&self, entry: impl Into<String>) {
        self.core.set_changed();
        let mut state = self.state.write();
        state.sequence.push(entry.into());
        state.string_rep = None;
        state.python_rep = None;
    }

    /// Fills the sequence from a derivation tree's sequence atoms and links
    /// the two forms.
    pub fn populate_from_tree(&self, tree: &DerivationTree) {
        let tree_state = tree.read();
        let Some(root) = tree_state.root.as_ref() else {
            warn!(form = %tree.print_form(), "cannot materialize an empty tree");
            return;
        };
        let tokens = materialize_sequence(root);
        drop(tree_state);

        self.core.set_changed();
        let mut state = self.state.write();
        state.sequence = tokens;
        state.generated = true;
        state.derive_id = tree.core().form_id();
        state.string_rep = None;
        state.python_rep = None;
        drop(state);
        tree.set_input_id(self.core.form_id());
        self.set_input_flag(InputFlags::GENERATED_GRAMMAR);
    }

    pub fn len(&self) -> usize {
        self.state.read().sequence.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().sequence.is_empty()
    }

    pub fn tokens(&self) -> Vec<String> {
        self.state.read().sequence.clone()
    }

    /// Trimmed length while trimmed, full length otherwise.
    pub fn effective_length(&self) -> i64 {
        let state = self.state.read();
        if state.trimmed { state.trimmed_length } else { state.sequence.len() as i64 }
    }

    pub fn generated(&self) -> bool {
        self.state.read().generated
    }

    pub fn set_generated(&self, generated: bool) {
        self.core.set_changed();
        self.state.write().generated = generated;
    }

    /// The whole sequence as one concatenated string; cached.
    pub fn to_concatenated_string(&self) -> String {
        if let Some(cached) = self.state.read().string_rep.clone() {
            return cached;
        }
        let mut state = self.state.write();
        let rep = state.sequence.concat();
        state.string_rep = Some(rep.clone());
        rep
    }

    /// Python-list style rendering; cached.
    pub fn to_python_list(&self) -> String {
        if let Some(cached) = self.state.read().python_rep.clone() {
            return cached;
        }
        let mut state = self.state.write();
        let rep =
            format!("[{}]", state.sequence.iter().map(|token| format!("'{token}'")).join(", "));
        state.python_rep = Some(rep.clone());
        rep
    }

    /// Hash of the token sequence, used for duplicate detection.
    pub fn sequence_hash(&self) -> u64 {
        let state = self.state.read();
        let mut hasher = ahash::AHasher::default();
        state.sequence.hash(&mut hasher);
        hasher.finish()
    }

    // ---- trimming ---------------------------------------------------------

    /// Cuts the sequence down to the `executed` leading tokens, keeping the
    /// original aside.
    pub fn trim(&self, executed: i64) {
        let mut state = self.state.write();
        if executed < 0 || executed as usize >= state.sequence.len() {
            return;
        }
        self.core.set_changed();
        if !state.trimmed {
            state.original_sequence = state.sequence.clone();
        }
        state.sequence.truncate(executed as usize);
        state.trimmed = true;
        state.trimmed_length = executed;
        state.string_rep = None;
        state.python_rep = None;
    }

    /// Restores the originally generated sequence.
    pub fn clear_trim(&self) {
        let mut state = self.state.write();
        if !state.trimmed {
            return;
        }
        self.core.set_changed();
        state.sequence = std::mem::take(&mut state.original_sequence);
        state.trimmed = false;
        state.trimmed_length = -1;
        state.string_rep = None;
        state.python_rep = None;
    }

    pub fn is_trimmed(&self) -> bool {
        self.state.read().trimmed
    }

    /// `-1` while untrimmed.
    pub fn trimmed_length(&self) -> i64 {
        let state = self.state.read();
        if state.trimmed { state.trimmed_length } else { -1 }
    }

    // ---- execution results ------------------------------------------------

    pub fn set_execution_result(
        &self,
        exit_code: i32,
        execution_time: Duration,
        result: OracleResult,
    ) {
        self.core.set_changed();
        let mut state = self.state.write();
        state.exit_code = exit_code;
        state.execution_time = execution_time;
        state.has_finished = true;
        state.oracle_result = result;
    }

    pub fn finished(&self) -> bool {
        self.state.read().has_finished
    }

    /// `None` until the associated test has finished.
    pub fn execution_time(&self) -> Option<Duration> {
        let state = self.state.read();
        state.has_finished.then_some(state.execution_time)
    }

    pub fn exit_code(&self) -> Option<i32> {
        let state = self.state.read();
        state.has_finished.then_some(state.exit_code)
    }

    pub fn oracle_result(&self) -> OracleResult {
        self.state.read().oracle_result
    }

    // ---- scores -----------------------------------------------------------

    pub fn primary_score(&self) -> f64 {
        self.state.read().primary_score
    }

    pub fn secondary_score(&self) -> f64 {
        self.state.read().secondary_score
    }

    pub fn set_primary_score(&self, score: f64) {
        self.core.set_changed();
        self.state.write().primary_score = score;
    }

    pub fn set_secondary_score(&self, score: f64) {
        self.core.set_changed();
        self.state.write().secondary_score = score;
    }

    pub fn enable_individual_scores(&self, primary: bool, secondary: bool) {
        self.core.set_changed();
        let mut state = self.state.write();
        state.enable_primary_individual |= primary;
        state.enable_secondary_individual |= secondary;
    }

    pub fn push_primary_individual(&self, score: f64) {
        let mut state = self.state.write();
        if state.enable_primary_individual {
            state.primary_individual.push_back(score);
            self.core.set_changed();
        }
    }

    pub fn push_secondary_individual(&self, score: f64) {
        let mut state = self.state.write();
        if state.enable_secondary_individual {
            state.secondary_individual.push_back(score);
            self.core.set_changed();
        }
    }

    pub fn primary_individual_len(&self) -> usize {
        self.state.read().primary_individual.len()
    }

    pub fn primary_individual(&self, position: usize) -> Option<f64> {
        self.state.read().primary_individual.get(position).copied()
    }

    pub fn clear_scores(&self) {
        self.core.set_changed();
        let mut state = self.state.write();
        state.primary_score = 0.0;
        state.secondary_score = 0.0;
        state.primary_individual.clear();
        state.secondary_individual.clear();
    }

    /// Maximal runs of constant primary score, as `(begin, length)`, at most
    /// `max` of them. Reducers cut where nothing changes.
    pub fn primary_ranges_without_changes(&self, max: usize) -> Vec<(usize, usize)> {
        ranges_without_changes(&self.state.read().primary_individual, max)
    }

    pub fn secondary_ranges_without_changes(&self, max: usize) -> Vec<(usize, usize)> {
        ranges_without_changes(&self.state.read().secondary_individual, max)
    }

    // ---- lineage ----------------------------------------------------------

    /// Marks this input as a split of `parent`, with the matching flag.
    pub fn set_parent_split(&self, parent_id: FormId, segments: Segments, complement: bool) {
        self.core.set_changed();
        let mut state = self.state.write();
        state.parent.parent_id = parent_id;
        state.parent.segments = segments;
        state.parent.complement = complement;
        drop(state);
        self.set_input_flag(InputFlags::GENERATED_DELTA_DEBUGGING);
    }

    /// Marks this input as an extension of `parent`.
    pub fn set_parent_extension(&self, parent_id: FormId, backtrack: i32) {
        self.core.set_changed();
        let mut state = self.state.write();
        state.parent.parent_id = parent_id;
        state.parent.backtrack = backtrack;
        drop(state);
        self.set_input_flag(if backtrack > 0 {
            InputFlags::GENERATED_GRAMMAR_PARENT_BACKTRACK
        } else {
            InputFlags::GENERATED_GRAMMAR_PARENT
        });
    }

    pub fn parent_split(&self) -> ParentSplit {
        self.state.read().parent.clone()
    }

    pub fn generation_id(&self) -> FormId {
        self.state.read().generation_id
    }

    pub fn set_generation_id(&self, id: FormId) {
        self.core.set_changed();
        self.state.write().generation_id = id;
    }

    pub fn generation_time(&self) -> Duration {
        self.state.read().generation_time
    }

    pub fn set_generation_time(&self, runtime: Duration) {
        self.core.set_changed();
        self.state.write().generation_time = runtime;
    }

    pub fn derive_id(&self) -> FormId {
        self.state.read().derive_id
    }

    pub fn set_derive_id(&self, id: FormId) {
        self.core.set_changed();
        self.state.write().derive_id = id;
    }

    pub fn test_id(&self) -> FormId {
        self.state.read().test_id
    }

    pub fn set_test_id(&self, id: FormId) {
        self.core.set_changed();
        self.state.write().test_id = id;
    }

    /// The execution record of this input, while it is still registered.
    pub fn test_case(&self, data: &crate::store::Data) -> Option<Arc<crate::test_case::TestCase>> {
        let id = self.state.read().test_id;
        data.lookup_form(id)
    }

    pub fn inc_derived_inputs(&self) {
        self.derived_inputs.fetch_add(1, Ordering::AcqRel);
        self.core.set_changed();
    }

    pub fn inc_derived_fails(&self) {
        self.derived_fails.fetch_add(1, Ordering::AcqRel);
        self.core.set_changed();
    }

    pub fn derived_inputs(&self) -> u64 {
        self.derived_inputs.load(Ordering::Acquire)
    }

    pub fn derived_fails(&self) -> u64 {
        self.derived_fails.load(Ordering::Acquire)
    }

    pub fn retries(&self) -> u64 {
        self.retries.load(Ordering::Acquire)
    }

    pub fn inc_retries(&self) {
        self.retries.fetch_add(1, Ordering::AcqRel);
    }

    pub fn print_form(&self) -> String {
        let state = self.state.read();
        format!(
            "[Input<{:#x}><parent {:#x}><len {}><prim {}><sec {}>]",
            self.core.form_id(),
            state.parent.parent_id,
            state.sequence.len(),
            state.primary_score,
            state.secondary_score,
        )
    }
}

fn ranges_without_changes(scores: &VecDeque<f64>, max: usize) -> Vec<(usize, usize)> {
    let mut ranges = Vec::new();
    let mut begin = 0usize;
    for position in 1..=scores.len() {
        if position == scores.len() || scores[position] != scores[begin] {
            if position - begin > 1 {
                ranges.push((begin, position - begin));
                if ranges.len() >= max {
                    break;
                }
            }
            begin = position;
        }
    }
    ranges
}

impl Form for Input {
    fn form_type(&self) -> FormType {
        FormType::Input
    }

    fn core(&self) -> &FormCore {
        &self.core
    }

    fn write_data(&self, enc: &mut Encoder) -> CodecResult<()> {
        enc.write_i32(CLASS_VERSION)?;
        self.core.write_envelope(enc)?;

        let state = self.state.read();
        enc.write_str_seq(state.sequence.iter().map(String::as_str))?;
        enc.write_str_seq(state.original_sequence.iter().map(String::as_str))?;
        enc.write_bool(state.has_finished)?;
        enc.write_bool(state.trimmed)?;
        enc.write_i64(state.trimmed_length)?;
        enc.write_duration_ns(state.execution_time)?;
        enc.write_i32(state.exit_code)?;
        enc.write_f64(state.primary_score)?;
        enc.write_f64(state.secondary_score)?;
        enc.write_bool(state.enable_primary_individual)?;
        enc.write_f64_seq(state.primary_individual.iter().copied())?;
        enc.write_bool(state.enable_secondary_individual)?;
        enc.write_f64_seq(state.secondary_individual.iter().copied())?;
        enc.write_bool(state.generated)?;
        enc.write_u64(state.parent.parent_id)?;
        enc.write_u64(state.parent.segments.len() as u64)?;
        for &(begin, length) in &state.parent.segments {
            enc.write_i64(begin)?;
            enc.write_i64(length)?;
        }
        enc.write_bool(state.parent.complement)?;
        enc.write_i32(state.parent.backtrack)?;
        enc.write_u64(state.generation_id)?;
        enc.write_duration_ns(state.generation_time)?;
        enc.write_i32(state.oracle_result.encode())?;
        enc.write_u64(state.derive_id)?;
        enc.write_u64(state.test_id)?;
        enc.write_u64(self.derived_inputs.load(Ordering::Acquire))?;
        enc.write_u64(self.derived_fails.load(Ordering::Acquire))
    }

    fn read_data(&self, dec: &mut Decoder<'_>, resolver: &mut LoadResolver) -> CodecResult<()> {
        read_version(dec, &[CLASS_VERSION])?;
        self.core.read_envelope(dec)?;

        let mut state = self.state.write();
        state.sequence = dec.read_str_seq()?;
        state.original_sequence = dec.read_str_seq()?;
        state.has_finished = dec.read_bool()?;
        state.trimmed = dec.read_bool()?;
        state.trimmed_length = dec.read_i64()?;
        state.execution_time = dec.read_duration_ns()?;
        state.exit_code = dec.read_i32()?;
        state.primary_score = dec.read_f64()?;
        state.secondary_score = dec.read_f64()?;
        state.enable_primary_individual = dec.read_bool()?;
        state.primary_individual = dec.read_f64_seq()?.into();
        state.enable_secondary_individual = dec.read_bool()?;
        state.secondary_individual = dec.read_f64_seq()?.into();
        state.generated = dec.read_bool()?;
        state.parent.parent_id = dec.read_u64()?;
        let count = dec.read_u64()?;
        state.parent.segments.clear();
        for _ in 0..count {
            let begin = dec.read_i64()?;
            let length = dec.read_i64()?;
            state.parent.segments.push((begin, length));
        }
        state.parent.complement = dec.read_bool()?;
        state.parent.backtrack = dec.read_i32()?;
        state.generation_id = dec.read_u64()?;
        state.generation_time = dec.read_duration_ns()?;
        state.oracle_result = OracleResult::decode(dec.read_i32()?)?;
        state.derive_id = dec.read_u64()?;
        state.test_id = dec.read_u64()?;
        drop(state);
        self.derived_inputs.store(dec.read_u64()?, Ordering::Release);
        self.derived_fails.store(dec.read_u64()?, Ordering::Release);

        // Restore the tree's back-link once every form is present.
        let input_id = self.core.form_id();
        let derive_id = self.state.read().derive_id;
        if derive_id != 0 {
            resolver.add_task(move |data| {
                if let Some(tree) = LoadResolver::resolve_form::<DerivationTree>(data, derive_id)
                    && tree.input_id() == 0
                {
                    tree.set_input_id(input_id);
                }
            });
        }
        Ok(())
    }

    fn clear(&self) {
        *self.state.write() = InputState { trimmed_length: -1, exit_code: -1, ..InputState::default() };
        self.derived_inputs.store(0, Ordering::Release);
        self.derived_fails.store(0, Ordering::Release);
        self.retries.store(0, Ordering::Release);
        self.core.clear();
    }

    fn free_memory(&self) {
        if self.core.has_flag(FormFlags::DO_NOT_FREE) {
            return;
        }
        let mut state = self.state.write();
        state.string_rep = None;
        state.python_rep = None;
        if !self.has_input_flag(InputFlags::KEEP_INDIVIDUAL_SCORES) {
            state.primary_individual = VecDeque::new();
            state.secondary_individual = VecDeque::new();
        }
    }

    fn freed(&self) -> bool {
        let state = self.state.read();
        state.string_rep.is_none() && state.python_rep.is_none()
    }

    fn memory_size(&self) -> usize {
        let state = self.state.read();
        size_of::<Self>()
            + state.sequence.iter().map(|t| t.len() + size_of::<String>()).sum::<usize>()
            + state.original_sequence.iter().map(|t| t.len() + size_of::<String>()).sum::<usize>()
            + (state.primary_individual.len() + state.secondary_individual.len()) * size_of::<f64>()
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

    fn sample_input(tokens: &[&str]) -> Input {
        let input = Input::default();
        for token in tokens {
            input.add_entry(*token);
        }
        input
    }

    #[test]
    fn renderings_and_cache_invalidation() {
        let input = sample_input(&["ab", "cd"]);
        assert_eq!(input.to_concatenated_string(), "abcd");
        assert_eq!(input.to_python_list(), "['ab', 'cd']");
        input.add_entry("e");
        assert_eq!(input.to_concatenated_string(), "abcde");
        assert_eq!(input.to_python_list(), "['ab', 'cd', 'e']");
    }

    #[test]
    fn trimming_keeps_the_original_aside() {
        let input = sample_input(&["a", "b", "c", "d"]);
        input.trim(2);
        assert!(input.is_trimmed());
        assert_eq!(input.trimmed_length(), 2);
        assert_eq!(input.effective_length(), 2);
        assert_eq!(input.tokens(), vec!["a", "b"]);

        input.clear_trim();
        assert!(!input.is_trimmed());
        assert_eq!(input.trimmed_length(), -1);
        assert_eq!(input.tokens(), vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn trim_beyond_length_is_ignored() {
        let input = sample_input(&["a", "b"]);
        input.trim(5);
        assert!(!input.is_trimmed());
    }

    #[test]
    fn score_ranges_without_changes() {
        let input = Input::default();
        input.enable_individual_scores(true, false);
        for score in [1.0, 1.0, 1.0, 2.0, 2.0, 3.0, 3.0, 3.0, 3.0] {
            input.push_primary_individual(score);
        }
        assert_eq!(input.primary_ranges_without_changes(10), vec![(0, 3), (3, 2), (5, 4)]);
        assert_eq!(input.primary_ranges_without_changes(1), vec![(0, 3)]);
    }

    #[test]
    fn individual_scores_require_enabling() {
        let input = Input::default();
        input.push_primary_individual(1.0);
        assert_eq!(input.primary_individual_len(), 0);
        input.enable_individual_scores(true, false);
        input.push_primary_individual(1.0);
        assert_eq!(input.primary_individual_len(), 1);
    }

    #[test]
    fn free_memory_honors_the_keep_flag() {
        let input = Input::default();
        input.enable_individual_scores(true, true);
        input.push_primary_individual(4.0);
        input.free_memory();
        assert_eq!(input.primary_individual_len(), 0);

        let keeper = Input::default();
        keeper.enable_individual_scores(true, true);
        keeper.push_primary_individual(4.0);
        keeper.set_input_flag(InputFlags::KEEP_INDIVIDUAL_SCORES);
        keeper.free_memory();
        assert_eq!(keeper.primary_individual_len(), 1);
    }

    #[test]
    fn lineage_flags_follow_the_setters() {
        let input = sample_input(&["x"]);
        input.set_parent_extension(42, 0);
        assert!(input.has_input_flag(InputFlags::GENERATED_GRAMMAR_PARENT));
        assert!(!input.has_input_flag(InputFlags::GENERATED_GRAMMAR_PARENT_BACKTRACK));

        let other = sample_input(&["y"]);
        other.set_parent_extension(42, 3);
        assert!(other.has_input_flag(InputFlags::GENERATED_GRAMMAR_PARENT_BACKTRACK));

        let split = sample_input(&["z"]);
        split.set_parent_split(7, Segments::from_slice(&[(0, 1)]), true);
        assert!(split.has_input_flag(InputFlags::GENERATED_DELTA_DEBUGGING));
        assert_eq!(split.parent_split().parent_id, 7);
    }

    #[test]
    fn duplicate_detection_hashes_the_sequence() {
        let a = sample_input(&["q", "r"]);
        let b = sample_input(&["q", "r"]);
        let c = sample_input(&["q", "s"]);
        assert_eq!(a.sequence_hash(), b.sequence_hash());
        assert_ne!(a.sequence_hash(), c.sequence_hash());
    }

    #[test]
    fn metadata_round_trip() {
        let input = sample_input(&["a", "b", "c"]);
        input.core().set_form_id(300);
        input.trim(2);
        input.set_execution_result(0, Duration::from_millis(125), OracleResult::Passing);
        input.set_primary_score(7.5);
        input.set_parent_extension(299, 1);
        input.set_generation_id(42);
        input.inc_derived_inputs();

        let mut enc = Encoder::new();
        input.write_data(&mut enc).unwrap();
        let bytes = enc.into_bytes();

        let loaded = Input::default();
        let mut resolver = LoadResolver::new();
        loaded.read_data(&mut Decoder::new(&bytes), &mut resolver).unwrap();
        assert_eq!(loaded.core().form_id(), 300);
        assert_eq!(loaded.tokens(), vec!["a", "b"]);
        assert!(loaded.is_trimmed());
        assert_eq!(loaded.trimmed_length(), 2);
        assert_eq!(loaded.exit_code(), Some(0));
        assert_eq!(loaded.execution_time(), Some(Duration::from_millis(125)));
        assert_eq!(loaded.primary_score(), 7.5);
        assert_eq!(loaded.oracle_result(), OracleResult::Passing);
        assert_eq!(loaded.parent_split().parent_id, 299);
        assert_eq!(loaded.parent_split().backtrack, 1);
        assert_eq!(loaded.derived_inputs(), 1);
        assert!(loaded.has_input_flag(InputFlags::GENERATED_GRAMMAR_PARENT_BACKTRACK));
    }
}
