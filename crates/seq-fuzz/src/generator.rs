//! The generator (singleton id 5): turns grammar derivations into fresh
//! input forms, extends existing inputs, and rotates generation cohorts.

use std::any::Any;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rand::Rng;
use rand_mt::Mt;
use tracing::{debug, warn};

use crate::codec::{CodecResult, Decoder, Encoder};
use crate::derivation::DerivationTree;
use crate::generation::Generation;
use crate::grammar::Grammar;
use crate::input::{Input, InputFlags};
use crate::settings::SettingsValues;
use crate::store::{Data, Form, FormCore, FormId, FormType, LoadResolver, read_version};

#[derive(Debug, Default)]
struct GeneratorState {
    generations: Vec<FormId>,
    current: FormId,
}

const CLASS_VERSION: i32 = 0x1;

pub struct Generator {
    core: FormCore,
    state: RwLock<GeneratorState>,
    rng: Mutex<Mt>,
}

impl std::fmt::Debug for Generator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Generator").field("state", &*self.state.read()).finish()
    }
}

impl Default for Generator {
    fn default() -> Self {
        Self {
            core: FormCore::default(),
            state: RwLock::new(GeneratorState::default()),
            rng: Mutex::new(Mt::new(0x5eed)),
        }
    }
}

impl Generator {
    /// Reseeds the generator's RNG; derivation seeds and target lengths
    /// drawn afterwards are reproducible.
    pub fn reseed(&self, seed: u32) {
        *self.rng.lock() = Mt::new(seed);
    }

    /// Random target length within the configured generation range.
    pub fn random_target_length(&self, settings: &SettingsValues) -> i32 {
        let low = settings.generation_length_min.max(1);
        let high = settings.generation_length_max.max(low);
        self.rng.lock().random_range(low..=high)
    }

    fn next_seed(&self) -> u32 {
        self.rng.lock().random_range(0..=u32::MAX)
    }

    /// Opens a new generation cohort sized from the settings.
    pub fn start_generation(&self, data: &Data, settings: &SettingsValues, target_size: i64) -> Arc<Generation> {
        let generation = data.create_form::<Generation>();
        let number = self.state.read().generations.len() as i32 + 1;
        generation.configure(
            target_size,
            settings.max_active_inputs,
            settings.max_simultaneous_generation,
            number,
        );
        self.core.set_changed();
        let mut state = self.state.write();
        state.generations.push(generation.core().form_id());
        state.current = generation.core().form_id();
        debug!(number, target_size, "opened generation");
        generation
    }

    pub fn current_generation(&self, data: &Data) -> Option<Arc<Generation>> {
        let id = self.state.read().current;
        data.lookup_form::<Generation>(id)
    }

    pub fn generation_count(&self) -> usize {
        self.state.read().generations.len()
    }

    /// Derives a fresh input from the grammar: a new derivation tree and a
    /// new input form, linked and flagged.
    pub fn generate_fresh(
        &self,
        data: &Data,
        grammar: &Grammar,
        settings: &SettingsValues,
    ) -> Option<Arc<Input>> {
        if !grammar.is_valid() {
            warn!("cannot generate from an invalid grammar");
            return None;
        }
        let target_len = self.random_target_length(settings);
        let seed = self.next_seed();

        let tree = data.create_form::<DerivationTree>();
        grammar.derive(&tree, target_len, seed);
        if !tree.is_valid() {
            data.delete_form(tree.core().form_id());
            return None;
        }
        let input = data.create_form::<Input>();
        input.populate_from_tree(&tree);
        input.set_generation_time(data.runtime());
        Some(input)
    }

    /// Uniformly picks one of the cohort's source inputs to extend from.
    pub fn pick_source(&self, data: &Data, generation: &Generation) -> Option<Arc<Input>> {
        let sources = generation.sources();
        if sources.is_empty() {
            return None;
        }
        let index = self.rng.lock().random_range(0..sources.len());
        data.lookup_form::<Input>(sources[index])
    }

    /// Extends `parent` by new sequence atoms, optionally backtracking over
    /// its suffix first. The parent keeps score of its derived inputs.
    pub fn generate_extension(
        &self,
        data: &Data,
        grammar: &Grammar,
        parent: &Arc<Input>,
        backtrack: bool,
        settings: &SettingsValues,
    ) -> Option<Arc<Input>> {
        let source = data.lookup_form::<DerivationTree>(parent.derive_id())?;
        let target_len = parent.effective_length() as i32 + self.random_target_length(settings);
        let seed = self.next_seed();

        let tree = data.create_form::<DerivationTree>();
        let trimmed = parent.is_trimmed().then(|| parent.trimmed_length());
        let backtracked = grammar.extend(&source, trimmed, &tree, backtrack, target_len, seed);
        let Some(backtracked) = backtracked else {
            parent.inc_derived_fails();
            data.delete_form(tree.core().form_id());
            return None;
        };

        let input = data.create_form::<Input>();
        input.populate_from_tree(&tree);
        input.set_parent_extension(parent.core().form_id(), backtracked as i32);
        input.set_generation_time(data.runtime());
        if backtrack {
            input.set_input_flag(InputFlags::GENERATED_GRAMMAR_PARENT_BACKTRACK);
        }
        parent.inc_derived_inputs();
        Some(input)
    }
}

impl Form for Generator {
    fn form_type(&self) -> FormType {
        FormType::Generator
    }

    fn core(&self) -> &FormCore {
        &self.core
    }

    fn write_data(&self, enc: &mut Encoder) -> CodecResult<()> {
        enc.write_i32(CLASS_VERSION)?;
        self.core.write_envelope(enc)?;
        let state = self.state.read();
        enc.write_u64_seq(state.generations.iter().copied())?;
        enc.write_u64(state.current)
    }

    fn read_data(&self, dec: &mut Decoder<'_>, _resolver: &mut LoadResolver) -> CodecResult<()> {
        read_version(dec, &[CLASS_VERSION])?;
        self.core.read_envelope(dec)?;
        let mut state = self.state.write();
        state.generations = dec.read_u64_seq()?;
        state.current = dec.read_u64()?;
        Ok(())
    }

    fn clear(&self) {
        *self.state.write() = GeneratorState::default();
        self.core.clear();
    }

    fn memory_size(&self) -> usize {
        size_of::<Self>() + self.state.read().generations.len() * size_of::<FormId>()
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

    fn session(grammar_text: &str) -> (Data, Arc<Generator>, Arc<Grammar>, SettingsValues) {
        let data = Data::new();
        let generator = data.create_form::<Generator>();
        generator.reseed(7);
        let grammar = data.create_form::<Grammar>();
        grammar.parse_text(grammar_text).unwrap();
        let settings = SettingsValues {
            generation_length_min: 3,
            generation_length_max: 6,
            extension_min: 0,
            extension_max: 0,
            backtrack_min: 1,
            backtrack_max: 1,
            ..SettingsValues::default()
        };
        grammar.set_generation_params(&settings);
        (data, generator, grammar, settings)
    }

    const XS: &str = "Grammar('start := 'SEQ_x ~ 'start | 'SEQ_x, 'SEQ_x := \"x\")";

    #[test]
    fn fresh_inputs_are_linked_to_their_trees() {
        let (data, generator, grammar, settings) = session(XS);
        let input = generator.generate_fresh(&data, &grammar, &settings).unwrap();
        assert!(input.generated());
        assert!((3..=6).contains(&(input.len() as i32)));
        assert!(input.has_input_flag(InputFlags::GENERATED_GRAMMAR));

        let tree = data.lookup_form::<DerivationTree>(input.derive_id()).unwrap();
        assert!(tree.is_valid());
        assert_eq!(tree.input_id(), input.core().form_id());
        assert_eq!(tree.sequence_len(), input.len() as i64);
    }

    #[test]
    fn extensions_grow_their_parent() {
        let (data, generator, grammar, settings) = session(XS);
        let parent = generator.generate_fresh(&data, &grammar, &settings).unwrap();
        let child = generator.generate_extension(&data, &grammar, &parent, false, &settings).unwrap();
        assert!(child.len() > parent.len());
        assert_eq!(child.parent_split().parent_id, parent.core().form_id());
        assert_eq!(parent.derived_inputs(), 1);
        assert!(child.has_input_flag(InputFlags::GENERATED_GRAMMAR_PARENT));

        // The parent tree may not be deleted while derived inputs remain.
        assert!(!data.delete_form(parent.derive_id()));
    }

    #[test]
    fn sources_are_picked_from_the_cohort() {
        let (data, generator, grammar, settings) = session(XS);
        let generation = generator.start_generation(&data, &settings, 10);
        assert!(generator.pick_source(&data, &generation).is_none());

        let parent = generator.generate_fresh(&data, &grammar, &settings).unwrap();
        generation.add_source(&parent);
        let picked = generator.pick_source(&data, &generation).unwrap();
        assert_eq!(picked.core().form_id(), parent.core().form_id());
    }

    /// The dispatch loop in miniature: generate, gate on the exclusion
    /// tree, record the verdict, and watch the gate close.
    #[test]
    fn decided_prefixes_gate_extensions() {
        use crate::exclusion::ExclusionTree;
        use crate::oracle::OracleResult;
        use crate::session::SessionData;
        use crate::test_case::{ExitReason, TestCase};

        let (data, generator, grammar, settings) = session(XS);
        let session_data = data.create_form::<SessionData>();
        let exclusion = data.create_form::<ExclusionTree>();
        exclusion.init(session_data.core().form_id());

        let input = generator.generate_fresh(&data, &grammar, &settings).unwrap();
        assert_eq!(exclusion.has_prefix(&data, &input.tokens()), (false, 0));

        // Execution finishes and the oracle decides.
        let test = data.create_form::<TestCase>();
        test.begin(input.core().form_id(), "./put".to_owned());
        test.finish(1, ExitReason::Natural, std::time::Duration::from_millis(3));
        input.set_test_id(test.core().form_id());
        input.set_execution_result(1, std::time::Duration::from_millis(3), OracleResult::Failing);
        exclusion.add_sequence(&data, &input.tokens(), input.core().form_id(), OracleResult::Failing);
        assert_eq!(input.test_case(&data).unwrap().exit_code(), 1);

        // Any extension of the decided input is now subsumed.
        let child = generator.generate_extension(&data, &grammar, &input, false, &settings).unwrap();
        let (blocked, decided_by) = exclusion.has_prefix(&data, &child.tokens());
        assert!(blocked);
        assert_eq!(decided_by, input.core().form_id());
    }

    #[test]
    fn generations_rotate() {
        let (data, generator, _, settings) = session(XS);
        let first = generator.start_generation(&data, &settings, 100);
        assert_eq!(first.generation_number(), 1);
        let second = generator.start_generation(&data, &settings, 50);
        assert_eq!(second.generation_number(), 2);
        assert_eq!(
            generator.current_generation(&data).unwrap().core().form_id(),
            second.core().form_id()
        );
        assert_eq!(generator.generation_count(), 2);
    }
}
