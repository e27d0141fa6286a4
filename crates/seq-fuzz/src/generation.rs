//! A generation cohort: bookkeeping for one wave of generated inputs, with
//! gating so that no single thread can claim the whole wave and sources
//! stay pinned in memory while the cohort is active.

use std::any::Any;
use std::sync::Arc;

use indexmap::IndexSet;
use parking_lot::RwLock;
use tracing::warn;

use crate::codec::{CodecResult, Decoder, Encoder};
use crate::input::Input;
use crate::store::{
    Data, Form, FormCore, FormFlags, FormId, FormType, LoadResolver, read_version,
};

#[derive(Debug, Default)]
struct GenerationState {
    target_size: i64,
    generated_size: i64,
    dd_size: i64,
    active_inputs: i64,
    max_active_inputs: i64,
    max_simultaneous_generation: i64,
    generation_number: i32,
    generated_inputs: IndexSet<FormId>,
    dd_inputs: IndexSet<FormId>,
    dd_controllers: IndexSet<FormId>,
    /// Inputs this cohort extends from; pinned while the cohort is active.
    sources: Vec<FormId>,
}

const CLASS_VERSION: i32 = 0x1;

#[derive(Debug, Default)]
pub struct Generation {
    core: FormCore,
    state: RwLock<GenerationState>,
}

impl Generation {
    pub fn configure(
        &self,
        target_size: i64,
        max_active_inputs: i64,
        max_simultaneous_generation: i64,
        generation_number: i32,
    ) {
        self.core.set_changed();
        let mut state = self.state.write();
        state.target_size = target_size;
        state.max_active_inputs = max_active_inputs;
        state.max_simultaneous_generation = max_simultaneous_generation;
        state.generation_number = generation_number;
    }

    pub fn target_size(&self) -> i64 {
        self.state.read().target_size
    }

    pub fn generated_size(&self) -> i64 {
        self.state.read().generated_size
    }

    pub fn dd_size(&self) -> i64 {
        self.state.read().dd_size
    }

    pub fn active_inputs(&self) -> i64 {
        self.state.read().active_inputs
    }

    pub fn generation_number(&self) -> i32 {
        self.state.read().generation_number
    }

    pub fn set_target_size(&self, size: i64) {
        self.core.set_changed();
        self.state.write().target_size = size;
    }

    /// Claims a batch of inputs to generate. Returns how many the caller may
    /// start right now; the claim is capped both by the active-input budget
    /// and the per-step generation cap, so one thread can never claim the
    /// whole wave.
    pub fn can_generate(&self) -> (bool, i64) {
        let mut state = self.state.write();
        if state.generated_size >= state.target_size {
            return (false, 0);
        }
        let headroom = state.max_active_inputs - state.active_inputs;
        if headroom <= 0 {
            return (false, 0);
        }
        let outstanding = state.target_size - state.generated_size;
        let batch = if headroom < state.max_simultaneous_generation {
            headroom.min(outstanding)
        } else {
            outstanding.min(state.max_simultaneous_generation)
        };
        state.active_inputs += batch;
        state.generated_size += batch;
        self.core.set_changed();
        (true, batch)
    }

    /// Returns a failed part of a claimed batch.
    pub fn fail_generation(&self, fails: i64) {
        self.core.set_changed();
        let mut state = self.state.write();
        state.generated_size -= fails;
        state.active_inputs -= fails;
        if state.active_inputs < 0 {
            warn!("active input count went negative");
            state.active_inputs = 0;
        }
    }

    pub fn add_generated_input(&self, input: &Input) {
        self.core.set_changed();
        self.state.write().generated_inputs.insert(input.core().form_id());
        input.set_generation_id(self.core.form_id());
    }

    pub fn remove_generated_input(&self, input: &Input) -> bool {
        let mut state = self.state.write();
        if state.generated_inputs.shift_remove(&input.core().form_id()) {
            state.generated_size -= 1;
            input.set_generation_id(0);
            self.core.set_changed();
            true
        } else {
            false
        }
    }

    pub fn add_dd_input(&self, input: &Input) {
        self.core.set_changed();
        let mut state = self.state.write();
        state.dd_inputs.insert(input.core().form_id());
        state.dd_size += 1;
        input.set_generation_id(self.core.form_id());
    }

    pub fn remove_dd_input(&self, input: &Input) -> bool {
        let mut state = self.state.write();
        if state.dd_inputs.shift_remove(&input.core().form_id()) {
            state.dd_size -= 1;
            input.set_generation_id(0);
            self.core.set_changed();
            true
        } else {
            false
        }
    }

    pub fn add_dd_controller(&self, controller_id: FormId) {
        self.core.set_changed();
        self.state.write().dd_controllers.insert(controller_id);
    }

    /// One claimed input finished executing.
    pub fn set_input_completed(&self) {
        self.core.set_changed();
        let mut state = self.state.write();
        state.active_inputs -= 1;
        if state.active_inputs < 0 {
            warn!("active input count went negative");
            state.active_inputs = 0;
        }
    }

    /// Registers a source input and pins it so `free_memory` leaves it
    /// intact while this cohort runs.
    pub fn add_source(&self, input: &Input) {
        self.core.set_changed();
        self.state.write().sources.push(input.core().form_id());
        input.core().set_flag(FormFlags::DO_NOT_FREE);
    }

    pub fn sources(&self) -> Vec<FormId> {
        self.state.read().sources.clone()
    }

    pub fn generated_input_ids(&self) -> Vec<FormId> {
        self.state.read().generated_inputs.iter().copied().collect()
    }

    /// Unpins all sources, e.g. when the cohort retires.
    pub fn release_sources(&self, data: &Data) {
        let sources = self.sources();
        for id in sources {
            if let Some(input) = data.lookup_form::<Input>(id) {
                input.core().unset_flag(FormFlags::DO_NOT_FREE);
            }
        }
    }
}

impl Form for Generation {
    fn form_type(&self) -> FormType {
        FormType::Generation
    }

    fn core(&self) -> &FormCore {
        &self.core
    }

    fn write_data(&self, enc: &mut Encoder) -> CodecResult<()> {
        enc.write_i32(CLASS_VERSION)?;
        self.core.write_envelope(enc)?;
        let state = self.state.read();
        enc.write_i64(state.target_size)?;
        enc.write_i64(state.generated_size)?;
        enc.write_i64(state.dd_size)?;
        enc.write_i64(state.active_inputs)?;
        enc.write_i64(state.max_active_inputs)?;
        enc.write_i64(state.max_simultaneous_generation)?;
        enc.write_i32(state.generation_number)?;
        enc.write_u64_seq(state.generated_inputs.iter().copied())?;
        enc.write_u64_seq(state.dd_inputs.iter().copied())?;
        enc.write_u64_seq(state.dd_controllers.iter().copied())?;
        enc.write_u64_seq(state.sources.iter().copied())
    }

    fn read_data(&self, dec: &mut Decoder<'_>, resolver: &mut LoadResolver) -> CodecResult<()> {
        read_version(dec, &[CLASS_VERSION])?;
        self.core.read_envelope(dec)?;
        let mut state = self.state.write();
        state.target_size = dec.read_i64()?;
        state.generated_size = dec.read_i64()?;
        state.dd_size = dec.read_i64()?;
        state.active_inputs = dec.read_i64()?;
        state.max_active_inputs = dec.read_i64()?;
        state.max_simultaneous_generation = dec.read_i64()?;
        state.generation_number = dec.read_i32()?;
        state.generated_inputs = dec.read_u64_seq()?.into_iter().collect();
        state.dd_inputs = dec.read_u64_seq()?.into_iter().collect();
        state.dd_controllers = dec.read_u64_seq()?.into_iter().collect();
        state.sources = dec.read_u64_seq()?;
        drop(state);

        // Re-pin sources once every form is present; inputs load in
        // arbitrary order relative to this cohort.
        let sources = self.state.read().sources.clone();
        resolver.add_late_task(move |data| {
            for id in sources {
                if let Some(input) = LoadResolver::resolve_form::<Input>(data, id) {
                    input.core().set_flag(FormFlags::DO_NOT_FREE);
                }
            }
        });
        Ok(())
    }

    fn clear(&self) {
        *self.state.write() = GenerationState::default();
        self.core.clear();
    }

    fn memory_size(&self) -> usize {
        let state = self.state.read();
        size_of::<Self>()
            + (state.generated_inputs.len()
                + state.dd_inputs.len()
                + state.dd_controllers.len()
                + state.sources.len())
                * size_of::<FormId>()
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

    fn cohort(target: i64, max_active: i64, max_step: i64) -> Generation {
        let generation = Generation::default();
        generation.configure(target, max_active, max_step, 1);
        generation
    }

    #[test]
    fn batches_are_capped_by_the_step_limit() {
        let generation = cohort(100, 50, 10);
        let (ok, batch) = generation.can_generate();
        assert!(ok);
        assert_eq!(batch, 10);
        assert_eq!(generation.generated_size(), 10);
        assert_eq!(generation.active_inputs(), 10);
    }

    #[test]
    fn batches_are_capped_by_active_headroom() {
        let generation = cohort(100, 5, 10);
        let (ok, batch) = generation.can_generate();
        assert!(ok);
        assert_eq!(batch, 5);
        let (ok, batch) = generation.can_generate();
        assert!(!ok);
        assert_eq!(batch, 0);

        generation.set_input_completed();
        let (ok, batch) = generation.can_generate();
        assert!(ok);
        assert_eq!(batch, 1);
    }

    #[test]
    fn a_finished_wave_stops_generating() {
        let generation = cohort(8, 100, 10);
        let (_, batch) = generation.can_generate();
        assert_eq!(batch, 8);
        assert!(!generation.can_generate().0);

        generation.fail_generation(3);
        let (ok, batch) = generation.can_generate();
        assert!(ok);
        assert_eq!(batch, 3);
    }

    #[test]
    fn sources_are_pinned_and_released() {
        let data = Data::new();
        let generation = data.create_form::<Generation>();
        let input = data.create_form::<Input>();
        generation.add_source(&input);
        assert!(input.core().has_flag(FormFlags::DO_NOT_FREE));
        generation.release_sources(&data);
        assert!(!input.core().has_flag(FormFlags::DO_NOT_FREE));
    }

    #[test]
    fn membership_round_trip() {
        let generation = cohort(10, 10, 5);
        generation.core().set_form_id(500);
        let input = Input::default();
        input.core().set_form_id(300);
        generation.add_generated_input(&input);
        assert_eq!(input.generation_id(), 500);
        generation.add_dd_controller(90);

        let mut enc = Encoder::new();
        generation.write_data(&mut enc).unwrap();
        let bytes = enc.into_bytes();

        let loaded = Generation::default();
        let mut resolver = LoadResolver::new();
        loaded.read_data(&mut Decoder::new(&bytes), &mut resolver).unwrap();
        assert_eq!(loaded.target_size(), 10);
        assert_eq!(loaded.generated_input_ids(), vec![300]);
        assert_eq!(loaded.generation_number(), 1);

        assert!(loaded.remove_generated_input(&input));
        assert_eq!(input.generation_id(), 0);
    }
}
