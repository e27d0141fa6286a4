//! Execution record of one input run against the target. The execution
//! layer fills it in; the scripting surface and the oracle read it.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;

use crate::codec::{CodecError, CodecResult, Decoder, Encoder};
use crate::store::{Form, FormCore, FormId, FormType, LoadResolver, read_version};

/// Why a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, derive_more::Display)]
pub enum ExitReason {
    /// The target exited on its own.
    #[default]
    Natural,
    /// The target consumed the whole sequence and was shut down.
    LastInput,
    /// Killed by the supervisor.
    Terminated,
    /// Ran past the time limit.
    Timeout,
    /// A single sequence entry ran past its time limit.
    FragmentTimeout,
    /// Ran past the memory limit.
    Memory,
    /// The target could not be launched or the pipe broke.
    InitError,
}

impl ExitReason {
    const fn encode(self) -> i32 {
        match self {
            ExitReason::Natural => 0,
            ExitReason::LastInput => 1,
            ExitReason::Terminated => 2,
            ExitReason::Timeout => 3,
            ExitReason::FragmentTimeout => 4,
            ExitReason::Memory => 5,
            ExitReason::InitError => 6,
        }
    }

    fn decode(value: i32) -> CodecResult<Self> {
        match value {
            0 => Ok(ExitReason::Natural),
            1 => Ok(ExitReason::LastInput),
            2 => Ok(ExitReason::Terminated),
            3 => Ok(ExitReason::Timeout),
            4 => Ok(ExitReason::FragmentTimeout),
            5 => Ok(ExitReason::Memory),
            6 => Ok(ExitReason::InitError),
            other => Err(CodecError::BadDiscriminant { what: "ExitReason", value: other as i64 }),
        }
    }
}

#[derive(Debug, Default)]
struct TestState {
    input_id: FormId,
    running: bool,
    exit_code: i32,
    exit_reason: ExitReason,
    execution_time: Duration,
    /// Captured target output; only retained when `storeOutput` is set.
    output: Vec<u8>,
    /// Per-entry response latencies, in microseconds.
    reaction_times: Vec<i64>,
    /// Sequence entries the target consumed before exiting.
    executed_entries: i64,
    command_line: String,
}

const CLASS_VERSION: i32 = 0x1;

/// The persisted test form.
#[derive(Debug, Default)]
pub struct TestCase {
    core: FormCore,
    state: RwLock<TestState>,
}

impl TestCase {
    pub fn begin(&self, input_id: FormId, command_line: String) {
        self.core.set_changed();
        let mut state = self.state.write();
        state.input_id = input_id;
        state.command_line = command_line;
        state.running = true;
    }

    pub fn record_output(&self, chunk: &[u8], store_output: bool) {
        if !store_output {
            return;
        }
        self.core.set_changed();
        self.state.write().output.extend_from_slice(chunk);
    }

    pub fn push_reaction_time(&self, micros: i64) {
        self.core.set_changed();
        let mut state = self.state.write();
        state.reaction_times.push(micros);
        state.executed_entries += 1;
    }

    pub fn finish(&self, exit_code: i32, reason: ExitReason, execution_time: Duration) {
        self.core.set_changed();
        let mut state = self.state.write();
        state.running = false;
        state.exit_code = exit_code;
        state.exit_reason = reason;
        state.execution_time = execution_time;
    }

    pub fn running(&self) -> bool {
        self.state.read().running
    }

    pub fn input_id(&self) -> FormId {
        self.state.read().input_id
    }

    pub fn exit_code(&self) -> i32 {
        self.state.read().exit_code
    }

    pub fn exit_reason(&self) -> ExitReason {
        self.state.read().exit_reason
    }

    pub fn execution_time(&self) -> Duration {
        self.state.read().execution_time
    }

    pub fn executed_entries(&self) -> i64 {
        self.state.read().executed_entries
    }

    pub fn output(&self) -> Vec<u8> {
        self.state.read().output.clone()
    }

    pub fn reaction_times(&self) -> Vec<i64> {
        self.state.read().reaction_times.clone()
    }

    pub fn command_line(&self) -> String {
        self.state.read().command_line.clone()
    }
}

impl Form for TestCase {
    fn form_type(&self) -> FormType {
        FormType::Test
    }

    fn core(&self) -> &FormCore {
        &self.core
    }

    fn write_data(&self, enc: &mut Encoder) -> CodecResult<()> {
        enc.write_i32(CLASS_VERSION)?;
        self.core.write_envelope(enc)?;
        let state = self.state.read();
        enc.write_u64(state.input_id)?;
        enc.write_bool(state.running)?;
        enc.write_i32(state.exit_code)?;
        enc.write_i32(state.exit_reason.encode())?;
        enc.write_duration_ns(state.execution_time)?;
        enc.write_bytes(&state.output)?;
        enc.write_u64(state.reaction_times.len() as u64)?;
        for &micros in &state.reaction_times {
            enc.write_i64(micros)?;
        }
        enc.write_i64(state.executed_entries)?;
        enc.write_str(&state.command_line)
    }

    fn read_data(&self, dec: &mut Decoder<'_>, _resolver: &mut LoadResolver) -> CodecResult<()> {
        read_version(dec, &[CLASS_VERSION])?;
        self.core.read_envelope(dec)?;
        let mut state = self.state.write();
        state.input_id = dec.read_u64()?;
        state.running = dec.read_bool()?;
        state.exit_code = dec.read_i32()?;
        state.exit_reason = ExitReason::decode(dec.read_i32()?)?;
        state.execution_time = dec.read_duration_ns()?;
        state.output = dec.read_bytes()?;
        let count = dec.read_u64()?;
        state.reaction_times = (0..count).map(|_| dec.read_i64()).collect::<CodecResult<_>>()?;
        state.executed_entries = dec.read_i64()?;
        state.command_line = dec.read_string()?;
        Ok(())
    }

    fn clear(&self) {
        *self.state.write() = TestState::default();
        self.core.clear();
    }

    fn free_memory(&self) {
        if self.core.has_flag(crate::store::FormFlags::DO_NOT_FREE) {
            return;
        }
        let mut state = self.state.write();
        state.output = Vec::new();
    }

    fn freed(&self) -> bool {
        self.state.read().output.is_empty()
    }

    fn memory_size(&self) -> usize {
        let state = self.state.read();
        size_of::<Self>() + state.output.len() + state.reaction_times.len() * size_of::<i64>()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
