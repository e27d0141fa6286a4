//! Oracle verdicts and the narrow contracts of the external collaborators
//! (process supervisor and oracle). The engine only consumes these
//! interfaces; launching the target and judging finished runs happen
//! elsewhere.

use std::any::Any;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;

use crate::codec::{CodecError, CodecResult, Decoder, Encoder};
use crate::store::{Form, FormCore, FormType, LoadResolver, read_version};

/// Classification of an executed input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, derive_more::Display)]
pub enum OracleResult {
    /// The target accepted the whole sequence.
    Passing,
    /// The target failed on the sequence.
    Failing,
    /// No verdict could be produced.
    #[default]
    Undefined,
    /// The run ended before the sequence was fully consumed.
    Unfinished,
    /// Every input with this input as a prefix produces the same verdict.
    Prefix,
}

impl OracleResult {
    /// A decided verdict subsumes all extensions of the input.
    pub fn is_decided(self) -> bool {
        matches!(self, OracleResult::Passing | OracleResult::Failing)
    }

    pub const fn encode(self) -> i32 {
        match self {
            OracleResult::Passing => 0x1,
            OracleResult::Failing => 0x2,
            OracleResult::Undefined => 0x4,
            OracleResult::Unfinished => 0x8,
            OracleResult::Prefix => 0x40,
        }
    }

    pub fn decode(value: i32) -> CodecResult<Self> {
        match value {
            0x1 => Ok(OracleResult::Passing),
            0x2 => Ok(OracleResult::Failing),
            0x4 => Ok(OracleResult::Undefined),
            0x8 => Ok(OracleResult::Unfinished),
            0x40 => Ok(OracleResult::Prefix),
            other => {
                Err(CodecError::BadDiscriminant { what: "OracleResult", value: other as i64 })
            }
        }
    }
}

/// Poll state of a launched target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetState {
    Running,
    Exited(i32),
}

/// Result of pushing a chunk of input at the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// `n` bytes were consumed.
    Written(usize),
    WouldBlock,
    Error,
}

/// Launches the program under test and pipes sequence entries to it.
/// Implemented by the execution layer, consumed by the scheduler.
pub trait ProcessSupervisor {
    type Handle;

    fn launch(&mut self, command: &Path, args: &[String]) -> std::io::Result<Self::Handle>;
    fn write_chunk(&mut self, handle: &mut Self::Handle, bytes: &[u8]) -> WriteOutcome;
    fn poll(&mut self, handle: &mut Self::Handle) -> TargetState;
    fn kill(&mut self, handle: &mut Self::Handle);
    fn read_output(&mut self, handle: &mut Self::Handle) -> Vec<u8>;
    /// Resident memory of the target, in bytes.
    fn memory(&self, handle: &Self::Handle) -> u64;
}

/// Labels finished runs.
pub trait Judge {
    fn classify(
        &self,
        sequence: &[String],
        exit_code: i32,
        runtime: Duration,
        output: &[u8],
    ) -> OracleResult;
}

#[derive(Debug, Default)]
struct OracleState {
    /// Command invoked to judge a finished run.
    command: PathBuf,
    arguments: Vec<String>,
}

const CLASS_VERSION: i32 = 0x1;

/// Persisted oracle configuration (singleton id 4).
#[derive(Debug, Default)]
pub struct Oracle {
    core: FormCore,
    state: RwLock<OracleState>,
}

impl Oracle {
    pub fn configure(&self, command: PathBuf, arguments: Vec<String>) {
        self.core.set_changed();
        let mut state = self.state.write();
        state.command = command;
        state.arguments = arguments;
    }

    pub fn command(&self) -> PathBuf {
        self.state.read().command.clone()
    }

    pub fn arguments(&self) -> Vec<String> {
        self.state.read().arguments.clone()
    }
}

impl Form for Oracle {
    fn form_type(&self) -> FormType {
        FormType::Oracle
    }

    fn core(&self) -> &FormCore {
        &self.core
    }

    fn write_data(&self, enc: &mut Encoder) -> CodecResult<()> {
        enc.write_i32(CLASS_VERSION)?;
        self.core.write_envelope(enc)?;
        let state = self.state.read();
        enc.write_str(&state.command.to_string_lossy())?;
        enc.write_str_seq(state.arguments.iter().map(String::as_str))
    }

    fn read_data(&self, dec: &mut Decoder<'_>, _resolver: &mut LoadResolver) -> CodecResult<()> {
        read_version(dec, &[CLASS_VERSION])?;
        self.core.read_envelope(dec)?;
        let mut state = self.state.write();
        state.command = PathBuf::from(dec.read_string()?);
        state.arguments = dec.read_str_seq()?;
        Ok(())
    }

    fn clear(&self) {
        *self.state.write() = OracleState::default();
        self.core.clear();
    }

    fn memory_size(&self) -> usize {
        let state = self.state.read();
        size_of::<Self>() + state.arguments.iter().map(String::len).sum::<usize>()
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

    #[test]
    fn verdict_codes_round_trip() {
        for result in [
            OracleResult::Passing,
            OracleResult::Failing,
            OracleResult::Undefined,
            OracleResult::Unfinished,
            OracleResult::Prefix,
        ] {
            assert_eq!(OracleResult::decode(result.encode()).unwrap(), result);
        }
        assert!(OracleResult::decode(0x3).is_err());
    }

    #[test]
    fn only_pass_and_fail_are_decided() {
        assert!(OracleResult::Passing.is_decided());
        assert!(OracleResult::Failing.is_decided());
        assert!(!OracleResult::Unfinished.is_decided());
        assert!(!OracleResult::Undefined.is_decided());
        assert!(!OracleResult::Prefix.is_decided());
    }
}
