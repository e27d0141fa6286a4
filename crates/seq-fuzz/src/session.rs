//! Session-wide bookkeeping: the string-atom interner used by the exclusion
//! tree plus runtime counters. Persisted as form `'SDAT'`.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap;
use parking_lot::RwLock;

use crate::codec::{CodecResult, Decoder, Encoder};
use crate::store::{Form, FormCore, FormType, LoadResolver, read_version};

/// Interned identifier of a sequence token. Atom 0 is never handed out.
pub type AtomId = u64;

#[derive(Debug, Default)]
struct AtomTable {
    by_string: AHashMap<String, AtomId>,
    by_id: AHashMap<AtomId, String>,
    next: AtomId,
}

impl AtomTable {
    fn intern(&mut self, token: &str) -> AtomId {
        if let Some(&id) = self.by_string.get(token) {
            return id;
        }
        self.next += 1;
        let id = self.next;
        self.by_string.insert(token.to_owned(), id);
        self.by_id.insert(id, token.to_owned());
        id
    }
}

#[derive(Debug, Default)]
struct SessionCounters {
    tests_executed: u64,
    inputs_generated: u64,
    runtime: Duration,
}

const CLASS_VERSION: i32 = 0x1;

/// Per-session data shared by the core subsystems.
#[derive(Debug, Default)]
pub struct SessionData {
    core: FormCore,
    atoms: RwLock<AtomTable>,
    counters: RwLock<SessionCounters>,
}

impl SessionData {
    /// Returns the atom for `token`, creating one on first sight.
    pub fn intern_atom(&self, token: &str) -> AtomId {
        if let Some(&id) = self.atoms.read().by_string.get(token) {
            return id;
        }
        self.core.set_changed();
        self.atoms.write().intern(token)
    }

    /// Returns the atom for `token` without interning.
    pub fn atom_id(&self, token: &str) -> Option<AtomId> {
        self.atoms.read().by_string.get(token).copied()
    }

    pub fn atom_string(&self, id: AtomId) -> Option<String> {
        self.atoms.read().by_id.get(&id).cloned()
    }

    pub fn atom_count(&self) -> usize {
        self.atoms.read().by_id.len()
    }

    pub fn count_test(&self) {
        self.core.set_changed();
        self.counters.write().tests_executed += 1;
    }

    pub fn count_generated_input(&self) {
        self.core.set_changed();
        self.counters.write().inputs_generated += 1;
    }

    pub fn tests_executed(&self) -> u64 {
        self.counters.read().tests_executed
    }

    pub fn inputs_generated(&self) -> u64 {
        self.counters.read().inputs_generated
    }

    pub fn add_runtime(&self, delta: Duration) {
        self.counters.write().runtime += delta;
    }

    pub fn runtime(&self) -> Duration {
        self.counters.read().runtime
    }
}

impl Form for SessionData {
    fn form_type(&self) -> FormType {
        FormType::SessionData
    }

    fn core(&self) -> &FormCore {
        &self.core
    }

    fn write_data(&self, enc: &mut Encoder) -> CodecResult<()> {
        enc.write_i32(CLASS_VERSION)?;
        self.core.write_envelope(enc)?;

        let atoms = self.atoms.read();
        enc.write_u64(atoms.next)?;
        enc.write_u64(atoms.by_id.len() as u64)?;
        // Stable order keeps identical stores byte-identical across saves.
        let mut entries: Vec<_> = atoms.by_id.iter().collect();
        entries.sort_by_key(|(id, _)| **id);
        for (id, token) in entries {
            enc.write_u64(*id)?;
            enc.write_str(token)?;
        }

        let counters = self.counters.read();
        enc.write_u64(counters.tests_executed)?;
        enc.write_u64(counters.inputs_generated)?;
        enc.write_duration_ns(counters.runtime)
    }

    fn read_data(&self, dec: &mut Decoder<'_>, _resolver: &mut LoadResolver) -> CodecResult<()> {
        read_version(dec, &[CLASS_VERSION])?;
        self.core.read_envelope(dec)?;

        let mut atoms = self.atoms.write();
        atoms.by_string.clear();
        atoms.by_id.clear();
        atoms.next = dec.read_u64()?;
        let count = dec.read_u64()?;
        for _ in 0..count {
            let id = dec.read_u64()?;
            let token = dec.read_string()?;
            atoms.by_string.insert(token.clone(), id);
            atoms.by_id.insert(id, token);
        }
        drop(atoms);

        let mut counters = self.counters.write();
        counters.tests_executed = dec.read_u64()?;
        counters.inputs_generated = dec.read_u64()?;
        counters.runtime = dec.read_duration_ns()?;
        Ok(())
    }

    fn clear(&self) {
        *self.atoms.write() = AtomTable::default();
        *self.counters.write() = SessionCounters::default();
        self.core.clear();
    }

    fn memory_size(&self) -> usize {
        let atoms = self.atoms.read();
        size_of::<Self>()
            + atoms
                .by_id
                .values()
                .map(|s| 2 * (s.len() + size_of::<(AtomId, String)>()))
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

    #[test]
    fn interning_is_a_bijection() {
        let session = SessionData::default();
        let a = session.intern_atom("left");
        let b = session.intern_atom("right");
        assert_ne!(a, b);
        assert_eq!(session.intern_atom("left"), a);
        assert_eq!(session.atom_string(a).as_deref(), Some("left"));
        assert_eq!(session.atom_id("right"), Some(b));
        assert_eq!(session.atom_id("missing"), None);
    }

    #[test]
    fn atoms_survive_serialization() {
        let session = SessionData::default();
        let a = session.intern_atom("x");
        session.count_test();

        let mut enc = Encoder::new();
        session.write_data(&mut enc).unwrap();
        let bytes = enc.into_bytes();

        let loaded = SessionData::default();
        let mut resolver = LoadResolver::new();
        loaded.read_data(&mut Decoder::new(&bytes), &mut resolver).unwrap();
        assert_eq!(loaded.atom_id("x"), Some(a));
        assert_eq!(loaded.tests_executed(), 1);
        // Newly interned atoms continue after the loaded high-water mark.
        assert!(loaded.intern_atom("y") > a);
    }
}
