//! The typed, id-keyed object store and the persistence envelope shared by
//! every long-lived object ("form").

use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::codec::{CodecError, CodecResult, Decoder, Encoder};

pub mod data;
pub mod resolver;

pub use data::Data;
pub use resolver::LoadResolver;

/// 64-bit identifier of a persisted object.
pub type FormId = u64;

/// Ids 1..7 are reserved for the singleton roles; dynamic ids start at
/// [`FIRST_DYNAMIC_ID`].
pub mod static_ids {
    use super::FormId;

    pub const SESSION: FormId = 1;
    pub const TASK_CONTROLLER: FormId = 2;
    pub const SETTINGS: FormId = 3;
    pub const ORACLE: FormId = 4;
    pub const GENERATOR: FormId = 5;
    pub const EXCLUSION_TREE: FormId = 6;
    pub const EXECUTION_HANDLER: FormId = 7;
}

pub const FIRST_DYNAMIC_ID: FormId = 100;

const fn four_cc(tag: &[u8; 4]) -> i32 {
    i32::from_be_bytes(*tag)
}

/// FourCC type tag of a serialized form record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, derive_more::Display)]
pub enum FormType {
    Input,
    Grammar,
    DevTree,
    ExclTree,
    Generator,
    Generation,
    Session,
    Settings,
    Test,
    TaskController,
    ExecutionHandler,
    Oracle,
    SessionData,
    DeltaController,
}

impl FormType {
    pub const fn tag(self) -> i32 {
        match self {
            FormType::Input => four_cc(b"INPU"),
            FormType::Grammar => four_cc(b"GRAM"),
            FormType::DevTree => four_cc(b"DEVT"),
            FormType::ExclTree => four_cc(b"EXCL"),
            FormType::Generator => four_cc(b"GENR"),
            FormType::Generation => four_cc(b"GENE"),
            FormType::Session => four_cc(b"SESS"),
            FormType::Settings => four_cc(b"SETT"),
            FormType::Test => four_cc(b"TEST"),
            FormType::TaskController => four_cc(b"TASK"),
            FormType::ExecutionHandler => four_cc(b"EXEC"),
            FormType::Oracle => four_cc(b"ORAC"),
            FormType::SessionData => four_cc(b"SDAT"),
            FormType::DeltaController => four_cc(b"DDCR"),
        }
    }

    pub fn from_tag(tag: i32) -> Option<Self> {
        const ALL: [FormType; 14] = [
            FormType::Input,
            FormType::Grammar,
            FormType::DevTree,
            FormType::ExclTree,
            FormType::Generator,
            FormType::Generation,
            FormType::Session,
            FormType::Settings,
            FormType::Test,
            FormType::TaskController,
            FormType::ExecutionHandler,
            FormType::Oracle,
            FormType::SessionData,
            FormType::DeltaController,
        ];
        ALL.into_iter().find(|ft| ft.tag() == tag)
    }
}

bitflags::bitflags! {
    /// Allocation-level flags shared by all forms. The low bits are free for
    /// per-type use (see [`crate::input::InputFlags`]).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FormFlags: u64 {
        /// The form is pinned; `free_memory` must leave it alone.
        const DO_NOT_FREE = 1 << 62;
        /// The form has been marked deleted and awaits physical erasure.
        const DELETED = 1 << 63;

        const _ = !0;
    }
}

/// State every form carries: identity, flags, the flag-value bag and the
/// changed/saved bookkeeping. Embedded in each concrete form.
#[derive(Debug, Default)]
pub struct FormCore {
    id: AtomicU64,
    flags: AtomicU64,
    flag_bag: Mutex<Vec<u64>>,
    changed: AtomicBool,
    saved: AtomicBool,
}

impl FormCore {
    pub fn form_id(&self) -> FormId {
        self.id.load(Ordering::Acquire)
    }

    pub fn set_form_id(&self, id: FormId) {
        self.id.store(id, Ordering::Release);
    }

    pub fn flags(&self) -> FormFlags {
        FormFlags::from_bits_retain(self.flags.load(Ordering::Acquire))
    }

    pub fn set_flag(&self, flag: FormFlags) {
        self.flags.fetch_or(flag.bits(), Ordering::AcqRel);
        let mut bag = self.flag_bag.lock();
        bag.push(flag.bits());
        self.changed.store(true, Ordering::Release);
    }

    pub fn unset_flag(&self, flag: FormFlags) {
        let mut bag = self.flag_bag.lock();
        if let Some(pos) = bag.iter().position(|&v| v == flag.bits()) {
            bag.remove(pos);
        }
        // The bit stays set while another bag entry still carries it.
        if !bag.iter().any(|&v| v & flag.bits() != 0) {
            self.flags.fetch_and(!flag.bits(), Ordering::AcqRel);
        }
        self.changed.store(true, Ordering::Release);
    }

    pub fn has_flag(&self, flag: FormFlags) -> bool {
        self.flags().contains(flag)
    }

    pub fn set_changed(&self) {
        self.changed.store(true, Ordering::Release);
    }

    pub fn clear_changed(&self) {
        self.changed.store(false, Ordering::Release);
    }

    pub fn has_changed(&self) -> bool {
        self.changed.load(Ordering::Acquire)
    }

    pub fn was_saved(&self) -> bool {
        self.saved.load(Ordering::Acquire)
    }

    pub fn mark_saved(&self) {
        self.saved.store(true, Ordering::Release);
    }

    /// Writes the form envelope: id, flags, flag bag.
    pub fn write_envelope(&self, enc: &mut Encoder) -> CodecResult<()> {
        enc.write_u64(self.form_id())?;
        enc.write_u64(self.flags.load(Ordering::Acquire))?;
        let bag = self.flag_bag.lock();
        enc.write_u64_seq(bag.iter().copied())
    }

    pub fn read_envelope(&self, dec: &mut Decoder<'_>) -> CodecResult<()> {
        self.set_form_id(dec.read_u64()?);
        self.flags.store(dec.read_u64()?, Ordering::Release);
        *self.flag_bag.lock() = dec.read_u64_seq()?;
        Ok(())
    }

    pub fn clear(&self) {
        self.flags.store(0, Ordering::Release);
        self.flag_bag.lock().clear();
        self.changed.store(false, Ordering::Release);
        self.saved.store(false, Ordering::Release);
    }
}

/// A persisted, id-keyed object. The store holds the sole strong reference;
/// cross-links between forms are ids resolved through the store for the
/// duration of an operation.
pub trait Form: Any + Send + Sync {
    fn form_type(&self) -> FormType;

    fn core(&self) -> &FormCore;

    /// Serializes class version, envelope and body into `enc`.
    fn write_data(&self, enc: &mut Encoder) -> CodecResult<()>;

    /// Deserializes a payload previously produced by [`Form::write_data`].
    /// Cross-references are enqueued on `resolver` instead of resolved
    /// in-place.
    fn read_data(&self, dec: &mut Decoder<'_>, resolver: &mut LoadResolver) -> CodecResult<()>;

    /// Whether the form may be physically erased right now.
    fn can_delete(&self, _data: &Data) -> bool {
        true
    }

    /// Resets all internal state.
    fn clear(&self);

    /// Drops reconstructible memory unless the form is pinned.
    fn free_memory(&self) {}

    fn freed(&self) -> bool {
        false
    }

    /// Rough accounting of the heap held by this form.
    fn memory_size(&self) -> usize;

    fn as_any(&self) -> &dyn Any;

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// Reads and checks a class-version header against the versions a reader
/// supports.
pub fn read_version(dec: &mut Decoder<'_>, supported: &[i32]) -> CodecResult<i32> {
    let version = dec.read_i32()?;
    if supported.contains(&version) {
        Ok(version)
    } else {
        Err(CodecError::UnknownVersion(version))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn four_cc_tags_match_ascii() {
        assert_eq!(FormType::Input.tag(), 0x494e5055);
        assert_eq!(FormType::Grammar.tag(), i32::from_be_bytes(*b"GRAM"));
        assert_eq!(FormType::from_tag(FormType::ExclTree.tag()), Some(FormType::ExclTree));
        assert_eq!(FormType::from_tag(0), None);
    }

    #[test]
    fn flag_bag_keeps_multiset_semantics() {
        let core = FormCore::default();
        core.set_flag(FormFlags::DO_NOT_FREE);
        core.set_flag(FormFlags::DO_NOT_FREE);
        core.unset_flag(FormFlags::DO_NOT_FREE);
        // One holder remains, so the bit must still be visible.
        assert!(core.has_flag(FormFlags::DO_NOT_FREE));
        core.unset_flag(FormFlags::DO_NOT_FREE);
        assert!(!core.has_flag(FormFlags::DO_NOT_FREE));
    }

    #[test]
    fn envelope_round_trip() {
        let core = FormCore::default();
        core.set_form_id(123);
        core.set_flag(FormFlags::DELETED);

        let mut enc = Encoder::new();
        core.write_envelope(&mut enc).unwrap();
        let bytes = enc.into_bytes();

        let other = FormCore::default();
        let mut dec = Decoder::new(&bytes);
        other.read_envelope(&mut dec).unwrap();
        assert_eq!(other.form_id(), 123);
        assert!(other.has_flag(FormFlags::DELETED));
    }
}
