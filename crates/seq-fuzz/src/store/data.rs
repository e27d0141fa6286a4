//! The object store: the process-wide home of every form, id allocation,
//! and the versioned save/load machinery.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::{Duration, Instant};

use ahash::AHashMap;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::codec::{Decoder, Encoder};
use crate::store::resolver::LoadResolver;
use crate::store::{FIRST_DYNAMIC_ID, Form, FormFlags, FormId, FormType, static_ids};

const MAGIC: [u64; 2] = [0xe30db97c4f1e478f, 0x8b03f3d9e946dcf3];
const SAVE_VERSION: i32 = 0x1;
const SAVE_EXTENSION: &str = "tfsave";

/// Forms the store can construct, with their reserved singleton slot if
/// they have one.
pub trait Registrable: Form + Default {
    const STATIC_ID: Option<FormId> = None;
}

impl Registrable for crate::input::Input {}
impl Registrable for crate::grammar::Grammar {}
impl Registrable for crate::derivation::DerivationTree {}
impl Registrable for crate::generation::Generation {}
impl Registrable for crate::test_case::TestCase {}
impl Registrable for crate::session::SessionData {}

impl Registrable for crate::settings::Settings {
    const STATIC_ID: Option<FormId> = Some(static_ids::SETTINGS);
}
impl Registrable for crate::oracle::Oracle {
    const STATIC_ID: Option<FormId> = Some(static_ids::ORACLE);
}
impl Registrable for crate::generator::Generator {
    const STATIC_ID: Option<FormId> = Some(static_ids::GENERATOR);
}
impl Registrable for crate::exclusion::ExclusionTree {
    const STATIC_ID: Option<FormId> = Some(static_ids::EXCLUSION_TREE);
}

/// Counts of what a save or load touched, per form type.
#[derive(Debug, Default, Clone)]
pub struct StoreStats {
    pub counts: Vec<(FormType, u64)>,
    pub failed: u64,
    pub skipped: u64,
}

pub struct Data {
    next_form_id: Mutex<FormId>,
    forms: RwLock<AHashMap<FormId, Arc<dyn Form>>>,
    unique_name: RwLock<String>,
    save_path: RwLock<PathBuf>,
    save_number: AtomicI32,
    session_start: Instant,
    prior_runtime: Mutex<Duration>,
}

impl std::fmt::Debug for Data {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Data")
            .field("forms", &self.forms.read().len())
            .field("unique_name", &*self.unique_name.read())
            .finish()
    }
}

impl Default for Data {
    fn default() -> Self {
        Self::new()
    }
}

impl Data {
    pub fn new() -> Self {
        Self {
            next_form_id: Mutex::new(FIRST_DYNAMIC_ID),
            forms: RwLock::new(AHashMap::new()),
            unique_name: RwLock::new("session".to_owned()),
            save_path: RwLock::new(PathBuf::from(".").join("saves")),
            save_number: AtomicI32::new(1),
            session_start: Instant::now(),
            prior_runtime: Mutex::new(Duration::ZERO),
        }
    }

    /// Overall session runtime, including time before the last load.
    pub fn runtime(&self) -> Duration {
        *self.prior_runtime.lock() + self.session_start.elapsed()
    }

    pub fn set_unique_name(&self, name: impl Into<String>) {
        *self.unique_name.write() = name.into();
    }

    pub fn set_save_path(&self, path: impl Into<PathBuf>) {
        *self.save_path.write() = path.into();
    }

    /// Creates and registers a new form. Singleton types land on their
    /// reserved id; asking again returns the existing instance.
    pub fn create_form<T: Registrable>(&self) -> Arc<T> {
        if let Some(id) = T::STATIC_ID {
            if let Some(existing) = self.lookup_form::<T>(id) {
                return existing;
            }
            let form = Arc::new(T::default());
            form.core().set_form_id(id);
            self.forms.write().insert(id, form.clone());
            return form;
        }
        let id = {
            let mut next = self.next_form_id.lock();
            let id = *next;
            *next += 1;
            id
        };
        let form = Arc::new(T::default());
        form.core().set_form_id(id);
        debug!(form_id = id, "created form");
        self.forms.write().insert(id, form.clone());
        form
    }

    /// Registers a loaded form under its existing id.
    pub fn register_form(&self, form: Arc<dyn Form>) -> bool {
        let id = form.core().form_id();
        if id == 0 {
            warn!("refusing to register a form without an id");
            return false;
        }
        {
            let mut next = self.next_form_id.lock();
            if id >= *next {
                *next = id + 1;
            }
        }
        self.forms.write().insert(id, form);
        true
    }

    /// Typed lookup; `None` when absent or of a different type.
    pub fn lookup_form<T: Form>(&self, id: FormId) -> Option<Arc<T>> {
        let form = self.forms.read().get(&id).cloned()?;
        form.into_any().downcast::<T>().ok()
    }

    /// Marks the form deleted and erases it, unless its `can_delete` veto
    /// holds it in place.
    pub fn delete_form(&self, id: FormId) -> bool {
        let Some(form) = self.forms.read().get(&id).cloned() else { return false };
        if !form.can_delete(self) {
            debug!(form_id = id, "form cannot be deleted yet");
            return false;
        }
        form.core().set_flag(FormFlags::DELETED);
        form.clear();
        self.forms.write().remove(&id);
        true
    }

    pub fn form_count(&self) -> usize {
        self.forms.read().len()
    }

    pub fn form_ids(&self) -> Vec<FormId> {
        let mut ids: Vec<FormId> = self.forms.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Per-type counts of the registered forms.
    pub fn stats(&self) -> StoreStats {
        let forms = self.forms.read();
        let mut by_type: AHashMap<FormType, u64> = AHashMap::new();
        for form in forms.values() {
            *by_type.entry(form.form_type()).or_default() += 1;
        }
        let mut counts: Vec<(FormType, u64)> = by_type.into_iter().collect();
        counts.sort_by_key(|(ft, _)| ft.tag());
        StoreStats { counts, failed: 0, skipped: 0 }
    }

    /// Clears and drops every form.
    pub fn clear(&self) {
        let forms: Vec<Arc<dyn Form>> = self.forms.read().values().cloned().collect();
        for form in forms {
            form.clear();
        }
        self.forms.write().clear();
        *self.next_form_id.lock() = FIRST_DYNAMIC_ID;
    }

    fn save_file_name(&self, number: i32) -> String {
        format!("{}_{}.{}", self.unique_name.read(), number, SAVE_EXTENSION)
    }

    /// Serializes every live form into the next numbered save file.
    pub fn save(&self) -> anyhow::Result<PathBuf> {
        let number = self.save_number.fetch_add(1, Ordering::AcqRel);
        let directory = self.save_path.read().clone();
        std::fs::create_dir_all(&directory)?;
        let path = directory.join(self.save_file_name(number));

        let mut enc = Encoder::new();
        enc.write_u64(MAGIC[0])?;
        enc.write_u64(MAGIC[1])?;
        enc.write_i32(SAVE_VERSION)?;
        enc.write_duration_ns(self.runtime())?;
        enc.write_str(&self.unique_name.read())?;
        enc.write_i32(number)?;
        enc.write_u64(*self.next_form_id.lock())?;

        let mut written = 0u64;
        let mut failed = 0u64;
        let forms = self.forms.read().clone();
        let mut ids: Vec<FormId> = forms.keys().copied().collect();
        ids.sort_unstable();
        for id in ids {
            let form = &forms[&id];
            if form.core().has_flag(FormFlags::DELETED) {
                continue;
            }
            crate::codec::with_scratch(|body| match form.write_data(body) {
                Ok(()) => {
                    enc.write_i32(form.form_type().tag())?;
                    enc.write_bytes(body.as_bytes())?;
                    form.core().mark_saved();
                    form.core().clear_changed();
                    written += 1;
                    Ok::<(), crate::codec::CodecError>(())
                }
                Err(error) => {
                    warn!(form_id = id, %error, "failed to serialize form, dropping it");
                    failed += 1;
                    Ok(())
                }
            })?;
        }

        std::fs::write(&path, enc.into_bytes())?;
        info!(path = %path.display(), written, failed, "saved store");
        Ok(path)
    }

    /// Loads the highest-numbered save for `name` from the save path.
    pub fn load_latest(&self, name: &str) -> anyhow::Result<StoreStats> {
        let directory = self.save_path.read().clone();
        let prefix = format!("{name}_");
        let mut best: Option<(i32, PathBuf)> = None;
        for entry in std::fs::read_dir(&directory)? {
            let path = entry?.path();
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else { continue };
            if path.extension().and_then(|e| e.to_str()) != Some(SAVE_EXTENSION) {
                continue;
            }
            let Some(number) = stem.strip_prefix(&prefix).and_then(|n| n.parse::<i32>().ok())
            else {
                continue;
            };
            if best.as_ref().is_none_or(|(existing, _)| number > *existing) {
                best = Some((number, path));
            }
        }
        let (_, path) = best.ok_or_else(|| anyhow::anyhow!("no save found for {name}"))?;
        self.load_file(&path)
    }

    /// Reads a save file, reconstructing every known form and resolving
    /// cross-references in two passes.
    pub fn load_file(&self, path: &Path) -> anyhow::Result<StoreStats> {
        let bytes = std::fs::read(path)?;
        let mut dec = Decoder::new(&bytes);

        if dec.read_u64()? != MAGIC[0] || dec.read_u64()? != MAGIC[1] {
            anyhow::bail!("{} is not a save file", path.display());
        }
        let version = dec.read_i32()?;
        if version != SAVE_VERSION {
            anyhow::bail!("unsupported save version {version:#x}");
        }
        *self.prior_runtime.lock() = dec.read_duration_ns()?;
        let name = dec.read_string()?;
        let number = dec.read_i32()?;
        let next_id = dec.read_u64()?;
        *self.unique_name.write() = name;
        self.save_number.store(number + 1, Ordering::Release);
        {
            let mut next = self.next_form_id.lock();
            *next = (*next).max(next_id);
        }

        let mut resolver = LoadResolver::new();
        let mut by_type: AHashMap<FormType, u64> = AHashMap::new();
        let mut failed = 0u64;
        let mut skipped = 0u64;
        while dec.remaining() > 0 {
            let tag = dec.read_i32()?;
            let mut block = dec.read_block()?;
            let Some(form_type) = FormType::from_tag(tag) else {
                warn!(tag, "unknown form type tag, skipping record");
                skipped += 1;
                continue;
            };
            let Some(form) = make_form(form_type) else {
                // Known but externally managed payloads are skipped whole.
                debug!(%form_type, "skipping externally managed form payload");
                skipped += 1;
                continue;
            };
            match form.read_data(&mut block, &mut resolver) {
                Ok(()) => {
                    *by_type.entry(form_type).or_default() += 1;
                    self.register_form(form);
                }
                Err(error) => {
                    warn!(%form_type, %error, "failed to read form, dropping it");
                    failed += 1;
                }
            }
        }

        resolver.resolve(self);
        resolver.resolve_late(self);

        let mut counts: Vec<(FormType, u64)> = by_type.into_iter().collect();
        counts.sort_by_key(|(ft, _)| ft.tag());
        let stats = StoreStats { counts, failed, skipped };
        info!(path = %path.display(), forms = self.form_count(), failed, skipped, "loaded store");
        Ok(stats)
    }
}

fn make_form(form_type: FormType) -> Option<Arc<dyn Form>> {
    let form: Arc<dyn Form> = match form_type {
        FormType::Input => Arc::new(crate::input::Input::default()),
        FormType::Grammar => Arc::new(crate::grammar::Grammar::default()),
        FormType::DevTree => Arc::new(crate::derivation::DerivationTree::default()),
        FormType::ExclTree => Arc::new(crate::exclusion::ExclusionTree::default()),
        FormType::Generator => Arc::new(crate::generator::Generator::default()),
        FormType::Generation => Arc::new(crate::generation::Generation::default()),
        FormType::Settings => Arc::new(crate::settings::Settings::default()),
        FormType::Test => Arc::new(crate::test_case::TestCase::default()),
        FormType::Oracle => Arc::new(crate::oracle::Oracle::default()),
        FormType::SessionData => Arc::new(crate::session::SessionData::default()),
        // Supervisor-side singletons and delta controllers are rebuilt by
        // their own subsystems, not from the save.
        FormType::Session
        | FormType::TaskController
        | FormType::ExecutionHandler
        | FormType::DeltaController => return None,
    };
    Some(form)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::derivation::DerivationTree;
    use crate::exclusion::ExclusionTree;
    use crate::grammar::Grammar;
    use crate::input::Input;
    use crate::oracle::OracleResult;
    use crate::session::SessionData;
    use crate::settings::Settings;

    const XS: &str = "Grammar('start := 'SEQ_x ~ 'start | 'SEQ_x, 'SEQ_x := \"x\" | \"y\")";

    #[test]
    fn dynamic_ids_start_past_the_reserved_range() {
        let data = Data::new();
        let settings = data.create_form::<Settings>();
        assert_eq!(settings.core().form_id(), static_ids::SETTINGS);
        let input = data.create_form::<Input>();
        assert_eq!(input.core().form_id(), FIRST_DYNAMIC_ID);
        let second = data.create_form::<Input>();
        assert_eq!(second.core().form_id(), FIRST_DYNAMIC_ID + 1);
    }

    #[test]
    fn singletons_are_created_once() {
        let data = Data::new();
        let a = data.create_form::<ExclusionTree>();
        let b = data.create_form::<ExclusionTree>();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn typed_lookup_rejects_wrong_types() {
        let data = Data::new();
        let input = data.create_form::<Input>();
        let id = input.core().form_id();
        assert!(data.lookup_form::<Input>(id).is_some());
        assert!(data.lookup_form::<DerivationTree>(id).is_none());
        assert!(data.lookup_form::<Input>(9999).is_none());
    }

    #[test]
    fn deleting_respects_the_veto() {
        let data = Data::new();
        let tree = data.create_form::<DerivationTree>();
        let input = data.create_form::<Input>();
        tree.set_input_id(input.core().form_id());
        input.inc_derived_inputs();
        assert!(!data.delete_form(tree.core().form_id()));

        let plain = data.create_form::<DerivationTree>();
        let id = plain.core().form_id();
        assert!(data.delete_form(id));
        assert!(data.lookup_form::<DerivationTree>(id).is_none());
    }

    /// Full round trip: grammar, three inputs with trees, exclusion
    /// entries. Reloading must reproduce each sequence from its stored
    /// seed.
    #[test]
    fn save_and_reload_reproduces_the_session() {
        let directory = tempfile::tempdir().unwrap();
        let data = Data::new();
        data.set_unique_name("roundtrip");
        data.set_save_path(directory.path());

        let session = data.create_form::<SessionData>();
        let _settings = data.create_form::<Settings>();
        let grammar = data.create_form::<Grammar>();
        grammar.parse_text(XS).unwrap();
        let exclusion = data.create_form::<ExclusionTree>();
        exclusion.init(session.core().form_id());

        let mut expected: Vec<(FormId, Vec<String>)> = Vec::new();
        for (index, seed) in [11u32, 22, 33].into_iter().enumerate() {
            let tree = data.create_form::<DerivationTree>();
            grammar.derive(&tree, 3 + index as i32, seed);
            assert!(tree.is_valid());
            let input = data.create_form::<Input>();
            input.populate_from_tree(&tree);
            expected.push((input.core().form_id(), input.tokens()));
        }
        exclusion.add_sequence(&data, &expected[0].1, expected[0].0, OracleResult::Passing);
        exclusion.add_sequence(&data, &expected[1].1, expected[1].0, OracleResult::Unfinished);

        let path = data.save().unwrap();
        assert!(path.exists());
        assert_eq!(path.extension().and_then(|e| e.to_str()), Some("tfsave"));

        let reloaded = Data::new();
        reloaded.set_save_path(directory.path());
        let stats = reloaded.load_latest("roundtrip").unwrap();
        assert_eq!(stats.failed, 0);

        let grammar2 = reloaded.lookup_form::<Grammar>(grammar.core().form_id()).unwrap();
        assert!(grammar2.is_valid());

        for (input_id, tokens) in &expected {
            let input = reloaded.lookup_form::<Input>(*input_id).unwrap();
            assert_eq!(&input.tokens(), tokens);

            // The tree was saved without nodes; re-derive from its seed.
            let tree = reloaded.lookup_form::<DerivationTree>(input.derive_id()).unwrap();
            assert!(tree.regenerate());
            grammar2.regenerate(&tree);
            assert!(tree.is_valid());
            let state = tree.read();
            let derived = crate::derivation::materialize_sequence(state.root.as_ref().unwrap());
            assert_eq!(&derived, tokens);
        }

        let exclusion2 =
            reloaded.lookup_form::<ExclusionTree>(static_ids::EXCLUSION_TREE).unwrap();
        let mut probe = expected[0].1.clone();
        probe.push("x".to_owned());
        assert_eq!(exclusion2.has_prefix(&reloaded, &probe), (true, expected[0].0));
        assert_eq!(exclusion2.has_prefix(&reloaded, &expected[1].1), (true, expected[1].0));

        // New forms keep allocating past everything that was loaded.
        let fresh = reloaded.create_form::<Input>();
        assert!(!expected.iter().any(|(id, _)| *id == fresh.core().form_id()));
    }

    #[test]
    fn load_rejects_junk_files() {
        let directory = tempfile::tempdir().unwrap();
        let path = directory.path().join("junk.tfsave");
        std::fs::write(&path, b"definitely not a save").unwrap();
        let data = Data::new();
        assert!(data.load_file(&path).is_err());
    }

    #[test]
    fn save_numbers_increment() {
        let directory = tempfile::tempdir().unwrap();
        let data = Data::new();
        data.set_unique_name("numbered");
        data.set_save_path(directory.path());
        let first = data.save().unwrap();
        let second = data.save().unwrap();
        assert!(first.to_string_lossy().contains("numbered_1"));
        assert!(second.to_string_lossy().contains("numbered_2"));

        let reloaded = Data::new();
        reloaded.set_save_path(directory.path());
        reloaded.load_latest("numbered").unwrap();
        let third = reloaded.save().unwrap();
        assert!(third.to_string_lossy().contains("numbered_3"));
    }
}
