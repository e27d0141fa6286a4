//! Session settings (singleton id 3). Loaded from a JSON file, persisted
//! with the save as form `'SETT'`.

use std::any::Any;
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::codec::{CodecResult, Decoder, Encoder};
use crate::store::{Form, FormCore, FormType, LoadResolver, read_version};

/// The recognized options. The JSON keys use the camel-cased field names,
/// e.g. `disableExclusionTree`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SettingsValues {
    /// Turns the exclusion tree into a no-op when set.
    pub disable_exclusion_tree: bool,
    /// Random target-length range for fresh derivations.
    pub generation_length_min: i32,
    pub generation_length_max: i32,
    /// Range of sequence nodes dropped before a plain extension.
    pub extension_min: i32,
    pub extension_max: i32,
    /// Range of sequence nodes dropped before a backtracking extension.
    pub backtrack_min: i32,
    pub backtrack_max: i32,
    pub max_active_inputs: i64,
    pub max_simultaneous_generation: i64,
    /// Whether target stdout is retained on the test record.
    pub store_output: bool,
}

impl Default for SettingsValues {
    fn default() -> Self {
        Self {
            disable_exclusion_tree: false,
            generation_length_min: 10,
            generation_length_max: 100,
            extension_min: 0,
            extension_max: 0,
            backtrack_min: 1,
            backtrack_max: 10,
            max_active_inputs: 5000,
            max_simultaneous_generation: 100,
            store_output: false,
        }
    }
}

const CLASS_VERSION: i32 = 0x1;

#[derive(Debug, Default)]
pub struct Settings {
    core: FormCore,
    values: RwLock<SettingsValues>,
}

impl Settings {
    pub fn values(&self) -> SettingsValues {
        self.values.read().clone()
    }

    pub fn update(&self, values: SettingsValues) {
        self.core.set_changed();
        *self.values.write() = values;
    }

    pub fn disable_exclusion_tree(&self) -> bool {
        self.values.read().disable_exclusion_tree
    }

    /// Reads settings from a JSON file, leaving defaults for absent keys.
    pub fn load_file(&self, path: &Path) -> anyhow::Result<()> {
        let raw = std::fs::read_to_string(path)?;
        let values: SettingsValues = serde_json::from_str(&raw)?;
        info!(path = %path.display(), "loaded settings");
        self.update(values);
        Ok(())
    }

    pub fn save_file(&self, path: &Path) -> anyhow::Result<()> {
        let raw = serde_json::to_string_pretty(&self.values())?;
        std::fs::write(path, raw)?;
        Ok(())
    }
}

impl Form for Settings {
    fn form_type(&self) -> FormType {
        FormType::Settings
    }

    fn core(&self) -> &FormCore {
        &self.core
    }

    fn write_data(&self, enc: &mut Encoder) -> CodecResult<()> {
        enc.write_i32(CLASS_VERSION)?;
        self.core.write_envelope(enc)?;
        let v = self.values.read();
        enc.write_bool(v.disable_exclusion_tree)?;
        enc.write_i32(v.generation_length_min)?;
        enc.write_i32(v.generation_length_max)?;
        enc.write_i32(v.extension_min)?;
        enc.write_i32(v.extension_max)?;
        enc.write_i32(v.backtrack_min)?;
        enc.write_i32(v.backtrack_max)?;
        enc.write_i64(v.max_active_inputs)?;
        enc.write_i64(v.max_simultaneous_generation)?;
        enc.write_bool(v.store_output)
    }

    fn read_data(&self, dec: &mut Decoder<'_>, _resolver: &mut LoadResolver) -> CodecResult<()> {
        read_version(dec, &[CLASS_VERSION])?;
        self.core.read_envelope(dec)?;
        let mut v = self.values.write();
        v.disable_exclusion_tree = dec.read_bool()?;
        v.generation_length_min = dec.read_i32()?;
        v.generation_length_max = dec.read_i32()?;
        v.extension_min = dec.read_i32()?;
        v.extension_max = dec.read_i32()?;
        v.backtrack_min = dec.read_i32()?;
        v.backtrack_max = dec.read_i32()?;
        v.max_active_inputs = dec.read_i64()?;
        v.max_simultaneous_generation = dec.read_i64()?;
        v.store_output = dec.read_bool()?;
        Ok(())
    }

    fn clear(&self) {
        *self.values.write() = SettingsValues::default();
        self.core.clear();
    }

    fn memory_size(&self) -> usize {
        size_of::<Self>()
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
    use crate::codec::Decoder;

    #[test]
    fn binary_round_trip() {
        let settings = Settings::default();
        settings.update(SettingsValues {
            disable_exclusion_tree: true,
            generation_length_min: 3,
            generation_length_max: 9,
            extension_min: 1,
            extension_max: 2,
            backtrack_min: 4,
            backtrack_max: 8,
            max_active_inputs: 77,
            max_simultaneous_generation: 11,
            store_output: true,
        });

        let mut enc = Encoder::new();
        settings.write_data(&mut enc).unwrap();
        let bytes = enc.into_bytes();

        let loaded = Settings::default();
        let mut resolver = LoadResolver::new();
        loaded.read_data(&mut Decoder::new(&bytes), &mut resolver).unwrap();
        let v = loaded.values();
        assert!(v.disable_exclusion_tree);
        assert_eq!(v.generation_length_max, 9);
        assert_eq!(v.max_active_inputs, 77);
        assert!(v.store_output);
    }

    #[test]
    fn json_defaults_for_absent_keys() {
        let parsed: SettingsValues =
            serde_json::from_str(r#"{ "backtrackMax": 42, "disableExclusionTree": true }"#)
                .unwrap();
        assert_eq!(parsed.backtrack_max, 42);
        assert!(parsed.disable_exclusion_tree);
        assert_eq!(parsed.generation_length_min, SettingsValues::default().generation_length_min);
    }
}
