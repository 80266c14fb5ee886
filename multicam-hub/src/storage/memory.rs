use std::collections::BTreeMap;
use std::sync::RwLock;

use super::{ButtonKey, ButtonValue, PresetRecord, PresetStore, StoreError};
use crate::device::{FocusValue, PresetSlot};

/// Volatile store, used when no storage path is configured.
#[derive(Debug, Default)]
pub struct MemoryPresetStore {
    presets: RwLock<BTreeMap<(usize, PresetSlot), FocusValue>>,
    buttons: RwLock<BTreeMap<ButtonKey, ButtonValue>>,
}

impl MemoryPresetStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PresetStore for MemoryPresetStore {
    fn get(&self, camera: usize, slot: PresetSlot) -> Result<Option<FocusValue>, StoreError> {
        let presets = self.presets.read().map_err(|_| StoreError::Poisoned)?;
        Ok(presets.get(&(camera, slot)).copied())
    }

    fn set(&self, record: PresetRecord) -> Result<(), StoreError> {
        let mut presets = self.presets.write().map_err(|_| StoreError::Poisoned)?;
        presets.insert((record.camera, record.slot), record.focus);
        Ok(())
    }

    fn all(&self) -> Result<Vec<PresetRecord>, StoreError> {
        let presets = self.presets.read().map_err(|_| StoreError::Poisoned)?;
        Ok(presets
            .iter()
            .map(|(&(camera, slot), &focus)| PresetRecord { camera, slot, focus })
            .collect())
    }

    fn set_button(&self, key: ButtonKey, value: &ButtonValue) -> Result<(), StoreError> {
        let mut buttons = self.buttons.write().map_err(|_| StoreError::Poisoned)?;
        buttons.insert(key, value.clone());
        Ok(())
    }

    fn buttons(&self) -> Result<Vec<(ButtonKey, ButtonValue)>, StoreError> {
        let buttons = self.buttons.read().map_err(|_| StoreError::Poisoned)?;
        Ok(buttons.iter().map(|(k, v)| (*k, v.clone())).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_set_overwrites() {
        let store = MemoryPresetStore::new();
        assert_eq!(store.get(0, 1).unwrap(), None);

        store.set(PresetRecord { camera: 0, slot: 1, focus: 100 }).unwrap();
        store.set(PresetRecord { camera: 0, slot: 1, focus: 200 }).unwrap();

        assert_eq!(store.get(0, 1).unwrap(), Some(200));
        assert_eq!(store.all().unwrap().len(), 1);
    }

    #[test]
    fn test_all_is_ordered() {
        let store = MemoryPresetStore::new();
        store.set(PresetRecord { camera: 2, slot: 0, focus: 1 }).unwrap();
        store.set(PresetRecord { camera: 0, slot: 9, focus: 2 }).unwrap();
        store.set(PresetRecord { camera: 0, slot: 3, focus: 3 }).unwrap();

        let keys: Vec<_> = store.all().unwrap().iter().map(|r| (r.camera, r.slot)).collect();
        assert_eq!(keys, vec![(0, 3), (0, 9), (2, 0)]);
    }

    #[test]
    fn test_buttons() {
        let store = MemoryPresetStore::new();
        let value = json!({"name": "Wide", "btn_class": "active"});
        let key = ButtonKey { camera: 1, slot: 4 };
        store.set_button(key, value.as_object().unwrap()).unwrap();

        let buttons = store.buttons().unwrap();
        assert_eq!(buttons.len(), 1);
        assert_eq!(buttons[0].0, key);
        assert_eq!(buttons[0].1["name"], "Wide");
    }
}
