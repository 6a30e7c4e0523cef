use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::alarm::{AlarmDefinition, AlarmId};
use crate::engine::AlarmStore;
use crate::error::StoreError;

/// Process-local alarm store. Nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    alarms: Mutex<BTreeMap<AlarmId, AlarmDefinition>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_alarms(alarms: impl IntoIterator<Item = AlarmDefinition>) -> Self {
        let store = Self::new();
        for def in alarms {
            store.insert(def);
        }
        store
    }

    /// Infallible upsert.
    pub fn insert(&self, def: AlarmDefinition) {
        self.lock().insert(def.id.clone(), def);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<AlarmId, AlarmDefinition>> {
        self.alarms.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl AlarmStore for MemoryStore {
    fn list(&self) -> Result<Vec<AlarmDefinition>, StoreError> {
        Ok(self.lock().values().cloned().collect())
    }

    fn get(&self, id: &str) -> Result<Option<AlarmDefinition>, StoreError> {
        Ok(self.lock().get(id).cloned())
    }

    fn upsert(&self, def: &AlarmDefinition) -> Result<(), StoreError> {
        self.insert(def.clone());
        Ok(())
    }

    fn delete(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.lock().remove(id).is_some())
    }
}
