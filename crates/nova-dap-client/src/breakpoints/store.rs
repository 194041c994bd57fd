use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
};

use parking_lot::RwLock;
use tokio::sync::broadcast;

use super::{BreakpointAttributes, BreakpointChange, BreakpointId, BreakpointRecord, BreakpointStore};

/// [`BreakpointStore`] kept in memory.
pub struct InMemoryBreakpointStore {
    records: RwLock<BTreeMap<BreakpointId, BreakpointRecord>>,
    next_id: AtomicU64,
    changes: broadcast::Sender<BreakpointChange>,
}

impl Default for InMemoryBreakpointStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBreakpointStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(256);
        Self {
            records: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
            changes,
        }
    }

    pub fn add(
        &self,
        path: impl Into<PathBuf>,
        line: u32,
        attributes: BreakpointAttributes,
    ) -> BreakpointRecord {
        let record = BreakpointRecord {
            id: BreakpointId(self.next_id.fetch_add(1, Ordering::Relaxed)),
            path: path.into(),
            line,
            attributes,
        };
        self.records.write().insert(record.id, record.clone());
        let _ = self.changes.send(BreakpointChange::Added(record.clone()));
        record
    }

    /// Replace a record's attributes. Returns the updated record.
    pub fn update(&self, id: BreakpointId, attributes: BreakpointAttributes) -> Option<BreakpointRecord> {
        let (record, old) = {
            let mut records = self.records.write();
            let record = records.get_mut(&id)?;
            let old = std::mem::replace(&mut record.attributes, attributes);
            (record.clone(), old)
        };
        if record.attributes != old {
            let _ = self.changes.send(BreakpointChange::Changed {
                record: record.clone(),
                old,
            });
        }
        Some(record)
    }

    pub fn set_enabled(&self, id: BreakpointId, enabled: bool) -> Option<BreakpointRecord> {
        let mut attributes = self.records.read().get(&id)?.attributes.clone();
        attributes.enabled = enabled;
        self.update(id, attributes)
    }

    pub fn remove(&self, id: BreakpointId) -> Option<BreakpointRecord> {
        let record = self.records.write().remove(&id)?;
        let _ = self.changes.send(BreakpointChange::Removed(record.clone()));
        Some(record)
    }

    pub fn get(&self, id: BreakpointId) -> Option<BreakpointRecord> {
        self.records.read().get(&id).cloned()
    }
}

impl BreakpointStore for InMemoryBreakpointStore {
    fn records(&self) -> Vec<BreakpointRecord> {
        self.records.read().values().cloned().collect()
    }

    fn records_for(&self, path: &Path) -> Vec<BreakpointRecord> {
        self.records
            .read()
            .values()
            .filter(|record| record.path == path)
            .cloned()
            .collect()
    }

    fn subscribe(&self) -> broadcast::Receiver<BreakpointChange> {
        self.changes.subscribe()
    }
}
