//! Source breakpoints as edited by the user, and how they reach adapters.

mod store;
mod sync;

use std::{
    fmt,
    path::{Path, PathBuf},
};

use tokio::sync::broadcast;

pub use store::InMemoryBreakpointStore;
pub use sync::{project_breakpoints, BreakpointSynchronizer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BreakpointId(pub u64);

impl fmt::Display for BreakpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// User-editable attributes of a breakpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakpointAttributes {
    /// 1-based; `None` or `Some(0)` lets the adapter pick the column.
    pub column: Option<u32>,
    pub condition: Option<String>,
    pub hit_condition: Option<String>,
    pub enabled: bool,
}

impl Default for BreakpointAttributes {
    fn default() -> Self {
        Self {
            column: None,
            condition: None,
            hit_condition: None,
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakpointRecord {
    pub id: BreakpointId,
    pub path: PathBuf,
    /// 1-based.
    pub line: u32,
    pub attributes: BreakpointAttributes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BreakpointChange {
    Added(BreakpointRecord),
    Changed {
        record: BreakpointRecord,
        old: BreakpointAttributes,
    },
    Removed(BreakpointRecord),
}

impl BreakpointChange {
    pub fn path(&self) -> &Path {
        match self {
            BreakpointChange::Added(record)
            | BreakpointChange::Changed { record, .. }
            | BreakpointChange::Removed(record) => &record.path,
        }
    }
}

/// The authoritative set of breakpoint records. Read-only from this crate's
/// point of view; edits happen elsewhere and show up on [`BreakpointStore::subscribe`].
pub trait BreakpointStore: Send + Sync {
    fn records(&self) -> Vec<BreakpointRecord>;

    fn records_for(&self, path: &Path) -> Vec<BreakpointRecord> {
        self.records()
            .into_iter()
            .filter(|record| record.path == path)
            .collect()
    }

    fn subscribe(&self) -> broadcast::Receiver<BreakpointChange>;
}
