use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
    sync::{Arc, Weak},
};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::{sync::broadcast::error::RecvError, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use super::{BreakpointAttributes, BreakpointRecord, BreakpointStore};
use crate::{
    protocol::{Capabilities, SetBreakpointsArguments, Source, SourceBreakpoint},
    session::{ConfigurationHook, DebugSession, SessionId},
};

const TARGET: &str = "nova.dap.client";

/// Wire breakpoints for one file, as a given adapter should see them.
///
/// Disabled records are left out, columns of `0` are omitted, and conditions
/// are dropped only when the adapter has said it does not support them.
pub fn project_breakpoints(records: &[BreakpointRecord], capabilities: &Capabilities) -> Vec<SourceBreakpoint> {
    let mut enabled: Vec<&BreakpointRecord> = records.iter().filter(|r| r.attributes.enabled).collect();
    enabled.sort_by_key(|r| (r.line, r.attributes.column.unwrap_or(0), r.id));

    enabled
        .into_iter()
        .map(|record| SourceBreakpoint {
            line: record.line,
            column: record.attributes.column.filter(|column| *column > 0),
            condition: non_empty(&record.attributes.condition)
                .filter(|_| capabilities.allows_conditions()),
            hit_condition: non_empty(&record.attributes.hit_condition)
                .filter(|_| capabilities.allows_hit_conditions()),
        })
        .collect()
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value.as_ref().filter(|v| !v.trim().is_empty()).cloned()
}

fn source_for(path: &Path) -> Source {
    Source {
        name: path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned()),
        path: Some(path.to_string_lossy().into_owned()),
    }
}

#[derive(Clone)]
struct SessionSlot {
    session: DebugSession,
    /// Serializes sends to one session so the last one out carries the newest snapshot.
    send_lock: Arc<tokio::sync::Mutex<()>>,
    /// Files this session may still hold breakpoints for. A file whose records
    /// all vanished while changes were missed still gets its empty list.
    sent: Arc<Mutex<BTreeSet<PathBuf>>>,
}

struct SyncInner {
    store: Arc<dyn BreakpointStore>,
    sessions: Mutex<Vec<SessionSlot>>,
    shutdown: CancellationToken,
}

/// Keeps every live session's breakpoints for a file equal to the store's
/// records for that file.
///
/// Every update re-sends the whole file, computed from a fresh store snapshot
/// taken while holding that session's send lock.
#[derive(Clone)]
pub struct BreakpointSynchronizer {
    inner: Arc<SyncInner>,
}

impl BreakpointSynchronizer {
    pub fn new(store: Arc<dyn BreakpointStore>) -> Self {
        Self {
            inner: Arc::new(SyncInner {
                store,
                sessions: Mutex::new(Vec::new()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Track `session`. Its breakpoints are flushed when it reports
    /// `initialized`, or right away if it already has.
    pub async fn add_session(&self, session: &DebugSession) {
        {
            let mut sessions = self.inner.sessions.lock();
            if sessions.iter().any(|slot| slot.session.id() == session.id()) {
                return;
            }
            sessions.push(SessionSlot {
                session: session.clone(),
                send_lock: Arc::new(tokio::sync::Mutex::new(())),
                sent: Arc::default(),
            });
        }
        session.add_configuration_hook(Arc::new(FlushOnInitialized {
            synchronizer: Arc::downgrade(&self.inner),
        }));

        let closed = session.clone();
        let synchronizer = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            closed.closed().await;
            if let Some(inner) = synchronizer.upgrade() {
                inner.forget(closed.id());
            }
        });
        if session.is_initialized() {
            self.inner.flush_session(session.id()).await;
        }
    }

    /// Stop tracking a session. Sessions are dropped on their own once they
    /// terminate.
    pub fn remove_session(&self, id: SessionId) {
        self.inner.forget(id);
    }

    pub fn session_count(&self) -> usize {
        self.inner.sessions.lock().len()
    }

    /// Send every file's breakpoints to every initialized session. Completes
    /// once all of those calls have been answered.
    pub async fn initialize(&self) {
        self.inner.initialize().await;
    }

    pub async fn record_added(&self, record: &BreakpointRecord) {
        self.inner.sync_file(&record.path).await;
    }

    pub async fn record_changed(&self, record: &BreakpointRecord, old: &BreakpointAttributes) {
        tracing::trace!(target: TARGET, id = %record.id, ?old, "breakpoint changed");
        self.inner.sync_file(&record.path).await;
    }

    /// Re-sends the file even when this was its last breakpoint; an empty list
    /// clears it on the adapter.
    pub async fn record_removed(&self, record: &BreakpointRecord) {
        self.inner.sync_file(&record.path).await;
    }

    pub async fn flush_session(&self, session: &DebugSession) {
        self.inner.flush_session(session.id()).await;
    }

    /// Follow the store's change stream until [`BreakpointSynchronizer::shutdown`].
    pub fn observe(&self) -> JoinHandle<()> {
        let mut changes = self.inner.store.subscribe();
        let inner = self.inner.clone();
        tokio::spawn(async move {
            loop {
                let change = tokio::select! {
                    _ = inner.shutdown.cancelled() => break,
                    change = changes.recv() => change,
                };
                match change {
                    Ok(change) => inner.sync_file(change.path()).await,
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::debug!(target: TARGET, skipped, "missed breakpoint changes; resending all files");
                        inner.initialize().await;
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    /// Stop issuing sends. Calls already on the wire are left to finish.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }
}

impl SyncInner {
    fn slots(&self) -> Vec<SessionSlot> {
        self.sessions.lock().clone()
    }

    fn forget(&self, id: SessionId) {
        self.sessions.lock().retain(|slot| slot.session.id() != id);
    }

    fn paths(&self) -> BTreeSet<PathBuf> {
        self.store
            .records()
            .into_iter()
            .map(|record| record.path)
            .collect()
    }

    async fn initialize(&self) {
        let paths = self.paths();
        let slots = self.slots();
        futures::future::join_all(slots.iter().map(|slot| self.flush_slot(slot, &paths))).await;
    }

    async fn sync_file(&self, path: &Path) {
        let slots = self.slots();
        futures::future::join_all(slots.iter().map(|slot| self.send_file(slot, path))).await;
    }

    async fn flush_session(&self, id: SessionId) {
        let slot = self
            .slots()
            .into_iter()
            .find(|slot| slot.session.id() == id);
        if let Some(slot) = slot {
            let paths = self.paths();
            self.flush_slot(&slot, &paths).await;
        }
    }

    async fn flush_slot(&self, slot: &SessionSlot, paths: &BTreeSet<PathBuf>) {
        let mut paths = paths.clone();
        paths.extend(slot.sent.lock().iter().cloned());
        for path in &paths {
            self.send_file(slot, path).await;
        }
    }

    async fn send_file(&self, slot: &SessionSlot, path: &Path) {
        if self.shutdown.is_cancelled() {
            return;
        }
        let _guard = slot.send_lock.lock().await;
        if self.shutdown.is_cancelled() || !slot.session.accepts_breakpoints() {
            return;
        }

        let records = self.store.records_for(path);
        let capabilities = slot.session.capabilities().unwrap_or_default();
        let breakpoints = project_breakpoints(&records, &capabilities);
        let count = breakpoints.len();
        let args = SetBreakpointsArguments {
            source: source_for(path),
            breakpoints,
        };

        slot.sent.lock().insert(path.to_path_buf());
        match slot.session.set_breakpoints(args).await {
            Ok(response) => {
                if count == 0 {
                    slot.sent.lock().remove(path);
                }
                let verified = response.breakpoints.iter().filter(|bp| bp.verified).count();
                tracing::debug!(
                    target: TARGET,
                    session = %slot.session.id(),
                    path = %path.display(),
                    count,
                    verified,
                    "breakpoints sent"
                );
            }
            Err(err) if err.is_no_result() || !slot.session.accepts_breakpoints() => {
                tracing::debug!(
                    target: TARGET,
                    session = %slot.session.id(),
                    path = %path.display(),
                    error = %err,
                    "breakpoints not confirmed"
                );
            }
            Err(err) => {
                tracing::warn!(
                    target: TARGET,
                    session = %slot.session.id(),
                    path = %path.display(),
                    error = %err,
                    "failed to set breakpoints"
                );
            }
        }
    }
}

struct FlushOnInitialized {
    synchronizer: Weak<SyncInner>,
}

#[async_trait]
impl ConfigurationHook for FlushOnInitialized {
    async fn on_initialized(&self, session: &DebugSession) {
        if let Some(inner) = self.synchronizer.upgrade() {
            inner.flush_session(session.id()).await;
        }
    }
}
