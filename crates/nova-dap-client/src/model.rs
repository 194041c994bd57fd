//! Lazily populated runtime state: threads, stack frames, scopes and variables.
//!
//! Everything below a thread is only valid for one stop. The cache is cleared
//! wholesale on every resume and each clear bumps an epoch; handles remember the
//! epoch they were created in and refuse to fetch once it has moved on, so a
//! frame id from an earlier stop never reaches the adapter.

use std::{
    collections::{BTreeMap, HashMap},
    path::PathBuf,
    sync::Weak,
};

use crate::{
    protocol::{self, FrameId, ThreadId, VariablesReference},
    session::SessionInner,
};

#[derive(Debug, Default)]
pub(crate) struct RuntimeModel {
    epoch: u64,
    threads: Option<Vec<protocol::Thread>>,
    frames: HashMap<ThreadId, Vec<protocol::StackFrame>>,
    scopes: HashMap<FrameId, Vec<protocol::Scope>>,
    variables: HashMap<VariablesReference, Vec<protocol::Variable>>,
    /// Threads reported through `stopped`/`thread` events. Survives resumes.
    known_threads: BTreeMap<ThreadId, String>,
}

impl RuntimeModel {
    pub(crate) fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Drop every per-stop cache. Clearing an empty model only moves the epoch.
    pub(crate) fn clear(&mut self) {
        self.epoch += 1;
        self.threads = None;
        self.frames.clear();
        self.scopes.clear();
        self.variables.clear();
    }

    pub(crate) fn clear_all(&mut self) {
        self.clear();
        self.known_threads.clear();
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.threads.is_none()
            && self.frames.is_empty()
            && self.scopes.is_empty()
            && self.variables.is_empty()
    }

    pub(crate) fn note_thread(&mut self, id: ThreadId, name: Option<&str>) {
        let entry = self
            .known_threads
            .entry(id)
            .or_insert_with(|| format!("Thread {id}"));
        if let Some(name) = name {
            *entry = name.to_string();
        }
    }

    pub(crate) fn forget_thread(&mut self, id: ThreadId) {
        if self.known_threads.remove(&id).is_some() {
            self.threads = None;
            self.frames.remove(&id);
        }
    }

    pub(crate) fn cached_threads(&self) -> Option<Vec<protocol::Thread>> {
        self.threads.clone()
    }

    /// Adapter threads plus any thread only known from events.
    pub(crate) fn merge_known_threads(&self, mut threads: Vec<protocol::Thread>) -> Vec<protocol::Thread> {
        for (id, name) in &self.known_threads {
            if !threads.iter().any(|t| t.id == *id) {
                threads.push(protocol::Thread {
                    id: *id,
                    name: name.clone(),
                });
            }
        }
        threads
    }

    pub(crate) fn store_threads(&mut self, epoch: u64, threads: Vec<protocol::Thread>) {
        if self.epoch == epoch {
            self.threads = Some(threads);
        }
    }

    pub(crate) fn cached_frames(&self, thread: ThreadId) -> Option<Vec<protocol::StackFrame>> {
        self.frames.get(&thread).cloned()
    }

    pub(crate) fn store_frames(&mut self, epoch: u64, thread: ThreadId, frames: Vec<protocol::StackFrame>) {
        if self.epoch == epoch {
            self.frames.insert(thread, frames);
        }
    }

    pub(crate) fn cached_scopes(&self, frame: FrameId) -> Option<Vec<protocol::Scope>> {
        self.scopes.get(&frame).cloned()
    }

    pub(crate) fn store_scopes(&mut self, epoch: u64, frame: FrameId, scopes: Vec<protocol::Scope>) {
        if self.epoch == epoch {
            self.scopes.insert(frame, scopes);
        }
    }

    pub(crate) fn cached_variables(&self, reference: VariablesReference) -> Option<Vec<protocol::Variable>> {
        self.variables.get(&reference).cloned()
    }

    pub(crate) fn store_variables(
        &mut self,
        epoch: u64,
        reference: VariablesReference,
        variables: Vec<protocol::Variable>,
    ) {
        if self.epoch == epoch {
            self.variables.insert(reference, variables);
        }
    }
}

/// A debuggee thread. Holds only a weak link to its session.
#[derive(Debug, Clone)]
pub struct Thread {
    pub(crate) id: ThreadId,
    pub(crate) name: String,
    pub(crate) session: Weak<SessionInner>,
}

impl Thread {
    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Frames of this thread for the current stop; fetched on first access.
    pub async fn stack_frames(&self) -> Vec<StackFrame> {
        match self.session.upgrade() {
            Some(session) => session.stack_frames(self.id).await,
            None => Vec::new(),
        }
    }
}

impl PartialEq for Thread {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.name == other.name
    }
}

#[derive(Debug, Clone)]
pub struct StackFrame {
    pub(crate) id: FrameId,
    pub(crate) name: String,
    pub(crate) line: u32,
    pub(crate) column: u32,
    pub(crate) source_path: Option<PathBuf>,
    pub(crate) thread: ThreadId,
    pub(crate) epoch: u64,
    pub(crate) session: Weak<SessionInner>,
}

impl StackFrame {
    pub fn id(&self) -> FrameId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn line(&self) -> u32 {
        self.line
    }

    pub fn column(&self) -> u32 {
        self.column
    }

    pub fn source_path(&self) -> Option<&std::path::Path> {
        self.source_path.as_deref()
    }

    pub fn thread_id(&self) -> ThreadId {
        self.thread
    }

    pub async fn scopes(&self) -> Vec<Scope> {
        match self.session.upgrade() {
            Some(session) => session.scopes(self.id, self.epoch).await,
            None => Vec::new(),
        }
    }
}

impl PartialEq for StackFrame {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.name == other.name
            && self.line == other.line
            && self.column == other.column
            && self.source_path == other.source_path
            && self.thread == other.thread
    }
}

#[derive(Debug, Clone)]
pub struct Scope {
    pub(crate) name: String,
    pub(crate) variables_reference: VariablesReference,
    pub(crate) expensive: bool,
    pub(crate) epoch: u64,
    pub(crate) session: Weak<SessionInner>,
}

impl Scope {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn variables_reference(&self) -> VariablesReference {
        self.variables_reference
    }

    pub fn has_children(&self) -> bool {
        !self.variables_reference.is_leaf()
    }

    /// Hint from the adapter that fetching this scope is costly.
    pub fn is_expensive(&self) -> bool {
        self.expensive
    }

    pub async fn variables(&self) -> Vec<Variable> {
        fetch_children(&self.session, self.variables_reference, self.epoch).await
    }
}

impl PartialEq for Scope {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.variables_reference == other.variables_reference
            && self.expensive == other.expensive
    }
}

#[derive(Debug, Clone)]
pub struct Variable {
    pub(crate) name: String,
    pub(crate) value: String,
    pub(crate) type_name: Option<String>,
    pub(crate) variables_reference: VariablesReference,
    pub(crate) epoch: u64,
    pub(crate) session: Weak<SessionInner>,
}

impl Variable {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn type_name(&self) -> Option<&str> {
        self.type_name.as_deref()
    }

    pub fn variables_reference(&self) -> VariablesReference {
        self.variables_reference
    }

    pub fn has_children(&self) -> bool {
        !self.variables_reference.is_leaf()
    }

    pub async fn variables(&self) -> Vec<Variable> {
        fetch_children(&self.session, self.variables_reference, self.epoch).await
    }
}

impl PartialEq for Variable {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.value == other.value
            && self.type_name == other.type_name
            && self.variables_reference == other.variables_reference
    }
}

async fn fetch_children(
    session: &Weak<SessionInner>,
    reference: VariablesReference,
    epoch: u64,
) -> Vec<Variable> {
    if reference.is_leaf() {
        return Vec::new();
    }
    match session.upgrade() {
        Some(session) => session.variables(reference, epoch).await,
        None => Vec::new(),
    }
}
