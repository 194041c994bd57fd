//! One client-side debug session: lifecycle state machine, adapter event
//! delivery, and the lazily fetched runtime model.

use std::{
    fmt,
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use nova_config::DebugConfig;
use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::{
    adapter::{AdapterConnection, DebugAdapter},
    dispatcher::{CloseReason, Inbound},
    error::{DapError, SessionError},
    model::{self, RuntimeModel},
    protocol::{
        AdapterEvent, Capabilities, DisconnectArguments, EvaluateArguments, EvaluateResponse,
        FrameId, InitializeArguments, ProcessEvent, SetBreakpointsArguments,
        SetBreakpointsResponse, StepKind, StoppedEvent, ThreadId, VariablesReference,
    },
};

const TARGET: &str = "nova.dap.client";

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Lifecycle of a session. `Terminated` is absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Initializing,
    Launching,
    Running,
    Stopped,
    Terminating,
    Terminated,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LaunchKind {
    #[default]
    Launch,
    Attach,
}

impl LaunchKind {
    pub fn command(self) -> &'static str {
        match self {
            LaunchKind::Launch => "launch",
            LaunchKind::Attach => "attach",
        }
    }
}

/// Who asked the session to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopKind {
    /// The user pressed "stop"; prefer `terminate` when the adapter supports it.
    UserStop,
    /// The workspace is going away; always `disconnect`.
    WorkspaceShutdown,
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub adapter_id: String,
    pub launch_kind: LaunchKind,
    /// Passed verbatim as the `launch`/`attach` arguments.
    pub configuration: Map<String, Value>,
    pub client_id: String,
    pub client_name: String,
    pub locale: String,
    pub initialize_timeout: Duration,
    /// How long to wait after `terminated` for the adapter to exit on its own.
    pub terminated_fallback: Duration,
    pub shutdown_grace: Duration,
}

impl SessionOptions {
    pub fn new(adapter_id: impl Into<String>, launch_kind: LaunchKind, configuration: Map<String, Value>) -> Self {
        Self::from_config(&DebugConfig::default(), adapter_id, launch_kind, configuration)
    }

    pub fn from_config(
        config: &DebugConfig,
        adapter_id: impl Into<String>,
        launch_kind: LaunchKind,
        configuration: Map<String, Value>,
    ) -> Self {
        Self {
            adapter_id: adapter_id.into(),
            launch_kind,
            configuration,
            client_id: config.client_id.clone(),
            client_name: config.client_name.clone(),
            locale: config.locale.clone(),
            initialize_timeout: config.initialize_timeout(),
            terminated_fallback: config.terminated_fallback(),
            shutdown_grace: config.shutdown_grace(),
        }
    }

    fn initialize_arguments(&self) -> InitializeArguments {
        InitializeArguments {
            client_id: self.client_id.clone(),
            client_name: self.client_name.clone(),
            adapter_id: self.adapter_id.clone(),
            locale: self.locale.clone(),
            lines_start_at1: true,
            columns_start_at1: true,
            path_format: "path".to_string(),
            supports_variable_type: true,
            supports_run_in_terminal_request: false,
        }
    }
}

/// Lifecycle notifications for process and console views.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged(SessionState),
    Stopped {
        thread_id: Option<ThreadId>,
        reason: String,
        description: Option<String>,
    },
    Continued,
    Process {
        name: String,
        pid: Option<i64>,
    },
    /// The adapter reported the debuggee gone (`terminated`).
    ProcessTerminated,
    Exited {
        exit_code: i64,
    },
    Output {
        category: Option<String>,
        output: String,
    },
    ConnectionLost {
        reason: String,
    },
}

/// Work that must finish between `initialized` and `configurationDone`.
#[async_trait]
pub trait ConfigurationHook: Send + Sync {
    async fn on_initialized(&self, session: &DebugSession);
}

#[derive(Debug, Default)]
struct Flags {
    started: bool,
    initialized: bool,
    configuration_done: bool,
    process: Option<ProcessEvent>,
    process_terminated: bool,
    terminated_event: bool,
    terminate_requested: bool,
    exit_code: Option<i64>,
    last_stop: Option<StoppedEvent>,
}

pub(crate) struct SessionInner {
    id: SessionId,
    options: SessionOptions,
    state: watch::Sender<SessionState>,
    capabilities: watch::Sender<Option<Capabilities>>,
    adapter: RwLock<Option<Arc<dyn DebugAdapter>>>,
    flags: Mutex<Flags>,
    model: Mutex<RuntimeModel>,
    events: broadcast::Sender<SessionEvent>,
    hooks: Mutex<Vec<Arc<dyn ConfigurationHook>>>,
    fallback: Mutex<Option<CancellationToken>>,
    closed: CancellationToken,
}

/// A debug session bound to one adapter connection for one launch.
///
/// Cheap to clone; all clones refer to the same session.
#[derive(Clone)]
pub struct DebugSession {
    inner: Arc<SessionInner>,
}

impl fmt::Debug for DebugSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DebugSession")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .finish()
    }
}

impl DebugSession {
    pub fn new(options: SessionOptions) -> Self {
        let (state, _) = watch::channel(SessionState::Idle);
        let (capabilities, _) = watch::channel(None);
        let (events, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(SessionInner {
                id: SessionId(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed)),
                options,
                state,
                capabilities,
                adapter: RwLock::new(None),
                flags: Mutex::new(Flags::default()),
                model: Mutex::new(RuntimeModel::default()),
                events,
                hooks: Mutex::new(Vec::new()),
                fallback: Mutex::new(None),
                closed: CancellationToken::new(),
            }),
        }
    }

    pub fn id(&self) -> SessionId {
        self.inner.id
    }

    pub fn options(&self) -> &SessionOptions {
        &self.inner.options
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    /// Wait until the session reaches `wanted`. Returns `false` on timeout or
    /// when the session terminates first.
    pub async fn wait_for_state(&self, wanted: SessionState, within: Duration) -> bool {
        let mut rx = self.inner.state.subscribe();
        let wait = async move {
            loop {
                let current = *rx.borrow_and_update();
                if current == wanted {
                    return true;
                }
                if current == SessionState::Terminated {
                    return false;
                }
                if rx.changed().await.is_err() {
                    return false;
                }
            }
        };
        tokio::time::timeout(within, wait).await.unwrap_or(false)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    /// `None` until the initialize exchange has completed.
    pub fn capabilities(&self) -> Option<Capabilities> {
        self.inner.capabilities.borrow().clone()
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.flags.lock().initialized
    }

    pub fn configuration_done_sent(&self) -> bool {
        self.inner.flags.lock().configuration_done
    }

    pub fn process(&self) -> Option<ProcessEvent> {
        self.inner.flags.lock().process.clone()
    }

    /// Whether there is a debuggee process that `terminate` would act on.
    pub fn can_terminate(&self) -> bool {
        let flags = self.inner.flags.lock();
        flags.process.is_some() && !flags.process_terminated && !flags.terminate_requested
    }

    pub fn is_process_terminated(&self) -> bool {
        self.inner.flags.lock().process_terminated
    }

    pub fn exit_code(&self) -> Option<i64> {
        self.inner.flags.lock().exit_code
    }

    pub fn last_stop(&self) -> Option<StoppedEvent> {
        self.inner.flags.lock().last_stop.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// Resolves once the session has terminated and released its transport.
    pub async fn closed(&self) {
        self.inner.closed.cancelled().await
    }

    pub fn add_configuration_hook(&self, hook: Arc<dyn ConfigurationHook>) {
        self.inner.hooks.lock().push(hook);
    }

    /// Connect, initialize and launch (or attach).
    ///
    /// Events start flowing as soon as the connection is up, so `initialized`
    /// and even `stopped` may be processed before this returns.
    #[tracing::instrument(target = "nova.dap.client", skip_all, fields(session = %self.inner.id))]
    pub async fn start<F>(&self, connect: F) -> Result<(), SessionError>
    where
        F: Future<Output = crate::error::Result<AdapterConnection>>,
    {
        let inner = &self.inner;
        {
            let mut flags = inner.flags.lock();
            if flags.started {
                return Err(SessionError::AlreadyStarted);
            }
            flags.started = true;
        }
        if !inner.set_state_if(|s| s == SessionState::Idle, SessionState::Connecting) {
            return Err(SessionError::Terminated);
        }

        let connection = match connect.await {
            Ok(connection) => connection,
            Err(err) => {
                tracing::warn!(target: TARGET, session = %inner.id, error = %err, "failed to connect to debug adapter");
                inner.finish();
                return Err(SessionError::Connect(err));
            }
        };
        let adapter = connection.adapter;
        *inner.adapter.write() = Some(adapter.clone());
        tokio::spawn(deliver(inner.clone(), connection.inbound));

        if !inner.set_state_if(|s| s == SessionState::Connecting, SessionState::Initializing) {
            // Stopped while connecting; nobody else knows about this transport.
            adapter.close(Duration::ZERO).await;
            return Err(SessionError::Terminated);
        }

        let capabilities = match adapter.initialize(inner.options.initialize_arguments()).await {
            Ok(capabilities) => capabilities,
            Err(err) => return Err(self.abort_start("initialize", err).await),
        };
        tracing::debug!(target: TARGET, session = %inner.id, ?capabilities, "debug adapter initialized");
        inner.capabilities.send_replace(Some(capabilities));

        if !inner.set_state_if(|s| s == SessionState::Initializing, SessionState::Launching) {
            return Err(SessionError::Terminated);
        }

        let kind = inner.options.launch_kind;
        let configuration = inner.options.configuration.clone();
        let launched = match kind {
            LaunchKind::Launch => adapter.launch(configuration).await,
            LaunchKind::Attach => adapter.attach(configuration).await,
        };
        if let Err(err) = launched {
            return Err(self.abort_start(kind.command(), err).await);
        }

        // A `stopped` event (stop on entry) may already have moved us on.
        inner.set_state_if(|s| s == SessionState::Launching, SessionState::Running);
        Ok(())
    }

    async fn abort_start(&self, command: &'static str, err: DapError) -> SessionError {
        if self.inner.is_shutting_down() {
            tracing::debug!(target: TARGET, session = %self.inner.id, command, error = %err, "startup interrupted by shutdown");
        } else {
            tracing::warn!(target: TARGET, session = %self.inner.id, command, error = %err, "debug session failed to start");
        }
        self.stop(StopKind::WorkspaceShutdown).await;
        self.close_gracefully(self.inner.options.shutdown_grace).await;
        SessionError::Request { command, source: err }
    }

    /// Ask the adapter to end the session. Only the first call does anything.
    ///
    /// Never contacts an adapter that has already reported `terminated`.
    pub async fn stop(&self, kind: StopKind) {
        let inner = &self.inner;
        let (already_requested, terminated_event, process_started) = {
            let mut flags = inner.flags.lock();
            let already = std::mem::replace(&mut flags.terminate_requested, true);
            (already, flags.terminated_event, flags.process.is_some())
        };
        if already_requested {
            tracing::debug!(target: TARGET, session = %inner.id, "stop already requested");
            return;
        }
        if self.state() == SessionState::Terminated {
            return;
        }

        inner.set_state(SessionState::Terminating);
        inner.with_model(RuntimeModel::clear);

        let Some(adapter) = inner.adapter() else {
            inner.finish();
            return;
        };
        if terminated_event {
            tracing::debug!(target: TARGET, session = %inner.id, "adapter already reported termination; not contacting it");
            return;
        }

        let capabilities = self.capabilities().unwrap_or_default();
        let (command, result) =
            if kind == StopKind::UserStop && process_started && capabilities.supports_terminate() {
                ("terminate", adapter.terminate().await)
            } else {
                let args = DisconnectArguments {
                    restart: None,
                    terminate_debuggee: Some(inner.options.launch_kind == LaunchKind::Launch),
                };
                ("disconnect", adapter.disconnect(args).await)
            };
        match result {
            Ok(()) => tracing::debug!(target: TARGET, session = %inner.id, command, "stop acknowledged"),
            Err(err) => inner.log_request_failure(command, &err),
        }
    }

    /// User-initiated stop; the transport is drained in the background.
    pub async fn terminate(&self) {
        self.stop(StopKind::UserStop).await;
        let session = self.clone();
        let grace = self.inner.options.shutdown_grace;
        tokio::spawn(async move {
            session.close_gracefully(grace).await;
        });
    }

    /// Wait up to `grace` for the adapter to go away on its own, then close
    /// locally. Returns `true` when no forced close was needed.
    pub async fn close_gracefully(&self, grace: Duration) -> bool {
        if tokio::time::timeout(grace, self.inner.closed.cancelled())
            .await
            .is_ok()
        {
            return true;
        }
        tracing::debug!(target: TARGET, session = %self.inner.id, "debug adapter did not exit in time; closing");
        self.force_close().await;
        false
    }

    /// Terminate locally without sending anything to the adapter.
    pub async fn force_close(&self) {
        self.inner.finish();
        if let Some(adapter) = self.inner.adapter() {
            adapter.close(Duration::ZERO).await;
        }
    }

    /// Threads for the current stop; fetched on first access.
    pub async fn threads(&self) -> Vec<model::Thread> {
        self.inner.threads().await
    }

    pub async fn evaluate(
        &self,
        expression: &str,
        frame: Option<&model::StackFrame>,
        context: Option<&str>,
    ) -> Result<EvaluateResponse, SessionError> {
        let adapter = self.inner.live_adapter()?;
        if let Some(frame) = frame {
            if frame.epoch != self.inner.with_model(|m| m.epoch()) {
                return Err(SessionError::StaleFrame);
            }
        }
        adapter
            .evaluate(EvaluateArguments {
                expression: expression.to_string(),
                frame_id: frame.map(|f| f.id),
                context: context.map(str::to_string),
            })
            .await
            .map_err(SessionError::request("evaluate"))
    }

    pub async fn resume(&self, thread: ThreadId) -> Result<(), SessionError> {
        let adapter = self.inner.live_adapter()?;
        let epoch = self.inner.with_model(|m| m.epoch());
        adapter
            .resume(thread)
            .await
            .map_err(SessionError::request("continue"))?;
        self.inner.resumed(epoch);
        Ok(())
    }

    pub async fn step(&self, thread: ThreadId, kind: StepKind) -> Result<(), SessionError> {
        let adapter = self.inner.live_adapter()?;
        let epoch = self.inner.with_model(|m| m.epoch());
        adapter
            .step(thread, kind)
            .await
            .map_err(SessionError::request(kind.command()))?;
        self.inner.resumed(epoch);
        Ok(())
    }

    pub async fn pause(&self, thread: ThreadId) -> Result<(), SessionError> {
        let adapter = self.inner.live_adapter()?;
        adapter
            .pause(thread)
            .await
            .map_err(SessionError::request("pause"))
    }

    /// Whether breakpoint updates should be sent to this session right now.
    pub(crate) fn accepts_breakpoints(&self) -> bool {
        // `initialized` can arrive before the initialize response; gating needs
        // the capabilities.
        self.is_initialized()
            && self.capabilities().is_some()
            && !self.inner.is_shutting_down()
            && self.inner.adapter().is_some()
    }

    pub(crate) async fn set_breakpoints(
        &self,
        args: SetBreakpointsArguments,
    ) -> crate::error::Result<SetBreakpointsResponse> {
        let adapter = self.inner.adapter().ok_or(DapError::ConnectionClosed)?;
        adapter.set_breakpoints(args).await
    }
}

async fn deliver(inner: Arc<SessionInner>, mut inbound: mpsc::UnboundedReceiver<Inbound>) {
    while let Some(item) = inbound.recv().await {
        match item {
            Inbound::Event(event) => inner.apply_event(event),
            Inbound::Closed(reason) => {
                inner.channel_closed(reason).await;
                return;
            }
        }
    }
    inner.channel_closed(CloseReason::EndOfStream).await;
}

impl SessionInner {
    fn adapter(&self) -> Option<Arc<dyn DebugAdapter>> {
        self.adapter.read().clone()
    }

    fn live_adapter(&self) -> Result<Arc<dyn DebugAdapter>, SessionError> {
        if self.is_shutting_down() {
            return Err(SessionError::Terminated);
        }
        self.adapter().ok_or(SessionError::NotConnected)
    }

    fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    fn with_model<T>(&self, f: impl FnOnce(&mut RuntimeModel) -> T) -> T {
        f(&mut self.model.lock())
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn is_shutting_down(&self) -> bool {
        let requested = {
            let flags = self.flags.lock();
            flags.terminate_requested || flags.terminated_event
        };
        requested
            || matches!(
                self.state(),
                SessionState::Terminating | SessionState::Terminated
            )
    }

    fn set_state(&self, to: SessionState) -> bool {
        self.set_state_if(|_| true, to)
    }

    /// Move to `to` if the current state passes `allowed`. Never leaves `Terminated`.
    fn set_state_if(&self, allowed: impl FnOnce(SessionState) -> bool, to: SessionState) -> bool {
        let mut from = None;
        let changed = self.state.send_if_modified(|state| {
            if *state == to || *state == SessionState::Terminated || !allowed(*state) {
                return false;
            }
            from = Some(*state);
            *state = to;
            true
        });
        if changed {
            tracing::debug!(target: TARGET, session = %self.id, ?from, ?to, "session state changed");
            self.emit(SessionEvent::StateChanged(to));
        }
        changed
    }

    fn log_request_failure(&self, command: &str, err: &DapError) {
        if err.is_no_result() {
            tracing::debug!(target: TARGET, session = %self.id, command, error = %err, "request produced no result");
        } else if self.is_shutting_down() {
            tracing::debug!(target: TARGET, session = %self.id, command, error = %err, "request failed during termination");
        } else {
            tracing::warn!(target: TARGET, session = %self.id, command, error = %err, "debug adapter request failed");
        }
    }

    /// A resume or step was acknowledged. Only clears if nothing else has
    /// already moved the model on (a `continued` or a newer `stopped`).
    fn resumed(&self, epoch: u64) {
        let cleared = self.with_model(|model| {
            if model.epoch() != epoch {
                return false;
            }
            model.clear();
            true
        });
        if cleared {
            self.flags.lock().last_stop = None;
            self.set_state_if(|s| s == SessionState::Stopped, SessionState::Running);
            self.emit(SessionEvent::Continued);
        }
    }

    fn apply_event(self: &Arc<Self>, event: AdapterEvent) {
        tracing::trace!(target: TARGET, session = %self.id, event = event.name(), "adapter event");
        match event {
            AdapterEvent::Initialized => {
                {
                    let mut flags = self.flags.lock();
                    if flags.initialized {
                        tracing::debug!(target: TARGET, session = %self.id, "ignoring repeated `initialized`");
                        return;
                    }
                    flags.initialized = true;
                }
                tokio::spawn(configure(self.clone()));
            }
            AdapterEvent::Stopped(stopped) => {
                self.with_model(|model| {
                    model.clear();
                    if let Some(thread) = stopped.thread_id {
                        model.note_thread(thread, None);
                    }
                });
                self.flags.lock().last_stop = Some(stopped.clone());
                self.set_state_if(
                    |s| {
                        matches!(
                            s,
                            SessionState::Initializing
                                | SessionState::Launching
                                | SessionState::Running
                                | SessionState::Stopped
                        )
                    },
                    SessionState::Stopped,
                );
                self.emit(SessionEvent::Stopped {
                    thread_id: stopped.thread_id,
                    reason: stopped.reason,
                    description: stopped.description,
                });
            }
            AdapterEvent::Continued(_) => {
                self.with_model(RuntimeModel::clear);
                self.flags.lock().last_stop = None;
                self.set_state_if(
                    |s| matches!(s, SessionState::Stopped | SessionState::Launching),
                    SessionState::Running,
                );
                self.emit(SessionEvent::Continued);
            }
            AdapterEvent::Process(process) => {
                tracing::info!(
                    target: TARGET,
                    session = %self.id,
                    name = %process.name,
                    pid = ?process.system_process_id,
                    "debuggee process started"
                );
                self.emit(SessionEvent::Process {
                    name: process.name.clone(),
                    pid: process.system_process_id,
                });
                self.flags.lock().process = Some(process);
            }
            AdapterEvent::Terminated => {
                {
                    let mut flags = self.flags.lock();
                    if flags.terminated_event {
                        return;
                    }
                    flags.terminated_event = true;
                    flags.process_terminated = true;
                }
                tracing::debug!(target: TARGET, session = %self.id, "debug adapter reported termination");
                self.with_model(RuntimeModel::clear);
                self.set_state(SessionState::Terminating);
                self.emit(SessionEvent::ProcessTerminated);
                self.arm_fallback();
            }
            AdapterEvent::Exited(exited) => {
                let after_terminated = {
                    let mut flags = self.flags.lock();
                    flags.exit_code = Some(exited.exit_code);
                    flags.process_terminated = true;
                    flags.terminated_event
                };
                tracing::info!(target: TARGET, session = %self.id, exit_code = exited.exit_code, "debuggee exited");
                self.emit(SessionEvent::Exited {
                    exit_code: exited.exit_code,
                });
                if after_terminated {
                    self.arm_fallback();
                }
            }
            AdapterEvent::Thread(thread) => self.with_model(|model| {
                if thread.reason == "exited" {
                    model.forget_thread(thread.thread_id);
                } else {
                    model.note_thread(thread.thread_id, None);
                }
            }),
            AdapterEvent::Output(output) => self.emit(SessionEvent::Output {
                category: output.category,
                output: output.output,
            }),
            AdapterEvent::Other { event, .. } => {
                tracing::debug!(target: TARGET, session = %self.id, event = %event, "ignoring adapter event");
            }
        }
    }

    /// (Re)start the window the adapter has to exit after `terminated`.
    fn arm_fallback(self: &Arc<Self>) {
        let token = self.closed.child_token();
        if let Some(previous) = self.fallback.lock().replace(token.clone()) {
            previous.cancel();
        }
        let window = self.options.terminated_fallback;
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(window) => {
                    if let Some(inner) = weak.upgrade() {
                        inner.fallback_expired().await;
                    }
                }
            }
        });
    }

    async fn fallback_expired(self: Arc<Self>) {
        if self.closed.is_cancelled() {
            return;
        }
        tracing::info!(target: TARGET, session = %self.id, "debug adapter did not exit after termination; cleaning up locally");
        self.finish();
        if let Some(adapter) = self.adapter() {
            adapter.close(Duration::ZERO).await;
        }
    }

    async fn channel_closed(self: &Arc<Self>, reason: CloseReason) {
        let expected = self.is_shutting_down();
        match &reason {
            CloseReason::Local => {
                tracing::debug!(target: TARGET, session = %self.id, "stopped reading from debug adapter");
            }
            CloseReason::EndOfStream if expected => {
                tracing::debug!(target: TARGET, session = %self.id, "debug adapter closed the connection");
            }
            CloseReason::EndOfStream => {
                tracing::info!(target: TARGET, session = %self.id, "debug adapter closed the connection unexpectedly");
                self.emit(SessionEvent::ConnectionLost {
                    reason: "debug adapter closed the connection".to_string(),
                });
            }
            CloseReason::Error(message) if expected => {
                tracing::debug!(target: TARGET, session = %self.id, error = %message, "transport failed during termination");
            }
            CloseReason::Error(message) => {
                tracing::warn!(target: TARGET, session = %self.id, error = %message, "lost connection to debug adapter");
                self.emit(SessionEvent::ConnectionLost {
                    reason: message.clone(),
                });
            }
        }

        self.finish();
        if let Some(adapter) = self.adapter() {
            adapter.close(self.options.shutdown_grace).await;
        }
    }

    /// Local bookkeeping for the end of the session. Sends nothing.
    fn finish(&self) {
        if let Some(token) = self.fallback.lock().take() {
            token.cancel();
        }
        self.with_model(RuntimeModel::clear_all);
        self.set_state(SessionState::Terminated);
        self.closed.cancel();
    }

    fn adapter_for_fetch(&self) -> Option<Arc<dyn DebugAdapter>> {
        if self.state() == SessionState::Terminated {
            return None;
        }
        self.adapter()
    }

    pub(crate) async fn threads(self: &Arc<Self>) -> Vec<model::Thread> {
        let (epoch, cached) = self.with_model(|m| (m.epoch(), m.cached_threads()));
        let threads = match cached {
            Some(threads) => threads,
            None => match self.adapter_for_fetch() {
                Some(adapter) => match adapter.threads().await {
                    Ok(threads) => self.with_model(|m| {
                        let merged = m.merge_known_threads(threads);
                        m.store_threads(epoch, merged.clone());
                        merged
                    }),
                    Err(err) => {
                        self.log_request_failure("threads", &err);
                        self.with_model(|m| m.merge_known_threads(Vec::new()))
                    }
                },
                None => self.with_model(|m| m.merge_known_threads(Vec::new())),
            },
        };

        threads
            .into_iter()
            .map(|thread| model::Thread {
                id: thread.id,
                name: thread.name,
                session: Arc::downgrade(self),
            })
            .collect()
    }

    pub(crate) async fn stack_frames(self: &Arc<Self>, thread: ThreadId) -> Vec<model::StackFrame> {
        let (epoch, cached) = self.with_model(|m| (m.epoch(), m.cached_frames(thread)));
        let frames = match cached {
            Some(frames) => frames,
            None => {
                let Some(adapter) = self.adapter_for_fetch() else {
                    return Vec::new();
                };
                match adapter.stack_trace(thread).await {
                    Ok(frames) => {
                        self.with_model(|m| m.store_frames(epoch, thread, frames.clone()));
                        frames
                    }
                    Err(err) => {
                        self.log_request_failure("stackTrace", &err);
                        return Vec::new();
                    }
                }
            }
        };

        frames
            .into_iter()
            .map(|frame| model::StackFrame {
                id: frame.id,
                name: frame.name,
                line: frame.line,
                column: frame.column,
                source_path: frame.source.and_then(|s| s.path).map(Into::into),
                thread,
                epoch,
                session: Arc::downgrade(self),
            })
            .collect()
    }

    pub(crate) async fn scopes(self: &Arc<Self>, frame: FrameId, frame_epoch: u64) -> Vec<model::Scope> {
        let (epoch, cached) = self.with_model(|m| (m.epoch(), m.cached_scopes(frame)));
        if epoch != frame_epoch {
            tracing::debug!(target: TARGET, session = %self.id, frame = %frame, "frame is from an earlier stop");
            return Vec::new();
        }
        let scopes = match cached {
            Some(scopes) => scopes,
            None => {
                let Some(adapter) = self.adapter_for_fetch() else {
                    return Vec::new();
                };
                match adapter.scopes(frame).await {
                    Ok(scopes) => {
                        self.with_model(|m| m.store_scopes(epoch, frame, scopes.clone()));
                        scopes
                    }
                    Err(err) => {
                        self.log_request_failure("scopes", &err);
                        return Vec::new();
                    }
                }
            }
        };

        scopes
            .into_iter()
            .map(|scope| model::Scope {
                name: scope.name,
                variables_reference: scope.variables_reference,
                expensive: scope.expensive,
                epoch,
                session: Arc::downgrade(self),
            })
            .collect()
    }

    pub(crate) async fn variables(
        self: &Arc<Self>,
        reference: VariablesReference,
        parent_epoch: u64,
    ) -> Vec<model::Variable> {
        let (epoch, cached) = self.with_model(|m| (m.epoch(), m.cached_variables(reference)));
        if epoch != parent_epoch {
            tracing::debug!(target: TARGET, session = %self.id, %reference, "variables reference is from an earlier stop");
            return Vec::new();
        }
        let variables = match cached {
            Some(variables) => variables,
            None => {
                let Some(adapter) = self.adapter_for_fetch() else {
                    return Vec::new();
                };
                match adapter.variables(reference).await {
                    Ok(variables) => {
                        self.with_model(|m| m.store_variables(epoch, reference, variables.clone()));
                        variables
                    }
                    Err(err) => {
                        self.log_request_failure("variables", &err);
                        return Vec::new();
                    }
                }
            }
        };

        variables
            .into_iter()
            .map(|variable| model::Variable {
                name: variable.name,
                value: variable.value,
                type_name: variable.type_,
                variables_reference: variable.variables_reference,
                epoch,
                session: Arc::downgrade(self),
            })
            .collect()
    }
}

/// Runs after `initialized`: hooks first, then `configurationDone` if required.
async fn configure(inner: Arc<SessionInner>) {
    // `initialized` may overtake the initialize response, and hooks need the
    // capabilities to shape what they send.
    let Some(capabilities) = wait_for_capabilities(&inner).await else {
        tracing::debug!(target: TARGET, session = %inner.id, "no capabilities; skipping configuration");
        return;
    };

    let session = DebugSession {
        inner: inner.clone(),
    };
    let hooks: Vec<_> = inner.hooks.lock().clone();
    for hook in hooks {
        hook.on_initialized(&session).await;
    }

    if !capabilities.requires_configuration_done() || inner.is_shutting_down() {
        return;
    }
    let Some(adapter) = inner.adapter() else {
        return;
    };
    match adapter.configuration_done().await {
        Ok(()) => {
            inner.flags.lock().configuration_done = true;
            tracing::debug!(target: TARGET, session = %inner.id, "configuration done");
        }
        Err(err) => inner.log_request_failure("configurationDone", &err),
    }
}

async fn wait_for_capabilities(inner: &SessionInner) -> Option<Capabilities> {
    let mut rx = inner.capabilities.subscribe();
    let wait = async {
        loop {
            let current = rx.borrow_and_update().clone();
            if current.is_some() {
                return current;
            }
            if rx.changed().await.is_err() {
                return None;
            }
        }
    };
    tokio::select! {
        _ = inner.closed.cancelled() => None,
        res = tokio::time::timeout(inner.options.initialize_timeout, wait) => res.ok().flatten(),
    }
}
