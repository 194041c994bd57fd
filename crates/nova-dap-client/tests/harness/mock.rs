use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use nova_dap_client::{
    dispatcher::{CloseReason, Inbound},
    protocol::{
        AdapterEvent, Capabilities, DisconnectArguments, EvaluateArguments, EvaluateResponse,
        FrameId, InitializeArguments, ProcessEvent, Scope, SetBreakpointsArguments,
        SetBreakpointsResponse, SourceBreakpoint, StackFrame, StepKind, Thread, ThreadId,
        Variable, VariablesReference,
    },
    AdapterConnection, DapError, DebugAdapter,
};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::sync::mpsc;

/// How a [`MockAdapter`] answers.
#[derive(Debug, Clone)]
pub struct MockBehavior {
    pub capabilities: Capabilities,
    /// Push `initialized` right after answering `initialize`.
    pub initialized_after_initialize: bool,
    /// Push a `process` event when `launch`/`attach` is answered.
    pub process_on_launch: bool,
    /// Close the channel (clean end of stream) after answering `disconnect`.
    pub close_on_disconnect: bool,
    /// Push `terminated` and `exited` after answering `terminate`.
    pub exit_on_terminate: bool,
    pub threads: Vec<Thread>,
    pub frames: HashMap<ThreadId, Vec<StackFrame>>,
    pub scopes: HashMap<FrameId, Vec<Scope>>,
    pub variables: HashMap<VariablesReference, Vec<Variable>>,
    /// Commands answered with an error response, and its message.
    pub failing: HashMap<String, String>,
    /// Commands that are never answered.
    pub hanging: HashSet<String>,
}

impl Default for MockBehavior {
    fn default() -> Self {
        Self {
            capabilities: Capabilities {
                supports_configuration_done_request: Some(true),
                ..Capabilities::default()
            },
            initialized_after_initialize: true,
            process_on_launch: true,
            close_on_disconnect: true,
            exit_on_terminate: true,
            threads: Vec::new(),
            frames: HashMap::new(),
            scopes: HashMap::new(),
            variables: HashMap::new(),
            failing: HashMap::new(),
            hanging: HashSet::new(),
        }
    }
}

impl MockBehavior {
    /// One thread, one frame, one `locals` scope holding `x = "42"`.
    pub fn stopped_program() -> Self {
        let thread = ThreadId(1);
        let frame = FrameId(10);
        let locals = VariablesReference(100);
        Self {
            threads: vec![Thread {
                id: thread,
                name: "main".to_string(),
            }],
            frames: HashMap::from([(
                thread,
                vec![StackFrame {
                    id: frame,
                    name: "Main.main".to_string(),
                    line: 5,
                    column: 1,
                    source: None,
                }],
            )]),
            scopes: HashMap::from([(
                frame,
                vec![Scope {
                    name: "locals".to_string(),
                    variables_reference: locals,
                    expensive: false,
                }],
            )]),
            variables: HashMap::from([(
                locals,
                vec![Variable {
                    name: "x".to_string(),
                    value: "42".to_string(),
                    type_: Some("int".to_string()),
                    variables_reference: VariablesReference::LEAF,
                    evaluate_name: Some("x".to_string()),
                }],
            )]),
            ..Self::default()
        }
    }
}

/// In-memory [`DebugAdapter`] that records every call it receives.
pub struct MockAdapter {
    behavior: Mutex<MockBehavior>,
    calls: Mutex<Vec<String>>,
    breakpoints: Mutex<Vec<SetBreakpointsArguments>>,
    closes: AtomicUsize,
    inbound_tx: Mutex<Option<mpsc::UnboundedSender<Inbound>>>,
    inbound_rx: Mutex<Option<mpsc::UnboundedReceiver<Inbound>>>,
}

impl MockAdapter {
    pub fn new(behavior: MockBehavior) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            behavior: Mutex::new(behavior),
            calls: Mutex::new(Vec::new()),
            breakpoints: Mutex::new(Vec::new()),
            closes: AtomicUsize::new(0),
            inbound_tx: Mutex::new(Some(tx)),
            inbound_rx: Mutex::new(Some(rx)),
        })
    }

    /// The connection handed to a session. Can only be taken once.
    pub fn connection(self: &Arc<Self>) -> AdapterConnection {
        let inbound = self
            .inbound_rx
            .lock()
            .take()
            .expect("mock adapter connection already taken");
        AdapterConnection {
            adapter: self.clone(),
            inbound,
        }
    }

    pub fn update(&self, f: impl FnOnce(&mut MockBehavior)) {
        f(&mut self.behavior.lock());
    }

    pub fn emit(&self, event: AdapterEvent) {
        if let Some(tx) = self.inbound_tx.lock().as_ref() {
            let _ = tx.send(Inbound::Event(event));
        }
    }

    pub fn close_channel(&self, reason: CloseReason) {
        if let Some(tx) = self.inbound_tx.lock().take() {
            let _ = tx.send(Inbound::Closed(reason));
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn count(&self, command: &str) -> usize {
        self.calls.lock().iter().filter(|c| *c == command).count()
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn set_breakpoints_calls(&self) -> Vec<SetBreakpointsArguments> {
        self.breakpoints.lock().clone()
    }

    pub fn last_breakpoints_for(&self, path: &str) -> Option<Vec<SourceBreakpoint>> {
        self.breakpoints
            .lock()
            .iter()
            .rev()
            .find(|args| args.source.path.as_deref() == Some(path))
            .map(|args| args.breakpoints.clone())
    }

    async fn call(&self, command: &str) -> Result<(), DapError> {
        self.calls.lock().push(command.to_string());
        let (hang, failure) = {
            let behavior = self.behavior.lock();
            (
                behavior.hanging.contains(command),
                behavior.failing.get(command).cloned(),
            )
        };
        if hang {
            futures::future::pending::<()>().await;
        }
        match failure {
            Some(message) => Err(DapError::Adapter {
                command: command.to_string(),
                message,
            }),
            None => Ok(()),
        }
    }

    fn launched(&self) {
        if self.behavior.lock().process_on_launch {
            self.emit(AdapterEvent::Process(ProcessEvent {
                name: "Main".to_string(),
                system_process_id: Some(4242),
                start_method: Some("launch".to_string()),
            }));
        }
    }
}

#[async_trait]
impl DebugAdapter for MockAdapter {
    async fn initialize(&self, _args: InitializeArguments) -> Result<Capabilities, DapError> {
        self.call("initialize").await?;
        let (capabilities, initialized) = {
            let behavior = self.behavior.lock();
            (
                behavior.capabilities.clone(),
                behavior.initialized_after_initialize,
            )
        };
        if initialized {
            self.emit(AdapterEvent::Initialized);
        }
        Ok(capabilities)
    }

    async fn launch(&self, _configuration: Map<String, Value>) -> Result<(), DapError> {
        self.call("launch").await?;
        self.launched();
        Ok(())
    }

    async fn attach(&self, _configuration: Map<String, Value>) -> Result<(), DapError> {
        self.call("attach").await?;
        self.launched();
        Ok(())
    }

    async fn set_breakpoints(
        &self,
        args: SetBreakpointsArguments,
    ) -> Result<SetBreakpointsResponse, DapError> {
        self.breakpoints.lock().push(args.clone());
        self.call("setBreakpoints").await?;
        Ok(SetBreakpointsResponse {
            breakpoints: args
                .breakpoints
                .iter()
                .map(|bp| nova_dap_client::protocol::Breakpoint {
                    verified: true,
                    line: Some(bp.line),
                    ..Default::default()
                })
                .collect(),
        })
    }

    async fn configuration_done(&self) -> Result<(), DapError> {
        self.call("configurationDone").await
    }

    async fn threads(&self) -> Result<Vec<Thread>, DapError> {
        self.call("threads").await?;
        Ok(self.behavior.lock().threads.clone())
    }

    async fn stack_trace(&self, thread: ThreadId) -> Result<Vec<StackFrame>, DapError> {
        self.call("stackTrace").await?;
        Ok(self
            .behavior
            .lock()
            .frames
            .get(&thread)
            .cloned()
            .unwrap_or_default())
    }

    async fn scopes(&self, frame: FrameId) -> Result<Vec<Scope>, DapError> {
        self.call("scopes").await?;
        Ok(self
            .behavior
            .lock()
            .scopes
            .get(&frame)
            .cloned()
            .unwrap_or_default())
    }

    async fn variables(&self, reference: VariablesReference) -> Result<Vec<Variable>, DapError> {
        self.call("variables").await?;
        Ok(self
            .behavior
            .lock()
            .variables
            .get(&reference)
            .cloned()
            .unwrap_or_default())
    }

    async fn evaluate(&self, args: EvaluateArguments) -> Result<EvaluateResponse, DapError> {
        self.call("evaluate").await?;
        Ok(EvaluateResponse {
            result: format!("<{}>", args.expression),
            type_: None,
            variables_reference: VariablesReference::LEAF,
        })
    }

    async fn resume(&self, _thread: ThreadId) -> Result<(), DapError> {
        self.call("continue").await
    }

    async fn step(&self, _thread: ThreadId, kind: StepKind) -> Result<(), DapError> {
        self.call(kind.command()).await
    }

    async fn pause(&self, _thread: ThreadId) -> Result<(), DapError> {
        self.call("pause").await
    }

    async fn terminate(&self) -> Result<(), DapError> {
        self.call("terminate").await?;
        if self.behavior.lock().exit_on_terminate {
            self.emit(AdapterEvent::Terminated);
            self.emit(AdapterEvent::Exited(
                nova_dap_client::protocol::ExitedEvent { exit_code: 0 },
            ));
        }
        Ok(())
    }

    async fn disconnect(&self, _args: DisconnectArguments) -> Result<(), DapError> {
        self.call("disconnect").await?;
        if self.behavior.lock().close_on_disconnect {
            self.close_channel(CloseReason::EndOfStream);
        }
        Ok(())
    }

    async fn close(&self, _grace: Duration) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.close_channel(CloseReason::Local);
    }
}
