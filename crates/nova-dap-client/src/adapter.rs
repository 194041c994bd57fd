//! The narrow outbound surface a session and the breakpoint synchronizer need
//! from a debug adapter, plus the wire implementation over a framed transport.

use std::{
    net::SocketAddr,
    path::PathBuf,
    process::Stdio,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader},
    process::{Child, Command},
    sync::mpsc,
};

use crate::{
    dispatcher::{DispatcherConfig, Inbound, RequestDispatcher},
    error::{DapError, Result},
    protocol::{
        Capabilities, DisconnectArguments, EvaluateArguments, EvaluateResponse, FrameId,
        InitializeArguments, Scope, ScopesArguments, ScopesResponse, SetBreakpointsArguments,
        SetBreakpointsResponse, StackFrame, StackTraceArguments, StackTraceResponse, StepKind,
        Thread, ThreadArguments, ThreadId, ThreadsResponse, Variable, VariablesArguments,
        VariablesReference, VariablesResponse,
    },
    transport::sanitize_json_error_message,
};

const TARGET: &str = "nova.dap.client";

/// Outbound protocol calls issued by a session.
///
/// Dropping a returned future abandons that call; implementations must not let
/// an abandoned call affect any other caller.
#[async_trait]
pub trait DebugAdapter: Send + Sync {
    async fn initialize(&self, args: InitializeArguments) -> Result<Capabilities>;
    async fn launch(&self, configuration: Map<String, Value>) -> Result<()>;
    async fn attach(&self, configuration: Map<String, Value>) -> Result<()>;
    async fn set_breakpoints(&self, args: SetBreakpointsArguments) -> Result<SetBreakpointsResponse>;
    async fn configuration_done(&self) -> Result<()>;
    async fn threads(&self) -> Result<Vec<Thread>>;
    async fn stack_trace(&self, thread: ThreadId) -> Result<Vec<StackFrame>>;
    async fn scopes(&self, frame: FrameId) -> Result<Vec<Scope>>;
    async fn variables(&self, reference: VariablesReference) -> Result<Vec<Variable>>;
    async fn evaluate(&self, args: EvaluateArguments) -> Result<EvaluateResponse>;
    async fn resume(&self, thread: ThreadId) -> Result<()>;
    async fn step(&self, thread: ThreadId, kind: StepKind) -> Result<()>;
    async fn pause(&self, thread: ThreadId) -> Result<()>;
    async fn terminate(&self) -> Result<()>;
    async fn disconnect(&self, args: DisconnectArguments) -> Result<()>;

    /// Drain and close the transport without sending anything further.
    ///
    /// Waits up to `grace` for the adapter to close its side before stopping
    /// locally. Safe to call more than once.
    async fn close(&self, grace: Duration);
}

/// A connected adapter together with the inbound event stream it feeds.
pub struct AdapterConnection {
    pub adapter: Arc<dyn DebugAdapter>,
    pub inbound: mpsc::UnboundedReceiver<Inbound>,
}

/// How to start an adapter process speaking the protocol on stdio.
#[derive(Debug, Clone, Default)]
pub struct AdapterCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct WireAdapterConfig {
    pub request_timeout: Duration,
    /// `initialize` can be slow while the adapter boots its runtime.
    pub initialize_timeout: Duration,
}

impl Default for WireAdapterConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            initialize_timeout: Duration::from_secs(10),
        }
    }
}

/// [`DebugAdapter`] over a framed byte stream.
pub struct WireAdapter {
    dispatcher: RequestDispatcher,
    child: tokio::sync::Mutex<Option<Child>>,
    config: WireAdapterConfig,
}

impl WireAdapter {
    pub fn start<R, W>(
        reader: R,
        writer: W,
        config: WireAdapterConfig,
    ) -> (Self, mpsc::UnboundedReceiver<Inbound>)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        Self::start_with_child(reader, writer, None, config)
    }

    fn start_with_child<R, W>(
        reader: R,
        writer: W,
        child: Option<Child>,
        config: WireAdapterConfig,
    ) -> (Self, mpsc::UnboundedReceiver<Inbound>)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (dispatcher, inbound) = RequestDispatcher::start(
            reader,
            writer,
            DispatcherConfig {
                request_timeout: config.request_timeout,
            },
        );
        let adapter = Self {
            dispatcher,
            child: tokio::sync::Mutex::new(child),
            config,
        };
        (adapter, inbound)
    }

    /// Connect over any pair of async streams.
    pub fn connect_streams<R, W>(reader: R, writer: W, config: WireAdapterConfig) -> AdapterConnection
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (adapter, inbound) = Self::start(reader, writer, config);
        AdapterConnection {
            adapter: Arc::new(adapter),
            inbound,
        }
    }

    /// Spawn an adapter process and talk to it over its stdin/stdout.
    ///
    /// The adapter's stderr is forwarded to the log at `debug`.
    pub fn spawn(command: &AdapterCommand, config: WireAdapterConfig) -> Result<AdapterConnection> {
        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .envs(command.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &command.cwd {
            cmd.current_dir(cwd);
        }

        let mut child = cmd.spawn()?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| missing_pipe("stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| missing_pipe("stdout"))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(target: TARGET, line = %line, "debug adapter stderr");
                }
            });
        }

        tracing::debug!(
            target: TARGET,
            program = %command.program.display(),
            pid = ?child.id(),
            "spawned debug adapter"
        );

        let (adapter, inbound) = Self::start_with_child(stdout, stdin, Some(child), config);
        Ok(AdapterConnection {
            adapter: Arc::new(adapter),
            inbound,
        })
    }

    /// Connect to an adapter already listening on a TCP socket.
    pub async fn connect_tcp(addr: SocketAddr, config: WireAdapterConfig) -> Result<AdapterConnection> {
        let stream = tokio::net::TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        tracing::debug!(target: TARGET, %addr, "connected to debug adapter");
        Ok(Self::connect_streams(reader, writer, config))
    }

    /// Transport errors seen by the framing layer so far.
    pub fn transport_errors(&self) -> usize {
        self.dispatcher.transport_errors()
    }

    async fn call<A: Serialize>(&self, command: &str, arguments: Option<A>) -> Result<Option<Value>> {
        let arguments = arguments.map(serde_json::to_value).transpose()?;
        self.dispatcher.request(command, arguments).await
    }

    async fn call_decoded<A: Serialize, T: DeserializeOwned>(
        &self,
        command: &str,
        arguments: Option<A>,
    ) -> Result<T> {
        let body = self.call(command, arguments).await?;
        decode_body(command, body)
    }
}

fn missing_pipe(name: &str) -> DapError {
    DapError::Io(std::io::Error::new(
        std::io::ErrorKind::BrokenPipe,
        format!("debug adapter {name} is not available"),
    ))
}

fn decode_body<T: DeserializeOwned>(command: &str, body: Option<Value>) -> Result<T> {
    let body = match body {
        Some(Value::Null) | None => Value::Object(Map::new()),
        Some(body) => body,
    };
    serde_json::from_value(body).map_err(|err| {
        DapError::Protocol(format!(
            "invalid `{command}` response body: {}",
            sanitize_json_error_message(&err.to_string())
        ))
    })
}

#[async_trait]
impl DebugAdapter for WireAdapter {
    async fn initialize(&self, args: InitializeArguments) -> Result<Capabilities> {
        let body = self
            .dispatcher
            .request_with(
                "initialize",
                Some(serde_json::to_value(args)?),
                self.config.initialize_timeout,
                None,
            )
            .await?;
        decode_body("initialize", body)
    }

    async fn launch(&self, configuration: Map<String, Value>) -> Result<()> {
        self.call("launch", Some(configuration)).await.map(drop)
    }

    async fn attach(&self, configuration: Map<String, Value>) -> Result<()> {
        self.call("attach", Some(configuration)).await.map(drop)
    }

    async fn set_breakpoints(&self, args: SetBreakpointsArguments) -> Result<SetBreakpointsResponse> {
        self.call_decoded("setBreakpoints", Some(args)).await
    }

    async fn configuration_done(&self) -> Result<()> {
        self.call::<Value>("configurationDone", None).await.map(drop)
    }

    async fn threads(&self) -> Result<Vec<Thread>> {
        let resp: ThreadsResponse = self.call_decoded::<Value, _>("threads", None).await?;
        Ok(resp.threads)
    }

    async fn stack_trace(&self, thread: ThreadId) -> Result<Vec<StackFrame>> {
        let resp: StackTraceResponse = self
            .call_decoded("stackTrace", Some(StackTraceArguments { thread_id: thread }))
            .await?;
        Ok(resp.stack_frames)
    }

    async fn scopes(&self, frame: FrameId) -> Result<Vec<Scope>> {
        let resp: ScopesResponse = self
            .call_decoded("scopes", Some(ScopesArguments { frame_id: frame }))
            .await?;
        Ok(resp.scopes)
    }

    async fn variables(&self, reference: VariablesReference) -> Result<Vec<Variable>> {
        let resp: VariablesResponse = self
            .call_decoded(
                "variables",
                Some(VariablesArguments {
                    variables_reference: reference,
                }),
            )
            .await?;
        Ok(resp.variables)
    }

    async fn evaluate(&self, args: EvaluateArguments) -> Result<EvaluateResponse> {
        self.call_decoded("evaluate", Some(args)).await
    }

    async fn resume(&self, thread: ThreadId) -> Result<()> {
        self.call("continue", Some(ThreadArguments { thread_id: thread }))
            .await
            .map(drop)
    }

    async fn step(&self, thread: ThreadId, kind: StepKind) -> Result<()> {
        self.call(kind.command(), Some(ThreadArguments { thread_id: thread }))
            .await
            .map(drop)
    }

    async fn pause(&self, thread: ThreadId) -> Result<()> {
        self.call("pause", Some(ThreadArguments { thread_id: thread }))
            .await
            .map(drop)
    }

    async fn terminate(&self) -> Result<()> {
        self.call::<Value>("terminate", None).await.map(drop)
    }

    async fn disconnect(&self, args: DisconnectArguments) -> Result<()> {
        self.call("disconnect", Some(args)).await.map(drop)
    }

    async fn close(&self, grace: Duration) {
        let outcome = self.dispatcher.close(grace).await;
        tracing::debug!(target: TARGET, ?outcome, "debug adapter transport closed");

        let child = self.child.lock().await.take();
        let Some(mut child) = child else {
            return;
        };
        match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!(target: TARGET, %status, "debug adapter exited");
            }
            Ok(Err(err)) => {
                tracing::debug!(target: TARGET, error = %err, "failed to wait for debug adapter");
            }
            Err(_elapsed) => {
                tracing::debug!(target: TARGET, "debug adapter still running; killing it");
                if let Err(err) = child.kill().await {
                    tracing::debug!(target: TARGET, error = %err, "failed to kill debug adapter");
                }
            }
        }
    }
}
