use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicI64, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::{mpsc, oneshot},
};
use tokio_util::sync::CancellationToken;

use crate::{
    error::{DapError, Result},
    protocol::{AdapterEvent, ProtocolMessage, Request, Response},
    transport::{sanitize_json_error_message, DapReader, DapWriter},
};

const TARGET: &str = "nova.dap.client";

type BoxedWriter = DapWriter<Box<dyn AsyncWrite + Unpin + Send>>;

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Default per-request timeout.
    pub request_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// Why the inbound side of a transport ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The adapter closed its end between two messages.
    EndOfStream,
    /// We stopped reading (local close).
    Local,
    /// Read error or EOF in the middle of a message.
    Error(String),
}

/// Everything the adapter pushes at a session, in receipt order.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Event(AdapterEvent),
    /// Always the last item on the channel.
    Closed(CloseReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOutcome {
    /// The adapter closed the channel on its own (possibly after we closed our write half).
    Clean,
    /// The grace period ran out and reading was stopped locally.
    Forced,
}

struct Inner {
    writer: tokio::sync::Mutex<Option<BoxedWriter>>,
    pending: Mutex<HashMap<i64, oneshot::Sender<Result<Response>>>>,
    next_seq: AtomicI64,
    /// Stops the read loop without touching the underlying stream.
    shutdown: CancellationToken,
    /// Set when a write fails; the read loop reports it as the close reason.
    write_failure: Mutex<Option<String>>,
    /// Cancelled once the read loop has exited.
    closed: CancellationToken,
    transport_errors: AtomicUsize,
    config: DispatcherConfig,
}

/// Issues requests over one adapter transport and routes what comes back.
///
/// Responses are matched to callers by `request_seq`; events and the final
/// close notification go to the single [`Inbound`] channel returned by
/// [`RequestDispatcher::start`].
#[derive(Clone)]
pub struct RequestDispatcher {
    inner: Arc<Inner>,
}

impl RequestDispatcher {
    pub fn start<R, W>(
        reader: R,
        writer: W,
        config: DispatcherConfig,
    ) -> (Self, mpsc::UnboundedReceiver<Inbound>)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let writer: Box<dyn AsyncWrite + Unpin + Send> = Box::new(writer);
        let inner = Arc::new(Inner {
            writer: tokio::sync::Mutex::new(Some(DapWriter::new(writer))),
            pending: Mutex::new(HashMap::new()),
            next_seq: AtomicI64::new(1),
            shutdown: CancellationToken::new(),
            write_failure: Mutex::new(None),
            closed: CancellationToken::new(),
            transport_errors: AtomicUsize::new(0),
            config,
        });

        tokio::spawn(read_loop(DapReader::new(reader), inner.clone(), events_tx));

        (Self { inner }, events_rx)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// Number of read/write failures observed by the framing layer.
    pub fn transport_errors(&self) -> usize {
        self.inner.transport_errors.load(Ordering::Relaxed)
    }

    pub async fn request(&self, command: &str, arguments: Option<Value>) -> Result<Option<Value>> {
        self.request_with(command, arguments, self.inner.config.request_timeout, None)
            .await
    }

    /// Send `command` and wait for its response.
    ///
    /// The wait is bounded by `timeout` and ends early when `cancel` fires.
    /// Dropping the returned future also abandons the request.
    pub async fn request_with(
        &self,
        command: &str,
        arguments: Option<Value>,
        timeout: Duration,
        cancel: Option<&CancellationToken>,
    ) -> Result<Option<Value>> {
        let seq = self.inner.next_seq.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().insert(seq, tx);
        let _guard = PendingGuard {
            inner: &self.inner,
            seq,
        };
        // Checked after inserting: the read loop marks itself closed before it
        // drains `pending`, so an entry it missed is caught here.
        if self.is_closed() {
            return Err(DapError::ConnectionClosed);
        }

        let message = ProtocolMessage::Request(Request {
            seq,
            command: command.to_string(),
            arguments,
        });
        self.send(&message).await?;

        let never = CancellationToken::new();
        let cancel = cancel.unwrap_or(&never);
        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(DapError::Cancelled),
            res = tokio::time::timeout(timeout, rx) => match res {
                Ok(Ok(response)) => response?,
                Ok(Err(_closed)) => return Err(DapError::ConnectionClosed),
                Err(_elapsed) => {
                    tracing::debug!(target: TARGET, command, seq, "request timed out");
                    return Err(DapError::Timeout { command: command.to_string() });
                }
            },
        };

        if !response.success {
            return Err(DapError::Adapter {
                command: response.command,
                message: response
                    .message
                    .unwrap_or_else(|| "request failed".to_string()),
            });
        }
        Ok(response.body)
    }

    async fn send(&self, message: &ProtocolMessage) -> Result<()> {
        send_message(&self.inner, message).await
    }

    /// Drain and close the transport.
    ///
    /// Waits up to `grace` for the adapter to close its end, then closes our write
    /// half and waits again. Only after that is reading stopped locally. The reader
    /// is never cut off mid-stream, so a well-behaved adapter always ends with a
    /// clean end-of-stream on our side.
    pub async fn close(&self, grace: Duration) -> CloseOutcome {
        if tokio::time::timeout(grace, self.inner.closed.cancelled())
            .await
            .is_ok()
        {
            self.shutdown_writer().await;
            return CloseOutcome::Clean;
        }

        self.shutdown_writer().await;
        if tokio::time::timeout(grace, self.inner.closed.cancelled())
            .await
            .is_ok()
        {
            return CloseOutcome::Clean;
        }

        tracing::debug!(target: TARGET, "adapter did not close its end; stopping reader");
        self.inner.shutdown.cancel();
        self.inner.closed.cancelled().await;
        CloseOutcome::Forced
    }

    async fn shutdown_writer(&self) {
        let writer = self.inner.writer.lock().await.take();
        if let Some(mut writer) = writer {
            // The peer may already be gone; nothing else would be written anyway.
            let _ = writer.shutdown().await;
        }
    }
}

struct PendingGuard<'a> {
    inner: &'a Inner,
    seq: i64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.inner.pending.lock().remove(&self.seq);
    }
}

/// A failed write loses the connection: the writer is dropped and the read
/// loop ends with [`CloseReason::Error`].
async fn send_message(inner: &Inner, message: &ProtocolMessage) -> Result<()> {
    let mut slot = inner.writer.lock().await;
    let Some(writer) = slot.as_mut() else {
        return Err(DapError::ConnectionClosed);
    };
    if let Err(err) = writer.write_message(message).await {
        inner.transport_errors.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(target: TARGET, error = %err, "failed to write to debug adapter");
        *slot = None;
        {
            let mut failure = inner.write_failure.lock();
            if failure.is_none() {
                *failure = Some(err.to_string());
            }
        }
        inner.shutdown.cancel();
        return Err(err);
    }
    Ok(())
}

async fn read_loop<R>(
    mut reader: DapReader<R>,
    inner: Arc<Inner>,
    events: mpsc::UnboundedSender<Inbound>,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    let reason = loop {
        let raw = tokio::select! {
            _ = inner.shutdown.cancelled() => {
                break match inner.write_failure.lock().take() {
                    Some(message) => CloseReason::Error(message),
                    None => CloseReason::Local,
                };
            }
            res = reader.read_raw() => res,
        };

        let bytes = match raw {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                tracing::debug!(target: TARGET, "debug adapter closed the connection");
                break CloseReason::EndOfStream;
            }
            Err(err) => {
                inner.transport_errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(target: TARGET, error = %err, "debug adapter transport failed");
                break CloseReason::Error(err.to_string());
            }
        };

        // Framing is intact even when one payload is garbage; skip it.
        let message = match serde_json::from_slice::<ProtocolMessage>(&bytes) {
            Ok(message) => message,
            Err(err) => {
                tracing::warn!(
                    target: TARGET,
                    error = %sanitize_json_error_message(&err.to_string()),
                    "ignoring malformed message from debug adapter"
                );
                continue;
            }
        };

        match message {
            ProtocolMessage::Response(response) => {
                let tx = inner.pending.lock().remove(&response.request_seq);
                match tx {
                    Some(tx) => {
                        let _ = tx.send(Ok(response));
                    }
                    None => tracing::debug!(
                        target: TARGET,
                        request_seq = response.request_seq,
                        command = %response.command,
                        "dropping response for abandoned request"
                    ),
                }
            }
            ProtocolMessage::Event(event) => {
                let _ = events.send(Inbound::Event(AdapterEvent::from_event(event)));
            }
            ProtocolMessage::Request(request) => {
                // Reverse requests (`runInTerminal`, `startDebugging`) are not supported.
                // Answer anyway so the adapter is never left waiting on us.
                tracing::debug!(
                    target: TARGET,
                    command = %request.command,
                    "rejecting reverse request from debug adapter"
                );
                let inner = inner.clone();
                tokio::spawn(async move {
                    let seq = inner.next_seq.fetch_add(1, Ordering::Relaxed);
                    let reply = ProtocolMessage::Response(Response::reply(
                        seq,
                        &request,
                        false,
                        Some(format!("`{}` is not supported by this client", request.command)),
                    ));
                    let _ = send_message(&inner, &reply).await;
                });
            }
        }
    };

    inner.closed.cancel();

    let pending = std::mem::take(&mut *inner.pending.lock());
    for (_seq, tx) in pending {
        let _ = tx.send(Err(DapError::ConnectionClosed));
    }

    let _ = events.send(Inbound::Closed(reason));
}
