//! Stopping many sessions at once without cutting transports out from under
//! their readers.

use std::time::Duration;

use nova_config::DebugConfig;
use tokio::task::JoinSet;

use crate::session::{DebugSession, SessionId, SessionState, StopKind};

const TARGET: &str = "nova.dap.client";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// The session had already terminated before shutdown began.
    AlreadyTerminated,
    /// The adapter closed the connection within the grace period.
    Clean,
    /// The grace period ran out and the transport was closed locally.
    Forced,
}

#[derive(Debug, Clone)]
pub struct ShutdownCoordinator {
    grace: Duration,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::from_config(&DebugConfig::default())
    }
}

impl ShutdownCoordinator {
    pub fn new(grace: Duration) -> Self {
        Self { grace }
    }

    pub fn from_config(config: &DebugConfig) -> Self {
        Self::new(config.shutdown_grace())
    }

    /// Ask every session to stop, then hand back a handle that resolves as
    /// each adapter goes away.
    ///
    /// The returned future completes once every stop request has been answered
    /// (or has failed or timed out). Transport closure happens in the background.
    pub async fn stop_all<I>(&self, sessions: I, kind: StopKind) -> ShutdownHandle
    where
        I: IntoIterator<Item = DebugSession>,
    {
        let sessions: Vec<DebugSession> = sessions.into_iter().collect();
        let already_terminated: Vec<bool> = sessions
            .iter()
            .map(|session| session.state() == SessionState::Terminated)
            .collect();

        tracing::debug!(target: TARGET, sessions = sessions.len(), ?kind, "stopping debug sessions");
        futures::future::join_all(sessions.iter().map(|session| session.stop(kind))).await;

        let mut tasks = JoinSet::new();
        let grace = self.grace;
        for (session, terminated) in sessions.into_iter().zip(already_terminated) {
            tasks.spawn(async move {
                let id = session.id();
                if terminated {
                    return (id, ShutdownOutcome::AlreadyTerminated);
                }
                let outcome = if session.close_gracefully(grace).await {
                    ShutdownOutcome::Clean
                } else {
                    ShutdownOutcome::Forced
                };
                tracing::debug!(target: TARGET, session = %id, ?outcome, "debug session shut down");
                (id, outcome)
            });
        }
        ShutdownHandle { tasks }
    }
}

/// Pending transport closures started by [`ShutdownCoordinator::stop_all`].
///
/// Dropping the handle does not cancel them.
pub struct ShutdownHandle {
    tasks: JoinSet<(SessionId, ShutdownOutcome)>,
}

impl ShutdownHandle {
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Wait for every session to finish closing.
    pub async fn wait(mut self) -> Vec<(SessionId, ShutdownOutcome)> {
        let mut outcomes = Vec::with_capacity(self.tasks.len());
        while let Some(joined) = self.tasks.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(err) => {
                    tracing::warn!(target: TARGET, error = %err, "session shutdown task failed");
                }
            }
        }
        outcomes.sort_by_key(|(id, _)| *id);
        outcomes
    }
}

impl Drop for ShutdownHandle {
    fn drop(&mut self) {
        self.tasks.detach_all();
    }
}
