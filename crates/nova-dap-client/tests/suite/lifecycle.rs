use nova_dap_client::{
    dispatcher::CloseReason,
    protocol::{
        AdapterEvent, Capabilities, ContinuedEvent, ExitedEvent, OutputEvent, StoppedEvent,
        ThreadId,
    },
    DapError, DebugSession, LaunchKind, SessionError, SessionEvent, SessionState, StopKind,
};
use tokio::sync::oneshot;

use crate::harness::{
    configured_session, drain, next_event, options, start, wait_for_state, wait_until,
    with_timeout, MockAdapter, MockBehavior,
};

fn stopped(thread: i64) -> AdapterEvent {
    AdapterEvent::Stopped(StoppedEvent {
        reason: "breakpoint".to_string(),
        thread_id: Some(ThreadId(thread)),
        description: None,
        all_threads_stopped: Some(true),
    })
}

fn terminating_adapter() -> MockBehavior {
    MockBehavior {
        capabilities: Capabilities {
            supports_configuration_done_request: Some(true),
            supports_terminate_request: Some(true),
            ..Capabilities::default()
        },
        ..MockBehavior::default()
    }
}

#[tokio::test]
async fn start_initializes_launches_and_configures() {
    let adapter = MockAdapter::new(MockBehavior::default());
    let session = DebugSession::new(options());
    let mut events = session.subscribe();
    start(&session, &adapter).await;

    assert_eq!(session.state(), SessionState::Running);
    assert!(wait_until(|| session.configuration_done_sent()).await);
    assert!(wait_until(|| session.process().is_some()).await);
    assert_eq!(session.process().unwrap().system_process_id, Some(4242));

    let calls = adapter.calls();
    assert_eq!(calls[0], "initialize");
    assert!(calls.contains(&"launch".to_string()), "calls: {calls:?}");
    assert_eq!(adapter.count("configurationDone"), 1);

    let states: Vec<SessionState> = drain(&mut events)
        .into_iter()
        .filter_map(|event| match event {
            SessionEvent::StateChanged(state) => Some(state),
            _ => None,
        })
        .collect();
    assert_eq!(
        states,
        vec![
            SessionState::Connecting,
            SessionState::Initializing,
            SessionState::Launching,
            SessionState::Running,
        ]
    );
}

#[tokio::test]
async fn attach_sends_attach() {
    let adapter = MockAdapter::new(MockBehavior::default());
    let mut options = options();
    options.launch_kind = LaunchKind::Attach;
    let session = DebugSession::new(options);
    start(&session, &adapter).await;
    assert_eq!(adapter.count("attach"), 1);
    assert_eq!(adapter.count("launch"), 0);
}

#[tokio::test]
async fn configuration_done_is_skipped_unless_advertised() {
    let adapter = MockAdapter::new(MockBehavior {
        capabilities: Capabilities::default(),
        ..MockBehavior::default()
    });
    let session = DebugSession::new(options());
    start(&session, &adapter).await;
    assert!(wait_until(|| session.is_initialized()).await);
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    assert_eq!(adapter.count("configurationDone"), 0);
    assert!(!session.configuration_done_sent());
}

#[tokio::test]
async fn starting_twice_is_rejected() {
    let adapter = MockAdapter::new(MockBehavior::default());
    let session = configured_session(&adapter).await;
    let err = session
        .start(async { Err(DapError::ConnectionClosed) })
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::AlreadyStarted), "unexpected error: {err:?}");
    assert_eq!(session.state(), SessionState::Running);
}

#[tokio::test]
async fn stopped_and_continued_events_drive_the_state() {
    let adapter = MockAdapter::new(MockBehavior::default());
    let session = configured_session(&adapter).await;
    let mut events = session.subscribe();

    adapter.emit(stopped(1));
    wait_for_state(&session, SessionState::Stopped).await;
    assert_eq!(session.last_stop().unwrap().thread_id, Some(ThreadId(1)));
    let event = next_event(&mut events, |e| matches!(e, SessionEvent::Stopped { .. })).await;
    assert_eq!(
        event,
        SessionEvent::Stopped {
            thread_id: Some(ThreadId(1)),
            reason: "breakpoint".to_string(),
            description: None,
        }
    );

    adapter.emit(AdapterEvent::Continued(ContinuedEvent::default()));
    wait_for_state(&session, SessionState::Running).await;
    assert!(session.last_stop().is_none());
    next_event(&mut events, |e| *e == SessionEvent::Continued).await;
}

#[tokio::test]
async fn output_is_forwarded() {
    let adapter = MockAdapter::new(MockBehavior::default());
    let session = configured_session(&adapter).await;
    let mut events = session.subscribe();

    adapter.emit(AdapterEvent::Output(OutputEvent {
        category: Some("stdout".to_string()),
        output: "hello\n".to_string(),
    }));
    let event = next_event(&mut events, |e| matches!(e, SessionEvent::Output { .. })).await;
    assert_eq!(
        event,
        SessionEvent::Output {
            category: Some("stdout".to_string()),
            output: "hello\n".to_string(),
        }
    );
}

async fn terminated_event_sends_nothing(exited_follows: bool) {
    let adapter = MockAdapter::new(terminating_adapter());
    let session = configured_session(&adapter).await;
    assert!(wait_until(|| session.process().is_some()).await);
    let mut events = session.subscribe();

    adapter.emit(AdapterEvent::Terminated);
    if exited_follows {
        adapter.emit(AdapterEvent::Exited(ExitedEvent { exit_code: 0 }));
    }
    next_event(&mut events, |e| *e == SessionEvent::ProcessTerminated).await;
    assert!(session.is_process_terminated());

    // Neither a user stop nor workspace shutdown may reach the adapter now.
    session.stop(StopKind::UserStop).await;
    session.stop(StopKind::WorkspaceShutdown).await;

    // The adapter never closes the connection; the fallback window ends the session.
    wait_for_state(&session, SessionState::Terminated).await;
    assert!(session.is_closed());
    assert_eq!(adapter.count("terminate"), 0);
    assert_eq!(adapter.count("disconnect"), 0);
    assert!(adapter.closes() >= 1);
}

#[tokio::test]
async fn terminated_event_sends_no_terminate_or_disconnect() {
    terminated_event_sends_nothing(false).await;
}

#[tokio::test]
async fn terminated_then_exited_sends_no_terminate_or_disconnect() {
    terminated_event_sends_nothing(true).await;
}

#[tokio::test]
async fn exited_after_terminated_is_delivered() {
    let adapter = MockAdapter::new(MockBehavior::default());
    let session = configured_session(&adapter).await;
    let mut events = session.subscribe();

    adapter.emit(AdapterEvent::Terminated);
    adapter.emit(AdapterEvent::Exited(ExitedEvent { exit_code: 3 }));

    let event = next_event(&mut events, |e| matches!(e, SessionEvent::Exited { .. })).await;
    assert_eq!(event, SessionEvent::Exited { exit_code: 3 });
    assert_eq!(session.exit_code(), Some(3));
}

#[tokio::test]
async fn exited_is_delivered_while_a_stop_is_in_flight() {
    let adapter = MockAdapter::new(MockBehavior::default());
    adapter.update(|b| {
        b.hanging.insert("disconnect".to_string());
    });
    let session = configured_session(&adapter).await;
    let mut events = session.subscribe();

    let stopping = tokio::spawn({
        let session = session.clone();
        async move { session.stop(StopKind::UserStop).await }
    });
    assert!(wait_until(|| adapter.count("disconnect") == 1).await);
    assert_eq!(session.state(), SessionState::Terminating);

    adapter.emit(AdapterEvent::Terminated);
    adapter.emit(AdapterEvent::Exited(ExitedEvent { exit_code: 7 }));
    let event = next_event(&mut events, |e| matches!(e, SessionEvent::Exited { .. })).await;
    assert_eq!(event, SessionEvent::Exited { exit_code: 7 });

    wait_for_state(&session, SessionState::Terminated).await;
    stopping.abort();
}

#[tokio::test]
async fn stop_is_idempotent() {
    let adapter = MockAdapter::new(MockBehavior::default());
    let session = configured_session(&adapter).await;

    tokio::join!(
        session.stop(StopKind::WorkspaceShutdown),
        session.stop(StopKind::WorkspaceShutdown),
        session.stop(StopKind::UserStop),
    );
    session.stop(StopKind::UserStop).await;

    wait_for_state(&session, SessionState::Terminated).await;
    assert_eq!(adapter.count("disconnect"), 1);
    assert_eq!(adapter.count("terminate"), 0);
}

#[tokio::test]
async fn user_stop_prefers_terminate_when_supported() {
    let adapter = MockAdapter::new(terminating_adapter());
    let session = configured_session(&adapter).await;
    assert!(wait_until(|| session.can_terminate()).await);

    session.stop(StopKind::UserStop).await;
    assert_eq!(adapter.count("terminate"), 1);
    assert_eq!(adapter.count("disconnect"), 0);

    // The adapter answers with `terminated` + `exited` but keeps the connection open.
    wait_for_state(&session, SessionState::Terminated).await;
    assert_eq!(session.exit_code(), Some(0));
    assert_eq!(adapter.count("disconnect"), 0);
}

#[tokio::test]
async fn user_stop_disconnects_without_a_process() {
    let adapter = MockAdapter::new(MockBehavior {
        process_on_launch: false,
        ..terminating_adapter()
    });
    let session = configured_session(&adapter).await;
    assert!(!session.can_terminate());

    session.stop(StopKind::UserStop).await;
    wait_for_state(&session, SessionState::Terminated).await;
    assert_eq!(adapter.count("terminate"), 0);
    assert_eq!(adapter.count("disconnect"), 1);
}

#[tokio::test]
async fn workspace_shutdown_always_disconnects() {
    let adapter = MockAdapter::new(terminating_adapter());
    let session = configured_session(&adapter).await;
    assert!(wait_until(|| session.can_terminate()).await);

    session.stop(StopKind::WorkspaceShutdown).await;
    wait_for_state(&session, SessionState::Terminated).await;
    assert_eq!(adapter.count("terminate"), 0);
    assert_eq!(adapter.count("disconnect"), 1);
}

#[tokio::test]
async fn losing_the_transport_terminates_the_session() {
    let adapter = MockAdapter::new(MockBehavior::stopped_program());
    let session = configured_session(&adapter).await;
    let mut events = session.subscribe();

    adapter.emit(stopped(1));
    wait_for_state(&session, SessionState::Stopped).await;
    assert_eq!(session.threads().await.len(), 1);

    adapter.close_channel(CloseReason::Error("connection reset by peer".to_string()));
    wait_for_state(&session, SessionState::Terminated).await;
    let event = next_event(&mut events, |e| matches!(e, SessionEvent::ConnectionLost { .. })).await;
    assert_eq!(
        event,
        SessionEvent::ConnectionLost {
            reason: "connection reset by peer".to_string(),
        }
    );

    assert!(session.threads().await.is_empty());
    assert_eq!(adapter.count("threads"), 1);
    assert!(matches!(
        session.resume(ThreadId(1)).await,
        Err(SessionError::Terminated)
    ));
    assert_eq!(adapter.count("disconnect"), 0);
}

#[tokio::test]
async fn unexpected_end_of_stream_is_reported() {
    let adapter = MockAdapter::new(MockBehavior::default());
    let session = configured_session(&adapter).await;
    let mut events = session.subscribe();

    adapter.close_channel(CloseReason::EndOfStream);
    wait_for_state(&session, SessionState::Terminated).await;
    next_event(&mut events, |e| matches!(e, SessionEvent::ConnectionLost { .. })).await;
}

#[tokio::test]
async fn launch_failure_aborts_start() {
    let adapter = MockAdapter::new(MockBehavior::default());
    adapter.update(|b| {
        b.failing
            .insert("launch".to_string(), "main class not found".to_string());
    });
    let session = DebugSession::new(options());
    let connection = adapter.connection();
    let err = session
        .start(async move { Ok(connection) })
        .await
        .unwrap_err();

    match err {
        SessionError::Request { command, source } => {
            assert_eq!(command, "launch");
            assert!(source.to_string().contains("main class not found"), "{source}");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(session.state(), SessionState::Terminated);
    assert_eq!(adapter.count("disconnect"), 1);
}

#[tokio::test]
async fn stop_while_connecting_closes_the_late_connection() {
    let adapter = MockAdapter::new(MockBehavior::default());
    let session = DebugSession::new(options());
    let (release, connected) = oneshot::channel::<()>();

    let starting = tokio::spawn({
        let session = session.clone();
        let connection = adapter.connection();
        async move {
            session
                .start(async move {
                    let _ = connected.await;
                    Ok(connection)
                })
                .await
        }
    });
    assert!(wait_until(|| session.state() == SessionState::Connecting).await);

    session.stop(StopKind::UserStop).await;
    assert_eq!(session.state(), SessionState::Terminated);

    release.send(()).unwrap();
    let result = with_timeout(starting).await.unwrap();
    assert!(matches!(result, Err(SessionError::Terminated)), "{result:?}");
    assert_eq!(adapter.count("initialize"), 0);
    assert!(adapter.closes() >= 1);
}
