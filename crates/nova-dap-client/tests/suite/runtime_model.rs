use nova_dap_client::{
    protocol::{AdapterEvent, ContinuedEvent, StepKind, StoppedEvent, ThreadId, VariablesReference},
    SessionError, SessionState,
};

use crate::harness::{
    configured_session, wait_for_state, MockAdapter, MockBehavior,
};

fn stopped(thread: i64) -> AdapterEvent {
    AdapterEvent::Stopped(StoppedEvent {
        reason: "breakpoint".to_string(),
        thread_id: Some(ThreadId(thread)),
        description: None,
        all_threads_stopped: None,
    })
}

#[tokio::test]
async fn stopped_thread_exposes_frames_scopes_and_variables() {
    let adapter = MockAdapter::new(MockBehavior::stopped_program());
    let session = configured_session(&adapter).await;
    adapter.emit(stopped(1));
    wait_for_state(&session, SessionState::Stopped).await;

    let threads = session.threads().await;
    assert_eq!(threads.len(), 1);
    assert_eq!(threads[0].id(), ThreadId(1));
    assert_eq!(threads[0].name(), "main");

    let frames = threads[0].stack_frames().await;
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].name(), "Main.main");
    assert_eq!(frames[0].line(), 5);
    assert_eq!(frames[0].thread_id(), ThreadId(1));

    let scopes = frames[0].scopes().await;
    assert_eq!(scopes.len(), 1);
    assert_eq!(scopes[0].name(), "locals");
    assert!(scopes[0].has_children());

    let variables = scopes[0].variables().await;
    assert_eq!(variables.len(), 1);
    assert_eq!(variables[0].name(), "x");
    assert_eq!(variables[0].value(), "42");
    assert_eq!(variables[0].type_name(), Some("int"));
    assert!(!variables[0].has_children());

    // Leaves never reach the adapter.
    assert!(variables[0].variables().await.is_empty());
    assert_eq!(adapter.count("variables"), 1);
}

#[tokio::test]
async fn repeated_fetches_within_one_stop_hit_the_cache() {
    let adapter = MockAdapter::new(MockBehavior::stopped_program());
    let session = configured_session(&adapter).await;
    adapter.emit(stopped(1));
    wait_for_state(&session, SessionState::Stopped).await;

    let first = walk(&session).await;
    let second = walk(&session).await;
    assert_eq!(first, second);
    assert_eq!(first, vec![("x".to_string(), "42".to_string())]);

    for command in ["threads", "stackTrace", "scopes", "variables"] {
        assert_eq!(adapter.count(command), 1, "`{command}` fetched more than once");
    }
}

async fn walk(session: &nova_dap_client::DebugSession) -> Vec<(String, String)> {
    let mut out = Vec::new();
    for thread in session.threads().await {
        for frame in thread.stack_frames().await {
            for scope in frame.scopes().await {
                for variable in scope.variables().await {
                    out.push((variable.name().to_string(), variable.value().to_string()));
                }
            }
        }
    }
    out
}

#[tokio::test]
async fn resuming_invalidates_everything_fetched_for_the_stop() {
    let adapter = MockAdapter::new(MockBehavior::stopped_program());
    let session = configured_session(&adapter).await;
    adapter.emit(stopped(1));
    wait_for_state(&session, SessionState::Stopped).await;

    let threads = session.threads().await;
    let frames = threads[0].stack_frames().await;
    let scopes = frames[0].scopes().await;

    session.resume(ThreadId(1)).await.unwrap();
    assert_eq!(adapter.count("continue"), 1);
    assert_eq!(session.state(), SessionState::Running);

    // Handles from the earlier stop fetch nothing.
    assert!(frames[0].scopes().await.is_empty());
    assert!(scopes[0].variables().await.is_empty());
    assert_eq!(adapter.count("scopes"), 1);
    assert_eq!(adapter.count("variables"), 0);
    assert!(matches!(
        session.evaluate("x", Some(&frames[0]), None).await,
        Err(SessionError::StaleFrame)
    ));

    adapter.emit(stopped(1));
    wait_for_state(&session, SessionState::Stopped).await;
    assert_eq!(walk(&session).await.len(), 1);
    assert_eq!(adapter.count("threads"), 2);
    assert_eq!(adapter.count("stackTrace"), 2);
}

#[tokio::test]
async fn continued_event_and_steps_clear_the_model() {
    let adapter = MockAdapter::new(MockBehavior::stopped_program());
    let session = configured_session(&adapter).await;

    adapter.emit(stopped(1));
    wait_for_state(&session, SessionState::Stopped).await;
    walk(&session).await;

    adapter.emit(AdapterEvent::Continued(ContinuedEvent::default()));
    wait_for_state(&session, SessionState::Running).await;
    adapter.emit(stopped(1));
    wait_for_state(&session, SessionState::Stopped).await;
    walk(&session).await;
    assert_eq!(adapter.count("threads"), 2);

    session.step(ThreadId(1), StepKind::Over).await.unwrap();
    assert_eq!(adapter.count("next"), 1);
    assert_eq!(session.state(), SessionState::Running);
    adapter.emit(stopped(1));
    wait_for_state(&session, SessionState::Stopped).await;
    walk(&session).await;
    assert_eq!(adapter.count("threads"), 3);
}

#[tokio::test]
async fn threads_known_only_from_events_are_listed() {
    let adapter = MockAdapter::new(MockBehavior::stopped_program());
    let session = configured_session(&adapter).await;

    adapter.emit(stopped(9));
    wait_for_state(&session, SessionState::Stopped).await;

    let mut ids: Vec<ThreadId> = session.threads().await.iter().map(|t| t.id()).collect();
    ids.sort();
    assert_eq!(ids, vec![ThreadId(1), ThreadId(9)]);
}

#[tokio::test]
async fn failed_fetches_are_not_cached() {
    let adapter = MockAdapter::new(MockBehavior::stopped_program());
    adapter.update(|b| {
        b.failing
            .insert("stackTrace".to_string(), "thread not suspended".to_string());
    });
    let session = configured_session(&adapter).await;
    adapter.emit(stopped(1));
    wait_for_state(&session, SessionState::Stopped).await;

    let threads = session.threads().await;
    assert!(threads[0].stack_frames().await.is_empty());

    adapter.update(|b| {
        b.failing.clear();
    });
    assert_eq!(threads[0].stack_frames().await.len(), 1);
    assert_eq!(adapter.count("stackTrace"), 2);
}

#[tokio::test]
async fn evaluate_runs_in_the_selected_frame() {
    let adapter = MockAdapter::new(MockBehavior::stopped_program());
    let session = configured_session(&adapter).await;
    adapter.emit(stopped(1));
    wait_for_state(&session, SessionState::Stopped).await;

    let frames = session.threads().await[0].stack_frames().await;
    let result = session
        .evaluate("x + 1", Some(&frames[0]), Some("watch"))
        .await
        .unwrap();
    assert_eq!(result.result, "<x + 1>");
    assert_eq!(result.variables_reference, VariablesReference::LEAF);
}
