mod common;

use std::sync::Arc;

use common::{sample_tree, wait_for, MockRuntime};
use playground_sandbox::errors::SessionError;
use playground_sandbox::path_codec::LogicalPath;
use playground_sandbox::process_state::{ProcessEvent, ProcessState, TestOutcome};
use playground_sandbox::session::{SandboxSession, SessionEvent, SessionState};
use playground_sandbox::settings::Settings;

fn session_with(runtime: &Arc<MockRuntime>) -> SandboxSession {
    SandboxSession::new(runtime.clone(), Settings::default())
}

fn became(state: ProcessState) -> impl Fn(&SessionEvent) -> bool {
    move |event| {
        matches!(
            event,
            SessionEvent::Process(ProcessEvent::StateChanged { to, .. }) if *to == state
        )
    }
}

#[tokio::test]
async fn boot_mounts_installs_and_opens_shell() {
    let runtime = Arc::new(MockRuntime::new(0, &["added 12 packages"]));
    let session = session_with(&runtime);
    let mut events = session.subscribe();

    session.boot(&sample_tree()).await.unwrap();

    assert_eq!(session.state().await, SessionState::Ready);
    assert_eq!(
        runtime.calls().await,
        vec!["boot", "mount", "spawn:npm install", "spawn_shell:jsh"]
    );
    assert_eq!(runtime.mounts.lock().await[0], sample_tree().to_mount_tree());

    assert!(matches!(
        events.recv().await.unwrap(),
        SessionEvent::StateChanged(SessionState::Installing { .. })
    ));
    assert_eq!(
        events.recv().await.unwrap(),
        SessionEvent::InstallLog("added 12 packages".into())
    );
    assert_eq!(
        events.recv().await.unwrap(),
        SessionEvent::StateChanged(SessionState::Ready)
    );
}

#[tokio::test]
async fn second_boot_is_rejected() {
    let runtime = Arc::new(MockRuntime::new(0, &[]));
    let session = session_with(&runtime);
    session.boot(&sample_tree()).await.unwrap();

    let result = session.boot(&sample_tree()).await;
    assert!(matches!(result, Err(SessionError::AlreadyBooted)));
    assert_eq!(
        runtime.calls().await.iter().filter(|call| *call == "boot").count(),
        1
    );
}

#[tokio::test]
async fn install_failure_leaves_session_failed() {
    let runtime = Arc::new(MockRuntime::new(1, &["npm ERR! missing script"]));
    let session = session_with(&runtime);

    let error = session.boot(&sample_tree()).await.unwrap_err();
    assert!(matches!(error, SessionError::InstallationFailed { exit_code: 1 }));
    assert!(matches!(session.state().await, SessionState::Failed(_)));

    let result = session.run_command("npm test").await;
    assert!(matches!(result, Err(SessionError::NotReady)));
    assert!(!runtime
        .calls()
        .await
        .iter()
        .any(|call| call.starts_with("spawn_shell")));

    // Failed is terminal.
    let result = session.boot(&sample_tree()).await;
    assert!(matches!(result, Err(SessionError::Failed(_))));
}

#[tokio::test]
async fn boot_error_is_reported_and_fatal() {
    let runtime = Arc::new(MockRuntime::failing_boot());
    let session = session_with(&runtime);

    let error = session.boot(&sample_tree()).await.unwrap_err();
    assert!(matches!(error, SessionError::Boot(_)));
    assert!(matches!(session.state().await, SessionState::Failed(_)));
    assert_eq!(runtime.calls().await, vec!["boot"]);
}

#[tokio::test]
async fn operations_before_ready_are_dropped() {
    let runtime = Arc::new(MockRuntime::new(0, &[]));
    let session = session_with(&runtime);

    assert!(matches!(
        session.run_command("ls").await,
        Err(SessionError::NotReady)
    ));
    assert!(matches!(session.abort().await, Err(SessionError::NotReady)));
    session
        .write_file(&LogicalPath::parse("src/main.js"), "x")
        .await
        .unwrap();
    assert!(runtime.writes.lock().await.is_empty());
}

#[tokio::test]
async fn write_file_uses_real_path_once_ready() {
    let runtime = Arc::new(MockRuntime::new(0, &[]));
    let session = session_with(&runtime);
    session.boot(&sample_tree()).await.unwrap();

    session
        .write_file(&LogicalPath::parse("src/main.js"), "export const a = 2;")
        .await
        .unwrap();
    assert_eq!(
        runtime.writes.lock().await.clone(),
        vec![("src/main.js".to_string(), "export const a = 2;".to_string())]
    );
}

#[tokio::test]
async fn command_runs_until_prompt_redraw() {
    let runtime = Arc::new(MockRuntime::new(0, &[]));
    let session = session_with(&runtime);
    session.boot(&sample_tree()).await.unwrap();
    let mut events = session.subscribe();

    session.run_tests().await.unwrap();
    assert_eq!(
        runtime.next_input().await,
        format!("{}\r", Settings::default().test_command)
    );
    assert_eq!(session.process_state().await, ProcessState::Running);

    let shell = runtime.shell().await;
    shell.send("PASS src/main.test.js\r\n".into()).unwrap();
    shell
        .send("Tests:       2 passed, 2 total\r\n".into())
        .unwrap();
    shell.send("~/project \u{1b}[3G".into()).unwrap();

    wait_for(&mut events, became(ProcessState::Idle)).await;
    assert_eq!(session.process_state().await, ProcessState::Idle);
    assert_eq!(session.test_outcome().await, Some(TestOutcome::Passed));
}

#[tokio::test]
async fn failing_summary_is_reported() {
    let runtime = Arc::new(MockRuntime::new(0, &[]));
    let session = session_with(&runtime);
    session.boot(&sample_tree()).await.unwrap();
    let mut events = session.subscribe();

    session.run_tests().await.unwrap();
    let shell = runtime.shell().await;
    shell
        .send("Tests:       1 failed, 1 passed, 2 total\r\n".into())
        .unwrap();

    let event = wait_for(&mut events, |event| {
        matches!(event, SessionEvent::Process(ProcessEvent::TestFinished(_)))
    })
    .await;
    assert_eq!(
        event,
        SessionEvent::Process(ProcessEvent::TestFinished(TestOutcome::Failed))
    );
}

#[tokio::test]
async fn abort_waits_for_prompt_before_idle() {
    let runtime = Arc::new(MockRuntime::new(0, &[]));
    let session = session_with(&runtime);
    session.boot(&sample_tree()).await.unwrap();
    let mut events = session.subscribe();

    session.run_command("npm start").await.unwrap();
    assert_eq!(runtime.next_input().await, "npm start\r");

    session.abort().await.unwrap();
    assert_eq!(runtime.next_input().await, "\u{3}");
    assert_eq!(session.process_state().await, ProcessState::Aborting);
    assert_eq!(session.test_outcome().await, None);

    let shell = runtime.shell().await;
    shell.send("^C\r\n".into()).unwrap();
    wait_for(&mut events, |event| {
        matches!(event, SessionEvent::Output(chunk) if chunk.contains("^C"))
    })
    .await;
    assert_eq!(session.process_state().await, ProcessState::Aborting);

    shell.send("\u{1b}[3G".into()).unwrap();
    wait_for(&mut events, became(ProcessState::Idle)).await;
}

#[tokio::test]
async fn teardown_releases_sandbox() {
    let runtime = Arc::new(MockRuntime::new(0, &[]));
    let session = session_with(&runtime);
    session.boot(&sample_tree()).await.unwrap();

    session.teardown().await.unwrap();
    assert_eq!(runtime.calls().await.last().map(String::as_str), Some("teardown"));
    assert!(matches!(session.state().await, SessionState::Failed(_)));
    assert!(matches!(
        session.run_command("ls").await,
        Err(SessionError::NotReady)
    ));
}

#[tokio::test]
async fn changes_during_install_are_applied_before_ready() {
    let (runtime, release) = MockRuntime::gated_install(&["resolving packages"]);
    let runtime = Arc::new(runtime);
    let session = Arc::new(session_with(&runtime));
    let mut events = session.subscribe();

    let booting = tokio::spawn({
        let session = session.clone();
        async move { session.boot(&sample_tree()).await }
    });
    wait_for(&mut events, |event| matches!(event, SessionEvent::InstallLog(_))).await;
    assert!(matches!(
        session.state().await,
        SessionState::Installing { .. }
    ));

    session
        .write_file(&LogicalPath::parse("src/main.js"), "export const a = 2;")
        .await
        .unwrap();
    session
        .remove_path(&LogicalPath::parse("src/util"))
        .await
        .unwrap();
    assert!(runtime.writes.lock().await.is_empty());

    release.send(()).unwrap();
    booting.await.unwrap().unwrap();

    assert_eq!(session.state().await, SessionState::Ready);
    assert_eq!(
        runtime.writes.lock().await.clone(),
        vec![("src/main.js".to_string(), "export const a = 2;".to_string())]
    );
    assert_eq!(runtime.removed.lock().await.clone(), vec!["src/util".to_string()]);
    let calls = runtime.calls().await;
    assert_eq!(
        &calls[calls.len() - 2..],
        &["write_file".to_string(), "remove_path".to_string()]
    );
}
