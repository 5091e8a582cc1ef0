//! Local sessions against the real `contour-agent` binary.
#![cfg(unix)]

use std::time::Duration;

use contour_core::{ContourError, EventBus};
use contour_runtime::{Session, SessionSettings};
use contour_types::{BackendDescriptor, Command, SessionState};
use tokio_util::sync::CancellationToken;

const WAIT: Option<Duration> = Some(Duration::from_secs(10));

fn agent_session() -> Session {
    let launch = Command::new(env!("CARGO_BIN_EXE_contour-agent")).args(["--framing", "newline"]);
    Session::new(
        BackendDescriptor::local(launch),
        SessionSettings::default(),
        EventBus::new(),
    )
}

#[tokio::test]
async fn runs_a_command_and_returns_to_ready() {
    let session = agent_session();
    session.start().await.expect("start");
    assert_eq!(session.state(), SessionState::Ready);

    let pending = session
        .submit(&Command::new("sh").args(["-c", "echo hello; echo oops >&2; exit 2"]))
        .await
        .expect("submit");
    assert_eq!(session.state(), SessionState::Busy);
    let outcome = pending
        .wait(WAIT, &CancellationToken::new())
        .await
        .expect("outcome");
    assert_eq!(outcome.stdout, "hello\n");
    assert_eq!(outcome.stderr, "oops\n");
    assert_eq!(outcome.exit_code, Some(2));
    assert!(!outcome.success());
    assert_eq!(session.state(), SessionState::Ready);

    session.stop().await.expect("stop");
    assert_eq!(session.state(), SessionState::Terminated);
}

#[tokio::test]
async fn echo_hello_succeeds() {
    let session = agent_session();
    session.start().await.expect("start");
    let outcome = session
        .submit(&Command::new("echo").arg("hello"))
        .await
        .expect("submit")
        .wait(WAIT, &CancellationToken::new())
        .await
        .expect("outcome");
    assert!(outcome.success());
    assert_eq!(outcome.stdout.trim_end(), "hello");
    assert_eq!(outcome.frame.get_str("stdout"), Some("hello\n"));
    assert_eq!(session.state(), SessionState::Ready);
    session.stop().await.expect("stop");
}

#[tokio::test]
async fn arguments_reach_the_program_verbatim() {
    let session = agent_session();
    session.start().await.expect("start");
    let hostile = "it's $HOME; `id` && rm -rf /";
    let outcome = session
        .submit(&Command::new("printf").args(["%s", hostile]))
        .await
        .expect("submit")
        .wait(WAIT, &CancellationToken::new())
        .await
        .expect("outcome");
    assert_eq!(outcome.stdout, hostile);
    session.stop().await.expect("stop");
}

#[tokio::test]
async fn second_submit_while_busy_is_rejected() {
    let session = agent_session();
    session.start().await.expect("start");
    let first = session
        .submit(&Command::new("sleep").arg("0.3"))
        .await
        .expect("submit");
    let err = session
        .submit(&Command::new("true"))
        .await
        .expect_err("busy");
    assert!(matches!(err, ContourError::SessionBusy(id) if id == first.id()));

    first
        .wait(WAIT, &CancellationToken::new())
        .await
        .expect("first completes");
    assert_eq!(session.state(), SessionState::Ready);
    session.stop().await.expect("stop");
}

#[tokio::test]
async fn raw_shell_lines_are_refused_locally() {
    let session = agent_session();
    session.start().await.expect("start");
    let err = session
        .submit(&Command::shell_line("echo hi | wc -c"))
        .await
        .expect_err("raw line");
    assert!(matches!(err, ContourError::UnsafeCommand(_)));
    assert_eq!(session.state(), SessionState::Ready);
    session.stop().await.expect("stop");
}

#[tokio::test]
async fn backend_death_while_busy_crashes_the_session() {
    let session = agent_session();
    session.start().await.expect("start");
    let pending = session
        .submit(&Command::new("sh").args(["-c", "kill -9 $PPID; sleep 5"]))
        .await
        .expect("submit");
    let err = pending
        .wait(WAIT, &CancellationToken::new())
        .await
        .expect_err("crash");
    assert!(matches!(err, ContourError::BackendTerminated(_)));
    assert_eq!(session.wait_for_exit().await, SessionState::Crashed);

    let err = session
        .submit(&Command::new("true"))
        .await
        .expect_err("dead session");
    assert!(matches!(err, ContourError::BackendTerminated(_)));
}

#[tokio::test]
async fn missing_backend_program_is_unavailable() {
    let session = Session::new(
        BackendDescriptor::local(Command::new("contour-definitely-not-installed")),
        SessionSettings::default(),
        EventBus::new(),
    );
    let err = session.start().await.expect_err("no program");
    assert!(matches!(err, ContourError::BackendUnavailable(_)));
    assert_eq!(session.state(), SessionState::Idle);
}
