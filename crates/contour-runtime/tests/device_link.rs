//! Device sessions over an in-memory link served by the reference agent.
#![cfg(unix)]

use std::time::Duration;

use contour_core::{ContourError, EventBus};
use contour_runtime::agent;
use contour_runtime::{DeviceDriver, Driver, Session, SessionSettings};
use contour_types::{BackendDescriptor, CommandConstruction, Command, SessionState};
use contour_wire::Framing;
use tokio_util::sync::CancellationToken;

fn device_session() -> Session {
    let (ours, theirs) = tokio::io::duplex(64 * 1024);
    let (read, write) = tokio::io::split(theirs);
    tokio::spawn(agent::serve(read, write, Framing::Newline, 64 * 1024));
    let path = "/dev/ttyACM0";
    Session::with_driver(
        BackendDescriptor::device(path),
        Driver::Device(DeviceDriver::with_stream(path, ours)),
        SessionSettings::default(),
        EventBus::new(),
    )
}

#[tokio::test]
async fn allow_listed_commands_run_on_the_device() {
    let session = device_session();
    session.start().await.expect("start");
    assert_eq!(
        session.describe_trust_boundary().construction,
        CommandConstruction::AllowListedShellLine
    );

    let outcome = session
        .submit(&Command::new("echo").args(["boot.py", "main.py"]))
        .await
        .expect("submit")
        .wait(Some(Duration::from_secs(5)), &CancellationToken::new())
        .await
        .expect("outcome");
    assert_eq!(outcome.stdout, "boot.py main.py\n");
    assert_eq!(session.state(), SessionState::Ready);
    session.stop().await.expect("stop");
}

#[tokio::test]
async fn tokens_outside_the_allow_list_never_reach_the_device() {
    let session = device_session();
    session.start().await.expect("start");

    let err = session
        .submit(&Command::new("cat").arg("main.py; reboot"))
        .await
        .expect_err("refused");
    assert!(matches!(err, ContourError::UnsafePath(_)));

    let err = session
        .submit(&Command::new("ls").env("PATH", "/bin"))
        .await
        .expect_err("env refused");
    assert!(matches!(err, ContourError::UnsafeCommand(_)));

    assert_eq!(session.state(), SessionState::Ready);
    assert_eq!(session.in_flight(), None);
    session.stop().await.expect("stop");
}
