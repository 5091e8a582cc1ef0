//! Local sessions against a small shell script that speaks the protocol.
#![cfg(unix)]

use std::time::Duration;

use contour_core::EventBus;
use contour_runtime::{Session, SessionSettings};
use contour_types::{BackendDescriptor, Command};
use tokio_util::sync::CancellationToken;

const WAIT: Option<Duration> = Some(Duration::from_secs(10));

const NOISY_BACKEND: &str = r#"
read hello
echo "{'kind': 'ready', 'id': 0}"
echo 'booting' >&2
read exec
echo 'disk almost full' >&2
sleep 0.3
echo "{'kind': 'result', 'id': 1, 'exit_code': 0, 'stdout': 'ok', 'stderr': ''}"
read rest
"#;

#[tokio::test]
async fn stderr_lines_are_attributed_to_the_request_in_flight() {
    let launch = Command::new("sh").args(["-c", NOISY_BACKEND]);
    let session = Session::new(
        BackendDescriptor::local(launch),
        SessionSettings::default(),
        EventBus::new(),
    );
    session.start().await.expect("start");
    tokio::time::sleep(Duration::from_millis(100)).await;

    let pending = session.submit(&Command::new("true")).await.expect("submit");
    let request_id = pending.id();
    let outcome = pending
        .wait(WAIT, &CancellationToken::new())
        .await
        .expect("outcome");
    assert_eq!(outcome.stdout, "ok");

    let tail = session.stderr_tail(10);
    let booting = tail.iter().find(|l| l.text == "booting").expect("booting line");
    assert_eq!(booting.request_id, None);
    let warning = tail
        .iter()
        .find(|l| l.text == "disk almost full")
        .expect("warning line");
    assert_eq!(warning.request_id, Some(request_id));
    assert!(warning.seq > booting.seq);

    session.stop().await.expect("stop");
}
