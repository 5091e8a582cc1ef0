//! Supervisor lifecycle against the real `contour-agent` binary.
#![cfg(unix)]

use std::time::Duration;

use contour_core::{ContourError, EventBus, SupervisorConfig};
use contour_runtime::{SubmitOptions, Supervisor, SupervisorSettings};
use contour_types::{BackendDescriptor, BackendEvent, Command, SessionState};

fn agent_descriptor() -> BackendDescriptor {
    BackendDescriptor::local(Command::new(env!("CARGO_BIN_EXE_contour-agent")))
}

fn supervisor() -> Supervisor {
    let settings = SupervisorSettings {
        supervisor: SupervisorConfig {
            auto_restart: true,
            max_failures: 3,
            cooldown_ms: 60_000,
            restart_delay_ms: 20,
        },
        ..SupervisorSettings::default()
    };
    Supervisor::new(settings, EventBus::new())
}

async fn wait_until_ready(supervisor: &Supervisor, previous: &str) -> String {
    for _ in 0..200 {
        if let Some(session) = supervisor.active_session() {
            if session.id() != previous && session.state() == SessionState::Ready {
                return session.id().to_string();
            }
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("backend never came back");
}

#[tokio::test]
async fn crashed_agent_is_restarted_and_serves_again() {
    let supervisor = supervisor();
    let mut events = supervisor.subscribe();
    supervisor
        .start_backend(agent_descriptor())
        .await
        .expect("start");
    let first = supervisor
        .active_session()
        .expect("session")
        .id()
        .to_string();

    let err = supervisor
        .submit_command(
            &Command::new("sh").args(["-c", "kill -9 $PPID; sleep 5"]),
            SubmitOptions::with_deadline(Duration::from_secs(10)),
        )
        .await
        .expect_err("crash");
    assert!(matches!(err, ContourError::BackendTerminated(_)));

    let second = wait_until_ready(&supervisor, &first).await;
    assert_ne!(first, second);

    let mut saw_restart = false;
    while let Ok(event) = events.try_recv() {
        if matches!(event, BackendEvent::RestartScheduled { attempt: 1, .. }) {
            saw_restart = true;
        }
    }
    assert!(saw_restart);

    let outcome = supervisor
        .submit_command(
            &Command::new("echo").arg("again"),
            SubmitOptions::with_deadline(Duration::from_secs(10)),
        )
        .await
        .expect("outcome");
    assert_eq!(outcome.stdout, "again\n");

    supervisor.shutdown().await;
    assert_eq!(supervisor.state(), None);
}
