//! One live backend and its request exchange.
//!
//! ```text
//! Idle -> Starting -> Ready <-> Busy -> Stopping -> Terminated
//!                     Ready | Busy -> Crashed -> Idle (acknowledged)
//! ```
//!
//! A dedicated reader task decodes frames and dispatches them. At most one
//! request is in flight; its terminator is matched by correlation id and
//! everything else is forwarded to subscribers as output.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use contour_core::{
    build, ContourConfig, ContourError, EventBus, ProtocolConfig, Result, SessionConfig,
};
use contour_observability::{emit_event, ObservabilityEvent, ProcessKind};
use contour_types::{
    BackendDescriptor, BackendEvent, BackendKind, Command, CommandOutcome, Frame, SessionState,
    TrustBoundary,
};
use contour_wire::{Reply, Request, WireError, HANDSHAKE_ID, PROTOCOL_VERSION};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::ChildStderr;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Level;
use uuid::Uuid;

use crate::driver::{BackendLink, BackendProcess, Driver, DriverCapabilities};
use crate::stderr_tail::{StderrLine, StderrTail};
use crate::transport::{FrameReceiver, FrameSender};

/// Lower bound on how long `stop` waits for the reader to observe closure.
const MIN_CLOSE_WAIT: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionSettings {
    pub protocol: ProtocolConfig,
    pub session: SessionConfig,
}

impl SessionSettings {
    pub fn from_config(config: &ContourConfig) -> Self {
        Self {
            protocol: config.protocol.clone(),
            session: config.session.clone(),
        }
    }
}

struct InFlight {
    id: u64,
    reply: oneshot::Sender<Result<CommandOutcome>>,
}

struct Core {
    state: SessionState,
    in_flight: Option<InFlight>,
    handshake: Option<oneshot::Sender<Result<()>>>,
}

enum Closure {
    Eof,
    Io(String),
    Protocol(ContourError),
}

impl Closure {
    fn reason(&self) -> String {
        match self {
            Closure::Eof => "backend closed the transport".to_string(),
            Closure::Io(detail) => format!("transport error: {}", detail),
            Closure::Protocol(err) => err.to_string(),
        }
    }
}

struct SessionInner {
    id: String,
    descriptor: BackendDescriptor,
    driver: Driver,
    settings: SessionSettings,
    events: EventBus,
    core: Mutex<Core>,
    writer: tokio::sync::Mutex<Option<FrameSender>>,
    process: tokio::sync::Mutex<Option<BackendProcess>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    stderr: StderrTail,
    next_id: AtomicU64,
    state_tx: watch::Sender<SessionState>,
}

/// Handle to one backend session. Clones share the same session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    pub fn new(descriptor: BackendDescriptor, settings: SessionSettings, events: EventBus) -> Self {
        let driver = Driver::for_descriptor(&descriptor);
        Self::with_driver(descriptor, driver, settings, events)
    }

    pub fn with_driver(
        descriptor: BackendDescriptor,
        driver: Driver,
        settings: SessionSettings,
        events: EventBus,
    ) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Idle);
        let stderr = StderrTail::new(settings.session.stderr_tail_lines);
        Self {
            inner: Arc::new(SessionInner {
                id: Uuid::new_v4().to_string(),
                descriptor,
                driver,
                settings,
                events,
                core: Mutex::new(Core {
                    state: SessionState::Idle,
                    in_flight: None,
                    handshake: None,
                }),
                writer: tokio::sync::Mutex::new(None),
                process: tokio::sync::Mutex::new(None),
                tasks: Mutex::new(Vec::new()),
                stderr,
                next_id: AtomicU64::new(HANDSHAKE_ID + 1),
                state_tx,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn descriptor(&self) -> &BackendDescriptor {
        &self.inner.descriptor
    }

    pub fn kind(&self) -> BackendKind {
        self.inner.driver.kind()
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock_core().state
    }

    pub fn in_flight(&self) -> Option<u64> {
        self.inner.lock_core().in_flight.as_ref().map(|f| f.id)
    }

    pub fn capabilities(&self) -> DriverCapabilities {
        self.inner.driver.capabilities()
    }

    pub fn describe_trust_boundary(&self) -> TrustBoundary {
        self.inner.driver.describe_trust_boundary()
    }

    /// Most recent out-of-protocol lines the backend wrote.
    pub fn stderr_tail(&self, lines: usize) -> Vec<StderrLine> {
        self.inner.stderr.last(lines)
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state_tx.subscribe()
    }

    /// Resolves once the session is `Crashed` or `Terminated`.
    pub async fn wait_for_exit(&self) -> SessionState {
        let mut rx = self.inner.state_tx.subscribe();
        loop {
            let current = *rx.borrow_and_update();
            if matches!(current, SessionState::Crashed | SessionState::Terminated) {
                return current;
            }
            if rx.changed().await.is_err() {
                return self.state();
            }
        }
    }

    /// Establishes the transport and completes the `hello`/`ready` handshake.
    pub async fn start(&self) -> Result<()> {
        let inner = &self.inner;
        let (handshake_tx, handshake_rx) = oneshot::channel();
        {
            let mut core = inner.lock_core();
            if core.state != SessionState::Idle {
                return Err(ContourError::BackendUnavailable(format!(
                    "session is {}",
                    core.state.as_str()
                )));
            }
            core.handshake = Some(handshake_tx);
            inner.transition(&mut core, SessionState::Starting, None, None);
        }

        let link = match inner.driver.start(&inner.settings.protocol).await {
            Ok(link) => link,
            Err(err) => {
                let mut core = inner.lock_core();
                core.handshake = None;
                inner.transition(&mut core, SessionState::Idle, None, Some(err.to_string()));
                drop(core);
                inner.emit(Level::WARN, "session.start.failed", None, Some(err.code()));
                return Err(match err {
                    ContourError::Io(io) => ContourError::BackendUnavailable(io.to_string()),
                    other => other,
                });
            }
        };
        self.attach(link).await;

        let hello = Request::Hello { id: HANDSHAKE_ID }.to_frame();
        let handshake = match inner.write_frame(&hello).await {
            Err(err) => Err(ContourError::BackendUnavailable(format!(
                "handshake could not be sent: {}",
                err
            ))),
            Ok(()) => {
                match tokio::time::timeout(inner.settings.session.startup_timeout(), handshake_rx)
                    .await
                {
                    Ok(Ok(result)) => result,
                    Ok(Err(_)) => Err(ContourError::BackendUnavailable(
                        "handshake was abandoned".to_string(),
                    )),
                    Err(_) => Err(ContourError::BackendUnavailable(format!(
                        "backend did not answer the handshake within {:?}",
                        inner.settings.session.startup_timeout()
                    ))),
                }
            }
        };

        match handshake {
            Ok(()) => {
                inner.emit(Level::INFO, "session.ready", None, None);
                Ok(())
            }
            Err(err) => {
                // The reader may have completed the handshake right at the deadline.
                if self.state() != SessionState::Starting {
                    return match self.state() {
                        SessionState::Ready | SessionState::Busy => Ok(()),
                        _ => Err(err),
                    };
                }
                inner.shutdown_transport(Duration::ZERO).await;
                {
                    let mut core = inner.lock_core();
                    core.handshake = None;
                    if core.state == SessionState::Starting {
                        inner.transition(&mut core, SessionState::Idle, None, Some(err.to_string()));
                    }
                }
                inner.emit(Level::WARN, "session.handshake.failed", None, Some(err.code()));
                Err(err)
            }
        }
    }

    async fn attach(&self, link: BackendLink) {
        let inner = &self.inner;
        let BackendLink {
            channel,
            process,
            stderr,
        } = link;
        let (sender, receiver) = channel.split();
        *inner.writer.lock().await = Some(sender);
        *inner.process.lock().await = process;

        let mut tasks = Vec::with_capacity(2);
        tasks.push(tokio::spawn(read_loop(Arc::downgrade(inner), receiver)));
        if let Some(stderr) = stderr {
            tasks.push(tokio::spawn(drain_stderr(Arc::downgrade(inner), stderr)));
        }
        let mut slot = inner.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        for task in slot.drain(..) {
            task.abort();
        }
        *slot = tasks;
    }

    /// Sends one command. Construction problems are reported before anything
    /// is written to the transport.
    pub async fn submit(&self, command: &Command) -> Result<PendingRequest> {
        let inner = &self.inner;
        let form = build(command, inner.driver.command_policy())?;
        let id = inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (reply_tx, reply_rx) = oneshot::channel();
        {
            let mut core = inner.lock_core();
            match core.state {
                SessionState::Ready => {}
                SessionState::Busy => {
                    let busy_with = core.in_flight.as_ref().map(|f| f.id).unwrap_or_default();
                    return Err(ContourError::SessionBusy(busy_with));
                }
                SessionState::Idle | SessionState::Starting => {
                    return Err(ContourError::BackendUnavailable(format!(
                        "session is {}",
                        core.state.as_str()
                    )))
                }
                SessionState::Stopping | SessionState::Terminated | SessionState::Crashed => {
                    return Err(ContourError::BackendTerminated(format!(
                        "session is {}",
                        core.state.as_str()
                    )))
                }
            }
            core.in_flight = Some(InFlight {
                id,
                reply: reply_tx,
            });
            inner.transition(&mut core, SessionState::Busy, Some(id), None);
        }

        let frame = Request::Exec { id, form }.to_frame();
        match inner.write_frame(&frame).await {
            Ok(()) => Ok(PendingRequest {
                id,
                session_id: inner.id.clone(),
                reply: reply_rx,
            }),
            Err(WireError::TooLarge { size, limit }) => {
                // Nothing reached the transport.
                let mut core = inner.lock_core();
                if core.in_flight.as_ref().is_some_and(|f| f.id == id) {
                    core.in_flight = None;
                    if core.state == SessionState::Busy {
                        inner.transition(&mut core, SessionState::Ready, Some(id), None);
                    }
                }
                Err(ContourError::FrameTooLarge { size, limit })
            }
            Err(err) => {
                let reason = err.to_string();
                inner.on_transport_closed(Closure::Io(reason.clone())).await;
                Err(ContourError::BackendTerminated(reason))
            }
        }
    }

    /// Orderly stop using the configured grace period.
    pub async fn stop(&self) -> Result<()> {
        self.terminate(self.inner.settings.session.stop_grace()).await
    }

    /// Closes the transport, waits up to `grace` for the backend to exit and
    /// then kills it. Ends in `Terminated`.
    pub async fn terminate(&self, grace: Duration) -> Result<()> {
        let inner = &self.inner;
        {
            let mut core = inner.lock_core();
            match core.state {
                SessionState::Terminated => return Ok(()),
                SessionState::Starting => {
                    return Err(ContourError::BackendUnavailable(
                        "session is still starting".to_string(),
                    ))
                }
                SessionState::Idle | SessionState::Crashed => {
                    inner.close_out(&mut core, SessionState::Terminated, "session stopped");
                    drop(core);
                    inner.abort_tasks();
                    return Ok(());
                }
                SessionState::Ready | SessionState::Busy => {
                    inner.transition(&mut core, SessionState::Stopping, None, None);
                }
                SessionState::Stopping => {}
            }
        }

        let writer = inner.writer.lock().await.take();
        let process = inner.process.lock().await.take();
        inner.driver.stop(writer, process, grace).await;

        let mut state_rx = inner.state_tx.subscribe();
        let observed = matches!(
            tokio::time::timeout(
                grace.max(MIN_CLOSE_WAIT),
                state_rx.wait_for(|state| *state == SessionState::Terminated),
            )
            .await,
            Ok(Ok(_))
        );
        inner.abort_tasks();
        if !observed {
            let mut core = inner.lock_core();
            if core.state == SessionState::Stopping {
                inner.close_out(&mut core, SessionState::Terminated, "session stopped");
            }
        }
        inner.emit(Level::INFO, "session.stopped", None, None);
        Ok(())
    }

    /// Clears a crash so the session may be started again.
    pub fn acknowledge(&self) -> bool {
        let mut core = self.inner.lock_core();
        if core.state != SessionState::Crashed {
            return false;
        }
        self.inner.transition(&mut core, SessionState::Idle, None, None);
        true
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("kind", &self.kind())
            .field("state", &self.state())
            .finish()
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}

impl SessionInner {
    fn lock_core(&self) -> MutexGuard<'_, Core> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(
        &self,
        core: &mut Core,
        to: SessionState,
        request_id: Option<u64>,
        detail: Option<String>,
    ) {
        let from = core.state;
        core.state = to;
        self.state_tx.send_replace(to);
        tracing::debug!(
            session_id = %self.id,
            "session {} -> {}",
            from.as_str(),
            to.as_str()
        );
        self.events.publish(BackendEvent::Lifecycle {
            session_id: self.id.clone(),
            backend: self.driver.kind(),
            state: to,
            request_id,
            detail,
        });
    }

    /// Fails whatever is waiting on this session and moves to `to`.
    fn close_out(&self, core: &mut Core, to: SessionState, reason: &str) {
        let failed = core.in_flight.take();
        let request_id = failed.as_ref().map(|f| f.id);
        if let Some(flight) = failed {
            let _ = flight
                .reply
                .send(Err(ContourError::BackendTerminated(reason.to_string())));
        }
        if let Some(handshake) = core.handshake.take() {
            let _ = handshake.send(Err(ContourError::BackendUnavailable(reason.to_string())));
        }
        self.transition(core, to, request_id, Some(reason.to_string()));
    }

    fn abort_tasks(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for task in tasks {
            task.abort();
        }
    }

    async fn write_frame(&self, frame: &Frame) -> std::result::Result<(), WireError> {
        let mut writer = self.writer.lock().await;
        match writer.as_mut() {
            Some(sender) => sender.send(frame).await,
            None => Err(WireError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "transport is closed",
            ))),
        }
    }

    async fn shutdown_transport(&self, grace: Duration) {
        self.abort_tasks();
        let writer = self.writer.lock().await.take();
        let process = self.process.lock().await.take();
        self.driver.stop(writer, process, grace).await;
    }

    fn dispatch(&self, frame: Frame) {
        let reply = Reply::from_frame(&frame);
        let mut core = self.lock_core();
        match reply {
            Some(Reply::Ready { id, protocol })
                if id == HANDSHAKE_ID && core.state == SessionState::Starting =>
            {
                let result = match protocol {
                    Some(version) if version != PROTOCOL_VERSION => {
                        Err(ContourError::BackendUnavailable(format!(
                            "backend speaks protocol {}, expected {}",
                            version, PROTOCOL_VERSION
                        )))
                    }
                    _ => {
                        self.transition(&mut core, SessionState::Ready, None, None);
                        Ok(())
                    }
                };
                if let Some(handshake) = core.handshake.take() {
                    let _ = handshake.send(result);
                }
                return;
            }
            Some(Reply::Result(result))
                if core.in_flight.as_ref().is_some_and(|f| f.id == result.id) =>
            {
                let outcome = CommandOutcome {
                    request_id: result.id,
                    exit_code: result.exit_code,
                    stdout: result.stdout,
                    stderr: result.stderr,
                    frame,
                };
                self.complete(&mut core, outcome);
                return;
            }
            Some(Reply::Error { id, message })
                if core.in_flight.as_ref().is_some_and(|f| f.id == id) =>
            {
                let outcome = CommandOutcome {
                    request_id: id,
                    exit_code: None,
                    stdout: String::new(),
                    stderr: message,
                    frame,
                };
                self.complete(&mut core, outcome);
                return;
            }
            _ => {}
        }
        drop(core);
        self.events.publish(BackendEvent::Output {
            session_id: self.id.clone(),
            frame,
        });
    }

    fn complete(&self, core: &mut Core, outcome: CommandOutcome) {
        let request_id = outcome.request_id;
        if core.state == SessionState::Busy {
            self.transition(core, SessionState::Ready, Some(request_id), None);
        }
        if let Some(flight) = core.in_flight.take() {
            if flight.reply.send(Ok(outcome)).is_err() {
                tracing::debug!(
                    session_id = %self.id,
                    "dropping late result for abandoned request {}",
                    request_id
                );
            }
        }
    }

    async fn on_transport_closed(&self, closure: Closure) {
        let reason = closure.reason();
        let crashed = {
            let mut core = self.lock_core();
            match core.state {
                SessionState::Starting => {
                    if let Some(handshake) = core.handshake.take() {
                        let _ = handshake.send(Err(ContourError::BackendUnavailable(reason.clone())));
                    }
                    false
                }
                SessionState::Stopping => {
                    self.close_out(&mut core, SessionState::Terminated, "session stopped");
                    false
                }
                SessionState::Ready | SessionState::Busy => {
                    self.close_out(&mut core, SessionState::Crashed, &reason);
                    true
                }
                SessionState::Idle | SessionState::Terminated | SessionState::Crashed => false,
            }
        };

        if let Closure::Protocol(err) = &closure {
            self.emit(
                Level::WARN,
                "session.protocol_violation",
                Some(&reason),
                Some(err.code()),
            );
        }
        if crashed {
            self.emit(Level::WARN, "session.crashed", Some(&reason), None);
            self.writer.lock().await.take();
            let process = self.process.lock().await.take();
            if let Some(mut process) = process {
                process.kill().await;
            }
        }
    }

    fn emit(&self, level: Level, event: &str, detail: Option<&str>, error_code: Option<&str>) {
        emit_event(
            level,
            ProcessKind::Engine,
            ObservabilityEvent {
                event,
                component: "session",
                session_id: Some(&self.id),
                backend: Some(self.driver.kind().as_str()),
                error_code,
                detail,
                ..ObservabilityEvent::default()
            },
        );
    }
}

async fn read_loop(session: Weak<SessionInner>, mut receiver: FrameReceiver) {
    let closure = loop {
        let next = receiver.receive().await;
        let Some(inner) = session.upgrade() else {
            return;
        };
        match next {
            Some(Ok(frame)) => inner.dispatch(frame),
            Some(Err(err)) if err.is_protocol_violation() => {
                break Closure::Protocol(ContourError::from(err));
            }
            Some(Err(err)) => break Closure::Io(err.to_string()),
            None => break Closure::Eof,
        }
    };
    if let Some(inner) = session.upgrade() {
        inner.on_transport_closed(closure).await;
    }
}

async fn drain_stderr(session: Weak<SessionInner>, stderr: ChildStderr) {
    let mut reader = BufReader::new(stderr);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
        let Some(inner) = session.upgrade() else {
            break;
        };
        let line = String::from_utf8_lossy(&buf)
            .trim_end_matches(['\r', '\n'])
            .to_string();
        let request_id = inner.lock_core().in_flight.as_ref().map(|f| f.id);
        inner.stderr.push(request_id, line.clone());
        inner.events.publish(BackendEvent::Stderr {
            session_id: inner.id.clone(),
            line,
        });
    }
}

/// Result slot for one submitted command.
#[derive(Debug)]
pub struct PendingRequest {
    id: u64,
    session_id: String,
    reply: oneshot::Receiver<Result<CommandOutcome>>,
}

impl PendingRequest {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Waits for the terminator. Cancellation and deadlines release the
    /// caller only; the backend keeps working and its late result is dropped.
    pub async fn wait(
        self,
        deadline: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<CommandOutcome> {
        let id = self.id;
        let reply = async move {
            match self.reply.await {
                Ok(result) => result,
                Err(_) => Err(ContourError::BackendTerminated(
                    "session was dropped".to_string(),
                )),
            }
        };
        let bounded = async move {
            match deadline {
                Some(limit) => tokio::time::timeout(limit, reply)
                    .await
                    .unwrap_or(Err(ContourError::Timeout(id))),
                None => reply.await,
            }
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ContourError::Cancelled(id)),
            result = bounded => result,
        }
    }
}
