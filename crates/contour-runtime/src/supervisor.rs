//! Owner of the single active backend session.
//!
//! Start, stop and restart are serialized by a lifecycle lock. A monitor task
//! per active backend watches for crashes and, when policy allows, replaces
//! the crashed session with a fresh one built from the same descriptor.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use contour_core::{ContourConfig, ContourError, EventBus, Result, SupervisorConfig};
use contour_observability::{emit_event, ObservabilityEvent, ProcessKind};
use contour_types::{
    BackendDescriptor, BackendEvent, Command, CommandOutcome, SessionState, TrustBoundary,
};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Level;

use crate::circuit::{CircuitBreaker, CircuitState};
use crate::driver::Driver;
use crate::session::{PendingRequest, Session, SessionSettings};
use crate::stderr_tail::StderrLine;

/// Builds the driver for a descriptor. Lets embedders supply transports the
/// descriptor alone cannot describe, such as an already-open device stream.
pub type DriverFactory = Arc<dyn Fn(&BackendDescriptor) -> Driver + Send + Sync>;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SupervisorSettings {
    pub session: SessionSettings,
    pub supervisor: SupervisorConfig,
}

impl SupervisorSettings {
    pub fn from_config(config: &ContourConfig) -> Self {
        Self {
            session: SessionSettings::from_config(config),
            supervisor: config.supervisor.clone(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    /// Overrides the configured command timeout.
    pub deadline: Option<Duration>,
}

impl SubmitOptions {
    pub fn with_deadline(deadline: Duration) -> Self {
        Self {
            deadline: Some(deadline),
        }
    }
}

struct Active {
    descriptor: BackendDescriptor,
    session: Session,
    monitor: Option<JoinHandle<()>>,
}

/// Caller-side state of one submitted request. The ticket tells a
/// registration apart from a later request that reuses the same id.
struct PendingEntry {
    ticket: u64,
    token: CancellationToken,
}

struct SupervisorInner {
    settings: SupervisorSettings,
    events: EventBus,
    lifecycle_lock: tokio::sync::Mutex<()>,
    active: Mutex<Option<Active>>,
    pending: Mutex<HashMap<u64, PendingEntry>>,
    next_ticket: AtomicU64,
    breaker: Mutex<CircuitBreaker>,
    driver_factory: Option<DriverFactory>,
    shutdown: CancellationToken,
}

#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<SupervisorInner>,
}

impl Supervisor {
    pub fn new(settings: SupervisorSettings, events: EventBus) -> Self {
        Self::build(settings, events, None)
    }

    pub fn with_driver_factory(
        settings: SupervisorSettings,
        events: EventBus,
        factory: DriverFactory,
    ) -> Self {
        Self::build(settings, events, Some(factory))
    }

    fn build(
        settings: SupervisorSettings,
        events: EventBus,
        driver_factory: Option<DriverFactory>,
    ) -> Self {
        let breaker = CircuitBreaker::new(
            settings.supervisor.max_failures,
            settings.supervisor.cooldown(),
        );
        Self {
            inner: Arc::new(SupervisorInner {
                settings,
                events,
                lifecycle_lock: tokio::sync::Mutex::new(()),
                active: Mutex::new(None),
                pending: Mutex::new(HashMap::new()),
                next_ticket: AtomicU64::new(0),
                breaker: Mutex::new(breaker),
                driver_factory,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BackendEvent> {
        self.inner.events.subscribe()
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    /// State of the active session, if one is configured.
    pub fn state(&self) -> Option<SessionState> {
        self.inner.lock_active().as_ref().map(|a| a.session.state())
    }

    pub fn active_descriptor(&self) -> Option<BackendDescriptor> {
        self.inner.lock_active().as_ref().map(|a| a.descriptor.clone())
    }

    pub fn active_session(&self) -> Option<Session> {
        self.inner.lock_active().as_ref().map(|a| a.session.clone())
    }

    pub fn trust_boundary(&self) -> Option<TrustBoundary> {
        self.active_session().map(|s| s.describe_trust_boundary())
    }

    pub fn stderr_tail(&self, lines: usize) -> Vec<StderrLine> {
        self.active_session()
            .map(|s| s.stderr_tail(lines))
            .unwrap_or_default()
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.inner.lock_breaker().state()
    }

    /// Replaces any active backend with a freshly started one.
    pub async fn start_backend(&self, descriptor: BackendDescriptor) -> Result<()> {
        let _guard = self.inner.lifecycle_lock.lock().await;
        if self.inner.shutdown.is_cancelled() {
            return Err(ContourError::BackendUnavailable(
                "supervisor is shutting down".to_string(),
            ));
        }
        self.stop_active(None).await;
        self.inner.lock_breaker().record_success();
        self.launch(descriptor).await
    }

    pub async fn stop_backend(&self) -> Result<()> {
        let _guard = self.inner.lifecycle_lock.lock().await;
        self.stop_active(None).await;
        Ok(())
    }

    /// Orderly stop followed by a start from the same descriptor.
    pub async fn restart_backend(&self) -> Result<()> {
        self.restart_with_grace(None).await
    }

    /// Restart without waiting for the backend to exit on its own. Offered
    /// when a request outlives its deadline.
    pub async fn force_restart(&self) -> Result<()> {
        self.restart_with_grace(Some(Duration::ZERO)).await
    }

    async fn restart_with_grace(&self, grace: Option<Duration>) -> Result<()> {
        let _guard = self.inner.lifecycle_lock.lock().await;
        if self.inner.shutdown.is_cancelled() {
            return Err(ContourError::BackendUnavailable(
                "supervisor is shutting down".to_string(),
            ));
        }
        let descriptor = self
            .active_descriptor()
            .ok_or_else(|| ContourError::BackendUnavailable("no backend configured".to_string()))?;
        self.stop_active(grace).await;
        self.inner.lock_breaker().record_success();
        self.launch(descriptor).await
    }

    /// Submits a command and waits for its outcome.
    pub async fn submit_command(
        &self,
        command: &Command,
        options: SubmitOptions,
    ) -> Result<CommandOutcome> {
        self.submit(command, options).await?.outcome().await
    }

    /// Submits a command and returns a handle that can be awaited or cancelled.
    pub async fn submit(&self, command: &Command, options: SubmitOptions) -> Result<CommandHandle> {
        let session = self
            .active_session()
            .ok_or_else(|| ContourError::BackendUnavailable("no backend is running".to_string()))?;
        let pending = session.submit(command).await?;
        let token = self.inner.shutdown.child_token();
        let ticket = self.inner.next_ticket.fetch_add(1, Ordering::Relaxed);
        self.inner.lock_pending().insert(
            pending.id(),
            PendingEntry {
                ticket,
                token: token.clone(),
            },
        );
        let registration = Registration {
            inner: Arc::downgrade(&self.inner),
            request_id: pending.id(),
            ticket,
        };
        let deadline = options
            .deadline
            .or_else(|| self.inner.settings.session.session.command_timeout());
        Ok(CommandHandle {
            supervisor: self.clone(),
            pending,
            token,
            deadline,
            _registration: registration,
        })
    }

    /// Releases the caller waiting on `request_id`. The backend is not interrupted.
    pub fn cancel(&self, request_id: u64) -> bool {
        match self.inner.lock_pending().get(&request_id) {
            Some(entry) => {
                entry.token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn pending_requests(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.inner.lock_pending().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Cancels every pending request and stops the backend. Further starts fail.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let _guard = self.inner.lifecycle_lock.lock().await;
        self.stop_active(None).await;
        self.inner.emit(Level::INFO, "supervisor.shutdown", None);
    }

    async fn launch(&self, descriptor: BackendDescriptor) -> Result<()> {
        let session = self.inner.open_session(&descriptor).await?;
        let monitor = tokio::spawn(monitor(Arc::downgrade(&self.inner), session.clone()));
        *self.inner.lock_active() = Some(Active {
            descriptor,
            session,
            monitor: Some(monitor),
        });
        Ok(())
    }

    async fn stop_active(&self, grace: Option<Duration>) {
        let active = self.inner.lock_active().take();
        let Some(mut active) = active else {
            return;
        };
        let stopped = match grace {
            Some(grace) => active.session.terminate(grace).await,
            None => active.session.stop().await,
        };
        if let Err(err) = stopped {
            tracing::warn!("Stopping backend session {} failed: {}", active.session.id(), err);
        }
        if let Some(monitor) = active.monitor.take() {
            monitor.abort();
        }
    }
}

impl SupervisorInner {
    fn lock_active(&self) -> MutexGuard<'_, Option<Active>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_pending(&self) -> MutexGuard<'_, HashMap<u64, PendingEntry>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_breaker(&self) -> MutexGuard<'_, CircuitBreaker> {
        self.breaker.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn driver_for(&self, descriptor: &BackendDescriptor) -> Driver {
        match &self.driver_factory {
            Some(factory) => factory(descriptor),
            None => Driver::for_descriptor(descriptor),
        }
    }

    async fn open_session(&self, descriptor: &BackendDescriptor) -> Result<Session> {
        let session = Session::with_driver(
            descriptor.clone(),
            self.driver_for(descriptor),
            self.settings.session.clone(),
            self.events.clone(),
        );
        session.start().await?;
        tracing::info!(
            "Backend session {} ready ({})",
            session.id(),
            session.kind().as_str()
        );
        Ok(session)
    }

    /// Decides what follows a crash. Returns the replacement session, if any.
    async fn recover(&self, crashed: &Session) -> Option<Session> {
        crashed.acknowledge();
        let backend = crashed.kind();
        loop {
            if !self.settings.supervisor.auto_restart || self.shutdown.is_cancelled() {
                return None;
            }
            let attempt = {
                let mut breaker = self.lock_breaker();
                breaker.record_failure();
                if !breaker.can_execute() {
                    let failures = breaker.failure_count();
                    drop(breaker);
                    self.events
                        .publish(BackendEvent::RestartSuppressed { backend, failures });
                    self.emit(
                        Level::WARN,
                        "supervisor.restart.suppressed",
                        Some(crashed.id()),
                    );
                    return None;
                }
                breaker.failure_count()
            };
            self.events
                .publish(BackendEvent::RestartScheduled { backend, attempt });

            tokio::select! {
                _ = self.shutdown.cancelled() => return None,
                _ = tokio::time::sleep(self.settings.supervisor.restart_delay()) => {}
            }

            let _guard = self.lifecycle_lock.lock().await;
            let descriptor = {
                let active = self.lock_active();
                match active.as_ref() {
                    Some(active) if active.session.id() == crashed.id() => {
                        active.descriptor.clone()
                    }
                    _ => return None,
                }
            };
            match self.open_session(&descriptor).await {
                Ok(next) => {
                    if let Some(active) = self.lock_active().as_mut() {
                        active.session = next.clone();
                    }
                    self.emit(Level::INFO, "supervisor.restarted", Some(next.id()));
                    return Some(next);
                }
                Err(err) => {
                    tracing::warn!("Automatic restart attempt {} failed: {}", attempt, err);
                }
            }
        }
    }

    fn emit(&self, level: Level, event: &str, session_id: Option<&str>) {
        emit_event(
            level,
            ProcessKind::Engine,
            ObservabilityEvent {
                event,
                component: "supervisor",
                session_id,
                ..ObservabilityEvent::default()
            },
        );
    }
}

async fn monitor(supervisor: Weak<SupervisorInner>, mut session: Session) {
    loop {
        if session.wait_for_exit().await != SessionState::Crashed {
            return;
        }
        let Some(inner) = supervisor.upgrade() else {
            return;
        };
        match inner.recover(&session).await {
            Some(next) => session = next,
            None => return,
        }
    }
}

/// Drops a request from the pending map once its caller lets go of it,
/// whether it resolved or the handle and its outcome future were dropped.
struct Registration {
    inner: Weak<SupervisorInner>,
    request_id: u64,
    ticket: u64,
}

impl Drop for Registration {
    fn drop(&mut self) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let mut pending = inner.lock_pending();
        if pending
            .get(&self.request_id)
            .is_some_and(|entry| entry.ticket == self.ticket)
        {
            pending.remove(&self.request_id);
        }
    }
}

/// A submitted command, owned by the caller until it resolves.
pub struct CommandHandle {
    supervisor: Supervisor,
    pending: PendingRequest,
    token: CancellationToken,
    deadline: Option<Duration>,
    _registration: Registration,
}

impl CommandHandle {
    pub fn id(&self) -> u64 {
        self.pending.id()
    }

    /// Token that releases this caller when cancelled.
    pub fn cancellation(&self) -> CancellationToken {
        self.token.clone()
    }

    pub async fn outcome(self) -> Result<CommandOutcome> {
        let CommandHandle {
            supervisor,
            pending,
            token,
            deadline,
            _registration: registration,
        } = self;
        let session_id = pending.session_id().to_string();
        let result = pending.wait(deadline, &token).await;
        drop(registration);

        if let Err(ContourError::Timeout(request_id)) = &result {
            tracing::warn!(
                "Request {} on session {} is unresponsive; a forced restart is available",
                request_id,
                session_id
            );
            supervisor.inner.events.publish(BackendEvent::Unresponsive {
                session_id,
                request_id: *request_id,
            });
        }
        result
    }
}
