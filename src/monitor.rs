//! Scan session lifecycle: start, poll on a fixed cadence, stop, finish.
//!
//! ```text
//! IDLE --start()--> STARTING --(ack)--> POLLING
//! POLLING --(running)--> POLLING
//! POLLING --(completed | failed)--> IDLE            refresh once
//! POLLING --stop()--> STOPPING --(stopped)--> IDLE   refresh once
//! STARTING --stop()--> stop sent right after the ack
//! POLLING --(poll error)--> POLLING                 counted against budget
//! POLLING --(budget exhausted | attempt cap)--> IDLE fatal, no refresh
//! ```
//!
//! At most one session exists at a time. Each session owns a generation
//! number and a `CancellationToken`; every poll carries the generation it
//! was issued for and its result is dropped if that session is no longer
//! current. Finishing a session takes it out of the state record, so the
//! terminal work (timer cancel, controls reset, dependent refresh) can run
//! only once per session.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::{RouteFamily, ScanBackend};
use crate::error::{ApiError, MonitorError, StartError};
use crate::target::parse_target;
use crate::types::{ScanHandle, ScanSnapshot, ScanStatus};
use crate::ui::{Controls, Notice, ScanSurface};

/// Polling cadence and the hard limits on a session.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub poll_interval: Duration,
    /// Consecutive failed polls tolerated before the session is declared lost.
    pub failure_budget: u32,
    /// Total polls before giving up on a scan that never finishes.
    pub max_polls: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1000),
            failure_budget: 5,
            max_polls: 3600,
        }
    }
}

impl MonitorConfig {
    /// Defaults matching each backend: the live log view polls every second,
    /// the queue status view every two seconds for at most ten minutes.
    pub fn for_routes(routes: RouteFamily) -> Self {
        match routes {
            RouteFamily::Live => Self::default(),
            RouteFamily::Queue => Self {
                poll_interval: Duration::from_millis(2000),
                max_polls: 300,
                ..Self::default()
            },
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_failure_budget(mut self, budget: u32) -> Self {
        self.failure_budget = budget;
        self
    }

    pub fn with_max_polls(mut self, max_polls: u32) -> Self {
        self.max_polls = max_polls;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Starting,
    Polling,
    Stopping,
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    Completed,
    Failed,
    Stopped,
    ConnectionLost { failures: u32, last_error: String },
    TimedOut { attempts: u32 },
    Abandoned,
}

impl SessionEnd {
    /// Ends observed from the backend, as opposed to client-side give-ups.
    pub fn is_backend_terminal(&self) -> bool {
        matches!(
            self,
            SessionEnd::Completed | SessionEnd::Failed | SessionEnd::Stopped
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOutcome {
    pub handle: ScanHandle,
    pub end: SessionEnd,
}

impl SessionOutcome {
    pub fn into_result(self) -> Result<ScanHandle, MonitorError> {
        match self.end {
            SessionEnd::Completed => Ok(self.handle),
            SessionEnd::Failed => Err(MonitorError::Failed {
                message: self.handle.error.unwrap_or_else(|| "Scan failed".to_string()),
            }),
            SessionEnd::Stopped => Err(MonitorError::Stopped),
            SessionEnd::ConnectionLost {
                failures,
                last_error,
            } => Err(MonitorError::ConnectionLost {
                failures,
                last_error,
            }),
            SessionEnd::TimedOut { attempts } => Err(MonitorError::TimedOut { attempts }),
            SessionEnd::Abandoned => Err(MonitorError::Abandoned),
        }
    }
}

/// What a call to [`ScanMonitor::stop`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopRequest {
    /// The backend accepted the stop request.
    Sent,
    /// The start request is still in flight; stop follows the acknowledgement.
    Deferred,
    /// A stop was already requested for this session.
    AlreadyRequested,
    /// The backend refused or could not be reached.
    Failed(ApiError),
    /// No scan is active.
    NoSession,
}

type OutcomeSlot = Option<SessionOutcome>;

struct Session {
    generation: u64,
    handle: ScanHandle,
    cancel: CancellationToken,
    polls: u32,
    failures: u32,
    stop_requested: bool,
    outcome_tx: watch::Sender<OutcomeSlot>,
}

struct MonitorState {
    phase: Phase,
    generation: u64,
    session: Option<Session>,
    // Stop asked for while STARTING.
    stop_pending: bool,
    // Outlives the session so `wait()` can read how the last one ended.
    last_outcome: Option<watch::Receiver<OutcomeSlot>>,
}

struct Inner {
    backend: Arc<dyn ScanBackend>,
    surface: Arc<dyn ScanSurface>,
    config: MonitorConfig,
    state: Mutex<MonitorState>,
}

struct TickResult {
    applied: Option<ScanSnapshot>,
    keep_polling: bool,
}

impl TickResult {
    fn stale() -> Self {
        Self {
            applied: None,
            keep_polling: false,
        }
    }
}

/// Drives one scan session at a time against a [`ScanBackend`].
#[derive(Clone)]
pub struct ScanMonitor {
    inner: Arc<Inner>,
}

impl ScanMonitor {
    pub fn new(
        backend: Arc<dyn ScanBackend>,
        surface: Arc<dyn ScanSurface>,
        config: MonitorConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                backend,
                surface,
                config,
                state: Mutex::new(MonitorState {
                    phase: Phase::Idle,
                    generation: 0,
                    session: None,
                    stop_pending: false,
                    last_outcome: None,
                }),
            }),
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.inner.config
    }

    pub async fn phase(&self) -> Phase {
        self.inner.state.lock().await.phase
    }

    /// Snapshot of the active session's handle, if any.
    pub async fn current(&self) -> Option<ScanHandle> {
        let st = self.inner.state.lock().await;
        st.session.as_ref().map(|s| s.handle.clone())
    }

    /// Start a scan and begin polling it in the background.
    ///
    /// An empty or malformed target fails without a network call. A backend
    /// rejection leaves the monitor idle with the server's message surfaced.
    pub async fn start(&self, target: &str) -> Result<ScanHandle, StartError> {
        let inner = &self.inner;
        let target = match parse_target(target) {
            Ok(t) => t,
            Err(e) => {
                inner.surface.notify(Notice::Error(e.to_string()));
                return Err(e.into());
            }
        };

        {
            let mut st = inner.state.lock().await;
            if st.phase != Phase::Idle {
                return Err(StartError::AlreadyActive);
            }
            st.phase = Phase::Starting;
            inner.surface.controls(Controls::STARTING);
        }

        info!(scan_target = %target, "starting scan");
        let ack = inner.backend.start_scan(target.as_str()).await;

        let mut st = inner.state.lock().await;
        let scan_id = match ack {
            Ok(id) => id,
            Err(err) => {
                let err = StartError::from(err);
                warn!(scan_target = %target, error = %err, "scan start rejected");
                st.phase = Phase::Idle;
                st.stop_pending = false;
                inner.surface.controls(Controls::IDLE);
                inner
                    .surface
                    .notify(Notice::Error(format!("Scan failed to start: {err}")));
                return Err(err);
            }
        };

        st.generation += 1;
        let generation = st.generation;
        let handle = ScanHandle::new(scan_id, target.as_str());
        let cancel = CancellationToken::new();
        let (outcome_tx, outcome_rx) = watch::channel(None);
        st.session = Some(Session {
            generation,
            handle: handle.clone(),
            cancel: cancel.clone(),
            polls: 0,
            failures: 0,
            stop_requested: false,
            outcome_tx,
        });
        st.last_outcome = Some(outcome_rx);
        st.phase = Phase::Polling;
        let stop_pending = std::mem::take(&mut st.stop_pending);
        if !stop_pending {
            inner.surface.controls(Controls::ACTIVE);
        }
        inner.surface.status(&handle);
        drop(st);

        info!(scan_id = %handle.id, generation, "scan started");
        tokio::spawn(poll_loop(self.inner.clone(), generation, cancel));
        if stop_pending {
            self.stop().await;
        }
        Ok(handle)
    }

    /// Poll the active session once, outside the regular cadence.
    ///
    /// Returns the snapshot if it was fetched and applied; `None` when there
    /// is no session, the poll failed, or the session ended meanwhile.
    pub async fn poll(&self) -> Option<ScanSnapshot> {
        let (generation, cancel) = {
            let st = self.inner.state.lock().await;
            let s = st.session.as_ref()?;
            (s.generation, s.cancel.clone())
        };
        self.inner.tick(generation, &cancel).await.applied
    }

    /// Ask the backend to stop the active scan.
    ///
    /// Sends at most one stop request per session and disables the stop
    /// control right away; the next poll confirms the `stopped` state. A
    /// stop asked for while the start request is in flight is sent as soon
    /// as the backend acknowledges the scan.
    pub async fn stop(&self) -> StopRequest {
        let inner = &self.inner;
        let (generation, scan_id) = {
            let mut guard = inner.state.lock().await;
            let st = &mut *guard;
            let Some(session) = st.session.as_mut() else {
                if st.phase != Phase::Starting {
                    return StopRequest::NoSession;
                }
                if st.stop_pending {
                    return StopRequest::AlreadyRequested;
                }
                st.stop_pending = true;
                inner.surface.controls(Controls::STOPPING);
                return StopRequest::Deferred;
            };
            if session.stop_requested {
                return StopRequest::AlreadyRequested;
            }
            session.stop_requested = true;
            st.phase = Phase::Stopping;
            inner.surface.controls(Controls::STOPPING);
            (session.generation, session.handle.id.clone())
        };

        info!(scan_id = %scan_id, "requesting stop");
        let res = inner.backend.stop_scan(&scan_id).await;

        let mut guard = inner.state.lock().await;
        let st = &mut *guard;
        let current = st.session.as_mut().filter(|s| s.generation == generation);
        match (res, current) {
            (Ok(()), Some(_)) => {
                inner
                    .surface
                    .notify(Notice::Info("Stop requested".to_string()));
                StopRequest::Sent
            }
            (Ok(()), None) => StopRequest::Sent,
            (Err(err), Some(session)) => {
                warn!(scan_id = %scan_id, error = %err, "stop request failed");
                session.stop_requested = false;
                st.phase = Phase::Polling;
                inner.surface.controls(Controls::ACTIVE);
                inner
                    .surface
                    .notify(Notice::Error(format!("Failed to stop scan: {err}")));
                StopRequest::Failed(err)
            }
            (Err(err), None) => {
                // The session already ended; its terminal notice stands.
                debug!(scan_id = %scan_id, error = %err, "stop request failed after session ended");
                StopRequest::Failed(err)
            }
        }
    }

    /// End the session without contacting the backend (the user navigated
    /// away). The poll timer is cancelled and no refresh is triggered.
    pub async fn abandon(&self) -> bool {
        let mut st = self.inner.state.lock().await;
        if st.session.is_none() {
            return false;
        }
        self.inner.finish(&mut st, SessionEnd::Abandoned);
        true
    }

    /// Wait for the most recent session to end.
    pub async fn wait(&self) -> Result<ScanHandle, MonitorError> {
        let rx = {
            let st = self.inner.state.lock().await;
            st.last_outcome.clone()
        };
        let mut rx = rx.ok_or(MonitorError::NoSession)?;
        let slot = match rx.wait_for(Option::is_some).await {
            Ok(slot) => (*slot).clone(),
            Err(_) => None,
        };
        slot.map(SessionOutcome::into_result)
            .unwrap_or(Err(MonitorError::Abandoned))
    }

    /// Start a scan and wait for it to end: the blocking, form-submit style
    /// of driving a session. Bounded by `max_polls` like every session.
    pub async fn run(&self, target: &str) -> Result<ScanHandle, MonitorError> {
        self.start(target).await?;
        self.wait().await
    }
}

async fn poll_loop(inner: Arc<Inner>, generation: u64, cancel: CancellationToken) {
    let period = inner.config.poll_interval;
    let mut ticker = time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        if !inner.tick(generation, &cancel).await.keep_polling {
            break;
        }
    }
    debug!(generation, "poll loop exited");
}

impl Inner {
    async fn tick(&self, generation: u64, cancel: &CancellationToken) -> TickResult {
        let scan_id = {
            let st = self.state.lock().await;
            match &st.session {
                Some(s) if s.generation == generation => s.handle.id.clone(),
                _ => return TickResult::stale(),
            }
        };

        let res = tokio::select! {
            _ = cancel.cancelled() => return TickResult::stale(),
            res = self.backend.scan_status(&scan_id) => res,
        };
        self.apply(generation, res).await
    }

    async fn apply(&self, generation: u64, res: Result<ScanSnapshot, ApiError>) -> TickResult {
        let mut guard = self.state.lock().await;
        let st = &mut *guard;
        let session = match st.session.as_mut() {
            Some(s) if s.generation == generation => s,
            _ => {
                debug!(generation, "discarding poll result for a finished session");
                return TickResult::stale();
            }
        };

        session.polls += 1;
        let polls = session.polls;
        let max_polls = self.config.max_polls.max(1);
        let budget = self.config.failure_budget.max(1);

        let (applied, end) = match res {
            Ok(snap) => {
                session.failures = 0;
                session.handle.absorb(&snap);
                self.surface.status(&session.handle);
                self.surface.log(&session.handle.output);
                debug!(
                    scan_id = %session.handle.id,
                    status = %session.handle.status,
                    lines = session.handle.output.len(),
                    polls,
                    "poll"
                );
                let end = match session.handle.status {
                    ScanStatus::Completed => Some(SessionEnd::Completed),
                    ScanStatus::Failed => Some(SessionEnd::Failed),
                    ScanStatus::Stopped => Some(SessionEnd::Stopped),
                    _ if polls >= max_polls => Some(SessionEnd::TimedOut { attempts: polls }),
                    _ => None,
                };
                (Some(snap), end)
            }
            Err(err) => {
                session.failures += 1;
                let failures = session.failures;
                warn!(
                    scan_id = %session.handle.id,
                    failures,
                    budget,
                    error = %err,
                    "poll failed"
                );
                let end = if failures >= budget {
                    Some(SessionEnd::ConnectionLost {
                        failures,
                        last_error: err.to_string(),
                    })
                } else if polls >= max_polls {
                    Some(SessionEnd::TimedOut { attempts: polls })
                } else {
                    None
                };
                (None, end)
            }
        };

        let keep_polling = match end {
            Some(end) => {
                self.finish(st, end);
                false
            }
            None => true,
        };
        TickResult {
            applied,
            keep_polling,
        }
    }

    /// Close the current session. Taking it out of the state record is what
    /// makes the terminal side effects happen once.
    fn finish(&self, st: &mut MonitorState, end: SessionEnd) {
        let Some(session) = st.session.take() else {
            return;
        };
        session.cancel.cancel();
        st.phase = Phase::Idle;
        self.surface.controls(Controls::IDLE);

        let handle = session.handle;
        match &end {
            SessionEnd::Completed => {
                self.surface
                    .notify(Notice::Success("Scan completed successfully!".to_string()));
            }
            SessionEnd::Failed => {
                let message = handle.error.as_deref().unwrap_or("Scan failed");
                self.surface
                    .notify(Notice::Error(format!("Scan failed: {message}")));
            }
            SessionEnd::Stopped => {
                self.surface.notify(Notice::Info("Scan stopped".to_string()));
            }
            SessionEnd::ConnectionLost { failures, last_error } => {
                self.surface.notify(Notice::Error(format!(
                    "Connection lost after {failures} failed polls: {last_error}"
                )));
            }
            SessionEnd::TimedOut { attempts } => {
                self.surface.notify(Notice::Error(format!(
                    "Scan timeout after {attempts} polls; final status unknown"
                )));
            }
            SessionEnd::Abandoned => {}
        }
        if end.is_backend_terminal() {
            self.surface.refresh_dependents();
        }

        info!(scan_id = %handle.id, status = %handle.status, end = ?end, "session finished");
        session
            .outcome_tx
            .send_replace(Some(SessionOutcome { handle, end }));
    }
}
