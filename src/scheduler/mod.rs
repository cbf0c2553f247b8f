//! Instrument polling scheduler.
//!
//! A [`PollingScheduler`] owns at most one polling session at a time. A session
//! is a Tokio task that repeatedly takes a reading from the bound instrument,
//! pushes the result into the [`EventStream`] and sleeps for the current
//! [`PollInterval`]. The control surface (`start`, `stop`, `update_interval`,
//! manual one-shot operations) can be driven from any task or thread.
//!
//! ## Guarantees
//!
//! - The instrument is only ever touched by one call at a time. The polling
//!   task and manual operations both go through the [`Connection`] mutex, and
//!   manual operations are refused while a session is active.
//! - Every session ends with exactly one [`MeasurementEvent::Terminated`], after
//!   all its other events. Emitting `Terminated` and entering
//!   [`SessionState::Stopped`] happen under the same lock.
//! - A stopped session leaves `Stopping` within the configured grace period,
//!   whether or not the caller keeps awaiting `stop`. A session whose
//!   instrument call does not return in time is abandoned: `Terminated` is
//!   emitted on its behalf, its task is aborted and the connection is marked as
//!   needing a reconnect.
//!
//! ## Example
//!
//! ```no_run
//! use dmm_daq::instrument::{Connection, MockMultimeter};
//! use dmm_daq::measurement::MeasurementKind;
//! use dmm_daq::scheduler::{PollInterval, PollingScheduler, SchedulerOptions};
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let (scheduler, mut events) =
//!     PollingScheduler::new(SchedulerOptions::default(), tokio::runtime::Handle::current());
//! scheduler.bind(Connection::new("sim://dmm", Box::new(MockMultimeter::new())))?;
//!
//! let interval = PollInterval::from_secs(0.5).unwrap_or_default();
//! let session = scheduler.start(MeasurementKind::DcVoltage, interval)?;
//! while let Some(event) = events.recv().await {
//!     println!("{}", event);
//!     if event.is_terminal() {
//!         break;
//!     }
//!     scheduler.stop(session).await;
//! }
//! scheduler.acknowledge();
//! # Ok(())
//! # }
//! ```

pub mod interval;
mod poll_loop;
pub mod sink;
pub mod state;

pub use interval::{PollInterval, DEFAULT_POLL_INTERVAL_SECS};
pub use sink::{result_sink, EventStream, ResultSink, SessionEmitter, SinkClosed};
pub use state::{InvalidTransition, SessionState, SessionStateMachine};

use crate::config::SchedulerSettings;
use crate::error::{ControlError, MeasurementError, StartError};
use crate::instrument::{Connection, InstrumentIdentity};
use crate::measurement::{MeasurementKind, DEFAULT_OVERLOAD_THRESHOLD_OHMS};
use poll_loop::PollContext;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Tunables of a [`PollingScheduler`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SchedulerOptions {
    /// Used when `update_interval` receives an invalid value
    pub default_interval: PollInterval,
    /// How long `stop` waits before abandoning the session task
    pub stop_grace: Duration,
    /// Resistance readings at or above this are reported as overload
    pub overload_threshold_ohms: f64,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            default_interval: PollInterval::default(),
            stop_grace: Duration::from_secs(2),
            overload_threshold_ohms: DEFAULT_OVERLOAD_THRESHOLD_OHMS,
        }
    }
}

impl From<&SchedulerSettings> for SchedulerOptions {
    fn from(settings: &SchedulerSettings) -> Self {
        Self {
            default_interval: PollInterval::from_secs(settings.default_interval_secs)
                .unwrap_or_default(),
            stop_grace: Duration::from_millis(settings.stop_grace_ms),
            overload_threshold_ohms: settings.overload_threshold_ohms,
        }
    }
}

/// Identifies one polling session. Handles of finished sessions are stale and
/// control calls made with them have no effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionHandle {
    id: u64,
    kind: MeasurementKind,
}

impl SessionHandle {
    /// Unique, increasing session number.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Function polled by the session.
    pub fn kind(&self) -> MeasurementKind {
        self.kind
    }
}

/// How a call to [`PollingScheduler::stop`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The session task observed cancellation and exited within the grace period
    Graceful,
    /// The task was abandoned after the grace period; reconnect before the next start
    Forced,
    /// Nothing to stop: stale handle, session already ended, or a stop already in progress
    NotRunning,
}

/// Bookkeeping for the current (or last, until acknowledged) session.
struct Session {
    id: u64,
    kind: MeasurementKind,
    connection: Connection,
    emitter: SessionEmitter,
    cancel_tx: watch::Sender<bool>,
    interval_tx: watch::Sender<PollInterval>,
    task: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct Core {
    machine: SessionStateMachine,
    connection: Option<Connection>,
    session: Option<Session>,
    next_id: u64,
}

impl Core {
    /// Walk whatever is left of Running -> Stopping -> Stopped.
    fn enter_stopped(&mut self) {
        if self.machine.state() == SessionState::Running {
            let _ = self.machine.transition(SessionState::Stopping);
        }
        if self.machine.state() == SessionState::Stopping {
            let _ = self.machine.transition(SessionState::Stopped);
        }
    }

    fn session_for(&self, handle: SessionHandle) -> Option<&Session> {
        self.session.as_ref().filter(|s| s.id == handle.id)
    }
}

fn lock(core: &Mutex<Core>) -> MutexGuard<'_, Core> {
    core.lock().unwrap_or_else(|e| e.into_inner())
}

/// Closes a session when its task ends, however it ends.
pub(crate) struct FinishGuard {
    core: Arc<Mutex<Core>>,
    session_id: u64,
}

impl Drop for FinishGuard {
    fn drop(&mut self) {
        let mut core = lock(&self.core);
        let terminated = match core.session.as_ref() {
            Some(session) if session.id == self.session_id => session.emitter.terminate(),
            _ => false,
        };
        if terminated {
            core.enter_stopped();
            info!(session = self.session_id, "Polling session stopped");
        }
    }
}

/// Wait up to `grace` for a cancelled session task, then abandon it.
async fn enforce_grace(
    core: Arc<Mutex<Core>>,
    session_id: u64,
    mut task: JoinHandle<()>,
    grace: Duration,
) -> StopOutcome {
    if tokio::time::timeout(grace, &mut task).await.is_ok() {
        return StopOutcome::Graceful;
    }

    let forced = {
        let mut core = lock(&core);
        let abandoned = core
            .session
            .as_ref()
            .filter(|session| session.id == session_id && session.emitter.terminate())
            .map(|session| session.connection.clone());
        match abandoned {
            Some(connection) => {
                connection.mark_unusable();
                core.enter_stopped();
                true
            }
            None => false,
        }
    };
    task.abort();

    if forced {
        warn!(
            session = session_id,
            grace_ms = grace.as_millis() as u64,
            "StopTimeoutWarning: polling task did not exit within {:?}; abandoned it",
            grace
        );
        StopOutcome::Forced
    } else {
        StopOutcome::Graceful
    }
}

/// Runs polling sessions against one bound instrument connection.
pub struct PollingScheduler {
    core: Arc<Mutex<Core>>,
    sink: ResultSink,
    options: SchedulerOptions,
    runtime: Handle,
}

impl PollingScheduler {
    /// Create a scheduler whose session tasks run on `runtime`.
    ///
    /// The returned [`EventStream`] is the single consumer of every event the
    /// scheduler produces.
    pub fn new(options: SchedulerOptions, runtime: Handle) -> (Self, EventStream) {
        let (sink, events) = result_sink();
        let scheduler = Self {
            core: Arc::new(Mutex::new(Core::default())),
            sink,
            options,
            runtime,
        };
        (scheduler, events)
    }

    /// Options the scheduler was created with.
    pub fn options(&self) -> &SchedulerOptions {
        &self.options
    }

    /// Current lifecycle state; callable from any thread.
    pub fn state(&self) -> SessionState {
        lock(&self.core).machine.state()
    }

    /// The session currently owning the instrument, if any.
    pub fn active_session(&self) -> Option<SessionHandle> {
        let core = lock(&self.core);
        match core.machine.state() {
            SessionState::Running | SessionState::Stopping => {
                core.session.as_ref().map(|s| SessionHandle {
                    id: s.id,
                    kind: s.kind,
                })
            }
            _ => None,
        }
    }

    /// Attach an instrument connection, replacing any previous one.
    pub fn bind(&self, connection: Connection) -> Result<(), ControlError> {
        let mut core = lock(&self.core);
        if !core.machine.state().allows_manual_operation() {
            return Err(ControlError::SessionActive);
        }
        info!("Bound instrument '{}'", connection.address());
        core.connection = Some(connection);
        Ok(())
    }

    /// Detach and disconnect the bound instrument.
    pub async fn unbind(&self) -> Result<(), ControlError> {
        let connection = {
            let mut core = lock(&self.core);
            if !core.machine.state().allows_manual_operation() {
                return Err(ControlError::SessionActive);
            }
            core.connection.take().ok_or(ControlError::NotConnected)?
        };

        if connection.is_usable() {
            connection.disconnect().await
        } else {
            warn!(
                "Dropping unusable connection to '{}' without disconnecting",
                connection.address()
            );
            Ok(())
        }
    }

    /// Begin polling `kind` every `interval`. Returns immediately.
    pub fn start(
        &self,
        kind: MeasurementKind,
        interval: PollInterval,
    ) -> Result<SessionHandle, StartError> {
        let mut core = lock(&self.core);
        if !core.machine.state().can_start() {
            return Err(StartError::AlreadyRunning);
        }
        let connection = core.connection.clone().ok_or(StartError::NotConnected)?;
        if !connection.is_usable() {
            return Err(StartError::NeedsReconnect);
        }

        if core.machine.state() == SessionState::Stopped {
            core.session = None;
            core.machine
                .transition(SessionState::Idle)
                .map_err(|_| StartError::AlreadyRunning)?;
        }
        core.machine
            .transition(SessionState::Running)
            .map_err(|_| StartError::AlreadyRunning)?;

        core.next_id += 1;
        let id = core.next_id;
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (interval_tx, interval_rx) = watch::channel(interval);
        let emitter = self.sink.session_emitter();

        let context = PollContext {
            session_id: id,
            kind,
            connection: connection.clone(),
            emitter: emitter.clone(),
            cancel_rx,
            interval_rx,
            overload_threshold: self.options.overload_threshold_ohms,
        };
        let finish = FinishGuard {
            core: self.core.clone(),
            session_id: id,
        };
        let task = self.runtime.spawn(poll_loop::run(context, finish));

        core.session = Some(Session {
            id,
            kind,
            connection,
            emitter,
            cancel_tx,
            interval_tx,
            task: Some(task),
        });

        info!(session = id, "Started polling {} every {}", kind, interval);
        Ok(SessionHandle { id, kind })
    }

    /// Stop the session `handle` refers to.
    ///
    /// Idempotent. Waits at most the grace period; a session that does not
    /// exit in time is abandoned and `Forced` is returned. The grace period is
    /// enforced by a task on the scheduler's runtime, so teardown completes even
    /// if this future is dropped early.
    pub async fn stop(&self, handle: SessionHandle) -> StopOutcome {
        let teardown = {
            let mut core = lock(&self.core);
            if core.session_for(handle).is_none() {
                debug!(session = handle.id, "Stop ignored for stale session");
                return StopOutcome::NotRunning;
            }
            if core.machine.state() != SessionState::Running {
                return StopOutcome::NotRunning;
            }
            if let Err(e) = core.machine.transition(SessionState::Stopping) {
                warn!("{}", e);
                return StopOutcome::NotRunning;
            }
            let Some(session) = core.session.as_mut() else {
                return StopOutcome::NotRunning;
            };
            session.cancel_tx.send_replace(true);
            info!(session = handle.id, "Stop requested");
            let Some(task) = session.task.take() else {
                return StopOutcome::Graceful;
            };
            self.runtime.spawn(enforce_grace(
                self.core.clone(),
                handle.id,
                task,
                self.options.stop_grace,
            ))
        };

        match teardown.await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(session = handle.id, "Stop watchdog did not complete: {}", e);
                StopOutcome::NotRunning
            }
        }
    }

    /// Change the interval of a running session; takes effect at the next sleep.
    ///
    /// Invalid values fall back to the default interval. The interval actually
    /// in effect is returned.
    pub fn update_interval(
        &self,
        handle: SessionHandle,
        secs: f64,
    ) -> Result<PollInterval, ControlError> {
        let core = lock(&self.core);
        let session = core
            .session_for(handle)
            .filter(|_| core.machine.state() == SessionState::Running)
            .ok_or(ControlError::StaleSession)?;

        let interval = PollInterval::sanitize(secs, self.options.default_interval);
        session.interval_tx.send_replace(interval);
        info!(session = handle.id, "Poll interval set to {}", interval);
        Ok(interval)
    }

    /// Return from `Stopped` to `Idle`, dropping the finished session.
    ///
    /// Returns false if there was nothing to acknowledge.
    pub fn acknowledge(&self) -> bool {
        let mut core = lock(&self.core);
        if core.machine.state() != SessionState::Stopped {
            return false;
        }
        core.session = None;
        core.machine.transition(SessionState::Idle).is_ok()
    }

    fn manual_connection(&self) -> Result<Connection, ControlError> {
        let core = lock(&self.core);
        if !core.machine.state().allows_manual_operation() {
            return Err(ControlError::SessionActive);
        }
        let connection = core.connection.clone().ok_or(ControlError::NotConnected)?;
        if !connection.is_usable() {
            return Err(ControlError::NeedsReconnect);
        }
        Ok(connection)
    }

    /// Take a single reading outside of a session.
    ///
    /// The front panel is returned to local control afterwards.
    pub async fn measure_once(&self, kind: MeasurementKind) -> Result<f64, ControlError> {
        let connection = self.manual_connection()?;
        let value = connection
            .try_run_blocking(move |port| {
                let reading = port.measure(kind);
                if let Err(e) = port.return_to_local() {
                    warn!("Failed to return instrument to local control: {}", e);
                }
                reading
            })
            .await?;

        if kind == MeasurementKind::Resistance && value >= self.options.overload_threshold_ohms {
            return Err(MeasurementError::Overload(kind).into());
        }
        info!("{} = {} {}", kind, value, kind.unit());
        Ok(value)
    }

    /// Query the instrument's `*IDN?` identity.
    pub async fn identify(&self) -> Result<InstrumentIdentity, ControlError> {
        self.manual_connection()?
            .try_run_blocking(|port| port.identify())
            .await
    }

    /// Send a raw SCPI command; queries return the response.
    pub async fn send_command(&self, command: &str) -> Result<Option<String>, ControlError> {
        let command = command.trim().to_string();
        debug!("Manual command: {}", command);
        self.manual_connection()?
            .try_run_blocking(move |port| port.send_raw(&command))
            .await
    }
}

impl Drop for PollingScheduler {
    fn drop(&mut self) {
        let core = lock(&self.core);
        if let Some(session) = core.session.as_ref() {
            session.cancel_tx.send_replace(true);
        }
    }
}
