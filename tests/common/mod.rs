//! Shared stub instrument for scheduler integration tests.
#![allow(dead_code)]

use dmm_daq::error::MeasurementError;
use dmm_daq::instrument::{Connection, InstrumentPort};
use dmm_daq::measurement::{MeasurementEvent, MeasurementKind};
use dmm_daq::scheduler::{EventStream, PollingScheduler, SchedulerOptions};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// Blocks `measure` calls until released.
#[derive(Default)]
pub struct Gate {
    open: Mutex<bool>,
    cond: Condvar,
}

impl Gate {
    pub fn release(&self) {
        *self.open.lock().unwrap() = true;
        self.cond.notify_all();
    }

    fn wait(&self) {
        let mut open = self.open.lock().unwrap();
        while !*open {
            open = self.cond.wait(open).unwrap();
        }
    }
}

/// What the test can observe about the stub from outside.
#[derive(Clone, Default)]
pub struct CallLog {
    calls: Arc<AtomicUsize>,
    local_returns: Arc<AtomicUsize>,
    call_times: Arc<Mutex<Vec<Instant>>>,
}

impl CallLog {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn local_returns(&self) -> usize {
        self.local_returns.load(Ordering::SeqCst)
    }

    pub fn call_times(&self) -> Vec<Instant> {
        self.call_times.lock().unwrap().clone()
    }

    /// Poll until at least `n` measure calls have started.
    pub async fn wait_for_calls(&self, n: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.calls() >= n {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        false
    }
}

/// Instrument port that replays a script of results, then repeats a fallback.
pub struct StubPort {
    script: VecDeque<Result<f64, MeasurementError>>,
    fallback: Result<f64, MeasurementError>,
    gate: Option<Arc<Gate>>,
    call_log: CallLog,
}

impl StubPort {
    /// Every call returns `value`.
    pub fn constant(value: f64) -> Self {
        Self {
            script: VecDeque::new(),
            fallback: Ok(value),
            gate: None,
            call_log: CallLog::default(),
        }
    }

    /// Calls return the scripted results in order, then `fallback` forever.
    pub fn scripted(
        script: Vec<Result<f64, MeasurementError>>,
        fallback: Result<f64, MeasurementError>,
    ) -> Self {
        Self {
            script: script.into(),
            fallback,
            gate: None,
            call_log: CallLog::default(),
        }
    }

    /// Every measure call blocks until the returned gate is released.
    pub fn gated(value: f64) -> (Self, Arc<Gate>) {
        let gate = Arc::new(Gate::default());
        let mut port = Self::constant(value);
        port.gate = Some(gate.clone());
        (port, gate)
    }

    pub fn call_log(&self) -> CallLog {
        self.call_log.clone()
    }

    pub fn into_connection(self) -> Connection {
        Connection::new("stub://dmm", Box::new(self))
    }
}

impl InstrumentPort for StubPort {
    fn measure(&mut self, _kind: MeasurementKind) -> Result<f64, MeasurementError> {
        self.call_log.calls.fetch_add(1, Ordering::SeqCst);
        self.call_log.call_times.lock().unwrap().push(Instant::now());
        if let Some(gate) = &self.gate {
            gate.wait();
        }
        self.script
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone())
    }

    fn send_raw(&mut self, command: &str) -> Result<Option<String>, MeasurementError> {
        if command == "*IDN?" {
            Ok(Some("STUB,DMM-1,0001,1.0".to_string()))
        } else if command.contains('?') {
            Ok(Some("+0,\"No error\"".to_string()))
        } else {
            Ok(None)
        }
    }

    fn return_to_local(&mut self) -> Result<(), MeasurementError> {
        self.call_log.local_returns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), MeasurementError> {
        Ok(())
    }
}

/// A scheduler bound to `port`, running on the current runtime.
pub fn scheduler_with(port: StubPort, options: SchedulerOptions) -> (PollingScheduler, EventStream) {
    let (scheduler, events) =
        PollingScheduler::new(options, tokio::runtime::Handle::current());
    scheduler.bind(port.into_connection()).unwrap();
    (scheduler, events)
}

/// Receive events until `Terminated` (inclusive) or until `timeout` passes.
pub async fn collect_until_terminated(
    events: &mut EventStream,
    timeout: Duration,
) -> Vec<MeasurementEvent> {
    let deadline = Instant::now() + timeout;
    let mut collected = Vec::new();
    while let Some(remaining) = deadline.checked_duration_since(Instant::now()) {
        match events.recv_timeout(remaining).await {
            Some(event) => {
                let done = event.is_terminal();
                collected.push(event);
                if done {
                    break;
                }
            }
            None => break,
        }
    }
    collected
}

/// Receive the next `n` events, failing the test if they do not arrive in time.
pub async fn next_events(
    events: &mut EventStream,
    n: usize,
    timeout: Duration,
) -> Vec<MeasurementEvent> {
    let mut collected = Vec::with_capacity(n);
    for _ in 0..n {
        let event = events
            .recv_timeout(timeout)
            .await
            .unwrap_or_else(|| panic!("timed out after {} events", collected.len()));
        collected.push(event);
    }
    collected
}
