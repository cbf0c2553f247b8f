//! The body of a polling session task.

use super::interval::PollInterval;
use super::sink::SessionEmitter;
use super::FinishGuard;
use crate::instrument::Connection;
use crate::measurement::{MeasurementEvent, MeasurementKind};
use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, error, info};

/// Everything a session task needs, moved into the task on start.
pub(crate) struct PollContext {
    pub session_id: u64,
    pub kind: MeasurementKind,
    pub connection: Connection,
    pub emitter: SessionEmitter,
    pub cancel_rx: watch::Receiver<bool>,
    pub interval_rx: watch::Receiver<PollInterval>,
    pub overload_threshold: f64,
}

impl PollContext {
    fn cancelled(&self) -> bool {
        *self.cancel_rx.borrow()
    }
}

/// Measure, emit, sleep until cancelled or a reading fails.
///
/// `finish` is dropped on every exit path (return, panic, abort) and closes
/// the session with exactly one `Terminated`.
pub(crate) async fn run(mut ctx: PollContext, finish: FinishGuard) {
    let _finish = finish;
    let session = ctx.session_id;
    let kind = ctx.kind;
    let mut cycles: u64 = 0;

    info!(session, "Polling {} every {}", kind, *ctx.interval_rx.borrow());

    loop {
        if ctx.cancelled() {
            debug!(session, "Cancellation observed before measuring");
            break;
        }

        let started = Instant::now();
        let result = ctx
            .connection
            .run_blocking(move |port| port.measure(kind))
            .await;
        cycles += 1;
        debug!(
            session,
            cycle = cycles,
            latency_ms = started.elapsed().as_secs_f64() * 1e3,
            "Measurement returned"
        );

        let event = match result {
            Ok(value) => MeasurementEvent::from_reading(kind, value, ctx.overload_threshold),
            Err(err) if err.is_fatal() => {
                error!(session, "Polling {} failed: {}", kind, err);
                let _ = ctx.emitter.emit(MeasurementEvent::Error {
                    message: err.to_string(),
                });
                break;
            }
            Err(err) => {
                debug!(session, "{}", err);
                MeasurementEvent::Overload { kind }
            }
        };

        if ctx.emitter.emit(event).is_err() {
            debug!(session, "Session emitter closed; leaving poll loop");
            break;
        }

        if ctx.cancelled() {
            break;
        }

        let interval = *ctx.interval_rx.borrow_and_update();
        tokio::select! {
            _ = tokio::time::sleep(interval.as_duration()) => {}
            changed = ctx.cancel_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    info!(session, cycles, "Polling loop exited");
}
