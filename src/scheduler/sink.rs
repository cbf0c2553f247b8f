//! Ordered single-consumer delivery of measurement events.
//!
//! The producer side is split per session: every session gets its own
//! [`SessionEmitter`], and closing that emitter is the same atomic step as
//! sending `Terminated`. After that nothing from the session can reach the
//! consumer, even if a stray polling task is still running.

use crate::measurement::MeasurementEvent;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;

/// Returned when an event can no longer be delivered.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("Result sink closed")]
pub struct SinkClosed;

/// Create a connected producer/consumer pair.
pub fn result_sink() -> (ResultSink, EventStream) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ResultSink { tx }, EventStream { rx })
}

/// Producer side shared by all sessions of one scheduler.
#[derive(Clone, Debug)]
pub struct ResultSink {
    tx: mpsc::UnboundedSender<MeasurementEvent>,
}

impl ResultSink {
    /// A fresh emitter for a new session.
    pub fn session_emitter(&self) -> SessionEmitter {
        SessionEmitter {
            tx: Arc::new(Mutex::new(Some(self.tx.clone()))),
        }
    }
}

/// Per-session producer. Clones share the same open/closed state.
#[derive(Clone, Debug)]
pub struct SessionEmitter {
    tx: Arc<Mutex<Option<mpsc::UnboundedSender<MeasurementEvent>>>>,
}

impl SessionEmitter {
    /// Deliver one event. Never blocks.
    ///
    /// Fails once the session was terminated or the consumer went away.
    pub fn emit(&self, event: MeasurementEvent) -> Result<(), SinkClosed> {
        let guard = self.tx.lock().unwrap_or_else(|e| e.into_inner());
        match guard.as_ref() {
            Some(tx) => tx.send(event).map_err(|_| SinkClosed),
            None => Err(SinkClosed),
        }
    }

    /// Send `Terminated` and close the emitter.
    ///
    /// Returns true only for the call that actually terminated the session.
    pub fn terminate(&self) -> bool {
        let mut guard = self.tx.lock().unwrap_or_else(|e| e.into_inner());
        match guard.take() {
            Some(tx) => {
                if tx.send(MeasurementEvent::Terminated).is_err() {
                    tracing::debug!("Event consumer gone; Terminated not delivered");
                }
                true
            }
            None => false,
        }
    }

    /// True once `Terminated` was sent for this session.
    pub fn is_terminated(&self) -> bool {
        self.tx.lock().unwrap_or_else(|e| e.into_inner()).is_none()
    }
}

/// Consumer side, owned by the presentation layer.
#[derive(Debug)]
pub struct EventStream {
    rx: mpsc::UnboundedReceiver<MeasurementEvent>,
}

impl EventStream {
    /// Non-blocking poll for a UI event loop.
    pub fn try_recv(&mut self) -> Option<MeasurementEvent> {
        match self.rx.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Wait for the next event. `None` once the scheduler is gone and the queue is empty.
    pub async fn recv(&mut self) -> Option<MeasurementEvent> {
        self.rx.recv().await
    }

    /// Wait at most `timeout` for the next event.
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Option<MeasurementEvent> {
        tokio::time::timeout(timeout, self.rx.recv())
            .await
            .ok()
            .flatten()
    }

    /// Take everything currently queued.
    pub fn drain(&mut self) -> Vec<MeasurementEvent> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measurement::MeasurementKind;

    #[test]
    fn test_events_arrive_in_order() {
        let (sink, mut stream) = result_sink();
        let emitter = sink.session_emitter();

        emitter
            .emit(MeasurementEvent::Overload {
                kind: MeasurementKind::Resistance,
            })
            .unwrap();
        emitter
            .emit(MeasurementEvent::Error {
                message: "timeout".into(),
            })
            .unwrap();
        assert!(emitter.terminate());

        let events = stream.drain();
        assert_eq!(events.len(), 3);
        assert!(matches!(events[0], MeasurementEvent::Overload { .. }));
        assert!(matches!(events[1], MeasurementEvent::Error { .. }));
        assert_eq!(events[2], MeasurementEvent::Terminated);
    }

    #[test]
    fn test_terminate_is_once_and_closes_emitter() {
        let (sink, mut stream) = result_sink();
        let emitter = sink.session_emitter();
        let clone = emitter.clone();

        assert!(emitter.terminate());
        assert!(!clone.terminate());
        assert!(clone.is_terminated());
        assert_eq!(
            clone.emit(MeasurementEvent::Error {
                message: "late".into()
            }),
            Err(SinkClosed)
        );

        assert_eq!(stream.drain(), vec![MeasurementEvent::Terminated]);
    }

    #[test]
    fn test_sessions_are_independent() {
        let (sink, mut stream) = result_sink();
        let first = sink.session_emitter();
        first.terminate();

        let second = sink.session_emitter();
        second
            .emit(MeasurementEvent::Error {
                message: "second".into(),
            })
            .unwrap();
        assert_eq!(stream.drain().len(), 2);
    }

    #[tokio::test]
    async fn test_recv_timeout_on_empty_stream() {
        let (sink, mut stream) = result_sink();
        assert!(stream
            .recv_timeout(Duration::from_millis(20))
            .await
            .is_none());

        sink.session_emitter().terminate();
        assert_eq!(stream.recv().await, Some(MeasurementEvent::Terminated));
    }
}
