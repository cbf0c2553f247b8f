//! Measurement vocabulary shared by instruments, the scheduler and consumers.

pub mod event;
pub mod kind;

pub use event::{MeasurementEvent, DEFAULT_OVERLOAD_THRESHOLD_OHMS};
pub use kind::{MeasurementKind, ParseKindError};
