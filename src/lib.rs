//! Core library of the `dmm_daq` multimeter control application.
//!
//! The centrepiece is the [`scheduler::PollingScheduler`], which runs one
//! background polling session at a time against a shared instrument
//! connection and delivers results through an ordered event stream. Around it:
//!
//! - [`instrument`]: the blocking instrument port, SCPI driver, socket transport
//!   and a simulated meter
//! - [`measurement`]: measurement kinds and the events a session produces
//! - [`config`]: figment-based settings
//! - [`error`]: error types of every operation surface

pub mod config;
pub mod error;
pub mod instrument;
pub mod measurement;
pub mod scheduler;
