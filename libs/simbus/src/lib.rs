//! simbus — a co-simulation master.
//!
//! simbus advances a network of heterogeneous simulation elements over a
//! shared time axis. Each element exposes named, typed input and output
//! ports on a [`core::databus::Databus`]; directed
//! [`core::connection::Connection`]s move values between ports through
//! inter-/extrapolation filters; the dependency analyser orders elements
//! (breaking algebraic loops by decoupling connections); one of three
//! stepping drivers advances every element across each synchronisation
//! step; and sampled port values are fanned out to result backends.
//!
//! The crate splits into:
//!
//! - [`core`] — channel values, filters, conversions, ports, databus,
//!   connections, dependency ordering, the element trait and harness,
//!   model assembly and the task loop;
//! - [`steptypes`] — the sequential, parallel single-threaded and
//!   parallel multithreaded drivers;
//! - [`storage`] — per-element result buffers and the CSV backend;
//! - [`input`] — the declarative model-file structures and reader;
//! - [`elements`] — the built-in analytic elements (constant,
//!   integrator, gain, sum, sinus generator, passthrough).

pub mod core;
pub mod elements;
pub mod input;
pub mod steptypes;
pub mod storage;

pub use crate::core::error::{Result, SimbusError};
pub use crate::core::model::Model;
pub use crate::core::task::{Task, TaskOutcome};
