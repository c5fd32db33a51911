//! Error types for simbus.
//!
//! Every fallible operation in the crate returns [`Result`]. Call sites
//! log context (element name, port name, time) and surface the error
//! upward; there is no unwinding-based error flow.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SimbusError {
    /// Malformed model input, unknown port, type mismatch at setup,
    /// duplicate port name, min > max, illegal coupling method.
    /// Fatal at setup time; no partial run is attempted.
    #[error("configuration error: {0}")]
    Config(String),

    /// An element step, connection update, strict-NaN check or storage
    /// write failed mid-run. The simulation aborts; backends are still
    /// given a chance to finalise what was already written.
    #[error("runtime error: {0}")]
    Runtime(String),

    #[error("port error: {0}")]
    Port(String),

    #[error("connection error: {0}")]
    Connection(String),

    /// Dependency analysis failed (e.g. no connection of an algebraic
    /// loop may be decoupled).
    #[error("scheduling error: {0}")]
    Scheduling(String),

    #[error("storage error: {0}")]
    Storage(String),

    /// SIGINT/SIGTERM received; the run terminated cleanly at the next
    /// synchronisation-step boundary.
    #[error("simulation interrupted")]
    Interrupted,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type that uses SimbusError
pub type Result<T> = std::result::Result<T, SimbusError>;
