//! Error taxonomy for the launch/supervision contract.
//!
//! Configuration and resource errors happen before the engine starts and
//! are never retried; crash and budget errors come out of the restart loop.

use std::io;
use thiserror::Error;

/// Everything that can go wrong between reading the environment and the
/// supervisor giving up on the engine.
#[derive(Debug, Error)]
pub enum Error {
    /// A required environment variable is absent (or blank).
    #[error("missing configuration: {0} is required")]
    MissingConfiguration(&'static str),

    /// An environment variable is present but unusable.
    #[error("invalid configuration: {field}={raw:?}: {reason}")]
    InvalidConfiguration {
        /// Environment variable name.
        field: &'static str,
        /// The raw value as read.
        raw: String,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// The host has fewer GPUs than the launch requires.
    #[error("insufficient resources: requested {requested} GPUs, host has {available}")]
    InsufficientResources {
        /// Devices the launch asked for.
        requested: usize,
        /// Devices the host actually has.
        available: usize,
    },

    /// A required TCP endpoint is already taken on the host.
    #[error("port {0} is already in use")]
    PortBindingFailed(u16),

    /// The engine process exited with a non-zero status or on a signal.
    #[error("engine process crashed (exit code {exit_code:?})")]
    ChildProcessCrashed {
        /// Exit code, None when killed by a signal.
        exit_code: Option<i32>,
    },

    /// Too many consecutive crashes without a stable run in between.
    #[error(
        "retry budget exhausted after {failures} consecutive engine failures \
         (last exit code {exit_code:?})"
    )]
    RetryBudgetExhausted {
        /// Consecutive failures observed.
        failures: u32,
        /// Exit code of the final attempt.
        exit_code: Option<i32>,
        /// Recent engine output captured before the final crash.
        log_tail: Vec<String>,
    },

    /// Host-level I/O failure (spawn, cache directory, device probe).
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl From<gpu_inventory::Error> for Error {
    fn from(e: gpu_inventory::Error) -> Self {
        match e {
            gpu_inventory::Error::Io(e) => Error::Io(e),
            gpu_inventory::Error::Insufficient {
                requested,
                available,
            } => Error::InsufficientResources {
                requested,
                available,
            },
        }
    }
}
