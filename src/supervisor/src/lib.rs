#![deny(warnings)]

//! Launch and lifecycle supervision for a GPU-backed inference engine.
//!
//! The supervisor resolves a declarative environment configuration into a
//! validated [`config::LaunchConfiguration`], reserves GPU devices, verifies
//! the service endpoints, starts the engine as an owned child process, and
//! applies a bounded-retry restart policy on failure. The engine itself is
//! an opaque long-running process; nothing here interprets its API.

mod builder;
pub mod config;
pub mod error;
mod launcher;
mod supervisor;

pub use builder::Builder;
pub use error::Error;
pub use launcher::{
    engine_args, EngineCommand, Endpoints, ServiceProcess, MANAGEMENT_PORT, SERVICE_PORT,
};
pub use supervisor::{RestartPolicy, ShutdownHandle, State, Supervisor};
