//! The restart supervisor: a single task driving the engine through
//! Starting -> Running -> Failed -> Restarting -> Stopped.
//!
//! The loop only ever suspends on the child's exit or the shutdown edge,
//! whichever fires first; the restart delay is raced against shutdown so a
//! stop request is never held up by policy timers.

use crate::config::LaunchConfiguration;
use crate::error::Error;
use crate::launcher::{self, EngineCommand, Endpoints};
use gpu_inventory::GpuInventory;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// Lifecycle states. `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Resolving resources and launching the engine.
    Starting,
    /// Engine process is alive.
    Running,
    /// Engine exited abnormally; deciding whether to retry.
    Failed,
    /// Waiting out the restart delay.
    Restarting,
    /// Terminal: clean shutdown or a fatal error.
    Stopped,
}

/// Bounded-retry restart policy.
///
/// `retry_limit` counts consecutive failures; a run lasting `min_uptime`
/// resets the counter, so a long-stable engine gets its full budget back.
#[derive(Debug, Clone, Copy)]
pub struct RestartPolicy {
    /// Consecutive failures tolerated before giving up.
    pub retry_limit: u32,
    /// Pause between a failure and the next launch attempt.
    pub restart_delay: Duration,
    /// Uptime after which the failure counter resets.
    pub min_uptime: Duration,
    /// How long a shutdown waits for the engine before killing it.
    pub grace_period: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        RestartPolicy {
            retry_limit: 5,
            restart_delay: Duration::from_secs(2),
            min_uptime: Duration::from_secs(30),
            grace_period: Duration::from_secs(10),
        }
    }
}

/// Requests a clean stop of the supervisor.
///
/// Dropping the last handle also counts as a shutdown request.
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: watch::Sender<bool>,
}

impl ShutdownHandle {
    pub(crate) fn new(tx: watch::Sender<bool>) -> Self {
        ShutdownHandle { tx }
    }

    /// Trip the shutdown edge. Idempotent.
    pub fn shutdown(&self) {
        let _ = self.tx.send(true);
    }
}

/// Owns the engine child process for its entire lifetime and applies the
/// restart policy. Built via [`crate::Builder`].
pub struct Supervisor {
    pub(crate) config: LaunchConfiguration,
    pub(crate) command: EngineCommand,
    pub(crate) endpoints: Endpoints,
    pub(crate) policy: RestartPolicy,
    pub(crate) inventory: Box<dyn GpuInventory + Send>,
    pub(crate) cache_dir: PathBuf,
    pub(crate) shutdown: watch::Receiver<bool>,
    pub(crate) state: State,
}

impl Supervisor {
    /// Current lifecycle state.
    pub fn state(&self) -> State {
        self.state
    }

    fn set_state(&mut self, state: State) {
        if self.state != state {
            log::debug!("state {:?} -> {:?}", self.state, state);
            self.state = state;
        }
    }

    fn shutdown_requested(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Drive the engine until a clean stop or a fatal error.
    ///
    /// Pre-launch failures (reservation, ports, spawn) are returned
    /// immediately and never retried: the inputs are unchanged, so a retry
    /// would fail identically.
    pub async fn run(&mut self) -> Result<(), Error> {
        let mut failures: u32 = 0;
        loop {
            self.set_state(State::Starting);
            if self.shutdown_requested() {
                self.set_state(State::Stopped);
                return Ok(());
            }

            // Re-validated on every attempt: a device may have gone away
            // since the last launch.
            let reservation =
                gpu_inventory::reserve(self.inventory.as_ref(), self.config.gpu_count)?;
            match &reservation {
                Some(r) => log::info!("reserved GPUs [{}]", r.visible_devices()),
                None => log::info!("CPU-only launch, no GPU reservation"),
            }
            launcher::preflight(&self.endpoints)?;

            let mut process = launcher::spawn_engine(
                &self.command,
                &self.config,
                &self.endpoints,
                reservation.as_ref(),
                &self.cache_dir,
            )?;
            log::info!(
                "engine started (pid {:?}, service port {}, management port {})",
                process.id(),
                self.endpoints.service_port,
                self.endpoints.management_port
            );
            self.set_state(State::Running);
            let started = Instant::now();

            tokio::select! {
                status = process.wait() => {
                    let status = status?;
                    if status.success() {
                        log::info!("engine exited cleanly, stopping");
                        self.set_state(State::Stopped);
                        return Ok(());
                    }
                    self.set_state(State::Failed);
                    let exit_code = status.code();
                    if started.elapsed() >= self.policy.min_uptime {
                        failures = 0;
                    }
                    failures += 1;
                    let crash = Error::ChildProcessCrashed { exit_code };
                    log::warn!("{} ({} consecutive failures)", crash, failures);
                    if failures >= self.policy.retry_limit {
                        self.set_state(State::Stopped);
                        return Err(Error::RetryBudgetExhausted {
                            failures,
                            exit_code,
                            log_tail: process.log_tail(),
                        });
                    }
                    self.set_state(State::Restarting);
                    tokio::select! {
                        _ = tokio::time::sleep(self.policy.restart_delay) => {}
                        _ = self.shutdown.changed() => {
                            log::info!("shutdown requested during restart delay");
                            self.set_state(State::Stopped);
                            return Ok(());
                        }
                    }
                }
                _ = self.shutdown.changed() => {
                    log::info!("shutdown requested, terminating engine");
                    process.terminate(self.policy.grace_period).await;
                    self.set_state(State::Stopped);
                    return Ok(());
                }
            }
        }
    }
}
