//! Builder for the Supervisor, caller should provide the resolved
//! configuration and the engine command line.

use crate::config::LaunchConfiguration;
use crate::launcher::{EngineCommand, Endpoints};
use crate::supervisor::{RestartPolicy, ShutdownHandle, State, Supervisor};
use gpu_inventory::{GpuInventory, NvidiaProcInventory};
use std::path::PathBuf;
use tokio::sync::watch;

/// Builder for the lifecycle supervisor
pub struct Builder {
    config: Option<LaunchConfiguration>,
    command: Option<EngineCommand>,
    endpoints: Endpoints,
    policy: RestartPolicy,
    inventory: Option<Box<dyn GpuInventory + Send>>,
    cache_dir: PathBuf,
}

macro_rules! config {
    ($name:ident, $t: ty, $comment: literal) => {
        #[doc=$comment]
        pub fn $name(mut self, $name: $t) -> Self {
            self.$name = $name;
            self
        }
    };
}

impl Default for Builder {
    fn default() -> Self {
        Builder {
            config: None,
            command: None,
            endpoints: Endpoints::default(),
            policy: RestartPolicy::default(),
            inventory: None,
            cache_dir: PathBuf::from("/root/.cache/huggingface"),
        }
    }
}

impl Builder {
    /// Create a new builder with default configuration
    pub fn new() -> Self {
        Builder::default()
    }

    config!(endpoints, Endpoints, "Service and management ports the engine must own");
    config!(policy, RestartPolicy, "Bounded-retry restart policy");
    config!(cache_dir, PathBuf, "Host-mounted model weight cache path");

    /// The validated launch configuration. Required.
    pub fn configuration(mut self, config: LaunchConfiguration) -> Self {
        self.config = Some(config);
        self
    }

    /// The engine program and leading arguments. Required.
    pub fn command(mut self, command: EngineCommand) -> Self {
        self.command = Some(command);
        self
    }

    /// GPU inventory source; defaults to the NVIDIA procfs listing.
    pub fn inventory<I>(mut self, inventory: I) -> Self
    where
        I: 'static + GpuInventory + Send,
    {
        self.inventory = Some(Box::new(inventory));
        self
    }

    /// Build the supervisor and the handle that requests its shutdown.
    pub fn build(self) -> (Supervisor, ShutdownHandle) {
        let (tx, rx) = watch::channel(false);
        let inventory = self
            .inventory
            .unwrap_or_else(|| Box::new(NvidiaProcInventory::default()));
        let supervisor = Supervisor {
            config: self.config.unwrap(),
            command: self.command.unwrap(),
            endpoints: self.endpoints,
            policy: self.policy,
            inventory,
            cache_dir: self.cache_dir,
            shutdown: rx,
            state: State::Starting,
        };
        (supervisor, ShutdownHandle::new(tx))
    }
}
