//! Runtime configuration.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::error::ConfigurationError;

/// The role this process plays in the cluster.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Partitions the road network and keeps workers in lock-step.
    Coordinator,
    /// Simulates the cells of its assigned workarea.
    Worker,
}

/// What the coordinator does when a worker disconnects while the simulation is running.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DisconnectPolicy {
    /// Stop issuing steps until a replacement worker joins, then rebalance.
    Stall,
    /// Rebalance over the remaining live workers right away.
    Rebalance,
}

impl Default for DisconnectPolicy {
    fn default() -> Self {
        Self::Stall
    }
}

/// Runtime configuration data.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// The server's logging config, which uses Rust's `env_logger` directives.
    #[serde(default = "Config::default_rust_log")]
    pub rust_log: String,
    /// The role of this process.
    pub role: Role,

    /// The host on which the coordinator is reachable.
    #[serde(default = "Config::default_host")]
    pub coordinator_host: String,
    /// The well-known port on which the coordinator listens for workers.
    #[serde(default = "Config::default_coordinator_port")]
    pub coordinator_port: u16,
    /// The number of workers the coordinator partitions the network for.
    #[serde(default = "Config::default_worker_count")]
    pub worker_count: usize,
    /// Worker addresses which the coordinator dials instead of waiting for them to connect.
    #[serde(default)]
    pub dial_workers: Vec<String>,

    /// The unique name of this worker.
    #[serde(default)]
    pub worker_name: Option<String>,
    /// The host on which this worker is reachable.
    #[serde(default = "Config::default_host")]
    pub worker_host: String,
    /// The port on which this worker is reachable.
    #[serde(default = "Config::default_worker_port")]
    pub worker_port: u16,
    /// Accept a connection from the coordinator instead of dialing it.
    #[serde(default)]
    pub worker_listen: bool,
    /// The number of reconnection attempts a worker makes after losing the coordinator.
    #[serde(default = "Config::default_reconnect_attempts")]
    pub reconnect_attempts: u32,

    /// The path to the JSON document describing the cells of the road network.
    #[serde(default = "Config::default_network_path")]
    pub network_path: String,

    /// The command used to invoke the external partitioning solver.
    ///
    /// The value is split on whitespace; the first token is the program, the remainder are
    /// passed ahead of the generated arguments.
    #[serde(default = "Config::default_solver_command")]
    pub solver_command: String,
    /// The number of seconds to wait for the solver before treating it as failed.
    #[serde(default = "Config::default_solver_timeout_seconds")]
    pub solver_timeout_seconds: u64,
    /// The allowed load imbalance, in thousandths above perfect balance.
    #[serde(default = "Config::default_solver_imbalance")]
    pub solver_imbalance: u32,
    /// The number of refinement iterations the solver performs.
    #[serde(default = "Config::default_solver_iterations")]
    pub solver_iterations: u32,
    /// The number of partitionings the solver computes, keeping the best.
    #[serde(default = "Config::default_solver_cuts")]
    pub solver_cuts: u32,

    /// The number of seconds a worker may take to complete a step before being dropped.
    #[serde(default = "Config::default_liveness_timeout_seconds")]
    pub liveness_timeout_seconds: u64,
    /// The initial pacing delay, in milliseconds, workers apply before each step.
    #[serde(default)]
    pub step_delay_ms: u64,
    /// The coordinator's reaction to a worker disconnecting mid-run.
    #[serde(default)]
    pub on_disconnect: DisconnectPolicy,
    /// The max/mean vehicle ratio above which the coordinator rebalances.
    #[serde(default)]
    pub rebalance_skew: Option<f64>,
    /// The number of steps after which the run ends.
    #[serde(default)]
    pub max_steps: Option<u64>,
}

impl Config {
    /// Create a new config instance.
    ///
    /// Currently this routine just parses the runtime environment and builds the application
    /// config from that.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Result<Self> {
        let config: Config = envy::from_env().context("error building config from env")?;
        config.validate()?;
        Ok(config)
    }

    /// Build a config from the given key/value pairs, as if they were environment variables.
    #[cfg(test)]
    pub fn new_test(vars: &[(&str, &str)]) -> Result<Self> {
        let config: Config = envy::from_iter(vars.iter().map(|(key, val)| (key.to_string(), val.to_string())))
            .context("error building test config")?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the relationships between config values which serde can not express.
    pub fn validate(&self) -> std::result::Result<(), ConfigurationError> {
        if self.solver_command.split_whitespace().next().is_none() {
            return Err(ConfigurationError::EmptySolverCommand);
        }
        match self.role {
            Role::Coordinator if self.worker_count == 0 => Err(ConfigurationError::InvalidWorkerCount(self.worker_count)),
            Role::Worker if self.worker_name.as_deref().map(str::trim).unwrap_or_default().is_empty() => Err(ConfigurationError::MissingWorkerName),
            _ => Ok(()),
        }
    }

    /// The address the coordinator listens on, or workers dial.
    pub fn coordinator_addr(&self) -> String {
        format!("{}:{}", self.coordinator_host, self.coordinator_port)
    }

    /// The bound on a single solver invocation.
    pub fn solver_timeout(&self) -> Duration {
        Duration::from_secs(self.solver_timeout_seconds)
    }

    /// The bound on a worker's step completion.
    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_secs(self.liveness_timeout_seconds)
    }

    fn default_rust_log() -> String {
        "info".into()
    }

    fn default_host() -> String {
        "127.0.0.1".into()
    }

    fn default_coordinator_port() -> u16 {
        7070
    }

    fn default_worker_port() -> u16 {
        7071
    }

    fn default_worker_count() -> usize {
        1
    }

    fn default_reconnect_attempts() -> u32 {
        5
    }

    fn default_network_path() -> String {
        "network.json".into()
    }

    fn default_solver_command() -> String {
        "gpmetis".into()
    }

    fn default_solver_timeout_seconds() -> u64 {
        300
    }

    fn default_solver_imbalance() -> u32 {
        30
    }

    fn default_solver_iterations() -> u32 {
        10
    }

    fn default_solver_cuts() -> u32 {
        1
    }

    fn default_liveness_timeout_seconds() -> u64 {
        30
    }
}
