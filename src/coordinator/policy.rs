use std::collections::BTreeMap;

/// The number of steps which must pass after an assignment before load skew may trigger a rebalance.
pub const SKEW_COOLDOWN_STEPS: u64 = 10;

/// A view of the cluster used for rebalance decisions, taken between steps.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ClusterState {
    /// The number of registered workers.
    pub workers: usize,
    /// The number of workers the run is configured for.
    pub expected_workers: usize,
    /// Whether the registered workers differ from the ones holding the current workareas.
    pub churned: bool,
    /// The number of steps completed since the current workareas were assigned.
    pub steps_since_assignment: u64,
    /// The vehicle count of each worker in the last completed step.
    pub vehicles: BTreeMap<String, u64>,
}

impl ClusterState {
    /// The ratio of the largest vehicle count to the mean, if any vehicles were reported.
    pub fn skew(&self) -> Option<f64> {
        let total: u64 = self.vehicles.values().sum();
        let max = self.vehicles.values().copied().max()?;
        if total == 0 {
            return None;
        }
        let mean = total as f64 / self.vehicles.len() as f64;
        Some(max as f64 / mean)
    }
}

/// A decision point for when workareas are recomputed.
pub trait RebalancePolicy: Send + Sync + 'static {
    /// Decide if workareas should be recomputed given the current cluster state.
    ///
    /// When this returns `false` for a churned cluster, no further steps are issued until the
    /// policy agrees to rebalance.
    fn should_rebalance(&self, state: &ClusterState) -> bool;
}

/// Rebalances on worker churn, and on vehicle skew above an optional threshold.
#[derive(Clone, Debug, Default)]
pub struct DefaultRebalancePolicy {
    /// The max/mean vehicle ratio above which to rebalance.
    pub skew: Option<f64>,
}

impl DefaultRebalancePolicy {
    pub fn new(skew: Option<f64>) -> Self {
        Self { skew }
    }
}

impl RebalancePolicy for DefaultRebalancePolicy {
    fn should_rebalance(&self, state: &ClusterState) -> bool {
        if state.churned {
            return true;
        }
        match (self.skew, state.skew()) {
            (Some(threshold), Some(skew)) => state.steps_since_assignment >= SKEW_COOLDOWN_STEPS && skew > threshold,
            _ => false,
        }
    }
}
