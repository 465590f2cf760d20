use anyhow::Result;

use crate::models::Workarea;

/// The motion model which advances the vehicles of a workarea.
///
/// Simulation is CPU bound, so steps are executed on the blocking pool.
pub trait Simulator: Send + 'static {
    /// Simulate one global step over the given workarea, returning the resulting vehicle count.
    fn simulate_step(&mut self, workarea: &Workarea, step: u64) -> Result<u64>;
}

/// A simulator without vehicles.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopSimulator;

impl Simulator for NoopSimulator {
    fn simulate_step(&mut self, workarea: &Workarea, step: u64) -> Result<u64> {
        tracing::trace!(step, cells = workarea.cells.len(), "simulating step without vehicles");
        Ok(0)
    }
}
