use std::collections::{BTreeMap, BTreeSet};

use crate::error::PlanningError;
use crate::graph::CellGraph;
use crate::models::{CellId, Workarea};
use crate::planner::Partition;

/// A mapping of group id to the cells of that group.
///
/// Group ids start at 1 and follow the order of the partitions the map was built from.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PartitionMap {
    groups: BTreeMap<usize, BTreeSet<CellId>>,
}

impl PartitionMap {
    #[cfg(test)]
    pub fn group(&self, id: usize) -> Option<&BTreeSet<CellId>> {
        self.groups.get(&id)
    }

    /// Iterate over all groups in ascending group id order.
    pub fn groups(&self) -> impl Iterator<Item = (usize, &BTreeSet<CellId>)> {
        self.groups.iter().map(|(id, cells)| (*id, cells))
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    /// Zip the groups of this map with the given workers, producing one workarea per worker.
    ///
    /// Fails when the number of workers differs from the number of groups, as cells would
    /// otherwise be left without an owner.
    pub fn assign(&self, workers: &[String]) -> Result<Vec<Workarea>, PlanningError> {
        if workers.len() != self.len() {
            return Err(PlanningError::WorkerCountMismatch {
                partitions: self.len(),
                workers: workers.len(),
            });
        }
        Ok(workers
            .iter()
            .zip(self.groups())
            .map(|(worker, (_, cells))| Workarea::new(worker.clone(), cells.clone()))
            .collect())
    }
}

/// Map each partition's vertices back onto the cells they were built from.
pub fn balance(graph: &CellGraph, partitions: &[Partition]) -> Result<PartitionMap, PlanningError> {
    let mut groups = BTreeMap::new();
    for (idx, partition) in partitions.iter().enumerate() {
        let cells = partition
            .iter()
            .map(|vertex| graph.cell_of(*vertex).ok_or(PlanningError::UnknownVertex(*vertex)))
            .collect::<Result<BTreeSet<_>, _>>()?;
        groups.insert(idx + 1, cells);
    }
    Ok(PartitionMap { groups })
}
