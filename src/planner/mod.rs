//! Partition planning.
//!
//! Planning turns the cell collection into one workarea per worker: the cell graph is built,
//! handed to a `Partitioner`, and the resulting vertex sets are mapped back onto cells and
//! zipped with the worker list. Partitioning itself is delegated; the default partitioner shells
//! out to an external solver, see the `metis` module.

mod assignment;
mod metis;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;

use crate::error::PlanningError;
use crate::graph::{CellGraph, VertexId};
use crate::models::{CellCollection, Workarea};

pub use assignment::{balance, PartitionMap};
pub use metis::MetisPartitioner;

const METRIC_PLANNING_SECONDS: &str = "traffic_grid_planning_seconds";

/// A set of vertices assigned to the same partition.
pub type Partition = BTreeSet<VertexId>;

/// A type capable of computing a balanced partition of a cell graph.
#[async_trait]
pub trait Partitioner: Send + Sync + 'static {
    /// Partition the vertices of the given graph into `parts` sets.
    ///
    /// Implementations are not required to be deterministic. The output is validated by
    /// `compute_partitions`, so implementations may return fewer sets than requested when
    /// trailing partitions are empty.
    async fn partition(&self, graph: &CellGraph, parts: usize) -> Result<Vec<Partition>, PlanningError>;
}

/// Compute exactly `parts` disjoint partitions covering every vertex of the given graph.
///
/// Graphs with no more vertices than requested partitions, and single partition requests, are
/// resolved without consulting the partitioner. Otherwise no returned partition is empty: any
/// partition the partitioner left empty receives a vertex from the largest partition.
pub async fn compute_partitions(partitioner: &dyn Partitioner, graph: &CellGraph, parts: usize) -> Result<Vec<Partition>, PlanningError> {
    if parts == 0 {
        return Err(PlanningError::NoPartitions);
    }
    if parts == 1 {
        return Ok(vec![graph.vertices().collect()]);
    }
    if graph.vertex_count() <= parts {
        let mut partitions = vec![Partition::new(); parts];
        for (partition, vertex) in partitions.iter_mut().zip(graph.vertices()) {
            partition.insert(vertex);
        }
        return Ok(partitions);
    }

    let mut partitions = partitioner.partition(graph, parts).await?;
    let extra = partitions
        .iter()
        .enumerate()
        .skip(parts)
        .find_map(|(partition, vertices)| vertices.iter().next().map(|vertex| (partition, *vertex)));
    if let Some((partition, vertex)) = extra {
        return Err(PlanningError::PartitionOutOfRange { vertex, partition, parts });
    }
    partitions.truncate(parts);
    partitions.resize_with(parts, Partition::new);

    // Every vertex must be covered by exactly one partition.
    let mut seen = BTreeSet::new();
    for vertex in partitions.iter().flatten() {
        if graph.cell_of(*vertex).is_none() {
            return Err(PlanningError::UnknownVertex(*vertex));
        }
        if !seen.insert(*vertex) {
            return Err(PlanningError::VertexCountMismatch {
                expected: graph.vertex_count(),
                found: partitions.iter().map(BTreeSet::len).sum(),
            });
        }
    }
    if seen.len() != graph.vertex_count() {
        return Err(PlanningError::VertexCountMismatch {
            expected: graph.vertex_count(),
            found: seen.len(),
        });
    }
    fill_empty_partitions(&mut partitions);
    Ok(partitions)
}

/// Move one vertex from the largest partition into each empty partition.
///
/// With at least as many vertices as partitions, the largest partition holds two or more
/// vertices while any partition is empty.
fn fill_empty_partitions(partitions: &mut [Partition]) {
    for empty in 0..partitions.len() {
        if !partitions[empty].is_empty() {
            continue;
        }
        let donor = match (0..partitions.len()).max_by_key(|idx| partitions[*idx].len()) {
            Some(donor) if partitions[donor].len() > 1 => donor,
            _ => return,
        };
        if let Some(vertex) = partitions[donor].iter().next_back().copied() {
            partitions[donor].remove(&vertex);
            partitions[empty].insert(vertex);
            tracing::debug!(vertex, from = donor, to = empty, "moved vertex into empty partition");
        }
    }
}

/// Computes workareas for a set of workers.
#[derive(Clone)]
pub struct Planner {
    partitioner: Arc<dyn Partitioner>,
}

impl Planner {
    /// Create a new instance.
    pub fn new(partitioner: Arc<dyn Partitioner>) -> Self {
        metrics::register_histogram!(METRIC_PLANNING_SECONDS, metrics::Unit::Seconds, "duration of partition planning runs");
        Self { partitioner }
    }

    /// Compute one workarea per given worker, in worker order, covering all given cells.
    #[tracing::instrument(level = "debug", skip(self, cells, workers), fields(cells = cells.len(), workers = workers.len()))]
    pub async fn plan(&self, cells: &CellCollection, workers: &[String]) -> Result<Vec<Workarea>, PlanningError> {
        let start = Instant::now();
        let graph = CellGraph::build(cells);
        tracing::debug!(vertices = graph.vertex_count(), edges = graph.edge_count(), "cell graph built");
        let partitions = compute_partitions(self.partitioner.as_ref(), &graph, workers.len()).await?;
        let workareas = balance(&graph, &partitions)?.assign(workers)?;
        metrics::histogram!(METRIC_PLANNING_SECONDS, start.elapsed().as_secs_f64());
        Ok(workareas)
    }
}
