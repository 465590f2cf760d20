//! The cell graph.
//!
//! Vertices are cells, numbered from 1 as the external solver rejects a zero vertex id. The
//! weight of a vertex is the lane length of its cell, and edges join cells which have at least
//! one road crossing between them, weighted by the total lane count of those roads.

#[cfg(test)]
mod mod_test;

use std::collections::{BTreeMap, HashMap};
use std::fmt::Write;

use crate::models::{CellCollection, CellId};

/// The index of a vertex in a cell graph, starting at 1.
pub type VertexId = u32;

/// The format flag of the solver input header, declaring vertex and edge weights.
const SOLVER_FORMAT_WEIGHTED: &str = "011";

/// A simple undirected weighted graph over cells.
#[derive(Clone, Debug, Default)]
pub struct CellGraph {
    /// The cell of each vertex, indexed by `vertex - 1`.
    cells: Vec<CellId>,
    /// The weight of each vertex, indexed by `vertex - 1`.
    weights: Vec<u64>,
    /// The neighbours of each vertex along with the edge weight, indexed by `vertex - 1`.
    ///
    /// Each undirected edge is present in the adjacency of both of its endpoints.
    adjacency: Vec<BTreeMap<VertexId, u64>>,
    /// The vertex of each cell.
    vertices: HashMap<CellId, VertexId>,
}

impl CellGraph {
    /// Build the graph of the given cells.
    ///
    /// Vertices are numbered in ascending cell id order so that repeated builds over the same
    /// cells produce identical graphs. Edges leaving the given cells are ignored, as are edges
    /// within a single cell.
    pub fn build(cells: &CellCollection) -> Self {
        let mut graph = Self::default();
        for cell in cells.iter() {
            graph.cells.push(cell.id);
            graph.weights.push(vertex_weight(cell.lane_length));
            graph.adjacency.push(BTreeMap::new());
            graph.vertices.insert(cell.id, graph.cells.len() as VertexId);
        }

        // Accumulate lanes per unordered vertex pair, so that A->B and B->A share one edge.
        let mut links: BTreeMap<(VertexId, VertexId), u64> = BTreeMap::new();
        for cell in cells.iter() {
            let start = match graph.vertices.get(&cell.id) {
                Some(start) => *start,
                None => continue,
            };
            for edge in cell.edges() {
                let end = match graph.vertices.get(&edge.end_cell) {
                    Some(end) => *end,
                    None => continue,
                };
                if start == end {
                    continue;
                }
                let key = if start < end { (start, end) } else { (end, start) };
                *links.entry(key).or_default() += u64::from(edge.lanes);
            }
        }

        for ((low, high), weight) in links.into_iter().filter(|(_, weight)| *weight > 0) {
            graph.adjacency[low as usize - 1].insert(high, weight);
            graph.adjacency[high as usize - 1].insert(low, weight);
        }
        graph
    }

    pub fn vertex_count(&self) -> usize {
        self.cells.len()
    }

    /// The number of undirected edges.
    pub fn edge_count(&self) -> usize {
        self.adjacency.iter().map(BTreeMap::len).sum::<usize>() / 2
    }

    /// Iterate over all vertex ids in ascending order.
    pub fn vertices(&self) -> impl Iterator<Item = VertexId> {
        1..=(self.cells.len() as VertexId)
    }

    pub fn vertex_weight(&self, vertex: VertexId) -> Option<u64> {
        self.slot(vertex).map(|idx| self.weights[idx])
    }

    /// The weight of the edge between the given vertices, in either order.
    #[cfg(test)]
    pub fn edge_weight(&self, a: VertexId, b: VertexId) -> Option<u64> {
        self.slot(a).and_then(|idx| self.adjacency[idx].get(&b).copied())
    }

    /// The neighbours of the given vertex along with the weight of the connecting edge.
    pub fn neighbours(&self, vertex: VertexId) -> impl Iterator<Item = (VertexId, u64)> + '_ {
        self.slot(vertex)
            .into_iter()
            .flat_map(move |idx| self.adjacency[idx].iter().map(|(vertex, weight)| (*vertex, *weight)))
    }

    /// The cell represented by the given vertex.
    pub fn cell_of(&self, vertex: VertexId) -> Option<CellId> {
        self.slot(vertex).map(|idx| self.cells[idx])
    }

    /// The vertex representing the given cell.
    #[cfg(test)]
    pub fn vertex_of(&self, cell: CellId) -> Option<VertexId> {
        self.vertices.get(&cell).copied()
    }

    /// Serialize this graph in the line oriented format read by the partitioning solver.
    ///
    /// The first line holds the vertex count, edge count and format flag. Every following line
    /// describes one vertex in id order: its weight, followed by a `neighbour weight` pair for
    /// each adjacent vertex.
    pub fn to_solver_input(&self) -> String {
        let mut out = String::with_capacity(16 * (self.vertex_count() + self.edge_count() + 1));
        let _ = writeln!(out, "{} {} {}", self.vertex_count(), self.edge_count(), SOLVER_FORMAT_WEIGHTED);
        for vertex in self.vertices() {
            let _ = write!(out, "{}", self.vertex_weight(vertex).unwrap_or(1));
            for (neighbour, weight) in self.neighbours(vertex) {
                let _ = write!(out, " {} {}", neighbour, weight);
            }
            out.push('\n');
        }
        out
    }

    fn slot(&self, vertex: VertexId) -> Option<usize> {
        match vertex as usize {
            0 => None,
            idx if idx <= self.cells.len() => Some(idx - 1),
            _ => None,
        }
    }
}

/// The solver only accepts positive integer weights.
fn vertex_weight(lane_length: f64) -> u64 {
    if lane_length.is_finite() && lane_length >= 1.0 {
        lane_length.round() as u64
    } else {
        1
    }
}
