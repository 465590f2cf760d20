//! Cells of the road network.
//!
//! The road network itself is built elsewhere; this module only describes the shape in which
//! it is handed to the coordinator, along with the lookups the graph builder needs. Cells are
//! immutable for the duration of a run once loaded.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// The unique identifier of a cell.
pub type CellId = u64;
/// The unique identifier of a node of the road network.
pub type NodeId = u64;

/// A directed road segment leaving a node.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Edge {
    /// The number of lanes of this edge.
    pub lanes: u32,
    /// The node at which this edge ends.
    pub end_node: NodeId,
    /// The cell containing the end node, which may differ from the start node's cell.
    pub end_cell: CellId,
}

/// A junction of the road network along with its outgoing edges.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Node {
    pub id: NodeId,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

/// A spatial partitioning unit of the road network.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Cell {
    pub id: CellId,
    /// The total lane length of all edges in this cell, used as its workload estimate.
    pub lane_length: f64,
    #[serde(default)]
    pub nodes: Vec<Node>,
}

impl Cell {
    /// Iterate over all outgoing edges of all nodes in this cell.
    pub fn edges(&self) -> impl Iterator<Item = &Edge> {
        self.nodes.iter().flat_map(|node| node.edges.iter())
    }
}

/// The serialized form of a road network.
#[derive(Debug, Deserialize)]
struct NetworkDocument {
    cells: Vec<Cell>,
}

/// An immutable mapping from cell identifier to cell.
#[derive(Clone, Debug, Default)]
pub struct CellCollection {
    cells: BTreeMap<CellId, Cell>,
}

impl CellCollection {
    /// Build a collection from the given cells, rejecting duplicate identifiers.
    pub fn new(cells: impl IntoIterator<Item = Cell>) -> Result<Self> {
        let mut map = BTreeMap::new();
        for cell in cells {
            let id = cell.id;
            if map.insert(id, cell).is_some() {
                bail!("duplicate cell id {} in road network", id);
            }
        }
        Ok(Self { cells: map })
    }

    /// Load a collection from the JSON document at the given path.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = tokio::fs::read(path)
            .await
            .with_context(|| format!("error reading road network from {}", path.display()))?;
        Self::from_json(&raw).with_context(|| format!("error loading road network from {}", path.display()))
    }

    /// Decode a collection from a JSON document.
    pub fn from_json(raw: &[u8]) -> Result<Self> {
        let doc: NetworkDocument = serde_json::from_slice(raw).context("error decoding road network document")?;
        let collection = Self::new(doc.cells)?;
        let dangling = collection
            .cells
            .values()
            .flat_map(|cell| cell.edges())
            .filter(|edge| !collection.cells.contains_key(&edge.end_cell))
            .count();
        if dangling > 0 {
            tracing::warn!(dangling, "road network contains edges ending in unknown cells, they will not be partitioned");
        }
        Ok(collection)
    }

    /// A new collection holding only the given cells; unknown ids are ignored.
    #[cfg(test)]
    pub fn restrict<'a>(&self, ids: impl IntoIterator<Item = &'a CellId>) -> Self {
        let cells = ids
            .into_iter()
            .filter_map(|id| self.cells.get(id).map(|cell| (*id, cell.clone())))
            .collect();
        Self { cells }
    }

    #[cfg(test)]
    pub fn get(&self, id: &CellId) -> Option<&Cell> {
        self.cells.get(id)
    }

    #[cfg(test)]
    pub fn contains(&self, id: &CellId) -> bool {
        self.cells.contains_key(id)
    }

    /// Iterate over all cells in ascending id order.
    pub fn iter(&self) -> impl Iterator<Item = &Cell> {
        self.cells.values()
    }

    #[cfg(test)]
    pub fn ids(&self) -> std::collections::BTreeSet<CellId> {
        self.cells.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }
}
