use anyhow::Result;
use rand::prelude::*;

use crate::models::{Cell, CellCollection, CellId, Edge, Node};

/// Build a cell with a single node whose outgoing edges end in the given `(lanes, cell)` pairs.
pub fn cell(id: CellId, lane_length: f64, edges: &[(u32, CellId)]) -> Cell {
    let edges = edges
        .iter()
        .enumerate()
        .map(|(idx, (lanes, end_cell))| Edge {
            lanes: *lanes,
            end_node: end_cell * 1_000 + idx as u64,
            end_cell: *end_cell,
        })
        .collect();
    Cell {
        id,
        lane_length,
        nodes: vec![Node { id: id * 1_000, edges }],
    }
}

/// Build a row of `len` cells with ids starting at 1, each linked to its neighbours in both
/// directions by a two lane road.
pub fn cell_row(len: u64) -> Result<CellCollection> {
    let mut rng = thread_rng();
    let cells = (1..=len).map(|id| {
        let mut links = vec![];
        if id > 1 {
            links.push((2, id - 1));
        }
        if id < len {
            links.push((2, id + 1));
        }
        cell(id, rng.gen_range(1.0..500.0), &links)
    });
    CellCollection::new(cells)
}
