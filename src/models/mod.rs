//! Data models.

mod cell;
mod workarea;

pub use cell::{Cell, CellCollection, CellId, Edge, Node, NodeId};
pub use workarea::{Workarea, WorkerMeta};
