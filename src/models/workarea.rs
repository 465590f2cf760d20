use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::models::CellId;

/// The set of cells assigned to one worker.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Workarea {
    /// The name of the worker owning this workarea.
    pub worker: String,
    /// The cells of this workarea, in ascending order.
    pub cells: BTreeSet<CellId>,
}

impl Workarea {
    pub fn new(worker: impl Into<String>, cells: BTreeSet<CellId>) -> Self {
        Self { worker: worker.into(), cells }
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

/// Coordinator-side metadata on a registered worker.
#[derive(Clone, Debug, PartialEq)]
pub struct WorkerMeta {
    /// The unique name of the worker.
    pub name: String,
    /// The address at which the worker is reachable.
    pub address: String,
    /// The port at which the worker is reachable.
    pub port: u16,
    /// The registration session of this worker.
    ///
    /// Every join is assigned a new session, so that state recorded against a replaced
    /// registration can be told apart from the current one.
    pub session: u64,
    /// The workarea currently assigned to this worker.
    pub workarea: Option<Workarea>,
}
