//! Error abstractions.
//!
//! Errors are grouped by how far they are allowed to reach. Planning errors abort only the
//! (re)balance attempt which produced them, transport errors stay local to one connection,
//! protocol violations are rejected and logged, and configuration errors stop the process
//! before any network activity takes place.

use thiserror::Error;

/// An error from computing a partition of the cell graph.
#[derive(Debug, Error)]
pub enum PlanningError {
    /// The configured solver program could not be found.
    #[error("partitioning solver `{0}` was not found")]
    SolverMissing(String),
    /// The solver program could not be started.
    #[error("error spawning partitioning solver: {0}")]
    SolverSpawn(std::io::Error),
    /// The solver exited with a non-zero status.
    #[error("partitioning solver exited unsuccessfully: {status}")]
    SolverFailed { status: String },
    /// The solver did not finish within the configured bound.
    #[error("partitioning solver timed out after {0:?}")]
    SolverTimeout(std::time::Duration),
    /// A line of solver output could not be parsed as a partition id.
    #[error("malformed solver output on line {line}: {content:?}")]
    MalformedOutput { line: usize, content: String },
    /// The solver reported a different number of vertices than it was given.
    #[error("solver output covers {found} vertices, expected {expected}")]
    VertexCountMismatch { expected: usize, found: usize },
    /// The solver assigned a vertex to a partition outside of the requested range.
    #[error("solver assigned vertex {vertex} to partition {partition}, but only {parts} partitions were requested")]
    PartitionOutOfRange { vertex: u32, partition: usize, parts: usize },
    /// Zero partitions were requested.
    #[error("at least one partition must be requested")]
    NoPartitions,
    /// A partition names a vertex which does not exist in the graph.
    #[error("partition references unknown vertex {0}")]
    UnknownVertex(u32),
    /// The number of partitions does not match the number of workers to assign.
    #[error("{partitions} partitions can not be assigned to {workers} workers")]
    WorkerCountMismatch { partitions: usize, workers: usize },
    /// An I/O error while staging solver input or reading its output.
    #[error("solver I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// An error on a single connection.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The connection has already been closed.
    #[error("connection is closed")]
    Closed,
    /// An I/O error on the underlying socket.
    #[error("connection I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// A received record could not be decoded.
    #[error("malformed record received: {0}")]
    MalformedRecord(String),
    /// A message could not be encoded as a record.
    #[error("error encoding record: {0}")]
    Encode(String),
}

/// A message which is not acceptable in the current protocol state.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ProtocolViolation {
    /// A non-join message arrived on a connection which has not joined.
    #[error("{0} received before join")]
    NotJoined(&'static str),
    /// A join arrived while all worker slots are taken.
    #[error("worker registry is full, rejecting join from {0}")]
    RegistryFull(String),
    /// A message names a worker other than the one registered on its connection.
    #[error("message names worker {named} but connection is registered as {registered}")]
    UnknownWorker { named: String, registered: String },
    /// A step completion does not refer to the step in flight.
    #[error("step completion for step {reported} does not match the current step {current:?}")]
    StaleStep { reported: u64, current: Option<u64> },
    /// A new workarea arrived while a step was executing.
    #[error("workarea assignment received while step {0} is executing")]
    WorkareaMidStep(u64),
    /// A step was requested before any workarea was assigned.
    #[error("step {0} requested before any workarea was assigned")]
    NoWorkarea(u64),
    /// A message kind which is never valid in this direction.
    #[error("unexpected {0} message")]
    UnexpectedMessage(&'static str),
}

/// An invalid runtime configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigurationError {
    /// The coordinator must expect at least one worker.
    #[error("worker count must be greater than 0, got {0}")]
    InvalidWorkerCount(usize),
    /// There must be at least one cell per worker.
    #[error("road network has {cells} cells, which is fewer than the {workers} configured workers")]
    TooFewCells { cells: usize, workers: usize },
    /// Workers must be configured with a name.
    #[error("WORKER_NAME must be set when running as a worker")]
    MissingWorkerName,
    /// The solver command may not be empty.
    #[error("SOLVER_COMMAND may not be empty")]
    EmptySolverCommand,
}

/// The error type used to indicate that a system shutdown is required.
#[derive(Debug, thiserror::Error)]
#[error("fatal error: {0}")]
pub struct ShutdownError(#[from] pub anyhow::Error);

