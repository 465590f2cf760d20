//! Partitioning through an external METIS-style solver program.
//!
//! The graph is written to a scratch directory in the solver's textual format, the solver is
//! invoked with a fresh random seed, and its output file, named after the input file suffixed
//! with `.part.<parts>`, is parsed back into vertex sets. The scratch directory is unique per
//! call and removed when the call returns, whether or not it succeeded.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use rand::prelude::*;
use tokio::process::Command;

use crate::config::Config;
use crate::error::PlanningError;
use crate::graph::{CellGraph, VertexId};
use crate::planner::{Partition, Partitioner};

/// The file name of the serialized graph within the scratch directory.
const GRAPH_FILE_NAME: &str = "cells.graph";

/// Tuning options passed to the solver.
#[derive(Clone, Debug)]
pub struct SolverOptions {
    /// The bound on a single solver invocation.
    pub timeout: Duration,
    /// The allowed load imbalance, in thousandths above perfect balance.
    pub imbalance: u32,
    /// The number of refinement iterations.
    pub iterations: u32,
    /// The number of partitionings to compute, keeping the best.
    pub cuts: u32,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(300),
            imbalance: 30,
            iterations: 10,
            cuts: 1,
        }
    }
}

/// A partitioner which shells out to an external solver.
#[derive(Clone, Debug)]
pub struct MetisPartitioner {
    /// The solver program.
    program: String,
    /// Arguments passed ahead of the generated arguments.
    leading_args: Vec<String>,
    options: SolverOptions,
}

impl MetisPartitioner {
    /// Create a new instance from a whitespace separated command line.
    pub fn new(command: &str, options: SolverOptions) -> Result<Self, PlanningError> {
        let mut tokens = command.split_whitespace().map(String::from);
        let program = tokens.next().ok_or_else(|| PlanningError::SolverMissing(command.to_string()))?;
        Ok(Self {
            program,
            leading_args: tokens.collect(),
            options,
        })
    }

    /// Create a new instance from the solver settings of the given config.
    pub fn from_config(config: &Config) -> Result<Self, PlanningError> {
        Self::new(
            &config.solver_command,
            SolverOptions {
                timeout: config.solver_timeout(),
                imbalance: config.solver_imbalance,
                iterations: config.solver_iterations,
                cuts: config.solver_cuts,
            },
        )
    }

    /// Ensure the solver program can be found, returning its resolved path.
    pub fn check_available(&self) -> Result<PathBuf, PlanningError> {
        let program = Path::new(&self.program);
        if program.components().count() > 1 {
            if !program.is_file() {
                return Err(PlanningError::SolverMissing(self.program.clone()));
            }
            return Ok(program.to_path_buf());
        }
        std::env::var_os("PATH")
            .iter()
            .flat_map(std::env::split_paths)
            .map(|dir| dir.join(program))
            .find(|candidate| candidate.is_file())
            .ok_or_else(|| PlanningError::SolverMissing(self.program.clone()))
    }

    /// The generated solver arguments, excluding the graph path and partition count.
    fn solver_args(&self, seed: i32) -> Vec<String> {
        vec![
            "-ptype=kway".into(),
            "-ctype=shem".into(),
            "-iptype=random".into(),
            "-objtype=vol".into(),
            "-contig".into(),
            "-minconn".into(),
            format!("-ufactor={}", self.options.imbalance),
            format!("-niter={}", self.options.iterations),
            format!("-ncuts={}", self.options.cuts),
            format!("-seed={}", seed),
        ]
    }
}

#[async_trait]
impl Partitioner for MetisPartitioner {
    #[tracing::instrument(level = "debug", skip(self, graph), fields(vertices = graph.vertex_count()))]
    async fn partition(&self, graph: &CellGraph, parts: usize) -> Result<Vec<Partition>, PlanningError> {
        let program = self.check_available()?;

        let scratch = tempfile::Builder::new().prefix("traffic-grid-plan-").tempdir()?;
        let input = scratch.path().join(GRAPH_FILE_NAME);
        tokio::fs::write(&input, graph.to_solver_input()).await?;

        let seed = thread_rng().gen_range(0..i32::MAX);
        tracing::debug!(seed, parts, program = %program.display(), "invoking partitioning solver");
        let child = Command::new(&program)
            .args(&self.leading_args)
            .args(self.solver_args(seed))
            .arg(&input)
            .arg(parts.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| match err.kind() {
                std::io::ErrorKind::NotFound => PlanningError::SolverMissing(self.program.clone()),
                _ => PlanningError::SolverSpawn(err),
            })?;
        let output = match tokio::time::timeout(self.options.timeout, child.wait_with_output()).await {
            Ok(output) => output?,
            Err(_elapsed) => return Err(PlanningError::SolverTimeout(self.options.timeout)),
        };
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(PlanningError::SolverFailed {
                status: format!("{}: {}", output.status, stderr.trim()),
            });
        }

        let mut output_path = input.into_os_string();
        output_path.push(format!(".part.{}", parts));
        let raw = tokio::fs::read_to_string(&output_path).await?;
        parse_solver_output(&raw, graph.vertex_count(), parts)
    }
}

/// Parse the solver's output, in which line `i - 1` names the partition of vertex `i`.
pub(super) fn parse_solver_output(raw: &str, vertex_count: usize, parts: usize) -> Result<Vec<Partition>, PlanningError> {
    let mut partitions = vec![Partition::new(); parts];
    let mut found = 0;
    for (idx, line) in raw.lines().enumerate() {
        let partition: usize = line.trim().parse().map_err(|_err| PlanningError::MalformedOutput {
            line: idx + 1,
            content: line.to_string(),
        })?;
        let vertex = (idx + 1) as VertexId;
        match partitions.get_mut(partition) {
            Some(set) => {
                set.insert(vertex);
            }
            None => return Err(PlanningError::PartitionOutOfRange { vertex, partition, parts }),
        }
        found += 1;
    }
    if found != vertex_count {
        return Err(PlanningError::VertexCountMismatch { expected: vertex_count, found });
    }
    Ok(partitions)
}
