use serde::{Deserialize, Serialize};

use crate::error::TransportError;
use crate::models::Workarea;

/// A message exchanged between the coordinator and its workers.
///
/// Each message is sent as a single JSON record tagged by its `type` field.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// A worker's request to join the cluster.
    Join { name: String, address: String, port: u16 },
    /// The coordinator accepted a join.
    JoinAccepted { name: String },
    /// The coordinator rejected a join, or a message sent before joining.
    JoinRejected { name: String, reason: String },
    /// The workareas of all workers. Each worker simulates the workarea bearing its name.
    WorkareaAssignment { revision: u64, workareas: Vec<Workarea> },
    /// Begin simulating the given global step.
    StepStart { step: u64 },
    /// A worker finished simulating the given step.
    StepComplete { name: String, step: u64, vehicles: u64 },
    /// Change the pacing delay applied before each step.
    ChangeSpeed { milliseconds: u64 },
    /// Stop issuing steps.
    Pause,
    /// Resume issuing steps.
    Resume,
    /// The run is over.
    Stop,
}

impl Message {
    /// The name of this message's variant, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Join { .. } => "join",
            Self::JoinAccepted { .. } => "join_accepted",
            Self::JoinRejected { .. } => "join_rejected",
            Self::WorkareaAssignment { .. } => "workarea_assignment",
            Self::StepStart { .. } => "step_start",
            Self::StepComplete { .. } => "step_complete",
            Self::ChangeSpeed { .. } => "change_speed",
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Stop => "stop",
        }
    }

    /// Encode this message as a newline terminated record.
    pub fn encode(&self) -> Result<String, TransportError> {
        let mut record = serde_json::to_string(self).map_err(|err| TransportError::Encode(err.to_string()))?;
        record.push('\n');
        Ok(record)
    }

    /// Decode a message from a single record, with or without its line terminator.
    pub fn decode(record: &[u8]) -> Result<Self, TransportError> {
        let record = record.strip_suffix(b"\n").unwrap_or(record);
        let record = record.strip_suffix(b"\r").unwrap_or(record);
        serde_json::from_slice(record).map_err(|err| TransportError::MalformedRecord(err.to_string()))
    }
}
