use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crate::error::ProtocolViolation;

/// A global step which every participant has finished.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FinishedStep {
    pub step: u64,
    /// The vehicle count reported by each participant.
    pub vehicles: BTreeMap<String, u64>,
    /// Participants which left the run before completing the step.
    pub departed: Vec<String>,
}

/// The step currently being executed.
#[derive(Debug)]
struct InFlight {
    step: u64,
    started: Instant,
    /// The registration session of every worker expected to complete this step.
    participants: BTreeMap<String, u64>,
    completed: BTreeMap<String, u64>,
    departed: Vec<String>,
}

/// Tracks which workers have completed the step in flight.
///
/// Completions are recorded per registration session, so a completion sent under a
/// registration which has since been replaced never counts toward the step.
#[derive(Debug, Default)]
pub struct StepTracker {
    in_flight: Option<InFlight>,
}

impl StepTracker {
    /// Begin tracking the given step for the given participants.
    pub fn begin(&mut self, step: u64, participants: BTreeMap<String, u64>, now: Instant) {
        self.in_flight = Some(InFlight {
            step,
            started: now,
            participants,
            completed: BTreeMap::new(),
            departed: vec![],
        });
    }

    /// The step in flight, if any.
    pub fn current(&self) -> Option<u64> {
        self.in_flight.as_ref().map(|in_flight| in_flight.step)
    }

    /// Record a step completion from the given registration.
    pub fn record(&mut self, name: &str, session: u64, step: u64, vehicles: u64) -> Result<(), ProtocolViolation> {
        let current = self.current();
        let in_flight = match self.in_flight.as_mut() {
            Some(in_flight) if in_flight.step == step => in_flight,
            _ => return Err(ProtocolViolation::StaleStep { reported: step, current }),
        };
        if in_flight.participants.get(name) != Some(&session) {
            return Err(ProtocolViolation::StaleStep { reported: step, current });
        }
        in_flight.completed.insert(name.into(), vehicles);
        Ok(())
    }

    /// Remove a participant from the step in flight, discarding any completion it sent.
    ///
    /// Returns `true` if the worker was a participant.
    pub fn remove(&mut self, name: &str) -> bool {
        let in_flight = match self.in_flight.as_mut() {
            Some(in_flight) => in_flight,
            None => return false,
        };
        if in_flight.participants.remove(name).is_none() {
            return false;
        }
        in_flight.completed.remove(name);
        in_flight.departed.push(name.into());
        true
    }

    /// Check if every remaining participant has completed the step in flight.
    pub fn is_complete(&self) -> bool {
        self.in_flight
            .as_ref()
            .map(|in_flight| in_flight.participants.keys().all(|name| in_flight.completed.contains_key(name)))
            .unwrap_or(false)
    }

    /// Participants which have not completed the step in flight within `timeout` of its start.
    pub fn overdue(&self, now: Instant, timeout: Duration) -> Vec<String> {
        match &self.in_flight {
            Some(in_flight) if now.saturating_duration_since(in_flight.started) >= timeout => in_flight
                .participants
                .keys()
                .filter(|name| !in_flight.completed.contains_key(*name))
                .cloned()
                .collect(),
            _ => vec![],
        }
    }

    /// Finish the step in flight, if it is complete.
    pub fn finish(&mut self) -> Option<FinishedStep> {
        if !self.is_complete() {
            return None;
        }
        self.in_flight.take().map(|in_flight| FinishedStep {
            step: in_flight.step,
            vehicles: in_flight.completed,
            departed: in_flight.departed,
        })
    }
}
