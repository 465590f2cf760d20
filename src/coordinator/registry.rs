use std::collections::BTreeMap;

use crate::error::ProtocolViolation;
use crate::models::{Workarea, WorkerMeta};

/// The outcome of a successful join.
#[derive(Debug, PartialEq, Eq)]
pub enum Joined {
    /// The worker took a free slot.
    New { session: u64 },
    /// The worker replaced its own prior registration.
    Replaced { session: u64, previous: u64 },
}

impl Joined {
    /// The session of the new registration.
    pub fn session(&self) -> u64 {
        match self {
            Self::New { session } | Self::Replaced { session, .. } => *session,
        }
    }
}

/// The set of workers registered with the coordinator, keyed by name.
///
/// The registry holds at most `capacity` workers. Joining under a name which is already
/// registered replaces that registration under a new session and never takes another slot.
#[derive(Debug)]
pub struct Registry {
    capacity: usize,
    workers: BTreeMap<String, WorkerMeta>,
    next_session: u64,
}

impl Registry {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            workers: BTreeMap::new(),
            next_session: 1,
        }
    }

    /// Register a worker, or replace its prior registration.
    pub fn join(&mut self, name: &str, address: &str, port: u16) -> Result<Joined, ProtocolViolation> {
        let session = self.next_session;
        if let Some(meta) = self.workers.get_mut(name) {
            let previous = meta.session;
            meta.address = address.into();
            meta.port = port;
            meta.session = session;
            self.next_session += 1;
            return Ok(Joined::Replaced { session, previous });
        }
        if self.is_full() {
            return Err(ProtocolViolation::RegistryFull(name.into()));
        }
        self.workers.insert(
            name.into(),
            WorkerMeta {
                name: name.into(),
                address: address.into(),
                port,
                session,
                workarea: None,
            },
        );
        self.next_session += 1;
        Ok(Joined::New { session })
    }

    /// Remove the given registration.
    ///
    /// Nothing is removed when the worker has since re-joined under a newer session.
    pub fn remove(&mut self, name: &str, session: u64) -> Option<WorkerMeta> {
        match self.workers.get(name) {
            Some(meta) if meta.session == session => self.workers.remove(name),
            _ => None,
        }
    }

    pub fn get(&self, name: &str) -> Option<&WorkerMeta> {
        self.workers.get(name)
    }

    /// Check if the given registration is the current one for its worker.
    pub fn is_current(&self, name: &str, session: u64) -> bool {
        self.workers.get(name).map(|meta| meta.session == session).unwrap_or(false)
    }

    /// The registered worker names, in ascending order.
    #[cfg(test)]
    pub fn names(&self) -> Vec<String> {
        self.workers.keys().cloned().collect()
    }

    /// The current session of every registered worker.
    pub fn sessions(&self) -> BTreeMap<String, u64> {
        self.workers.iter().map(|(name, meta)| (name.clone(), meta.session)).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &WorkerMeta> {
        self.workers.values()
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.workers.len() >= self.capacity
    }

    /// Record the given workareas against their owners.
    ///
    /// Workareas of workers which are no longer registered are ignored.
    pub fn set_workareas(&mut self, workareas: &[Workarea]) {
        for meta in self.workers.values_mut() {
            meta.workarea = workareas.iter().find(|area| area.worker == meta.name).cloned();
        }
    }
}
