//! Coordinator controller.
//!
//! The coordinator owns the worker registry and the step tracker, and is the only task which
//! mutates them. Every input (connection events, control requests, planning results and the
//! liveness timer) is funneled through the controller's `select!` loop, so handlers never race.
//!
//! ## Run lifecycle
//! A run starts out `Collecting` workers. Once the configured number of workers has joined,
//! the coordinator enters `Assigning`, planning runs in a spawned task and each worker is sent
//! the full set of workareas. While `Running`, the coordinator issues one global step at a
//! time and only issues the next once every participant of the current step has reported it
//! complete. Workareas are only ever recomputed and sent between steps (`Rebalancing`).
//!
//! When a worker leaves mid-step it is dropped from the step in flight, so the remaining
//! participants can still finish it. Afterwards the disconnect policy decides between waiting
//! for a replacement (`Collecting`) and rebalancing over the remaining workers.

mod policy;
mod registry;
mod steps;

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use futures::stream::StreamExt;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, ReceiverStream};
use uuid::Uuid;

use crate::config::{Config, DisconnectPolicy};
use crate::error::{ConfigurationError, PlanningError, ProtocolViolation, ShutdownError, TransportError};
use crate::models::{CellCollection, Workarea};
use crate::planner::{Partitioner, Planner};
use crate::transport::{Connection, ConnectionEvent, ConnectionEventKind, Listener, Message};

pub use policy::{ClusterState, DefaultRebalancePolicy, RebalancePolicy};
use registry::{Joined, Registry};
use steps::{FinishedStep, StepTracker};

const METRIC_REGISTERED_WORKERS: &str = "traffic_grid_registered_workers";
const METRIC_COMPLETED_STEPS: &str = "traffic_grid_completed_steps";
const METRIC_STEP_VEHICLES: &str = "traffic_grid_step_vehicles";
const METRIC_PROTOCOL_VIOLATIONS: &str = "traffic_grid_protocol_violations";

/// The interval at which step deadlines and planning backoff are checked.
const LIVENESS_CHECK_INTERVAL: Duration = Duration::from_millis(250);
/// The delay after a failed rebalance before planning is attempted again.
const REPLAN_BACKOFF: Duration = Duration::from_secs(5);
const DIAL_ATTEMPTS: u32 = 5;
const DIAL_BACKOFF: Duration = Duration::from_millis(500);

/// The phase of a coordinator's run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// Waiting for enough workers to join.
    Collecting,
    /// Computing the initial workareas.
    Assigning,
    /// Issuing steps.
    Running,
    /// Recomputing workareas for a changed cluster.
    Rebalancing,
    /// The run is over.
    Terminated,
}

/// An observable summary of the coordinator's state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterStatus {
    pub phase: Phase,
    /// The number of registered workers.
    pub workers: usize,
    /// The revision of the current workareas, `0` before the first assignment.
    pub revision: u64,
    /// The step in flight.
    pub step: Option<u64>,
    /// The number of steps every participant has completed.
    pub completed_steps: u64,
    pub paused: bool,
}

/// A message bound for the coordinator controller.
pub enum CoordinatorCtlMsg {
    /// Change the pacing delay of all workers.
    ChangeSpeed(u64),
    /// Stop issuing steps.
    Pause,
    /// Resume issuing steps.
    Resume,
    /// Recompute workareas before the next step.
    Rebalance,
    /// End the run.
    Stop,
    /// A planning task has finished for the given worker registrations.
    PlanFinished {
        workers: BTreeMap<String, u64>,
        result: Result<Vec<Workarea>, PlanningError>,
    },
    /// An outbound dial has finished.
    Dialed { addr: String, result: Result<Connection, TransportError> },
}

/// A handle used for controlling and observing a coordinator.
#[derive(Clone)]
pub struct CoordinatorHandle {
    tx: mpsc::Sender<CoordinatorCtlMsg>,
    status: watch::Receiver<ClusterStatus>,
    local_addr: SocketAddr,
}

impl CoordinatorHandle {
    /// The address the coordinator is listening on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The coordinator's most recently published status.
    pub fn status(&self) -> ClusterStatus {
        self.status.borrow().clone()
    }

    /// A receiver of status updates.
    pub fn subscribe(&self) -> watch::Receiver<ClusterStatus> {
        self.status.clone()
    }

    pub async fn change_speed(&self, milliseconds: u64) -> Result<()> {
        self.send(CoordinatorCtlMsg::ChangeSpeed(milliseconds)).await
    }

    pub async fn pause(&self) -> Result<()> {
        self.send(CoordinatorCtlMsg::Pause).await
    }

    pub async fn resume(&self) -> Result<()> {
        self.send(CoordinatorCtlMsg::Resume).await
    }

    pub async fn rebalance(&self) -> Result<()> {
        self.send(CoordinatorCtlMsg::Rebalance).await
    }

    pub async fn stop(&self) -> Result<()> {
        self.send(CoordinatorCtlMsg::Stop).await
    }

    async fn send(&self, msg: CoordinatorCtlMsg) -> Result<()> {
        self.tx.send(msg).await.map_err(|_| anyhow::anyhow!("coordinator is no longer running"))
    }
}

/// A connection to a peer, along with the worker registration it carries.
struct Peer {
    conn: Connection,
    worker: Option<(String, u64)>,
}

/// A controller encapsulating all coordination of a run.
pub struct Coordinator {
    /// The application's runtime config.
    config: Arc<Config>,
    /// The cells of the road network.
    cells: Arc<CellCollection>,
    planner: Planner,
    policy: Box<dyn RebalancePolicy>,
    /// The listener on which workers connect.
    listener: Listener,

    /// A channel of control requests and spawned task results.
    requests_tx: mpsc::Sender<CoordinatorCtlMsg>,
    /// A channel of control requests and spawned task results.
    requests_rx: ReceiverStream<CoordinatorCtlMsg>,
    /// The channel on which all connections deliver their events.
    events_tx: mpsc::Sender<ConnectionEvent>,
    /// The channel on which all connections deliver their events.
    events_rx: mpsc::Receiver<ConnectionEvent>,
    /// A channel used for publishing the coordinator's status.
    status_tx: watch::Sender<ClusterStatus>,
    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,

    /// All open connections.
    conns: HashMap<Uuid, Peer>,
    /// Outbound connections, mapped to the address they were dialed on.
    dialed: HashMap<Uuid, String>,
    registry: Registry,
    steps: StepTracker,

    phase: Phase,
    /// The revision of the current workareas.
    revision: u64,
    /// The worker registrations holding the current workareas.
    assigned: BTreeMap<String, u64>,
    /// A bool indicating if a planning task is running.
    is_planning: bool,
    /// The earliest time at which a failed rebalance may be retried.
    replan_after: Option<Instant>,
    rebalance_requested: bool,
    paused: bool,
    step_delay_ms: u64,
    next_step: u64,
    completed_steps: u64,
    steps_since_assignment: u64,
    /// The vehicle counts reported for the last completed step.
    last_vehicles: BTreeMap<String, u64>,
    /// An error which ended the run, returned once the controller shuts down.
    fatal: Option<anyhow::Error>,
}

impl Coordinator {
    /// Create a new instance, binding the coordinator's listener.
    pub async fn new(
        config: Arc<Config>, cells: Arc<CellCollection>, partitioner: Arc<dyn Partitioner>, policy: Box<dyn RebalancePolicy>, shutdown_tx: broadcast::Sender<()>,
    ) -> Result<(Self, CoordinatorHandle)> {
        if cells.len() < config.worker_count {
            return Err(ConfigurationError::TooFewCells {
                cells: cells.len(),
                workers: config.worker_count,
            }
            .into());
        }
        let addr = config.coordinator_addr();
        let listener = Listener::bind(&addr).await.with_context(|| format!("error binding coordinator listener to {}", addr))?;
        let local_addr = listener.local_addr().context("error reading coordinator listener address")?;

        metrics::register_gauge!(METRIC_REGISTERED_WORKERS, metrics::Unit::Count, "the number of registered workers");
        metrics::register_counter!(METRIC_COMPLETED_STEPS, metrics::Unit::Count, "the number of globally completed steps");
        metrics::register_gauge!(METRIC_STEP_VEHICLES, metrics::Unit::Count, "the total vehicle count of the last completed step");
        metrics::register_counter!(METRIC_PROTOCOL_VIOLATIONS, metrics::Unit::Count, "the number of rejected protocol violations");

        let (requests_tx, requests_rx) = mpsc::channel(100);
        let (events_tx, events_rx) = mpsc::channel(1000);
        let status = ClusterStatus {
            phase: Phase::Collecting,
            workers: 0,
            revision: 0,
            step: None,
            completed_steps: 0,
            paused: false,
        };
        let (status_tx, status_rx) = watch::channel(status);
        let handle = CoordinatorHandle {
            tx: requests_tx.clone(),
            status: status_rx,
            local_addr,
        };

        Ok((
            Self {
                registry: Registry::new(config.worker_count),
                step_delay_ms: config.step_delay_ms,
                config,
                cells,
                planner: Planner::new(partitioner),
                policy,
                listener,
                requests_tx,
                requests_rx: ReceiverStream::new(requests_rx),
                events_tx,
                events_rx,
                status_tx,
                shutdown_rx: BroadcastStream::new(shutdown_tx.subscribe()),
                shutdown_tx,
                conns: HashMap::new(),
                dialed: HashMap::new(),
                steps: StepTracker::default(),
                phase: Phase::Collecting,
                revision: 0,
                assigned: BTreeMap::new(),
                is_planning: false,
                replan_after: None,
                rebalance_requested: false,
                paused: false,
                next_step: 1,
                completed_steps: 0,
                steps_since_assignment: 0,
                last_vehicles: BTreeMap::new(),
                fatal: None,
            },
            handle,
        ))
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        tracing::info!(
            addr = %self.listener.local_addr().map(|addr| addr.to_string()).unwrap_or_default(),
            workers = self.config.worker_count,
            cells = self.cells.len(),
            "coordinator has started"
        );
        for addr in self.config.dial_workers.clone() {
            self.spawn_dial(addr, Duration::ZERO);
        }
        let mut liveness = tokio::time::interval(LIVENESS_CHECK_INTERVAL);

        while self.phase != Phase::Terminated {
            tokio::select! {
                Some(msg) = self.requests_rx.next() => self.handle_ctl_msg(msg).await,
                Some(event) = self.events_rx.recv() => self.handle_connection_event(event).await,
                res = self.listener.accept(self.events_tx.clone()) => {
                    if let Err(err) = res {
                        tracing::warn!(error = %err, "error accepting worker connection");
                    }
                }
                _ = liveness.tick() => self.check_liveness().await,
                _ = self.shutdown_rx.next() => break,
            }
        }

        // Begin shutdown routine.
        self.terminate("coordinator shutting down").await;
        let _res = self.shutdown_tx.send(());
        tracing::debug!("coordinator has shutdown");
        match self.fatal.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Handle a coordinator controller message.
    #[tracing::instrument(level = "trace", skip(self, msg))]
    async fn handle_ctl_msg(&mut self, msg: CoordinatorCtlMsg) {
        match msg {
            CoordinatorCtlMsg::ChangeSpeed(milliseconds) => {
                tracing::info!(milliseconds, "changing step pacing delay");
                self.step_delay_ms = milliseconds;
                self.broadcast(&Message::ChangeSpeed { milliseconds }).await;
            }
            CoordinatorCtlMsg::Pause => {
                tracing::info!("pausing run");
                self.paused = true;
                self.broadcast(&Message::Pause).await;
                self.publish_status();
            }
            CoordinatorCtlMsg::Resume => {
                tracing::info!("resuming run");
                self.paused = false;
                self.broadcast(&Message::Resume).await;
                self.publish_status();
                self.advance().await;
            }
            CoordinatorCtlMsg::Rebalance => {
                tracing::info!("rebalance requested");
                self.rebalance_requested = true;
                self.replan_after = None;
                self.advance().await;
            }
            CoordinatorCtlMsg::Stop => self.terminate("stop requested").await,
            CoordinatorCtlMsg::PlanFinished { workers, result } => self.handle_plan_finished(workers, result).await,
            CoordinatorCtlMsg::Dialed { addr, result } => self.handle_dialed(addr, result),
        }
    }

    /// Handle an event from one of the coordinator's connections.
    async fn handle_connection_event(&mut self, event: ConnectionEvent) {
        match event.kind {
            ConnectionEventKind::Opened(conn) => {
                tracing::debug!(conn = %conn.id(), peer = %conn.peer(), "worker connection opened");
                if self.phase == Phase::Terminated {
                    conn.close().await;
                    return;
                }
                self.conns.insert(conn.id(), Peer { conn, worker: None });
            }
            ConnectionEventKind::Record(msg) => self.handle_record(event.conn, msg).await,
            ConnectionEventKind::Closed(err) => self.handle_closed(event.conn, err),
        }
        self.advance().await;
    }

    /// Handle a record received from a worker connection.
    #[tracing::instrument(level = "trace", skip(self, msg), fields(kind = msg.kind()))]
    async fn handle_record(&mut self, conn: Uuid, msg: Message) {
        let registration = match self.conns.get(&conn) {
            Some(peer) => peer.worker.clone(),
            None => return,
        };
        match (msg, registration) {
            (Message::Join { name, address, port }, registration) => self.handle_join(conn, registration, name, address, port).await,
            (Message::StepComplete { name, step, vehicles }, Some((registered, session))) => {
                if name != registered {
                    let violation = ProtocolViolation::UnknownWorker { named: name, registered };
                    self.record_violation(conn, &violation);
                    return;
                }
                match self.steps.record(&name, session, step, vehicles) {
                    Ok(()) => tracing::debug!(worker = %name, step, vehicles, "step completed by worker"),
                    Err(violation) => self.record_violation(conn, &violation),
                }
            }
            (msg, None) => {
                let name = match &msg {
                    Message::StepComplete { name, .. } => name.clone(),
                    _ => String::new(),
                };
                let violation = ProtocolViolation::NotJoined(msg.kind());
                self.record_violation(conn, &violation);
                self.send_to(conn, &Message::JoinRejected { name, reason: violation.to_string() }).await;
            }
            (msg, Some(_)) => self.record_violation(conn, &ProtocolViolation::UnexpectedMessage(msg.kind())),
        }
    }

    /// Handle a join request.
    async fn handle_join(&mut self, conn: Uuid, registration: Option<(String, u64)>, name: String, address: String, port: u16) {
        if let Some((registered, _)) = registration.filter(|(registered, _)| *registered != name) {
            let violation = ProtocolViolation::UnknownWorker { named: name.clone(), registered };
            self.record_violation(conn, &violation);
            self.send_to(conn, &Message::JoinRejected { name, reason: violation.to_string() }).await;
            return;
        }
        let joined = match self.registry.join(&name, &address, port) {
            Ok(joined) => joined,
            Err(violation) => {
                self.record_violation(conn, &violation);
                self.send_to(conn, &Message::JoinRejected { name, reason: violation.to_string() }).await;
                return;
            }
        };

        let session = joined.session();
        if let Joined::Replaced { previous, .. } = joined {
            tracing::info!(worker = %name, session, previous, "worker registration replaced");
            if self.steps.remove(&name) {
                tracing::warn!(worker = %name, "replaced registration dropped from the step in flight");
            }
            let stale: Vec<Uuid> = self
                .conns
                .iter()
                .filter(|(id, peer)| **id != conn && peer.worker.as_ref().map(|(_, session)| *session == previous).unwrap_or(false))
                .map(|(id, _)| *id)
                .collect();
            for id in stale {
                if let Some(peer) = self.conns.remove(&id) {
                    peer.conn.close().await;
                }
            }
        }
        if let Some(peer) = self.conns.get_mut(&conn) {
            peer.worker = Some((name.clone(), session));
        }
        tracing::info!(worker = %name, session, %address, port, "worker joined");
        metrics::gauge!(METRIC_REGISTERED_WORKERS, self.registry.len() as f64);
        self.publish_status();

        self.send_to(conn, &Message::JoinAccepted { name }).await;
        if self.step_delay_ms > 0 {
            self.send_to(conn, &Message::ChangeSpeed { milliseconds: self.step_delay_ms }).await;
        }
        if self.paused {
            self.send_to(conn, &Message::Pause).await;
        }
    }

    /// Handle the closure of a connection.
    fn handle_closed(&mut self, conn: Uuid, err: Option<TransportError>) {
        if let Some(addr) = self.dialed.remove(&conn) {
            if self.phase != Phase::Terminated {
                self.spawn_dial(addr, DIAL_BACKOFF);
            }
        }
        let peer = match self.conns.remove(&conn) {
            Some(peer) => peer,
            None => return,
        };
        match err {
            Some(err) => tracing::warn!(conn = %conn, error = %err, "worker connection failed"),
            None => tracing::debug!(conn = %conn, "worker connection closed"),
        }
        if let Some((name, session)) = peer.worker {
            self.depart(&name, session, "connection closed");
        }
    }

    /// Handle the result of an outbound dial.
    fn handle_dialed(&mut self, addr: String, result: Result<Connection, TransportError>) {
        match result {
            Ok(conn) if conn.is_closed() => {
                if self.phase != Phase::Terminated {
                    self.spawn_dial(addr, DIAL_BACKOFF);
                }
            }
            Ok(conn) => {
                tracing::debug!(%addr, conn = %conn.id(), "dialed worker");
                self.dialed.insert(conn.id(), addr);
            }
            Err(err) => tracing::warn!(%addr, error = %err, "giving up dialing worker"),
        }
    }

    /// Drop workers which have not completed the step in flight in time.
    async fn check_liveness(&mut self) {
        let overdue = self.steps.overdue(Instant::now(), self.config.liveness_timeout());
        for name in overdue {
            let session = match self.registry.get(&name) {
                Some(meta) => meta.session,
                None => continue,
            };
            tracing::warn!(worker = %name, timeout = ?self.config.liveness_timeout(), "worker missed its step deadline");
            let ids: Vec<Uuid> = self
                .conns
                .iter()
                .filter(|(_, peer)| peer.worker.as_ref() == Some(&(name.clone(), session)))
                .map(|(id, _)| *id)
                .collect();
            for id in ids {
                if let Some(peer) = self.conns.remove(&id) {
                    peer.conn.close().await;
                }
            }
            self.depart(&name, session, "liveness timeout");
        }
        self.advance().await;
    }

    /// Remove a worker registration, dropping it from the step in flight.
    fn depart(&mut self, name: &str, session: u64, reason: &'static str) {
        if self.registry.remove(name, session).is_none() {
            return;
        }
        let in_step = self.steps.remove(name);
        tracing::warn!(worker = %name, session, reason, in_step, "worker departed");
        metrics::gauge!(METRIC_REGISTERED_WORKERS, self.registry.len() as f64);
        self.publish_status();
    }

    /// Drive the run forward as far as the current state allows.
    ///
    /// This is called after every input, and is the only place where steps are started or
    /// planning is kicked off, so both only ever happen between steps.
    async fn advance(&mut self) {
        if self.phase == Phase::Terminated {
            return;
        }
        if self.steps.current().is_some() {
            match self.steps.finish() {
                Some(finished) => self.handle_step_finished(finished),
                None => return,
            }
        }
        if self.is_planning {
            return;
        }
        if let Some(max_steps) = self.config.max_steps {
            if self.completed_steps >= max_steps {
                self.terminate("step limit reached").await;
                return;
            }
        }
        if self.registry.is_empty() && self.revision > 0 && self.config.on_disconnect == DisconnectPolicy::Rebalance {
            self.terminate("all workers disconnected").await;
            return;
        }

        let state = self.cluster_state();
        let short = state.workers < state.expected_workers;
        if self.revision == 0 {
            // The initial assignment waits for every expected worker.
            if short {
                self.set_phase(Phase::Collecting);
            } else {
                self.start_planning();
            }
            return;
        }
        if state.workers == 0 || (state.churned && short && self.config.on_disconnect == DisconnectPolicy::Stall) {
            self.set_phase(Phase::Collecting);
            return;
        }
        if self.rebalance_requested || self.policy.should_rebalance(&state) {
            let backing_off = self.replan_after.map(|at| Instant::now() < at).unwrap_or(false);
            if !backing_off {
                self.start_planning();
                return;
            }
        }
        if state.churned {
            // The workareas no longer cover the registered workers, so no step may start.
            return;
        }
        self.set_phase(Phase::Running);
        if !self.paused {
            self.start_step().await;
        }
    }

    fn cluster_state(&self) -> ClusterState {
        ClusterState {
            workers: self.registry.len(),
            expected_workers: self.config.worker_count,
            churned: self.registry.sessions() != self.assigned,
            steps_since_assignment: self.steps_since_assignment,
            vehicles: self.last_vehicles.clone(),
        }
    }

    /// Spawn a planning task for the currently registered workers.
    #[tracing::instrument(level = "trace", skip(self))]
    fn start_planning(&mut self) {
        let workers = self.registry.sessions();
        let names: Vec<String> = workers.keys().cloned().collect();
        self.is_planning = true;
        self.rebalance_requested = false;
        self.set_phase(if self.revision == 0 { Phase::Assigning } else { Phase::Rebalancing });
        tracing::info!(workers = names.len(), revision = self.revision + 1, "computing workareas");

        let (planner, cells, tx) = (self.planner.clone(), self.cells.clone(), self.requests_tx.clone());
        let _handle = tokio::spawn(async move {
            let result = planner.plan(&cells, &names).await;
            let _res = tx.send(CoordinatorCtlMsg::PlanFinished { workers, result }).await;
        });
    }

    /// Handle the output of a planning task.
    async fn handle_plan_finished(&mut self, workers: BTreeMap<String, u64>, result: Result<Vec<Workarea>, PlanningError>) {
        self.is_planning = false;
        match result {
            Err(err) if self.revision == 0 => {
                tracing::error!(error = %err, "error computing initial workareas");
                self.fatal = Some(ShutdownError(anyhow::Error::from(err).context("error computing initial workareas")).into());
                self.terminate("initial planning failed").await;
            }
            Err(err) => {
                tracing::error!(error = %err, revision = self.revision, "error rebalancing workareas, keeping current workareas");
                self.replan_after = Some(Instant::now() + REPLAN_BACKOFF);
                self.advance().await;
            }
            Ok(_) if workers != self.registry.sessions() => {
                tracing::debug!("registered workers changed during planning, discarding workareas");
                self.advance().await;
            }
            Ok(workareas) => {
                self.apply_workareas(workers, workareas).await;
                self.advance().await;
            }
        }
    }

    /// Make the given workareas current and send them to every worker.
    async fn apply_workareas(&mut self, workers: BTreeMap<String, u64>, workareas: Vec<Workarea>) {
        self.revision += 1;
        self.registry.set_workareas(&workareas);
        self.assigned = workers;
        self.steps_since_assignment = 0;
        self.last_vehicles.clear();
        self.replan_after = None;
        for meta in self.registry.iter() {
            let cells = meta.workarea.as_ref().map(|area| area.cells.len()).unwrap_or(0);
            tracing::debug!(worker = %meta.name, address = %meta.address, port = meta.port, cells, revision = self.revision, "workarea assigned");
        }
        tracing::info!(revision = self.revision, workers = workareas.len(), "workareas assigned");
        self.broadcast(&Message::WorkareaAssignment {
            revision: self.revision,
            workareas,
        })
        .await;
        self.set_phase(Phase::Running);
    }

    /// Issue the next global step to every registered worker.
    async fn start_step(&mut self) {
        let step = self.next_step;
        self.next_step += 1;
        self.steps.begin(step, self.registry.sessions(), Instant::now());
        tracing::debug!(step, "step started");
        self.broadcast(&Message::StepStart { step }).await;
        self.publish_status();
    }

    fn handle_step_finished(&mut self, finished: FinishedStep) {
        self.completed_steps += 1;
        self.steps_since_assignment += 1;
        let total: u64 = finished.vehicles.values().sum();
        metrics::increment_counter!(METRIC_COMPLETED_STEPS);
        metrics::gauge!(METRIC_STEP_VEHICLES, total as f64);
        if !finished.departed.is_empty() {
            tracing::warn!(step = finished.step, departed = ?finished.departed, "step finished without departed workers");
        }
        tracing::debug!(step = finished.step, vehicles = total, "step complete");
        self.last_vehicles = finished.vehicles;
        self.publish_status();
    }

    /// End the run, telling every worker to stop.
    async fn terminate(&mut self, reason: &'static str) {
        if self.phase == Phase::Terminated {
            return;
        }
        tracing::info!(reason, completed_steps = self.completed_steps, "coordinator run terminated");
        self.broadcast(&Message::Stop).await;
        for (_, peer) in self.conns.drain() {
            peer.conn.close().await;
        }
        self.dialed.clear();
        self.set_phase(Phase::Terminated);
    }

    /// Spawn a task dialing the worker at the given address.
    fn spawn_dial(&self, addr: String, delay: Duration) {
        let (events_tx, tx) = (self.events_tx.clone(), self.requests_tx.clone());
        let _handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut attempt = 0;
            let result = loop {
                attempt += 1;
                match Connection::connect(&addr, events_tx.clone()).await {
                    Ok(conn) => break Ok(conn),
                    Err(err) if attempt < DIAL_ATTEMPTS => {
                        tracing::debug!(%addr, attempt, error = %err, "error dialing worker, will retry");
                        tokio::time::sleep(DIAL_BACKOFF * attempt).await;
                    }
                    Err(err) => break Err(err),
                }
            };
            let _res = tx.send(CoordinatorCtlMsg::Dialed { addr, result }).await;
        });
    }

    /// Send a message to every registered worker.
    async fn broadcast(&mut self, msg: &Message) {
        let registered = self.conns.values().filter(|peer| {
            peer.worker
                .as_ref()
                .map(|(name, session)| self.registry.is_current(name, *session))
                .unwrap_or(false)
        });
        for peer in registered {
            if let Err(err) = peer.conn.send(msg).await {
                tracing::warn!(conn = %peer.conn.id(), error = %err, kind = msg.kind(), "error sending message to worker");
            }
        }
    }

    /// Send a message on the given connection.
    async fn send_to(&mut self, conn: Uuid, msg: &Message) {
        let peer = match self.conns.get(&conn) {
            Some(peer) => peer,
            None => return,
        };
        if let Err(err) = peer.conn.send(msg).await {
            tracing::warn!(conn = %conn, error = %err, kind = msg.kind(), "error sending message to worker");
        }
    }

    fn record_violation(&self, conn: Uuid, violation: &ProtocolViolation) {
        tracing::warn!(conn = %conn, error = %violation, "rejecting protocol violation");
        metrics::increment_counter!(METRIC_PROTOCOL_VIOLATIONS);
    }

    fn set_phase(&mut self, phase: Phase) {
        if self.phase != phase {
            tracing::debug!(from = ?self.phase, to = ?phase, "coordinator phase changed");
            self.phase = phase;
        }
        self.publish_status();
    }

    fn publish_status(&self) {
        let status = ClusterStatus {
            phase: self.phase,
            workers: self.registry.len(),
            revision: self.revision,
            step: self.steps.current(),
            completed_steps: self.completed_steps,
            paused: self.paused,
        };
        self.status_tx.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            *current = status;
            true
        });
    }
}
