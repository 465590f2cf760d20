//! Worker controller.
//!
//! A worker joins the coordinator under its configured name, waits for its workarea and then
//! simulates one global step per `StepStart`, reporting each with a `StepComplete`. Steps run
//! on the blocking pool while the controller keeps handling records, so control messages are
//! applied between steps and a workarea arriving mid-step is rejected.
//!
//! A worker either dials the coordinator, or with `WORKER_LISTEN` waits for the coordinator to
//! dial it. A lost connection is re-established with a linear backoff, re-joining under the
//! same name; a dialing worker gives up after `RECONNECT_ATTEMPTS` failures.

#[cfg(test)]
mod mod_test;
mod simulator;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::stream::StreamExt;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, ReceiverStream};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{ConfigurationError, ProtocolViolation, TransportError};
use crate::models::Workarea;
use crate::transport::{Connection, ConnectionEvent, ConnectionEventKind, Listener, Message};

pub use simulator::{NoopSimulator, Simulator};

/// The base delay between reconnection attempts, multiplied by the attempt number.
const RECONNECT_BACKOFF: Duration = Duration::from_millis(500);

/// An observable summary of a worker's state.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WorkerStatus {
    /// Whether the coordinator has accepted this worker's current join.
    pub joined: bool,
    /// The revision of the current workarea.
    pub revision: u64,
    /// The number of cells in the current workarea.
    pub cells: usize,
    /// The last step this worker completed.
    pub last_step: Option<u64>,
    pub pacing_ms: u64,
    pub paused: bool,
}

/// A message bound for the worker controller.
pub enum WorkerCtlMsg {
    /// A connection attempt has finished.
    Connected(Result<Connection, TransportError>),
    /// A step has been simulated, handing the simulator back.
    StepFinished {
        step: u64,
        simulator: Option<Box<dyn Simulator>>,
        result: Result<u64>,
    },
}

/// A controller encapsulating a worker's participation in a run.
pub struct Worker {
    /// The application's runtime config.
    config: Arc<Config>,
    /// The unique name of this worker.
    name: String,
    /// The simulator, `None` while a step is executing.
    simulator: Option<Box<dyn Simulator>>,
    /// The listener on which the coordinator dials this worker, if listening.
    listener: Option<Arc<Listener>>,
    /// The port advertised to the coordinator.
    port: u16,

    /// A channel of spawned task results.
    requests_tx: mpsc::Sender<WorkerCtlMsg>,
    /// A channel of spawned task results.
    requests_rx: ReceiverStream<WorkerCtlMsg>,
    /// The channel on which connections deliver their events.
    events_tx: mpsc::Sender<ConnectionEvent>,
    /// The channel on which connections deliver their events.
    events_rx: mpsc::Receiver<ConnectionEvent>,
    /// A channel used for publishing the worker's status.
    status_tx: watch::Sender<WorkerStatus>,
    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,

    /// The connection to the coordinator.
    conn: Option<Connection>,
    /// The number of consecutive failed connection attempts.
    reconnect_attempt: u32,
    joined: bool,
    workarea: Option<Workarea>,
    revision: u64,
    /// The step being simulated, along with the connection it was issued on.
    running_step: Option<(u64, Uuid)>,
    /// An assignment received on a newer connection while an interrupted step was running.
    pending_assignment: Option<(u64, Vec<Workarea>)>,
    /// A step issued on a newer connection while an interrupted step was running.
    pending_step: Option<u64>,
    last_step: Option<u64>,
    /// The delay applied before simulating each step.
    pacing: Duration,
    paused: bool,
    /// A bool indicating that the run is over for this worker.
    stopped: bool,
    /// An error which ended the worker, returned once the controller shuts down.
    fatal: Option<anyhow::Error>,
}

impl Worker {
    /// Create a new instance, binding this worker's listener when configured to listen.
    pub async fn new(config: Arc<Config>, simulator: Box<dyn Simulator>, shutdown_tx: broadcast::Sender<()>) -> Result<(Self, watch::Receiver<WorkerStatus>)> {
        let name = config.worker_name.clone().ok_or(ConfigurationError::MissingWorkerName)?;
        let (listener, port) = if config.worker_listen {
            let addr = format!("{}:{}", config.worker_host, config.worker_port);
            let listener = Listener::bind(&addr).await.with_context(|| format!("error binding worker listener to {}", addr))?;
            let port = listener.local_addr().context("error reading worker listener address")?.port();
            (Some(Arc::new(listener)), port)
        } else {
            (None, config.worker_port)
        };

        let (requests_tx, requests_rx) = mpsc::channel(10);
        let (events_tx, events_rx) = mpsc::channel(100);
        let status = WorkerStatus {
            pacing_ms: config.step_delay_ms,
            ..Default::default()
        };
        let (status_tx, status_rx) = watch::channel(status);

        Ok((
            Self {
                name,
                simulator: Some(simulator),
                listener,
                port,
                requests_tx,
                requests_rx: ReceiverStream::new(requests_rx),
                events_tx,
                events_rx,
                status_tx,
                shutdown_rx: BroadcastStream::new(shutdown_tx.subscribe()),
                shutdown_tx,
                conn: None,
                reconnect_attempt: 0,
                joined: false,
                workarea: None,
                revision: 0,
                running_step: None,
                pending_assignment: None,
                pending_step: None,
                last_step: None,
                pacing: Duration::from_millis(config.step_delay_ms),
                paused: false,
                stopped: false,
                fatal: None,
                config,
            },
            status_rx,
        ))
    }

    /// The address on which this worker accepts the coordinator, if listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|listener| listener.local_addr().ok())
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        tracing::info!(worker = %self.name, listening = self.listener.is_some(), "worker has started");
        self.spawn_connect(Duration::ZERO);

        while !self.stopped {
            tokio::select! {
                Some(msg) = self.requests_rx.next() => self.handle_ctl_msg(msg).await,
                Some(event) = self.events_rx.recv() => self.handle_connection_event(event).await,
                _ = self.shutdown_rx.next() => break,
            }
        }

        // Begin shutdown routine.
        if let Some(conn) = self.conn.take() {
            conn.close().await;
        }
        let _res = self.shutdown_tx.send(());
        tracing::debug!(worker = %self.name, "worker has shutdown");
        match self.fatal.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Handle a worker controller message.
    #[tracing::instrument(level = "trace", skip(self, msg))]
    async fn handle_ctl_msg(&mut self, msg: WorkerCtlMsg) {
        match msg {
            WorkerCtlMsg::Connected(result) => self.handle_connected(result).await,
            WorkerCtlMsg::StepFinished { step, simulator, result } => self.handle_step_finished(step, simulator, result).await,
        }
    }

    /// Handle the outcome of a connection attempt, joining on success.
    async fn handle_connected(&mut self, result: Result<Connection, TransportError>) {
        let conn = match result {
            Ok(conn) => conn,
            Err(err) => {
                tracing::warn!(worker = %self.name, error = %err, attempt = self.reconnect_attempt, "error connecting to coordinator");
                self.schedule_reconnect();
                return;
            }
        };
        tracing::info!(worker = %self.name, peer = %conn.peer(), "connected to coordinator");
        self.reconnect_attempt = 0;
        let join = Message::Join {
            name: self.name.clone(),
            address: self.config.worker_host.clone(),
            port: self.port,
        };
        if let Err(err) = conn.send(&join).await {
            // The connection's reader reports the closure, which triggers a reconnect.
            tracing::warn!(worker = %self.name, error = %err, "error sending join");
        }
        self.conn = Some(conn);
    }

    /// Handle an event from a connection.
    async fn handle_connection_event(&mut self, event: ConnectionEvent) {
        if self.conn.as_ref().map(Connection::id) != Some(event.conn) {
            return;
        }
        match event.kind {
            ConnectionEventKind::Opened(_) => (),
            ConnectionEventKind::Record(msg) => self.handle_message(msg).await,
            ConnectionEventKind::Closed(err) => {
                match err {
                    Some(err) => tracing::warn!(worker = %self.name, error = %err, "connection to coordinator failed"),
                    None => tracing::warn!(worker = %self.name, "connection to coordinator closed"),
                }
                self.conn = None;
                self.joined = false;
                // The coordinator re-sends workareas once this worker has re-joined.
                self.workarea = None;
                self.pending_assignment = None;
                self.pending_step = None;
                self.publish_status();
                self.schedule_reconnect();
            }
        }
    }

    /// Handle a record from the coordinator.
    #[tracing::instrument(level = "trace", skip(self, msg), fields(kind = msg.kind()))]
    async fn handle_message(&mut self, msg: Message) {
        match msg {
            Message::JoinAccepted { .. } => {
                tracing::info!(worker = %self.name, "join accepted by coordinator");
                self.joined = true;
            }
            Message::JoinRejected { reason, .. } => {
                tracing::error!(worker = %self.name, %reason, "join rejected by coordinator");
                self.fatal = Some(anyhow::anyhow!("join rejected by coordinator: {}", reason));
                self.stopped = true;
            }
            Message::WorkareaAssignment { revision, workareas } => self.handle_assignment(revision, workareas),
            Message::StepStart { step } => self.start_step(step),
            Message::ChangeSpeed { milliseconds } => {
                tracing::info!(worker = %self.name, milliseconds, "step pacing changed");
                self.pacing = Duration::from_millis(milliseconds);
            }
            Message::Pause => {
                tracing::info!(worker = %self.name, "run paused");
                self.paused = true;
            }
            Message::Resume => {
                tracing::info!(worker = %self.name, "run resumed");
                self.paused = false;
            }
            Message::Stop => {
                tracing::info!(worker = %self.name, last_step = ?self.last_step, "run stopped by coordinator");
                self.stopped = true;
            }
            msg @ (Message::Join { .. } | Message::StepComplete { .. }) => self.record_violation(&ProtocolViolation::UnexpectedMessage(msg.kind())),
        }
        self.publish_status();
    }

    /// Apply a new set of workareas, which is only allowed between steps.
    fn handle_assignment(&mut self, revision: u64, workareas: Vec<Workarea>) {
        if let Some((step, started_on)) = self.running_step {
            if self.current_conn() == Some(started_on) {
                self.record_violation(&ProtocolViolation::WorkareaMidStep(step));
                return;
            }
            tracing::debug!(worker = %self.name, revision, interrupted = step, "holding workarea until the interrupted step finishes");
            self.pending_assignment = Some((revision, workareas));
            return;
        }
        self.workarea = workareas.into_iter().find(|area| area.worker == self.name);
        self.revision = revision;
        match &self.workarea {
            Some(area) if area.is_empty() => tracing::warn!(worker = %self.name, revision, "assigned an empty workarea"),
            Some(area) => tracing::info!(worker = %self.name, revision, cells = area.cells.len(), "workarea assigned"),
            None => tracing::warn!(worker = %self.name, revision, "assignment holds no workarea for this worker"),
        }
    }

    /// Begin simulating the given step on the blocking pool.
    fn start_step(&mut self, step: u64) {
        if let Some((current, started_on)) = self.running_step {
            if self.current_conn() != Some(started_on) {
                tracing::debug!(worker = %self.name, step, interrupted = current, "holding step until the interrupted step finishes");
                self.pending_step = Some(step);
                return;
            }
            self.record_violation(&ProtocolViolation::StaleStep {
                reported: step,
                current: Some(current),
            });
            return;
        }
        let workarea = match &self.workarea {
            Some(workarea) => workarea.clone(),
            None => {
                self.record_violation(&ProtocolViolation::NoWorkarea(step));
                return;
            }
        };
        let conn = match self.current_conn() {
            Some(conn) => conn,
            None => return,
        };
        let mut simulator = match self.simulator.take() {
            Some(simulator) => simulator,
            None => return,
        };
        self.running_step = Some((step, conn));

        let (pacing, tx) = (self.pacing, self.requests_tx.clone());
        let _handle = tokio::spawn(async move {
            if !pacing.is_zero() {
                tokio::time::sleep(pacing).await;
            }
            let msg = match tokio::task::spawn_blocking(move || {
                let result = simulator.simulate_step(&workarea, step);
                (simulator, result)
            })
            .await
            {
                Ok((simulator, result)) => WorkerCtlMsg::StepFinished {
                    step,
                    simulator: Some(simulator),
                    result,
                },
                Err(err) => WorkerCtlMsg::StepFinished {
                    step,
                    simulator: None,
                    result: Err(anyhow::Error::from(err).context("simulation task failed")),
                },
            };
            let _res = tx.send(msg).await;
        });
    }

    /// Handle a simulated step, reporting it to the coordinator.
    async fn handle_step_finished(&mut self, step: u64, simulator: Option<Box<dyn Simulator>>, result: Result<u64>) {
        let started_on = self.running_step.take().map(|(_, conn)| conn);
        self.simulator = simulator;
        let vehicles = match result {
            Ok(vehicles) => vehicles,
            Err(err) => {
                tracing::error!(worker = %self.name, step, error = ?err, "error simulating step");
                self.fatal = Some(err.context(format!("error simulating step {}", step)));
                self.stopped = true;
                return;
            }
        };

        // A completion is only meaningful to the session which issued the step.
        match self.conn.as_ref().filter(|conn| Some(conn.id()) == started_on) {
            Some(conn) => {
                let msg = Message::StepComplete {
                    name: self.name.clone(),
                    step,
                    vehicles,
                };
                match conn.send(&msg).await {
                    Ok(()) => tracing::debug!(worker = %self.name, step, vehicles, "step complete"),
                    Err(err) => tracing::warn!(worker = %self.name, step, error = %err, "error reporting step completion"),
                }
                self.last_step = Some(step);
            }
            None => tracing::debug!(worker = %self.name, step, "connection lost during step, dropping completion"),
        }

        if let Some((revision, workareas)) = self.pending_assignment.take() {
            self.handle_assignment(revision, workareas);
        }
        if let Some(next) = self.pending_step.take() {
            self.start_step(next);
        }
        self.publish_status();
    }

    /// The id of the current connection to the coordinator.
    fn current_conn(&self) -> Option<Uuid> {
        self.conn.as_ref().map(Connection::id)
    }

    /// Schedule the next connection attempt, or give up.
    fn schedule_reconnect(&mut self) {
        if self.stopped {
            return;
        }
        if self.listener.is_none() && self.reconnect_attempt >= self.config.reconnect_attempts {
            tracing::error!(worker = %self.name, attempts = self.reconnect_attempt, "giving up on coordinator");
            self.fatal = Some(anyhow::anyhow!("unable to reach coordinator after {} attempts", self.reconnect_attempt));
            self.stopped = true;
            return;
        }
        self.reconnect_attempt += 1;
        self.spawn_connect(RECONNECT_BACKOFF * self.reconnect_attempt);
    }

    /// Spawn a task which dials the coordinator, or accepts its connection when listening.
    fn spawn_connect(&self, delay: Duration) {
        let (events_tx, tx, listener, addr) = (self.events_tx.clone(), self.requests_tx.clone(), self.listener.clone(), self.config.coordinator_addr());
        let _handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let result = match listener {
                Some(listener) => listener.accept(events_tx).await,
                None => Connection::connect(&addr, events_tx).await,
            };
            let _res = tx.send(WorkerCtlMsg::Connected(result)).await;
        });
    }

    fn record_violation(&self, violation: &ProtocolViolation) {
        tracing::warn!(worker = %self.name, error = %violation, "rejecting protocol violation");
    }

    fn publish_status(&self) {
        let status = WorkerStatus {
            joined: self.joined,
            revision: self.revision,
            cells: self.workarea.as_ref().map(|area| area.cells.len()).unwrap_or(0),
            last_step: self.last_step,
            pacing_ms: self.pacing.as_millis() as u64,
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
