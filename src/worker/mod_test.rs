use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::coordinator::{Coordinator, DefaultRebalancePolicy};
use crate::fixtures;
use crate::models::{CellId, Workarea};
use crate::planner::MetisPartitioner;
use crate::transport::{Connection, ConnectionEvent, ConnectionEventKind, Listener, Message};
use crate::worker::{Simulator, Worker, WorkerStatus};

const TIMEOUT: Duration = Duration::from_secs(5);
const QUIET: Duration = Duration::from_millis(300);

/// A simulator reporting one vehicle per cell, counting its invocations.
#[derive(Clone, Default)]
struct CountingSimulator {
    steps: Arc<AtomicU64>,
    delay: Duration,
}

impl Simulator for CountingSimulator {
    fn simulate_step(&mut self, workarea: &Workarea, _step: u64) -> Result<u64> {
        std::thread::sleep(self.delay);
        self.steps.fetch_add(1, Ordering::SeqCst);
        Ok(workarea.cells.len() as u64)
    }
}

/// A simulator which always fails.
struct FailingSimulator;

impl Simulator for FailingSimulator {
    fn simulate_step(&mut self, _workarea: &Workarea, step: u64) -> Result<u64> {
        bail!("vehicle state corrupted at step {}", step)
    }
}

/// The coordinator's end of the protocol, driven by hand.
struct FakeCoordinator {
    listener: Listener,
    events_tx: mpsc::Sender<ConnectionEvent>,
    events: mpsc::Receiver<ConnectionEvent>,
}

impl FakeCoordinator {
    async fn bind() -> Result<Self> {
        let listener = Listener::bind("127.0.0.1:0").await?;
        let (events_tx, events) = mpsc::channel(100);
        Ok(Self { listener, events_tx, events })
    }

    fn port(&self) -> Result<String> {
        Ok(self.listener.local_addr()?.port().to_string())
    }

    async fn accept(&self) -> Result<Connection> {
        let conn = tokio::time::timeout(TIMEOUT, self.listener.accept(self.events_tx.clone()))
            .await
            .context("timeout waiting for worker to connect")??;
        Ok(conn)
    }

    /// Receive the next record from the worker.
    async fn recv(&mut self) -> Result<Message> {
        loop {
            let event = tokio::time::timeout(TIMEOUT, self.events.recv())
                .await
                .context("timeout waiting for a message from the worker")?
                .context("connection event queue closed")?;
            match event.kind {
                ConnectionEventKind::Opened(_) => continue,
                ConnectionEventKind::Record(msg) => return Ok(msg),
                ConnectionEventKind::Closed(err) => bail!("worker connection closed: {:?}", err),
            }
        }
    }

    /// Accept a worker and acknowledge its join.
    async fn accept_join(&mut self, expected: &str) -> Result<Connection> {
        let conn = self.accept().await?;
        match self.recv().await? {
            Message::Join { name, .. } if name == expected => (),
            other => bail!("expected join from {}, got {:?}", expected, other),
        }
        conn.send(&Message::JoinAccepted { name: expected.into() }).await?;
        Ok(conn)
    }

    async fn assert_quiet(&mut self) -> Result<()> {
        match tokio::time::timeout(QUIET, self.events.recv()).await {
            Err(_) => Ok(()),
            Ok(event) => bail!("expected no messages from the worker, got {:?}", event),
        }
    }
}

struct Harness {
    join: JoinHandle<Result<()>>,
    status: watch::Receiver<WorkerStatus>,
    _shutdown_tx: broadcast::Sender<()>,
}

async fn start_worker(vars: &[(&str, &str)], simulator: impl Simulator) -> Result<Harness> {
    let mut env = vec![("ROLE", "worker"), ("WORKER_NAME", "worker-0")];
    env.extend_from_slice(vars);
    let config = Arc::new(Config::new_test(&env)?);
    let (shutdown_tx, _) = broadcast::channel(1);
    let (worker, status) = Worker::new(config, Box::new(simulator), shutdown_tx.clone()).await?;
    Ok(Harness {
        join: worker.spawn(),
        status,
        _shutdown_tx: shutdown_tx,
    })
}

fn assignment(revision: u64, own: &[CellId]) -> Message {
    Message::WorkareaAssignment {
        revision,
        workareas: vec![
            Workarea::new("worker-0", own.iter().copied().collect()),
            Workarea::new("worker-1", BTreeSet::from([100, 101])),
        ],
    }
}

async fn wait_for_status(status: &mut watch::Receiver<WorkerStatus>, pred: impl Fn(&WorkerStatus) -> bool) -> Result<WorkerStatus> {
    tokio::time::timeout(TIMEOUT, async {
        loop {
            let current = status.borrow_and_update().clone();
            if pred(&current) {
                return Ok::<_, anyhow::Error>(current);
            }
            status.changed().await.context("worker status channel closed")?;
        }
    })
    .await
    .context("timeout waiting for worker status")?
}

#[tokio::test]
async fn worker_joins_and_reports_completed_steps() -> Result<()> {
    let mut coordinator = FakeCoordinator::bind().await?;
    let simulator = CountingSimulator::default();
    let harness = start_worker(&[("COORDINATOR_PORT", &coordinator.port()?), ("WORKER_PORT", "7171")], simulator.clone()).await?;

    let conn = coordinator.accept().await?;
    match coordinator.recv().await? {
        Message::Join { name, address, port } => {
            assert_eq!(name, "worker-0", "unexpected worker name {}", name);
            assert_eq!((address.as_str(), port), ("127.0.0.1", 7171), "unexpected advertised address {}:{}", address, port);
        }
        other => bail!("expected a join, got {:?}", other),
    }
    conn.send(&Message::JoinAccepted { name: "worker-0".into() }).await?;
    conn.send(&assignment(1, &[1, 2, 3])).await?;
    conn.send(&Message::StepStart { step: 1 }).await?;

    let msg = coordinator.recv().await?;
    assert_eq!(
        msg,
        Message::StepComplete {
            name: "worker-0".into(),
            step: 1,
            vehicles: 3
        },
        "unexpected step completion"
    );
    assert_eq!(simulator.steps.load(Ordering::SeqCst), 1, "expected a single simulated step");
    let mut status = harness.status.clone();
    let status = wait_for_status(&mut status, |status| status.last_step == Some(1)).await?;
    assert!(status.joined, "expected the worker to be joined, got {:?}", status);
    assert_eq!((status.revision, status.cells), (1, 3), "unexpected workarea in status {:?}", status);
    Ok(())
}

#[tokio::test]
async fn workarea_is_never_applied_mid_step() -> Result<()> {
    let mut coordinator = FakeCoordinator::bind().await?;
    let simulator = CountingSimulator {
        delay: Duration::from_millis(300),
        ..Default::default()
    };
    let mut harness = start_worker(&[("COORDINATOR_PORT", &coordinator.port()?)], simulator).await?;
    let conn = coordinator.accept_join("worker-0").await?;

    conn.send(&assignment(1, &[1, 2, 3])).await?;
    conn.send(&Message::StepStart { step: 1 }).await?;
    conn.send(&assignment(2, &[1])).await?;

    match coordinator.recv().await? {
        Message::StepComplete { step: 1, vehicles: 3, .. } => (),
        other => bail!("expected step 1 to complete over the original workarea, got {:?}", other),
    }
    let status = wait_for_status(&mut harness.status, |status| status.last_step == Some(1)).await?;
    assert_eq!(status.revision, 1, "expected the mid-step workarea to be rejected, got {:?}", status);

    conn.send(&assignment(3, &[4, 5])).await?;
    conn.send(&Message::StepStart { step: 2 }).await?;
    match coordinator.recv().await? {
        Message::StepComplete { step: 2, vehicles: 2, .. } => (),
        other => bail!("expected step 2 to complete over the new workarea, got {:?}", other),
    }
    Ok(())
}

#[tokio::test]
async fn step_without_workarea_is_rejected() -> Result<()> {
    let mut coordinator = FakeCoordinator::bind().await?;
    let simulator = CountingSimulator::default();
    let _harness = start_worker(&[("COORDINATOR_PORT", &coordinator.port()?)], simulator.clone()).await?;
    let conn = coordinator.accept_join("worker-0").await?;

    conn.send(&Message::StepStart { step: 1 }).await?;

    coordinator.assert_quiet().await?;
    assert_eq!(simulator.steps.load(Ordering::SeqCst), 0, "expected no step to be simulated");
    Ok(())
}

#[tokio::test]
async fn change_speed_delays_each_step() -> Result<()> {
    let mut coordinator = FakeCoordinator::bind().await?;
    let mut harness = start_worker(&[("COORDINATOR_PORT", &coordinator.port()?)], CountingSimulator::default()).await?;
    let conn = coordinator.accept_join("worker-0").await?;
    conn.send(&assignment(1, &[1])).await?;
    conn.send(&Message::ChangeSpeed { milliseconds: 200 }).await?;
    wait_for_status(&mut harness.status, |status| status.pacing_ms == 200).await?;

    let start = Instant::now();
    conn.send(&Message::StepStart { step: 1 }).await?;
    coordinator.recv().await?;

    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(200), "expected the step to be paced by 200ms, took {:?}", elapsed);
    Ok(())
}

#[tokio::test]
async fn stop_terminates_worker() -> Result<()> {
    let mut coordinator = FakeCoordinator::bind().await?;
    let harness = start_worker(&[("COORDINATOR_PORT", &coordinator.port()?)], CountingSimulator::default()).await?;
    let conn = coordinator.accept_join("worker-0").await?;

    conn.send(&Message::Stop).await?;

    tokio::time::timeout(TIMEOUT, harness.join).await???;
    Ok(())
}

#[tokio::test]
async fn rejected_join_is_fatal() -> Result<()> {
    let mut coordinator = FakeCoordinator::bind().await?;
    let harness = start_worker(&[("COORDINATOR_PORT", &coordinator.port()?)], CountingSimulator::default()).await?;
    let conn = coordinator.accept().await?;
    coordinator.recv().await?;

    conn.send(&Message::JoinRejected {
        name: "worker-0".into(),
        reason: "worker registry is full".into(),
    })
    .await?;

    let res = tokio::time::timeout(TIMEOUT, harness.join).await??;
    assert!(res.is_err(), "expected a rejected worker to fail, got {:?}", res);
    Ok(())
}

#[tokio::test]
async fn simulation_failure_is_fatal() -> Result<()> {
    let mut coordinator = FakeCoordinator::bind().await?;
    let harness = start_worker(&[("COORDINATOR_PORT", &coordinator.port()?)], FailingSimulator).await?;
    let conn = coordinator.accept_join("worker-0").await?;
    conn.send(&assignment(1, &[1])).await?;

    conn.send(&Message::StepStart { step: 1 }).await?;

    let res = tokio::time::timeout(TIMEOUT, harness.join).await??;
    match res {
        Err(err) => assert!(format!("{:#}", err).contains("vehicle state corrupted"), "expected the simulator error, got {:#}", err),
        Ok(()) => bail!("expected the worker to fail"),
    }
    Ok(())
}

#[tokio::test]
async fn worker_rejoins_after_losing_coordinator() -> Result<()> {
    let mut coordinator = FakeCoordinator::bind().await?;
    let mut harness = start_worker(&[("COORDINATOR_PORT", &coordinator.port()?), ("RECONNECT_ATTEMPTS", "3")], CountingSimulator::default()).await?;
    let conn = coordinator.accept_join("worker-0").await?;
    conn.send(&assignment(1, &[1, 2])).await?;
    wait_for_status(&mut harness.status, |status| status.revision == 1 && status.joined).await?;

    conn.close().await;

    // Drain the closure of the first connection before accepting the second.
    loop {
        let event = tokio::time::timeout(TIMEOUT, coordinator.events.recv()).await?.context("connection event queue closed")?;
        if matches!(event.kind, ConnectionEventKind::Closed(_)) {
            break;
        }
    }
    let status = wait_for_status(&mut harness.status, |status| !status.joined).await?;
    assert_eq!(status.cells, 0, "expected the workarea to be dropped with the connection, got {:?}", status);
    let _conn = coordinator.accept_join("worker-0").await?;
    wait_for_status(&mut harness.status, |status| status.joined).await?;
    Ok(())
}

#[tokio::test]
async fn worker_gives_up_after_reconnect_attempts() -> Result<()> {
    let port = {
        let listener = Listener::bind("127.0.0.1:0").await?;
        listener.local_addr()?.port().to_string()
    };
    let harness = start_worker(&[("COORDINATOR_PORT", &port), ("RECONNECT_ATTEMPTS", "1")], CountingSimulator::default()).await?;

    let res = tokio::time::timeout(TIMEOUT, harness.join).await??;

    assert!(res.is_err(), "expected the worker to give up, got {:?}", res);
    Ok(())
}

#[tokio::test]
async fn listening_worker_joins_when_dialed() -> Result<()> {
    let config = Arc::new(Config::new_test(&[("ROLE", "worker"), ("WORKER_NAME", "worker-0"), ("WORKER_LISTEN", "true"), ("WORKER_PORT", "0")])?);
    let (shutdown_tx, _) = broadcast::channel(1);
    let (worker, _status) = Worker::new(config, Box::new(CountingSimulator::default()), shutdown_tx).await?;
    let addr = worker.local_addr().context("expected a listening worker")?;
    let _handle = worker.spawn();
    let (events_tx, mut events) = mpsc::channel(10);

    let _conn = Connection::connect(&addr.to_string(), events_tx).await?;

    loop {
        let event = tokio::time::timeout(TIMEOUT, events.recv()).await?.context("connection event queue closed")?;
        match event.kind {
            ConnectionEventKind::Opened(_) => continue,
            ConnectionEventKind::Record(Message::Join { name, port, .. }) => {
                assert_eq!(name, "worker-0", "unexpected worker name {}", name);
                assert_eq!(port, addr.port(), "expected the listener's port to be advertised, got {}", port);
                break;
            }
            other => bail!("expected a join, got {:?}", other),
        }
    }
    Ok(())
}

#[tokio::test]
async fn workers_run_in_lockstep_with_coordinator() -> Result<()> {
    let config = Arc::new(Config::new_test(&[("ROLE", "coordinator"), ("COORDINATOR_PORT", "0"), ("WORKER_COUNT", "1"), ("MAX_STEPS", "3")])?);
    let (shutdown_tx, _) = broadcast::channel(1);
    let partitioner = Arc::new(MetisPartitioner::from_config(&config)?);
    let (coordinator, handle) = Coordinator::new(
        config,
        Arc::new(fixtures::cell_row(4)?),
        partitioner,
        Box::new(DefaultRebalancePolicy::new(None)),
        shutdown_tx,
    )
    .await?;
    let coordinator = coordinator.spawn();
    let simulator = CountingSimulator::default();
    let harness = start_worker(&[("COORDINATOR_PORT", &handle.local_addr().port().to_string())], simulator.clone()).await?;

    tokio::time::timeout(TIMEOUT, coordinator).await???;
    tokio::time::timeout(TIMEOUT, harness.join).await???;

    assert_eq!(simulator.steps.load(Ordering::SeqCst), 3, "expected the worker to simulate every step");
    assert_eq!(handle.status().completed_steps, 3, "expected the coordinator to complete every step");
    Ok(())
}

#[tokio::test]
async fn rejoin_during_interrupted_step_applies_new_workarea_afterwards() -> Result<()> {
    let mut coordinator = FakeCoordinator::bind().await?;
    let simulator = CountingSimulator {
        delay: Duration::from_millis(1500),
        ..Default::default()
    };
    let mut harness = start_worker(&[("COORDINATOR_PORT", &coordinator.port()?), ("RECONNECT_ATTEMPTS", "3")], simulator.clone()).await?;
    let conn = coordinator.accept_join("worker-0").await?;
    conn.send(&assignment(1, &[1, 2, 3])).await?;
    conn.send(&Message::StepStart { step: 1 }).await?;
    tokio::time::sleep(Duration::from_millis(200)).await;

    conn.close().await;
    loop {
        let event = tokio::time::timeout(TIMEOUT, coordinator.events.recv()).await?.context("connection event queue closed")?;
        if matches!(event.kind, ConnectionEventKind::Closed(_)) {
            break;
        }
    }
    let conn = coordinator.accept_join("worker-0").await?;
    conn.send(&assignment(2, &[4, 5])).await?;
    conn.send(&Message::StepStart { step: 2 }).await?;

    match coordinator.recv().await? {
        Message::StepComplete { step: 2, vehicles: 2, .. } => (),
        other => bail!("expected step 2 to complete over the new workarea, got {:?}", other),
    }
    let status = wait_for_status(&mut harness.status, |status| status.last_step == Some(2)).await?;
    assert_eq!((status.revision, status.cells), (2, 2), "expected the held workarea to be applied, got {:?}", status);
    assert_eq!(simulator.steps.load(Ordering::SeqCst), 2, "expected both steps to be simulated");
    Ok(())
}
