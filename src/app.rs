use std::sync::Arc;

use anyhow::{Context, Result};
use futures::stream::StreamExt;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, SignalStream};
use tokio_stream::StreamMap;

use crate::config::{Config, Role};
use crate::coordinator::{Coordinator, CoordinatorHandle, DefaultRebalancePolicy};
use crate::models::CellCollection;
use crate::planner::MetisPartitioner;
use crate::worker::{NoopSimulator, Worker};

/// The application object, running either the coordinator or a worker.
pub struct App {
    /// The application's runtime config.
    config: Arc<Config>,
    /// The handle of the coordinator, when running as the coordinator.
    coordinator: Option<CoordinatorHandle>,

    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,

    /// The join handle of the coordinator or worker controller.
    handle: JoinHandle<Result<()>>,
}

impl App {
    /// Create a new instance.
    pub async fn new(config: Arc<Config>) -> Result<Self> {
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let (coordinator, handle) = match config.role {
            Role::Coordinator => {
                let cells = CellCollection::load(&config.network_path)
                    .await
                    .with_context(|| format!("error loading road network from {}", config.network_path))?;
                let partitioner = MetisPartitioner::from_config(&config).context("error configuring partitioner")?;
                if config.worker_count > 1 {
                    let solver = partitioner.check_available().context("partitioning solver is not available")?;
                    tracing::debug!(solver = %solver.display(), "partitioning solver found");
                }
                let policy = DefaultRebalancePolicy::new(config.rebalance_skew);
                let (ctl, handle) = Coordinator::new(config.clone(), Arc::new(cells), Arc::new(partitioner), Box::new(policy), shutdown_tx.clone())
                    .await
                    .context("error spawning coordinator")?;
                (Some(handle), ctl.spawn())
            }
            Role::Worker => {
                let (ctl, _status) = Worker::new(config.clone(), Box::new(NoopSimulator), shutdown_tx.clone())
                    .await
                    .context("error spawning worker")?;
                (None, ctl.spawn())
            }
        };

        Ok(Self {
            config,
            coordinator,
            shutdown_rx: BroadcastStream::new(shutdown_rx),
            shutdown_tx,
            handle,
        })
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        let mut signals = StreamMap::new();
        signals.insert("sigterm", SignalStream::new(signal(SignalKind::terminate()).context("error building signal stream")?));
        signals.insert("sigint", SignalStream::new(signal(SignalKind::interrupt()).context("error building signal stream")?));
        if self.coordinator.is_some() {
            signals.insert("sighup", SignalStream::new(signal(SignalKind::hangup()).context("error building signal stream")?));
            signals.insert("sigusr1", SignalStream::new(signal(SignalKind::user_defined1()).context("error building signal stream")?));
            signals.insert("sigusr2", SignalStream::new(signal(SignalKind::user_defined2()).context("error building signal stream")?));
        }

        loop {
            tokio::select! {
                Some((sig, _)) = signals.next() => {
                    if self.handle_signal(sig).await {
                        break;
                    }
                }
                _ = self.shutdown_rx.next() => break,
            }
        }

        // Begin shutdown routine.
        tracing::debug!(role = ?self.config.role, "traffic grid is shutting down");
        let res = self.handle.await.context("error joining controller handle").and_then(|res| res);
        if let Err(err) = &res {
            tracing::error!(error = ?err, "error shutting down controller");
        }
        tracing::debug!("traffic grid shutdown");
        res
    }

    /// Handle a unix signal, returning `true` when the signal begins shutdown.
    async fn handle_signal(&mut self, sig: &'static str) -> bool {
        let coordinator = match (&self.coordinator, sig) {
            (Some(coordinator), "sighup" | "sigusr1" | "sigusr2") => coordinator,
            _ => {
                tracing::debug!(signal = sig, "signal received, beginning graceful shutdown");
                let _ = self.shutdown_tx.send(());
                return true;
            }
        };
        tracing::info!(signal = sig, "signal received, forwarding to coordinator");
        let res = match sig {
            "sighup" => coordinator.rebalance().await,
            "sigusr1" => coordinator.pause().await,
            _ => coordinator.resume().await,
        };
        if let Err(err) = res {
            tracing::warn!(error = ?err, signal = sig, "error forwarding signal to coordinator");
        }
        false
    }
}
