//! Parameter server lifecycle.
//!
//! Drives rounds back to back: receive until every trainer's barrier is in,
//! run the update program, reset sparse row sets and written-slot marks,
//! release the updated parameters and wait for trainers to pick them up.

use crate::core::{now, Error, Result, Timestamp};
use crate::paramserver::config::ServerConfig;
use crate::paramserver::executor::UpdateExecutor;
use crate::paramserver::message::GradientMessage;
use crate::paramserver::round::{ParamGradMapping, RoundCoordinator, RoundOutcome};
use crate::paramserver::transport::Transport;
use crate::paramserver::variable::VariableStore;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

type ServerTask = Arc<Mutex<Option<JoinHandle<Result<()>>>>>;

/// Server statistics.
#[derive(Clone, Debug, Default)]
pub struct ServerStats {
    pub rounds_completed: u64,
    pub messages_received: u64,
    pub messages_rejected: u64,
    pub update_failures: u64,
    pub last_round_at: Option<Timestamp>,
}

/// Final statistics returned when the server stops.
pub type RunSummary = ServerStats;

/// Synchronous parameter server.
pub struct ParameterServer<T: Transport, E: UpdateExecutor> {
    config: ServerConfig,
    transport: Arc<T>,
    executor: E,
    store: VariableStore,
    coordinator: RoundCoordinator,
    server_task: ServerTask,
    stats: ServerStats,
}

impl<T: Transport, E: UpdateExecutor> ParameterServer<T, E> {
    /// Validate the configuration, declare variable slots and spawn the
    /// transport's dispatch loop. Must be called from within a tokio runtime.
    pub fn start(config: ServerConfig, transport: Arc<T>, executor: E) -> Result<Self> {
        config.validate()?;
        let store = VariableStore::from_config(&config)?;
        let mapping = ParamGradMapping::from_config(&config)?;
        let coordinator = RoundCoordinator::new(config.fan_in, mapping);

        let serving = transport.clone();
        let handle = tokio::spawn(async move { serving.serve().await });

        info!(
            endpoint = %config.endpoint,
            fan_in = config.fan_in,
            variables = store.len(),
            "parameter server started"
        );

        Ok(Self {
            config,
            transport,
            executor,
            store,
            coordinator,
            server_task: Arc::new(Mutex::new(Some(handle))),
            stats: ServerStats::default(),
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    pub fn store(&self) -> &VariableStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut VariableStore {
        &mut self.store
    }

    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }

    /// Handle for stopping the server from another task.
    pub fn stop_handle(&self) -> StopHandle<T> {
        StopHandle {
            transport: self.transport.clone(),
            server_task: self.server_task.clone(),
        }
    }

    /// Serve rounds until a terminate message arrives.
    pub async fn run(&mut self) -> Result<RunSummary> {
        loop {
            match self.run_round().await {
                Ok(outcome) if outcome.terminated => {
                    join_server_task(&self.server_task).await;
                    info!(
                        rounds = self.stats.rounds_completed,
                        "parameter server stopped"
                    );
                    return Ok(self.stats.clone());
                }
                Ok(_) => {}
                Err(err) => {
                    error!(error = %err, "round failed, shutting down");
                    self.transport.begin_shutdown();
                    join_server_task(&self.server_task).await;
                    return Err(err);
                }
            }
        }
    }

    /// Run a single round: receive, update, release.
    ///
    /// A terminated round skips the update and release steps; the transport
    /// is already shutting down when it returns.
    pub async fn run_round(&mut self) -> Result<RoundOutcome> {
        self.transport.set_accepting_phase(true);

        let outcome = self
            .coordinator
            .drain(&*self.transport, &mut self.store, self.config.drain_timeout())
            .await?;
        self.stats.messages_received += outcome.received as u64;
        self.stats.messages_rejected += outcome.rejected as u64;

        if outcome.terminated {
            self.store.clear_written();
            self.coordinator.end_round();
            return Ok(outcome);
        }

        debug!(round = outcome.round, "run optimize program");
        if let Err(err) = self
            .executor
            .run(&mut self.store, &self.config.optimize_block_id)
        {
            error!(round = outcome.round, error = %err, "run sub program error");
            self.stats.update_failures += 1;
        }

        // Stale row indices would otherwise be merged into next round's sums.
        for name in self.coordinator.sparse_updates().iter() {
            if let Err(err) = self.store.clear_rows(name) {
                warn!(name = %name, error = %err, "failed to reset sparse rows");
            }
        }
        self.store.clear_written();

        self.release(outcome.updated).await?;

        self.coordinator.end_round();
        self.stats.rounds_completed += 1;
        self.stats.last_round_at = Some(now());
        Ok(outcome)
    }

    async fn release(&mut self, expected: usize) -> Result<()> {
        let params: Vec<String> = self
            .config
            .param_list
            .iter()
            .filter(|p| self.store.contains(p))
            .cloned()
            .collect();
        let snapshot = self.store.snapshot(&params)?;

        self.transport.publish_release(snapshot);
        self.transport.set_accepting_phase(false);

        let acks = self.transport.await_acknowledgements(expected);
        match self.config.release_timeout() {
            Some(limit) => tokio::time::timeout(limit, acks)
                .await
                .map_err(|_| Error::Timeout {
                    phase: "acknowledgements",
                    after_ms: limit.as_millis() as u64,
                })?,
            None => acks.await,
        }
    }
}

async fn join_server_task(task: &Mutex<Option<JoinHandle<Result<()>>>>) {
    let handle = task.lock().await.take();
    if let Some(handle) = handle {
        match handle.await {
            Ok(Ok(())) => debug!("server task joined"),
            Ok(Err(err)) => warn!(error = %err, "server task exited with error"),
            Err(err) => error!(error = %err, "server task panicked"),
        }
    }
}

/// Stops a running [`ParameterServer`] from outside its loop.
pub struct StopHandle<T: Transport> {
    transport: Arc<T>,
    server_task: ServerTask,
}

impl<T: Transport> Clone for StopHandle<T> {
    fn clone(&self) -> Self {
        Self {
            transport: self.transport.clone(),
            server_task: self.server_task.clone(),
        }
    }
}

impl<T: Transport> StopHandle<T> {
    /// Queue a terminate message, stop the transport and join its dispatch
    /// loop. The round loop notices the terminate at its next pull.
    pub async fn stop(&self) -> Result<()> {
        self.transport.push_self(GradientMessage::terminate())?;
        self.transport.begin_shutdown();
        join_server_task(&self.server_task).await;
        Ok(())
    }
}
