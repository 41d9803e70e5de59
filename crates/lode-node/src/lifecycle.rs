//! Startup and shutdown ordering.
//!
//! [`Coordinator::run`] is the only owner of the store handle:
//!
//! 1. move a legacy database directory into place, then check for interrupt
//! 2. open the engine (released by [`StoreGuard`] on every exit path)
//! 3. run schema upgrades to completion, then check for interrupt
//! 4. finish index drops left over from an interrupted run
//! 5. for a maintenance run, perform the requested drop and return
//! 6. otherwise seed genesis, create and backfill the configured indexes,
//!    start services, and wait for the interrupt
//!
//! Services stop in reverse start order before the store is closed.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use lode_core::error::LodeError;
use lode_core::genesis;

use crate::config::NodeConfig;
use crate::db::ChainDb;
use crate::engine::Engine;
use crate::indexers::IndexKind;
use crate::interrupt::Interrupt;
use crate::upgrade;

/// A long-running component started after the store is ready.
#[async_trait]
pub trait Service: Send {
    fn name(&self) -> &'static str;

    async fn start(&mut self) -> Result<(), LodeError>;

    /// Stop and wait until the service no longer touches the store.
    async fn stop(&mut self);
}

/// How [`Coordinator::run`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Services ran until the interrupt and were stopped.
    Completed,
    /// Shutdown was requested before services started.
    Interrupted,
    /// A maintenance drop ran; services were not started.
    Maintenance,
}

/// Closes the engine when dropped.
pub struct StoreGuard {
    engine: Arc<Engine>,
}

impl StoreGuard {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }
}

impl Drop for StoreGuard {
    fn drop(&mut self) {
        info!("gracefully shutting down the database");
        if let Err(e) = self.engine.close() {
            error!("failed to close database: {e}");
        }
    }
}

/// `Ok(None)` for an interrupt, so callers can turn it into a clean exit.
fn interrupted<T>(result: Result<T, LodeError>) -> Result<Option<T>, LodeError> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(LodeError::Interrupted) => Ok(None),
        Err(e) => Err(e),
    }
}

async fn stop_all(started: &mut Vec<Box<dyn Service>>) {
    while let Some(mut service) = started.pop() {
        service.stop().await;
        info!(service = service.name(), "service stopped");
    }
}

/// Runs the node's startup and shutdown sequence.
pub struct Coordinator {
    config: NodeConfig,
    interrupt: Interrupt,
}

impl Coordinator {
    pub fn new(config: NodeConfig, interrupt: Interrupt) -> Self {
        Self { config, interrupt }
    }

    /// Run until interrupted. `factory` builds the services once the store
    /// is ready; it is not called for maintenance or interrupted runs.
    pub async fn run<F>(self, factory: F) -> Result<RunOutcome, LodeError>
    where
        F: FnOnce(Arc<ChainDb>) -> Result<Vec<Box<dyn Service>>, LodeError>,
    {
        let interrupt = &self.interrupt;

        upgrade::upgrade_data_paths(&self.config.data_dir)?;
        if interrupt.is_requested() {
            return Ok(RunOutcome::Interrupted);
        }

        let engine = Engine::open(self.config.db_path(), &self.config.engine)?;
        let guard = StoreGuard::new(Arc::new(engine));
        info!(path = %self.config.db_path().display(), "database loaded");

        if interrupted(upgrade::upgrade(guard.engine(), interrupt))?.is_none() || interrupt.is_requested() {
            info!("interrupted during database upgrade");
            return Ok(RunOutcome::Interrupted);
        }

        let db = Arc::new(ChainDb::from_engine(Arc::clone(guard.engine())));
        if interrupted(db.indexes().resume_pending_drops(interrupt))?.is_none() {
            return Ok(RunOutcome::Interrupted);
        }

        if let Some(kind) = self.config.maintenance_drop() {
            return match interrupted(db.indexes().drop_index(kind, interrupt))? {
                Some(true) => Ok(RunOutcome::Maintenance),
                Some(false) => {
                    info!(index = %kind, "index does not exist; nothing to drop");
                    Ok(RunOutcome::Maintenance)
                }
                None => Ok(RunOutcome::Interrupted),
            };
        }

        db.blocks().ensure_genesis(genesis::genesis_block())?;
        let enabled = self.config.enabled_indexes();
        for kind in &enabled {
            db.indexes().create_index(*kind)?;
        }
        if interrupted(db.indexes().catch_up(interrupt))?.is_none() {
            info!("interrupted during index catch-up");
            return Ok(RunOutcome::Interrupted);
        }
        for kind in IndexKind::ALL {
            if !enabled.contains(&kind) && db.indexes().has_index(kind)? {
                warn!(index = %kind, "index is not enabled but exists; it is still maintained until dropped");
            }
        }

        let mut started: Vec<Box<dyn Service>> = Vec::new();
        for mut service in factory(Arc::clone(&db))? {
            if let Err(e) = service.start().await {
                error!(service = service.name(), "failed to start: {e}");
                stop_all(&mut started).await;
                return Err(e);
            }
            info!(service = service.name(), "service started");
            started.push(service);
        }

        interrupt.wait().await;
        info!("shutdown requested");
        stop_all(&mut started).await;
        drop(db);
        drop(guard);
        info!("shutdown complete");
        Ok(RunOutcome::Completed)
    }
}

/// Logs the best tip at a fixed interval.
pub struct TipReporter {
    db: Arc<ChainDb>,
    interval: Duration,
    task: Option<JoinHandle<()>>,
}

impl TipReporter {
    pub fn new(db: Arc<ChainDb>, interval: Duration) -> Self {
        Self {
            db,
            interval,
            task: None,
        }
    }
}

#[async_trait]
impl Service for TipReporter {
    fn name(&self) -> &'static str {
        "tip reporter"
    }

    async fn start(&mut self) -> Result<(), LodeError> {
        let db = Arc::clone(&self.db);
        let period = self.interval.max(Duration::from_millis(1));
        self.task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                match db.blocks().best_tip() {
                    Ok(Some(tip)) => info!(height = tip.height, hash = %tip.hash, "best chain tip"),
                    Ok(None) => info!("chain is empty"),
                    Err(e) => warn!("failed to read chain tip: {e}"),
                }
            }
        }));
        Ok(())
    }

    async fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
        }
    }
}
