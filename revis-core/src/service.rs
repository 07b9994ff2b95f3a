//! Top-level entry point for the calling layer.

use std::fmt;
use std::sync::Arc;

use revis_model::{ConnectionDescriptor, ScanPage, SessionId};
use tokio::task::JoinHandle;
use tracing::info;

use crate::backend::Connector;
use crate::config::ServiceConfig;
use crate::delete::DeleteReport;
use crate::error::Result;
use crate::registry::RunnerRegistry;
use crate::runner;
use crate::session::ScanBridge;
use crate::store::{ConnectionStore, InMemoryConnectionStore};

/// Owns the runner registry and the scan sessions. Construct one per process
/// and call [`RevisService::close`] on shutdown.
pub struct RevisService {
    config: ServiceConfig,
    registry: Arc<RunnerRegistry>,
    bridge: ScanBridge,
    sweeper: JoinHandle<()>,
}

impl fmt::Debug for RevisService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RevisService")
            .field("registry", &self.registry)
            .field("bridge", &self.bridge)
            .finish()
    }
}

impl RevisService {
    /// Must be called from within a Tokio runtime; spawns the session
    /// sweeper.
    pub fn new(
        config: ServiceConfig,
        store: Arc<dyn ConnectionStore>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let registry = Arc::new(RunnerRegistry::new(store, connector, config.clone()));
        let bridge = ScanBridge::new(Arc::clone(&registry), config.scan);
        let sweeper = bridge.spawn_sweeper();
        Self {
            config,
            registry,
            bridge,
            sweeper,
        }
    }

    /// Validates `config` and serves the connections it lists.
    pub fn from_config(config: ServiceConfig, connector: Arc<dyn Connector>) -> Result<Self> {
        config.validate()?;
        let store = InMemoryConnectionStore::from_descriptors(config.connections.clone());
        Ok(Self::new(config, Arc::new(store), connector))
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn registry(&self) -> &RunnerRegistry {
        &self.registry
    }

    pub fn sessions(&self) -> &ScanBridge {
        &self.bridge
    }

    pub async fn start_scan(&self, identity: &str, pattern: &str) -> Result<ScanPage> {
        self.bridge.start_scan(identity, pattern).await
    }

    /// Next page of a scan. Pass the id from the most recent page, not the
    /// first one: each id is consumed by the call that uses it.
    pub async fn continue_scan(&self, session_id: SessionId) -> Result<ScanPage> {
        self.bridge.continue_scan(session_id).await
    }

    pub async fn delete_matching(&self, identity: &str, pattern: &str) -> Result<DeleteReport> {
        let runner = self.registry.get_runner(identity).await?;
        runner.delete_matching(pattern).await
    }

    pub async fn flush(&self, identity: &str) -> Result<()> {
        let runner = self.registry.get_runner(identity).await?;
        runner.flush().await
    }

    /// Checks that `descriptor` can be dialed, authenticated and pinged,
    /// without touching any cached runner.
    pub async fn test_connection(&self, descriptor: &ConnectionDescriptor) -> Result<()> {
        let connector = self.registry.connector();
        runner::test_connection(
            connector.as_ref(),
            descriptor,
            self.config.pool.connect_timeout(),
        )
        .await
    }

    /// Drops the cached runner for `identity`, e.g. after its descriptor was
    /// edited or removed. The next use dials afresh.
    pub async fn close_connection(&self, identity: &str) -> bool {
        self.registry.close_runner(identity).await
    }

    /// Cancels every scan session and closes every pool.
    pub async fn close(&self) {
        self.bridge.shutdown();
        self.registry.close_all().await;
        info!("Revis service closed");
    }
}

impl Drop for RevisService {
    fn drop(&mut self) {
        self.sweeper.abort();
    }
}
