//! Runner registry: one [`CommandRunner`] per connection identity.
//!
//! Runners are built on first use and forgotten after sitting idle for the
//! configured window. Every entry gets its own timer task; a lookup pushes the
//! deadline back. A timer that fires while the runner's pool still has
//! connections checked out re-arms instead of closing the pool.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::backend::Connector;
use crate::config::ServiceConfig;
use crate::error::{Result, RevisError};
use crate::runner::CommandRunner;
use crate::store::ConnectionStore;

struct RegistryEntry {
    runner: Arc<CommandRunner>,
    last_used: Instant,
    timer: CancellationToken,
}

type Entries = Arc<Mutex<HashMap<String, RegistryEntry>>>;

pub struct RunnerRegistry {
    store: Arc<dyn ConnectionStore>,
    connector: Arc<dyn Connector>,
    config: ServiceConfig,
    entries: Entries,
    shutdown: CancellationToken,
}

impl fmt::Debug for RunnerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let runner_count = self
            .entries
            .try_lock()
            .map(|entries| entries.len())
            .unwrap_or_default();
        f.debug_struct("RunnerRegistry")
            .field("store", &self.store)
            .field("connector", &self.connector)
            .field("idle_timeout", &self.config.registry.idle_timeout())
            .field("runner_count", &runner_count)
            .finish()
    }
}

impl RunnerRegistry {
    pub fn new(
        store: Arc<dyn ConnectionStore>,
        connector: Arc<dyn Connector>,
        config: ServiceConfig,
    ) -> Self {
        Self {
            store,
            connector,
            config,
            entries: Arc::new(Mutex::new(HashMap::new())),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::clone(&self.connector)
    }

    /// Runner for `identity`, building and connecting one if none is cached.
    /// A runner that fails to connect is never cached. Once the registry is
    /// closed every lookup fails with [`RevisError::PoolClosed`].
    pub async fn get_runner(&self, identity: &str) -> Result<Arc<CommandRunner>> {
        if self.is_closed() {
            return Err(RevisError::PoolClosed(identity.to_string()));
        }
        if let Some(runner) = self.touch(identity).await {
            return Ok(runner);
        }

        let descriptor = self.store.resolve(identity).await?;
        let runner = Arc::new(
            CommandRunner::connect(descriptor, Arc::clone(&self.connector), self.config.clone())
                .await?,
        );

        let mut entries = self.entries.lock().await;
        if self.is_closed() {
            drop(entries);
            runner.close();
            debug!("Registry closed while dialing {}", identity);
            return Err(RevisError::PoolClosed(identity.to_string()));
        }
        if let Some(entry) = entries.get_mut(identity) {
            // Another caller connected the same identity while we dialed.
            entry.last_used = Instant::now();
            let existing = Arc::clone(&entry.runner);
            drop(entries);
            runner.close();
            debug!("Discarded duplicate runner for {}", identity);
            return Ok(existing);
        }

        let timer = self.shutdown.child_token();
        entries.insert(
            identity.to_string(),
            RegistryEntry {
                runner: Arc::clone(&runner),
                last_used: Instant::now(),
                timer: timer.clone(),
            },
        );
        drop(entries);

        tokio::spawn(watch_idle(
            Arc::clone(&self.entries),
            identity.to_string(),
            Arc::clone(&runner),
            self.config.registry.idle_timeout(),
            timer,
        ));
        info!("Registered runner for {}", identity);
        Ok(runner)
    }

    /// Closes and forgets the runner for `identity`. Returns `false` when
    /// there was nothing to close.
    pub async fn close_runner(&self, identity: &str) -> bool {
        let removed = self.entries.lock().await.remove(identity);
        match removed {
            Some(entry) => {
                entry.timer.cancel();
                entry.runner.close();
                info!("Closed runner for {}", identity);
                true
            }
            None => false,
        }
    }

    /// Closes every runner and refuses further lookups.
    pub async fn close_all(&self) {
        let drained: Vec<(String, RegistryEntry)> = {
            let mut entries = self.entries.lock().await;
            self.shutdown.cancel();
            entries.drain().collect()
        };
        for (identity, entry) in drained {
            entry.timer.cancel();
            entry.runner.close();
            debug!("Closed runner for {}", identity);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    pub async fn contains(&self, identity: &str) -> bool {
        self.entries.lock().await.contains_key(identity)
    }

    async fn touch(&self, identity: &str) -> Option<Arc<CommandRunner>> {
        let mut entries = self.entries.lock().await;
        let entry = entries.get_mut(identity)?;
        entry.last_used = Instant::now();
        Some(Arc::clone(&entry.runner))
    }
}

impl Drop for RunnerRegistry {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Sleeps until the entry's deadline and evicts it if nothing used it in the
/// meantime. Exits as soon as the entry is replaced or removed.
async fn watch_idle(
    entries: Entries,
    identity: String,
    runner: Arc<CommandRunner>,
    idle: Duration,
    timer: CancellationToken,
) {
    let mut deadline = Instant::now() + idle;
    loop {
        tokio::select! {
            _ = timer.cancelled() => return,
            _ = tokio::time::sleep_until(deadline) => {}
        }

        let mut guard = entries.lock().await;
        let Some(entry) = guard.get_mut(&identity) else {
            return;
        };
        if !Arc::ptr_eq(&entry.runner, &runner) {
            return;
        }

        let now = Instant::now();
        if entry.last_used + idle > now {
            deadline = entry.last_used + idle;
            continue;
        }
        let in_use = runner.in_use();
        if in_use > 0 {
            debug!(
                "Deferring eviction of {}: {} connections still checked out",
                identity, in_use
            );
            entry.last_used = now;
            deadline = now + idle;
            continue;
        }

        guard.remove(&identity);
        drop(guard);
        runner.close();
        info!("Evicted idle runner for {}", identity);
        return;
    }
}
