//! Bounded pool of live connections to one remote store.
//!
//! Connections are dialed lazily on checkout and handed back on drop of the
//! [`PooledConnection`] guard. The pool counts checked-out connections so the
//! registry can tell whether closing it would pull a connection out from under
//! an in-flight iterator.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;
use revis_model::ConnectionDescriptor;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use crate::backend::{Connector, StoreConnection};
use crate::config::PoolConfig;
use crate::error::{Result, RevisError};

struct PoolInner {
    identity: String,
    descriptor: ConnectionDescriptor,
    connector: Arc<dyn Connector>,
    config: PoolConfig,
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<Box<dyn StoreConnection>>>,
    in_use: AtomicUsize,
    closed: AtomicBool,
}

/// Cheap to clone; clones share the same connections.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("identity", &self.inner.identity)
            .field("max_connections", &self.inner.config.max_connections)
            .field("in_use", &self.in_use())
            .field("idle", &self.idle_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl ConnectionPool {
    pub fn new(
        descriptor: ConnectionDescriptor,
        connector: Arc<dyn Connector>,
        config: PoolConfig,
    ) -> Self {
        let max_connections = config.max_connections.max(1);
        Self {
            inner: Arc::new(PoolInner {
                identity: descriptor.identity(),
                descriptor,
                connector,
                config,
                permits: Arc::new(Semaphore::new(max_connections)),
                idle: Mutex::new(Vec::with_capacity(max_connections)),
                in_use: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn identity(&self) -> &str {
        &self.inner.identity
    }

    pub fn descriptor(&self) -> &ConnectionDescriptor {
        &self.inner.descriptor
    }

    /// Checks out a connection, reusing an idle one or dialing a new one.
    /// Waits for a free slot at most `checkout_timeout`.
    pub async fn get(&self) -> Result<PooledConnection> {
        if self.is_closed() {
            return Err(self.closed_error());
        }

        let checkout_timeout = self.inner.config.checkout_timeout();
        let permit = tokio::time::timeout(
            checkout_timeout,
            Arc::clone(&self.inner.permits).acquire_owned(),
        )
        .await
        .map_err(|_| {
            RevisError::Connection(format!(
                "{}: no pooled connection became free within {:?}",
                self.inner.identity, checkout_timeout
            ))
        })?
        .map_err(|_| self.closed_error())?;

        self.inner.in_use.fetch_add(1, Ordering::SeqCst);
        let mut guard = PooledConnection {
            pool: Arc::clone(&self.inner),
            conn: None,
            broken: false,
            _permit: permit,
        };

        let reused = self.inner.idle.lock().pop();
        let conn = match reused {
            Some(conn) => conn,
            None => {
                debug!("Opening new pooled connection to {}", self.inner.identity);
                self.inner
                    .connector
                    .connect(&self.inner.descriptor, self.inner.config.connect_timeout())
                    .await
                    .map_err(|e| {
                        RevisError::Connection(format!("{}: {e}", self.inner.identity))
                    })?
            }
        };
        guard.conn = Some(conn);
        Ok(guard)
    }

    /// Connections currently checked out.
    pub fn in_use(&self) -> usize {
        self.inner.in_use.load(Ordering::SeqCst)
    }

    pub fn idle_count(&self) -> usize {
        self.inner.idle.lock().len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Drops idle connections and refuses further checkouts. Connections still
    /// checked out are dropped when their guards are released.
    pub fn close(&self) {
        let drained: Vec<_> = {
            let mut idle = self.inner.idle.lock();
            if self.inner.closed.swap(true, Ordering::SeqCst) {
                return;
            }
            idle.drain(..).collect()
        };
        self.inner.permits.close();
        debug!(
            "Closed pool for {} ({} idle connections released, {} still checked out)",
            self.inner.identity,
            drained.len(),
            self.in_use()
        );
    }

    fn closed_error(&self) -> RevisError {
        RevisError::PoolClosed(self.inner.identity.clone())
    }
}

/// A checked-out connection. Returned to the pool on drop unless the pool has
/// been closed or the connection was marked broken.
pub struct PooledConnection {
    pool: Arc<PoolInner>,
    conn: Option<Box<dyn StoreConnection>>,
    broken: bool,
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    /// Discard this connection instead of reusing it, e.g. after an I/O
    /// failure left it in an unknown protocol state.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("identity", &self.pool.identity)
            .field("broken", &self.broken)
            .finish()
    }
}

impl Deref for PooledConnection {
    type Target = dyn StoreConnection;

    fn deref(&self) -> &Self::Target {
        self.conn
            .as_deref()
            .expect("pooled connection is present until drop")
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn
            .as_deref_mut()
            .expect("pooled connection is present until drop")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        self.pool.in_use.fetch_sub(1, Ordering::SeqCst);
        let Some(conn) = self.conn.take() else {
            return;
        };
        if self.broken {
            warn!("Discarding broken connection to {}", self.pool.identity);
            return;
        }
        let mut idle = self.pool.idle.lock();
        if !self.pool.closed.load(Ordering::SeqCst) {
            idle.push(conn);
        }
    }
}
