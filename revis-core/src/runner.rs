//! Commands against one remote store, backed by its connection pool.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use revis_model::{ConnectionDescriptor, HashField, KeyKind, KeyRecord, KeyValue, ScoredMember};
use tracing::{debug, info};

use crate::backend::{BackendError, Connector, Reply, StoreConnection, ValueCommand, ValueQuery};
use crate::config::ServiceConfig;
use crate::delete::{DeleteCoordinator, DeleteReport};
use crate::error::{Result, RevisError};
use crate::iterator::KeyIterator;
use crate::pool::ConnectionPool;

/// Owns the pool for one connection identity.
pub struct CommandRunner {
    pool: ConnectionPool,
    config: ServiceConfig,
}

impl fmt::Debug for CommandRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandRunner")
            .field("pool", &self.pool)
            .finish()
    }
}

impl CommandRunner {
    /// Builds the pool and opens its first connection, so dial, auth and
    /// select failures surface here instead of on first use.
    pub async fn connect(
        descriptor: ConnectionDescriptor,
        connector: Arc<dyn Connector>,
        config: ServiceConfig,
    ) -> Result<Self> {
        let pool = ConnectionPool::new(descriptor, connector, config.pool);
        drop(pool.get().await?);
        info!("Connected runner for {}", pool.identity());
        Ok(Self { pool, config })
    }

    pub fn identity(&self) -> &str {
        self.pool.identity()
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Connections currently checked out of this runner's pool.
    pub fn in_use(&self) -> usize {
        self.pool.in_use()
    }

    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }

    pub async fn key_iterator(&self, pattern: &str) -> Result<KeyIterator> {
        KeyIterator::open(&self.pool, pattern, self.config.scan.scan_count).await
    }

    /// Resolves type and value for every key in `batch`, in place and in
    /// order, using a pooled connection.
    pub async fn fetch_batch_metadata_and_values(&self, batch: &mut [KeyRecord]) -> Result<()> {
        let mut conn = self.pool.get().await?;
        let outcome = fetch_metadata_and_values(&mut *conn, batch).await;
        if outcome.is_err() {
            conn.mark_broken();
        }
        outcome
    }

    pub async fn delete_matching(&self, pattern: &str) -> Result<DeleteReport> {
        DeleteCoordinator::new(self.pool.clone(), self.config.scan, self.config.delete)
            .run(pattern)
            .await
    }

    /// Clears the whole selected database.
    pub async fn flush(&self) -> Result<()> {
        let mut conn = self.pool.get().await?;
        info!("Flushing database behind {}", self.identity());
        let outcome = conn.flush_db().await;
        if let Err(e @ (BackendError::Io(_) | BackendError::Timeout(_))) = &outcome {
            debug!("Discarding connection after failed flush: {}", e);
            conn.mark_broken();
        }
        outcome.map_err(RevisError::command)
    }

    pub fn close(&self) {
        self.pool.close();
    }
}

/// Two pipelined round trips over `conn`: one `TYPE` per key, then the
/// matching value read per key. Any decode failure fails the whole batch.
pub async fn fetch_metadata_and_values(
    conn: &mut dyn StoreConnection,
    batch: &mut [KeyRecord],
) -> Result<()> {
    if batch.is_empty() {
        return Ok(());
    }

    let keys: Vec<String> = batch.iter().map(|record| record.key.clone()).collect();
    let types = conn.key_types(&keys).await.map_err(RevisError::fetch)?;
    if types.len() != batch.len() {
        return Err(RevisError::Fetch(format!(
            "expected {} TYPE replies, got {}",
            batch.len(),
            types.len()
        )));
    }

    for (record, tag) in batch.iter_mut().zip(&types) {
        record.kind = match KeyKind::from_type_tag(tag) {
            KeyKind::String => None,
            other => Some(other),
        };
    }

    let queries: Vec<ValueQuery<'_>> = batch
        .iter()
        .map(|record| ValueQuery {
            key: &record.key,
            command: ValueCommand::for_kind(record.effective_kind()),
        })
        .collect();
    let replies = conn.fetch_values(&queries).await.map_err(RevisError::fetch)?;
    if replies.len() != batch.len() {
        return Err(RevisError::Fetch(format!(
            "expected {} value replies, got {}",
            batch.len(),
            replies.len()
        )));
    }

    for (record, reply) in batch.iter_mut().zip(replies) {
        record.value = decode_value(record.effective_kind(), reply)
            .map_err(|e| RevisError::Fetch(format!("{}: {e}", record.key)))?;
    }

    debug!("Fetched values for {} keys", batch.len());
    Ok(())
}

/// Decodes one value reply. `Nil` means the key disappeared after it was
/// scanned.
pub fn decode_value(
    kind: KeyKind,
    reply: Reply,
) -> std::result::Result<Option<KeyValue>, BackendError> {
    let value = match (kind, reply) {
        (_, Reply::Nil) => return Ok(None),
        (KeyKind::String, Reply::Text(text)) => KeyValue::Scalar(text),
        (KeyKind::List, Reply::Items(items)) => KeyValue::List(items),
        (KeyKind::Set, Reply::Items(items)) => KeyValue::Set(items),
        (KeyKind::SortedSet, Reply::Items(items)) => {
            let members = pairs(items)?
                .map(|(member, score)| {
                    score
                        .parse::<f64>()
                        .map(|score| ScoredMember { member, score })
                        .map_err(|e| {
                            BackendError::Protocol(format!("invalid score {score:?}: {e}"))
                        })
                })
                .collect::<std::result::Result<Vec<_>, _>>()?;
            KeyValue::SortedSet(members)
        }
        (KeyKind::Hash, Reply::Items(items)) => KeyValue::Hash(
            pairs(items)?
                .map(|(field, value)| HashField { field, value })
                .collect(),
        ),
        (kind, reply) => {
            return Err(BackendError::Protocol(format!(
                "unexpected reply for {kind} value: {reply:?}"
            )));
        }
    };
    Ok(Some(value))
}

fn pairs(
    items: Vec<String>,
) -> std::result::Result<impl Iterator<Item = (String, String)>, BackendError> {
    if items.len() % 2 != 0 {
        return Err(BackendError::Protocol(format!(
            "expected field/value pairs, got {} elements",
            items.len()
        )));
    }
    let mut items = items.into_iter();
    Ok(std::iter::from_fn(move || Some((items.next()?, items.next()?))))
}

/// Dials a one-off connection, authenticates, selects the database and
/// expects `PONG` back from a ping.
pub async fn test_connection(
    connector: &dyn Connector,
    descriptor: &ConnectionDescriptor,
    timeout: Duration,
) -> Result<()> {
    let mut conn = connector
        .connect(descriptor, timeout)
        .await
        .map_err(|e| RevisError::Connection(format!("{}: {e}", descriptor.address())))?;
    let reply = conn.ping().await.map_err(RevisError::connection)?;
    if reply != "PONG" {
        return Err(RevisError::Connection(format!(
            "unexpected connection test reply from {}: {reply:?}",
            descriptor.address()
        )));
    }
    Ok(())
}
