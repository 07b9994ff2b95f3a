//! Paged scan sessions.
//!
//! A scan runs as a background producer that walks a [`KeyIterator`], fills
//! fixed-size chunks with types and values, and publishes them on a bounded
//! channel as [`ScanEvent`]s. Callers pull one page per request: the first
//! page comes back from [`ScanBridge::start_scan`] and later pages from
//! [`ScanBridge::continue_scan`], each under a fresh [`SessionId`].
//!
//! Dropping a session (on exhaustion, error, expiry or shutdown) cancels its
//! producer, which hands the iterator's connection back to the pool.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use revis_model::{KeyRecord, ScanPage, SessionId};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

use crate::config::ScanConfig;
use crate::error::{Result, RevisError};
use crate::iterator::KeyIterator;
use crate::registry::RunnerRegistry;
use crate::runner::{CommandRunner, fetch_metadata_and_values};

/// One unit published by a scan producer. `Done` and `Error` are terminal.
#[derive(Debug)]
pub enum ScanEvent {
    /// A full chunk, with more to follow.
    Chunk(Vec<KeyRecord>),
    /// The last chunk of the scan, possibly empty.
    Done(Vec<KeyRecord>),
    Error(RevisError),
}

struct ScanSession {
    events: mpsc::Receiver<ScanEvent>,
    identity: String,
    pattern: String,
    expires_at: Instant,
    _producer: DropGuard,
}

impl fmt::Debug for ScanSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScanSession")
            .field("identity", &self.identity)
            .field("pattern", &self.pattern)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

pub struct ScanBridge {
    registry: Arc<RunnerRegistry>,
    config: ScanConfig,
    sessions: Arc<DashMap<SessionId, ScanSession>>,
    shutdown: CancellationToken,
}

impl fmt::Debug for ScanBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScanBridge")
            .field("config", &self.config)
            .field("session_count", &self.sessions.len())
            .field("shutdown_cancelled", &self.shutdown.is_cancelled())
            .finish()
    }
}

impl ScanBridge {
    pub fn new(registry: Arc<RunnerRegistry>, config: ScanConfig) -> Self {
        Self {
            registry,
            config,
            sessions: Arc::new(DashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Spawns the task that drops sessions nobody continued in time. Must be
    /// called from within a Tokio runtime.
    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        let sessions = Arc::clone(&self.sessions);
        let shutdown = self.shutdown.clone();
        let every = self.config.sweep_interval();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!("Scan session sweeper shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        expire_sessions(&sessions, Instant::now());
                    }
                }
            }
        })
    }

    /// Starts a scan and waits for its first page.
    ///
    /// A session is kept only when the page says more follow; a scan that is
    /// already exhausted (including one with no matches) leaves nothing
    /// behind.
    pub async fn start_scan(&self, identity: &str, pattern: &str) -> Result<ScanPage> {
        let runner = self.registry.get_runner(identity).await?;
        let cancel = self.shutdown.child_token();
        let mut events = spawn_producer(runner, pattern.to_string(), self.config, cancel.clone());
        let producer = cancel.drop_guard();

        match next_event(&mut events).await {
            ScanEvent::Chunk(keys) => {
                let id = SessionId::new();
                self.sessions.insert(
                    id,
                    ScanSession {
                        events,
                        identity: identity.to_string(),
                        pattern: pattern.to_string(),
                        expires_at: self.next_expiry(),
                        _producer: producer,
                    },
                );
                info!(
                    "Started scan session {} for {:?} on {}",
                    id, pattern, identity
                );
                Ok(ScanPage::continued(keys, id))
            }
            ScanEvent::Done(keys) => {
                debug!(
                    "Scan for {:?} on {} finished in one page of {} keys",
                    pattern,
                    identity,
                    keys.len()
                );
                Ok(ScanPage::last(keys))
            }
            ScanEvent::Error(err) => Err(err),
        }
    }

    /// Waits for the next page of the session `id`.
    ///
    /// The id is consumed: when more pages follow, the returned page carries
    /// a new id for the next call. Unknown or already consumed ids fail with
    /// [`RevisError::SessionNotFound`] without touching any producer.
    pub async fn continue_scan(&self, id: SessionId) -> Result<ScanPage> {
        let Some((_, mut session)) = self.sessions.remove(&id) else {
            return Err(RevisError::SessionNotFound(id));
        };

        match next_event(&mut session.events).await {
            ScanEvent::Chunk(keys) => {
                let next_id = SessionId::new();
                session.expires_at = self.next_expiry();
                self.sessions.insert(next_id, session);
                Ok(ScanPage::continued(keys, next_id))
            }
            ScanEvent::Done(keys) => {
                info!(
                    "Scan session {} for {:?} on {} finished",
                    id, session.pattern, session.identity
                );
                Ok(ScanPage::last(keys))
            }
            ScanEvent::Error(err) => {
                warn!(
                    "Scan session {} for {:?} on {} failed: {}",
                    id, session.pattern, session.identity, err
                );
                Err(err)
            }
        }
    }

    /// Drops every session whose idle deadline has passed. Returns how many
    /// were dropped.
    pub fn sweep_expired(&self) -> usize {
        expire_sessions(&self.sessions, Instant::now())
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Cancels every producer and forgets every session.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.sessions.clear();
    }

    fn next_expiry(&self) -> Instant {
        Instant::now() + self.config.session_idle_timeout()
    }
}

impl Drop for ScanBridge {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn expire_sessions(sessions: &DashMap<SessionId, ScanSession>, now: Instant) -> usize {
    let before = sessions.len();
    sessions.retain(|id, session| {
        let live = session.expires_at > now;
        if !live {
            warn!(
                "Scan session {} for {:?} on {} expired without being continued",
                id, session.pattern, session.identity
            );
        }
        live
    });
    before.saturating_sub(sessions.len())
}

async fn next_event(events: &mut mpsc::Receiver<ScanEvent>) -> ScanEvent {
    events.recv().await.unwrap_or_else(|| {
        ScanEvent::Error(RevisError::Cancelled(
            "scan producer stopped before finishing".to_string(),
        ))
    })
}

/// Launches the producer plus a supervisor that turns a failed or panicked
/// producer into a terminal [`ScanEvent::Error`].
fn spawn_producer(
    runner: Arc<CommandRunner>,
    pattern: String,
    config: ScanConfig,
    cancel: CancellationToken,
) -> mpsc::Receiver<ScanEvent> {
    // Room for every chunk a capped scan can produce, a trailing empty `Done`
    // and a supervisor error, so the producer never waits on a slow consumer.
    let (tx, rx) = mpsc::channel(config.buffered_chunks() + 2);
    let identity = runner.identity().to_string();
    let producer = tokio::spawn(produce(runner, pattern, config, tx.clone(), cancel));
    tokio::spawn(supervise(producer, tx, identity));
    rx
}

async fn supervise(
    producer: JoinHandle<Result<()>>,
    events: mpsc::Sender<ScanEvent>,
    identity: String,
) {
    let err = match producer.await {
        Ok(Ok(())) => return,
        Ok(Err(err)) if err.is_cancelled() => {
            debug!("Scan producer for {} cancelled", identity);
            return;
        }
        Ok(Err(err)) => err,
        Err(join_err) if join_err.is_cancelled() => return,
        Err(join_err) => {
            RevisError::Internal(format!("scan producer for {identity} panicked: {join_err}"))
        }
    };

    debug!("Scan producer for {} failed: {}", identity, err);
    if events.send(ScanEvent::Error(err)).await.is_err() {
        debug!("Scan session for {} already gone; dropping error", identity);
    }
}

async fn produce(
    runner: Arc<CommandRunner>,
    pattern: String,
    config: ScanConfig,
    events: mpsc::Sender<ScanEvent>,
    cancel: CancellationToken,
) -> Result<()> {
    let chunk_size = config.chunk_size.max(1);
    let cap = config.max_keys_per_session.max(1);

    let mut keys = until_cancelled(&cancel, runner.key_iterator(&pattern)).await?;
    let mut chunk = Vec::with_capacity(chunk_size.min(cap));
    let mut scanned = 0usize;

    while keys.has_next() && scanned < cap {
        let Some(record) = until_cancelled(&cancel, keys.next()).await? else {
            break;
        };
        chunk.push(record);
        scanned += 1;

        if chunk.len() >= chunk_size {
            fill_values(&cancel, &mut keys, &mut chunk).await?;
            let full = std::mem::replace(&mut chunk, Vec::with_capacity(chunk_size));
            if keys.has_next() && scanned < cap {
                publish(&events, ScanEvent::Chunk(full)).await?;
            } else {
                keys.close();
                return publish(&events, ScanEvent::Done(full)).await;
            }
        }
    }

    fill_values(&cancel, &mut keys, &mut chunk).await?;
    keys.close();
    debug!("Scan of {:?} produced {} keys", pattern, scanned);
    publish(&events, ScanEvent::Done(chunk)).await
}

/// Fetches types and values on the iterator's own connection.
async fn fill_values(
    cancel: &CancellationToken,
    keys: &mut KeyIterator,
    chunk: &mut [KeyRecord],
) -> Result<()> {
    let fetched =
        until_cancelled(cancel, fetch_metadata_and_values(keys.connection(), chunk)).await;
    if let Err(err) = &fetched {
        keys.poison(err.clone());
    }
    fetched
}

async fn publish(events: &mpsc::Sender<ScanEvent>, event: ScanEvent) -> Result<()> {
    events
        .send(event)
        .await
        .map_err(|_| RevisError::Cancelled("scan session dropped".to_string()))
}

async fn until_cancelled<T>(
    cancel: &CancellationToken,
    work: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(RevisError::Cancelled("scan session closed".to_string())),
        outcome = work => outcome,
    }
}
