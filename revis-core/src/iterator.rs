//! Lazy, cursor-driven iteration over the keys matching a pattern.

use std::collections::VecDeque;
use std::fmt;

use revis_model::KeyRecord;
use tracing::debug;

use crate::backend::StoreConnection;
use crate::error::{Result, RevisError};
use crate::pool::{ConnectionPool, PooledConnection};

/// Walks a cursor scan, holding one pooled connection for its whole life.
///
/// Keys are buffered one scan step at a time. Once any step fails the error
/// is sticky: every later call returns it again without touching the backend.
/// Dropping the iterator (or calling [`KeyIterator::close`]) hands the
/// connection back to the pool.
pub struct KeyIterator {
    conn: PooledConnection,
    pattern: String,
    scan_count: usize,
    cursor: u64,
    buffer: VecDeque<String>,
    error: Option<RevisError>,
    steps: usize,
}

impl fmt::Debug for KeyIterator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyIterator")
            .field("pattern", &self.pattern)
            .field("cursor", &self.cursor)
            .field("buffered", &self.buffer.len())
            .field("steps", &self.steps)
            .field("failed", &self.error.is_some())
            .finish()
    }
}

impl KeyIterator {
    /// Checks out a connection and performs the first scan step.
    pub async fn open(pool: &ConnectionPool, pattern: &str, scan_count: usize) -> Result<Self> {
        let conn = pool.get().await?;
        let mut iterator = Self {
            conn,
            pattern: pattern.to_string(),
            scan_count: scan_count.max(1),
            cursor: 0,
            buffer: VecDeque::new(),
            error: None,
            steps: 0,
        };
        iterator.refill().await?;
        Ok(iterator)
    }

    /// `true` while keys are buffered or the cursor has not wrapped to zero.
    /// Always `false` once an error has been recorded.
    pub fn has_next(&self) -> bool {
        self.error.is_none() && (!self.buffer.is_empty() || self.cursor != 0)
    }

    /// Next key, or `None` once the scan is exhausted.
    ///
    /// Empty scan steps with a live cursor are skipped, so `has_next` may be
    /// `true` right before this returns `None`.
    pub async fn next(&mut self) -> Result<Option<KeyRecord>> {
        if let Some(err) = &self.error {
            return Err(err.clone());
        }

        loop {
            if let Some(key) = self.buffer.pop_front() {
                return Ok(Some(KeyRecord::new(key)));
            }
            if self.cursor == 0 {
                return Ok(None);
            }
            self.refill().await?;
        }
    }

    /// Connection the iterator holds, for issuing other commands between
    /// scan steps.
    pub fn connection(&mut self) -> &mut dyn StoreConnection {
        &mut *self.conn
    }

    /// Records `err` as the iterator's sticky error.
    pub(crate) fn poison(&mut self, err: RevisError) {
        self.conn.mark_broken();
        self.error = Some(err);
    }

    /// Returns the connection to the pool.
    pub fn close(self) {
        debug!(
            "Closing key iterator for {:?} after {} scan steps",
            self.pattern, self.steps
        );
    }

    async fn refill(&mut self) -> Result<()> {
        match self
            .conn
            .scan(self.cursor, &self.pattern, self.scan_count)
            .await
        {
            Ok((cursor, keys)) => {
                self.steps += 1;
                self.cursor = cursor;
                self.buffer.extend(keys);
                Ok(())
            }
            Err(e) => {
                let err = RevisError::iteration(e);
                self.poison(err.clone());
                Err(err)
            }
        }
    }
}
