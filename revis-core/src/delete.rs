//! Bulk deletion of every key matching a pattern.
//!
//! Keys are collected from a [`KeyIterator`] into large batches; each batch is
//! unlinked by its own task on its own pooled connection. One failing batch
//! does not stop its siblings. The report carries the count of keys removed by
//! batches that succeeded plus the first error seen anywhere.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::{DeleteConfig, ScanConfig};
use crate::error::{Result, RevisError};
use crate::iterator::KeyIterator;
use crate::pool::ConnectionPool;

/// Aggregate outcome of a delete.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteReport {
    /// Keys removed by batches that completed.
    pub count: usize,
    /// `true` when iteration and every batch succeeded.
    pub deleted_all_keys: bool,
    #[serde(skip)]
    pub error: Option<RevisError>,
}

impl DeleteReport {
    /// Collapses the report into the first error, if any.
    pub fn into_result(self) -> Result<usize> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.count),
        }
    }
}

#[derive(Debug, Default)]
struct DeleteStatus {
    count: usize,
    first_error: Option<RevisError>,
}

/// Shared progress of one delete: a running count and a first-error latch
/// behind one lock.
#[derive(Debug, Clone, Default)]
struct DeleteJob {
    status: Arc<Mutex<DeleteStatus>>,
}

impl DeleteJob {
    fn add_count(&self, deleted: usize) {
        self.status.lock().count += deleted;
    }

    fn record_error(&self, err: RevisError) {
        let mut status = self.status.lock();
        if status.first_error.is_none() {
            status.first_error = Some(err);
        } else {
            debug!("Suppressing subsequent delete error: {}", err);
        }
    }

    fn report(&self) -> DeleteReport {
        let status = self.status.lock();
        DeleteReport {
            count: status.count,
            deleted_all_keys: status.first_error.is_none(),
            error: status.first_error.clone(),
        }
    }
}

#[derive(Debug)]
pub struct DeleteCoordinator {
    pool: ConnectionPool,
    scan: ScanConfig,
    delete: DeleteConfig,
}

impl DeleteCoordinator {
    pub fn new(pool: ConnectionPool, scan: ScanConfig, delete: DeleteConfig) -> Self {
        Self { pool, scan, delete }
    }

    /// Runs the delete to completion: returns only after iteration and every
    /// dispatched batch have finished.
    pub async fn run(&self, pattern: &str) -> Result<DeleteReport> {
        let job = DeleteJob::default();

        let iteration = tokio::spawn(drive_deletion(
            self.pool.clone(),
            pattern.to_string(),
            self.scan.scan_count,
            self.delete.batch_size.max(1),
            job.clone(),
        ));

        if let Err(join_err) = iteration.await {
            job.record_error(RevisError::Internal(format!(
                "delete iteration task aborted: {join_err}"
            )));
        }

        let report = job.report();
        match &report.error {
            Some(err) => warn!(
                "Delete of {:?} on {} finished with error after {} keys: {}",
                pattern,
                self.pool.identity(),
                report.count,
                err
            ),
            None => info!(
                "Deleted {} keys matching {:?} on {}",
                report.count,
                pattern,
                self.pool.identity()
            ),
        }
        Ok(report)
    }
}

/// Iterates keys, dispatching a batch task whenever `batch_size` keys are
/// buffered and once more at the end, then waits for all batches. An
/// iteration failure is latched as soon as it happens, ahead of any batch
/// that fails later.
async fn drive_deletion(
    pool: ConnectionPool,
    pattern: String,
    scan_count: usize,
    batch_size: usize,
    job: DeleteJob,
) {
    let mut batches = JoinSet::new();
    if let Err(err) =
        collect_and_dispatch(&pool, &pattern, scan_count, batch_size, &job, &mut batches).await
    {
        warn!("Iterating keys for delete of {:?} failed: {}", pattern, err);
        job.record_error(err);
    }

    // Batches already dispatched run to completion even when iteration failed.
    while let Some(joined) = batches.join_next().await {
        if let Err(join_err) = joined {
            job.record_error(RevisError::Internal(format!(
                "delete batch task aborted: {join_err}"
            )));
        }
    }
}

async fn collect_and_dispatch(
    pool: &ConnectionPool,
    pattern: &str,
    scan_count: usize,
    batch_size: usize,
    job: &DeleteJob,
    batches: &mut JoinSet<()>,
) -> Result<()> {
    let mut keys = KeyIterator::open(pool, pattern, scan_count).await?;
    let mut pending = Vec::with_capacity(batch_size.min(4_096));

    while keys.has_next() {
        let Some(record) = keys.next().await? else {
            break;
        };
        pending.push(record.key);
        if pending.len() >= batch_size {
            let batch = std::mem::take(&mut pending);
            batches.spawn(unlink_batch(pool.clone(), batch, job.clone()));
        }
    }

    // Release the iterator's connection before the last batch needs one.
    keys.close();
    if !pending.is_empty() {
        batches.spawn(unlink_batch(pool.clone(), pending, job.clone()));
    }
    Ok(())
}

async fn unlink_batch(pool: ConnectionPool, keys: Vec<String>, job: DeleteJob) {
    let outcome = async {
        let mut conn = pool.get().await?;
        match conn.unlink(&keys).await {
            Ok(deleted) => Ok(deleted),
            Err(e) => {
                conn.mark_broken();
                Err(RevisError::delete_batch(e))
            }
        }
    }
    .await;

    match outcome {
        Ok(deleted) => {
            debug!("Unlinked {} of {} keys in batch", deleted, keys.len());
            job.add_count(deleted);
        }
        Err(err) => {
            warn!("Delete batch of {} keys failed: {}", keys.len(), err);
            job.record_error(err);
        }
    }
}
