//! Batch apply entry points
//!
//! A batch is cut into segments at command entries. Each command runs alone
//! as a barrier; the CRUD entries between commands are spread over the writer
//! pool by conflict key.

use super::writer_pool::{ApplyMode, WriterPool, WriterReport};
use crate::error::{ReplError, ReplResult};
use crate::ingestion::MissingDocumentSource;
use crate::oplog::{ConflictKey, OpTime, OperationKind, OplogEntry};
use crate::storage::{StorageEngine, StorageError};
use std::collections::HashSet;
use tracing::{debug, error, info, warn};

/// Split a batch so that every command sits in its own segment
fn segments(batch: Vec<OplogEntry>) -> Vec<Vec<OplogEntry>> {
    let mut segments = Vec::new();
    let mut current = Vec::new();

    for entry in batch {
        if entry.kind == OperationKind::Command {
            if !current.is_empty() {
                segments.push(std::mem::take(&mut current));
            }
            segments.push(vec![entry]);
        } else {
            current.push(entry);
        }
    }
    if !current.is_empty() {
        segments.push(current);
    }
    segments
}

fn bounds(batch: &[OplogEntry]) -> ReplResult<(OpTime, OpTime)> {
    match (batch.first(), batch.last()) {
        (Some(first), Some(last)) => Ok((first.op_time, last.op_time)),
        _ => Err(ReplError::IllegalState("cannot apply an empty batch".into())),
    }
}

/// The failure with the lowest OpTime across all writers
fn earliest_failure(reports: &mut [WriterReport]) -> Option<(OpTime, StorageError)> {
    let idx = reports
        .iter()
        .enumerate()
        .filter_map(|(i, r)| r.failure.as_ref().map(|(op, _)| (i, *op)))
        .min_by_key(|(_, op)| *op)
        .map(|(i, _)| i)?;
    reports[idx].failure.take()
}

/// Steady-state apply: every entry must apply cleanly.
///
/// Returns the OpTime of the last entry in the batch.
pub async fn multi_sync_apply(pool: &WriterPool, batch: Vec<OplogEntry>) -> ReplResult<OpTime> {
    let (start, end) = bounds(&batch)?;
    let count = batch.len();

    for segment in segments(batch) {
        let mut reports = pool.apply(segment, ApplyMode::SteadyState).await?;
        if let Some((at, source)) = earliest_failure(&mut reports) {
            error!("Batch starting at {} failed at {}: {}", start, at, source);
            return Err(ReplError::ApplyFailed { start, source });
        }
    }

    debug!("Applied {} entries through {}", count, end);
    Ok(end)
}

/// Initial-sync apply: tolerates entries that reference documents not yet
/// copied. Those entries are retried after fetching the document from the
/// sync source, for at most `max_retries` rounds per segment.
pub async fn multi_initial_sync_apply(
    pool: &WriterPool,
    batch: Vec<OplogEntry>,
    missing: Option<&MissingDocumentSource>,
    max_retries: u32,
) -> ReplResult<OpTime> {
    let (start, end) = bounds(&batch)?;

    for segment in segments(batch) {
        apply_initial_sync_segment(pool, segment, start, missing, max_retries).await?;
    }
    Ok(end)
}

async fn apply_initial_sync_segment(
    pool: &WriterPool,
    segment: Vec<OplogEntry>,
    start: OpTime,
    missing: Option<&MissingDocumentSource>,
    max_retries: u32,
) -> ReplResult<()> {
    let mut pending = segment;
    let mut round = 0;

    loop {
        let mut reports = pool.apply(pending, ApplyMode::InitialSync).await?;
        if let Some((at, source)) = earliest_failure(&mut reports) {
            error!("Initial sync batch starting at {} failed at {}: {}", start, at, source);
            return Err(ReplError::ApplyFailed { start, source });
        }

        let mut deferred: Vec<OplogEntry> = reports.into_iter().flat_map(|r| r.deferred).collect();
        if deferred.is_empty() {
            return Ok(());
        }
        // Stable: same-key entries come from one writer, already in order
        deferred.sort_by_key(|e| e.op_time);

        if round >= max_retries {
            let head = &deferred[0];
            let id = head.conflict_key().map(|k| k.id).unwrap_or_default();
            error!(
                "Giving up on {} after {} retry round(s): {} entries still reference missing documents",
                head.op_time,
                round,
                deferred.len()
            );
            return Err(ReplError::ApplyFailed {
                start,
                source: StorageError::MissingDocument {
                    namespace: head.namespace.clone(),
                    id,
                },
            });
        }
        round += 1;
        info!("Retrying {} deferred entries (round {}/{})", deferred.len(), round, max_retries);

        pending = resolve_missing(pool.storage().as_ref(), deferred, missing, start).await?;
    }
}

/// Fetch the document behind the first deferred entry of each key.
///
/// A fetched document is inserted and its entries retried. A document the
/// source no longer has is deleted later in the log, so the blocking entry is
/// dropped.
async fn resolve_missing(
    storage: &dyn StorageEngine,
    deferred: Vec<OplogEntry>,
    missing: Option<&MissingDocumentSource>,
    start: OpTime,
) -> ReplResult<Vec<OplogEntry>> {
    let missing = match missing {
        Some(missing) => missing,
        None => return Ok(deferred),
    };

    let mut seen: HashSet<ConflictKey> = HashSet::new();
    let mut skipped: HashSet<OpTime> = HashSet::new();

    for head in &deferred {
        let key = match head.conflict_key() {
            Some(key) => key,
            None => continue,
        };
        if !seen.insert(key) {
            continue;
        }
        let id = match head.document_id() {
            Some(id) => id,
            None => continue,
        };

        match missing.fetch(&head.namespace, id).await {
            Ok(Some(document)) => {
                debug!("Fetched missing document {} in {}", id, head.namespace);
                let insert = OplogEntry::insert(head.op_time, head.namespace.clone(), document);
                storage
                    .apply_one(&insert)
                    .map_err(|source| ReplError::ApplyFailed { start, source })?;
            }
            Ok(None) => {
                debug!("Document {} in {} is gone on the source; skipping {}", id, head.namespace, head.op_time);
                skipped.insert(head.op_time);
            }
            Err(e) => warn!("Failed to fetch missing document {} in {}: {}", id, head.namespace, e),
        }
    }

    Ok(deferred
        .into_iter()
        .filter(|e| !(skipped.contains(&e.op_time) && e.conflict_key().is_some()))
        .collect())
}
