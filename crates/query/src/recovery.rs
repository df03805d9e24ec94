//! Crash recovery over the textual WAL, applied through the page API.
//!
//! Two passes. Analysis+redo scans forward, buckets records by transaction
//! and re-applies every operation of a committed transaction in LSN order.
//! Undo walks backwards applying inverse operations for every transaction
//! that began but never committed. Replay is idempotent: operation payloads
//! carry the target slot and post-state, and pages remember the last LSN
//! applied to them.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use log::{info, warn};
use storage::{BufferPoolManager, PageType};
use wal::{LogOperation, LogReader, LogRecord, Lsn, TxnId};

use crate::error::QueryResult;
use crate::processor::parse_value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxnOutcome {
    Running,
    Committed,
    Aborted,
}

/// What a recovery pass did.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecoveryReport {
    pub redone: usize,
    pub undone: usize,
    pub skipped_records: usize,
    pub loser_transactions: usize,
    pub max_txn_id: TxnId,
}

/// Replays the log against the buffer pool after a crash, and rolls back
/// single transactions for online aborts.
pub struct RecoveryManager {
    log_path: PathBuf,
}

impl RecoveryManager {
    pub fn new(log_path: impl AsRef<Path>) -> Self {
        Self {
            log_path: log_path.as_ref().to_path_buf(),
        }
    }

    pub fn recover(&self, pool: &BufferPoolManager) -> QueryResult<RecoveryReport> {
        let (records, skipped_records) = self.load_records()?;
        let mut report = RecoveryReport {
            skipped_records,
            ..RecoveryReport::default()
        };
        if records.is_empty() {
            return Ok(report);
        }

        // Analysis: final outcome per transaction.
        let mut outcomes: HashMap<TxnId, TxnOutcome> = HashMap::new();
        for record in &records {
            report.max_txn_id = report.max_txn_id.max(record.txn_id);
            let outcome = outcomes.entry(record.txn_id).or_insert(TxnOutcome::Running);
            match record.op {
                LogOperation::Commit => *outcome = TxnOutcome::Committed,
                LogOperation::Abort => *outcome = TxnOutcome::Aborted,
                _ => {}
            }
        }
        report.loser_transactions = outcomes
            .values()
            .filter(|outcome| **outcome != TxnOutcome::Committed)
            .count();

        // Redo committed work forward.
        for record in &records {
            if outcomes.get(&record.txn_id) == Some(&TxnOutcome::Committed)
                && self.redo(pool, record)?
            {
                report.redone += 1;
            }
        }

        // Undo losers backward. Aborted transactions were rolled back
        // online, but a crash during the rollback cannot be ruled out and
        // the inverse operations are idempotent.
        for record in records.iter().rev() {
            if outcomes.get(&record.txn_id) != Some(&TxnOutcome::Committed)
                && self.undo(pool, record)?
            {
                report.undone += 1;
            }
        }

        pool.flush_all_pages()?;
        info!(
            "recovery finished: {} redone, {} undone, {} losers, {} unreadable records",
            report.redone, report.undone, report.loser_transactions, report.skipped_records
        );
        Ok(report)
    }

    /// Rolls back one transaction by undoing its records newest-first,
    /// down to the BEGIN at `first_lsn`. Used by online abort.
    pub fn rollback_transaction(
        &self,
        pool: &BufferPoolManager,
        txn_id: TxnId,
        first_lsn: Lsn,
    ) -> QueryResult<usize> {
        let (records, _) = self.load_records()?;
        let mut undone = 0;
        for record in records.iter().rev() {
            if record.txn_id == txn_id && record.lsn >= first_lsn && self.undo(pool, record)? {
                undone += 1;
            }
        }
        Ok(undone)
    }

    fn load_records(&self) -> QueryResult<(Vec<LogRecord>, usize)> {
        let mut reader = LogReader::open(&self.log_path)?;
        let mut records = Vec::new();
        let mut skipped = 0;
        loop {
            match reader.next_record() {
                Ok(Some(record)) => records.push(record),
                Ok(None) => break,
                Err(error) => {
                    warn!("skipping unreadable log record during recovery: {error}");
                    skipped += 1;
                    if reader.at_end() {
                        break;
                    }
                }
            }
        }
        Ok((records, skipped))
    }

    /// Re-applies one committed operation. Records already reflected in the
    /// page (by LSN) are skipped.
    fn redo(&self, pool: &BufferPoolManager, record: &LogRecord) -> QueryResult<bool> {
        match record.op {
            LogOperation::Insert | LogOperation::Update => {
                self.apply_restore(pool, record.lsn, &record.new_value)
            }
            LogOperation::Delete => self.apply_remove(pool, record.lsn, &record.old_value),
            LogOperation::Begin | LogOperation::Commit | LogOperation::Abort => Ok(false),
        }
    }

    /// Applies the inverse of one operation: insert↔delete, update restores
    /// the old value. Page LSNs are left alone so repeated recovery runs
    /// converge on identical bytes.
    fn undo(&self, pool: &BufferPoolManager, record: &LogRecord) -> QueryResult<bool> {
        match record.op {
            LogOperation::Insert => self.apply_remove(pool, 0, &record.new_value),
            LogOperation::Delete => self.apply_restore(pool, 0, &record.old_value),
            LogOperation::Update => self.apply_restore(pool, 0, &record.old_value),
            LogOperation::Begin | LogOperation::Commit | LogOperation::Abort => Ok(false),
        }
    }

    fn apply_restore(
        &self,
        pool: &BufferPoolManager,
        record_lsn: Lsn,
        value: &str,
    ) -> QueryResult<bool> {
        let Some((ptr, record)) = parse_value(value) else {
            warn!("skipping log record with unparsable value {value:?}");
            return Ok(false);
        };
        let applied = {
            let mut guard = pool.fetch_page(ptr.page_id)?;
            if record_lsn != 0 && record_lsn <= guard.lsn() {
                false
            } else if !prepare_target_page(&mut guard, ptr.page_id) {
                false
            } else {
                guard.restore_record(ptr.slot, &record)?;
                if record_lsn > guard.lsn() {
                    guard.set_lsn(record_lsn);
                }
                guard.update_checksum();
                true
            }
        };
        pool.unpin_page(ptr.page_id, applied)?;
        Ok(applied)
    }

    fn apply_remove(
        &self,
        pool: &BufferPoolManager,
        record_lsn: Lsn,
        value: &str,
    ) -> QueryResult<bool> {
        let Some((ptr, _)) = parse_value(value) else {
            warn!("skipping log record with unparsable value {value:?}");
            return Ok(false);
        };
        let (applied, mutated) = {
            let mut guard = pool.fetch_page(ptr.page_id)?;
            if record_lsn != 0 && record_lsn <= guard.lsn() {
                (false, false)
            } else {
                let removed = guard.remove_record(ptr.slot);
                let mut mutated = removed;
                if record_lsn > guard.lsn() {
                    guard.set_lsn(record_lsn);
                    guard.update_checksum();
                    mutated = true;
                }
                (removed, mutated)
            }
        };
        pool.unpin_page(ptr.page_id, mutated)?;
        Ok(applied)
    }
}

/// Makes sure a redo/undo target is a record-bearing page. Pages that were
/// allocated but never flushed read back zeroed and are initialised here;
/// index pages are never valid targets.
fn prepare_target_page(page: &mut storage::Page, page_id: storage::PageId) -> bool {
    match page.page_type() {
        PageType::Data | PageType::Overflow => true,
        PageType::Free => {
            page.init(page_id, PageType::Data);
            true
        }
        PageType::Index => {
            warn!("log record targets index page {page_id}; skipping");
            false
        }
    }
}
