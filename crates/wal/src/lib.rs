//! Write-ahead log: a textual, line-oriented, append-only journal plus the
//! transaction lifecycle built on top of it.
//!
//! One record per line:
//!
//! ```text
//! <lsn>|<txn>|<page>|<op>|<old>|<new>|<ts>\n
//! ```
//!
//! Appends happen under a single mutex. `log_operation` only pushes bytes to
//! the OS; durability is bought at commit time with an fsync.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use log::warn;
use parking_lot::Mutex;
use thiserror::Error;

/// Log sequence number: monotonically increasing, starting at 1.
pub type Lsn = u64;

/// Transaction identifier.
pub type TxnId = u64;

/// Page identifier as used in log records; −1 marks records that touch no
/// page (begin/commit/abort).
pub type PageId = i64;

/// Page id for records without a page target.
pub const NO_PAGE: PageId = -1;

#[derive(Debug, Error)]
pub enum WalError {
    #[error("wal io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unparsable log record: {reason}: {line:?}")]
    Parse { line: String, reason: String },
    #[error("transaction {0} is not active")]
    InactiveTransaction(TxnId),
}

pub type WalResult<T> = Result<T, WalError>;

/// Operation recorded by a log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogOperation {
    Begin,
    Commit,
    Abort,
    Insert,
    Delete,
    Update,
}

impl LogOperation {
    pub fn as_str(self) -> &'static str {
        match self {
            LogOperation::Begin => "begin",
            LogOperation::Commit => "commit",
            LogOperation::Abort => "abort",
            LogOperation::Insert => "insert",
            LogOperation::Delete => "delete",
            LogOperation::Update => "update",
        }
    }

    fn parse(text: &str) -> Option<Self> {
        match text {
            "begin" => Some(LogOperation::Begin),
            "commit" => Some(LogOperation::Commit),
            "abort" => Some(LogOperation::Abort),
            "insert" => Some(LogOperation::Insert),
            "delete" => Some(LogOperation::Delete),
            "update" => Some(LogOperation::Update),
            _ => None,
        }
    }
}

/// A parsed log line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub lsn: Lsn,
    pub txn_id: TxnId,
    pub page_id: PageId,
    pub op: LogOperation,
    pub old_value: String,
    pub new_value: String,
    pub timestamp: u64,
}

impl LogRecord {
    pub fn to_line(&self) -> String {
        format!(
            "{}|{}|{}|{}|{}|{}|{}",
            self.lsn,
            self.txn_id,
            self.page_id,
            self.op.as_str(),
            self.old_value,
            self.new_value,
            self.timestamp
        )
    }

    /// Parses one line. The first four fields and the trailing timestamp
    /// split on `|`; the middle `old|new` region is split per operation,
    /// because UPDATE values may themselves contain the delimiter.
    pub fn parse(line: &str) -> WalResult<Self> {
        let err = |reason: &str| WalError::Parse {
            line: line.to_string(),
            reason: reason.to_string(),
        };

        let mut head = line.splitn(5, '|');
        let lsn = head
            .next()
            .and_then(|field| field.parse::<Lsn>().ok())
            .ok_or_else(|| err("bad lsn"))?;
        let txn_id = head
            .next()
            .and_then(|field| field.parse::<TxnId>().ok())
            .ok_or_else(|| err("bad txn id"))?;
        let page_id = head
            .next()
            .and_then(|field| field.parse::<PageId>().ok())
            .ok_or_else(|| err("bad page id"))?;
        let op = head
            .next()
            .and_then(LogOperation::parse)
            .ok_or_else(|| err("bad operation"))?;
        let rest = head.next().ok_or_else(|| err("missing values"))?;

        let (middle, timestamp_text) = rest.rsplit_once('|').ok_or_else(|| err("missing timestamp"))?;
        let timestamp = timestamp_text
            .parse::<u64>()
            .map_err(|_| err("bad timestamp"))?;

        let (old_value, new_value) = match op {
            // An insert's old value is empty, so the boundary is the first
            // delimiter; a delete's new value is empty, so it is the last.
            LogOperation::Insert => middle.split_once('|').ok_or_else(|| err("missing values"))?,
            LogOperation::Delete => middle.rsplit_once('|').ok_or_else(|| err("missing values"))?,
            LogOperation::Update => split_update_values(middle).ok_or_else(|| err("ambiguous update values"))?,
            LogOperation::Begin | LogOperation::Commit | LogOperation::Abort => {
                middle.split_once('|').ok_or_else(|| err("missing values"))?
            }
        };

        Ok(LogRecord {
            lsn,
            txn_id,
            page_id,
            op,
            old_value: old_value.to_string(),
            new_value: new_value.to_string(),
            timestamp,
        })
    }
}

/// Splits the `old|new` region of an UPDATE record. Both sides serialise the
/// same attribute arity, so the region holds an odd number of delimiters and
/// the centre one is the boundary.
fn split_update_values(middle: &str) -> Option<(&str, &str)> {
    let pipes: Vec<usize> = middle
        .char_indices()
        .filter(|(_, c)| *c == '|')
        .map(|(index, _)| index)
        .collect();
    if pipes.is_empty() || pipes.len() % 2 == 0 {
        return None;
    }
    let at = pipes[pipes.len() / 2];
    Some((&middle[..at], &middle[at + 1..]))
}

pub fn current_timestamp_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

struct LogState {
    writer: BufWriter<File>,
    next_lsn: Lsn,
    durable_lsn: Lsn,
}

/// Appends log records under a global mutex and controls their durability.
pub struct LogManager {
    state: Mutex<LogState>,
}

impl LogManager {
    /// Opens (or creates) the log file and resumes the LSN sequence after
    /// the last parsable record.
    pub fn open(path: impl AsRef<Path>) -> WalResult<Self> {
        let path_ref = path.as_ref();
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path_ref)?;

        let mut last_lsn = 0;
        let mut reader = LogReader::open(path_ref)?;
        loop {
            match reader.next_record() {
                Ok(Some(record)) => last_lsn = last_lsn.max(record.lsn),
                Ok(None) => break,
                Err(error) => {
                    warn!("skipping unreadable log record while opening: {error}");
                    if reader.at_end() {
                        break;
                    }
                }
            }
        }

        Ok(Self {
            state: Mutex::new(LogState {
                writer: BufWriter::new(file),
                next_lsn: last_lsn + 1,
                durable_lsn: last_lsn,
            }),
        })
    }

    /// Appends one record, assigning it the next LSN. The bytes reach the OS
    /// buffer but are not fsynced.
    pub fn append(
        &self,
        txn_id: TxnId,
        page_id: PageId,
        op: LogOperation,
        old_value: &str,
        new_value: &str,
    ) -> WalResult<Lsn> {
        let mut state = self.state.lock();
        let lsn = state.next_lsn;
        let record = LogRecord {
            lsn,
            txn_id,
            page_id,
            op,
            old_value: old_value.to_string(),
            new_value: new_value.to_string(),
            timestamp: current_timestamp_millis(),
        };
        let mut line = record.to_line();
        line.push('\n');
        state.writer.write_all(line.as_bytes())?;
        state.writer.flush()?;
        state.next_lsn += 1;
        Ok(lsn)
    }

    /// Fsyncs the log; everything appended so far becomes durable.
    pub fn sync(&self) -> WalResult<()> {
        let mut state = self.state.lock();
        state.writer.flush()?;
        state.writer.get_ref().sync_data()?;
        state.durable_lsn = state.next_lsn - 1;
        Ok(())
    }

    /// Makes the log durable at least up to `lsn`. Used by the buffer pool
    /// before writing back a page carrying that LSN.
    pub fn flush(&self, lsn: Lsn) -> WalResult<()> {
        {
            let state = self.state.lock();
            if lsn <= state.durable_lsn {
                return Ok(());
            }
        }
        self.sync()
    }

    pub fn durable_lsn(&self) -> Lsn {
        self.state.lock().durable_lsn
    }

    pub fn last_lsn(&self) -> Lsn {
        self.state.lock().next_lsn - 1
    }

    /// Discards the log contents. Only safe at a quiescent checkpoint: no
    /// active transactions and every page effect flushed. A lone COMMIT
    /// stamp is written so the LSN sequence stays monotonic across the
    /// truncation and later restarts; replaying the stamp is a no-op.
    pub fn truncate(&self) -> WalResult<()> {
        let mut state = self.state.lock();
        state.writer.flush()?;
        state.writer.get_ref().set_len(0)?;
        let record = LogRecord {
            lsn: state.next_lsn,
            txn_id: 0,
            page_id: NO_PAGE,
            op: LogOperation::Commit,
            old_value: String::new(),
            new_value: String::new(),
            timestamp: current_timestamp_millis(),
        };
        let mut line = record.to_line();
        line.push('\n');
        state.writer.write_all(line.as_bytes())?;
        state.writer.flush()?;
        state.writer.get_ref().sync_data()?;
        state.next_lsn += 1;
        state.durable_lsn = state.next_lsn - 1;
        Ok(())
    }
}

struct TxnState {
    next_txn_id: TxnId,
    active: HashMap<TxnId, Lsn>,
}

/// Issues transaction ids and writes their lifecycle records.
pub struct TransactionManager {
    log: Arc<LogManager>,
    state: Mutex<TxnState>,
}

impl TransactionManager {
    pub fn new(log: Arc<LogManager>) -> Self {
        Self {
            log,
            state: Mutex::new(TxnState {
                next_txn_id: 1,
                active: HashMap::new(),
            }),
        }
    }

    pub fn log_manager(&self) -> Arc<LogManager> {
        Arc::clone(&self.log)
    }

    /// Skips the id counter past transactions seen in a recovered log.
    pub fn set_next_txn_id(&self, next: TxnId) {
        let mut state = self.state.lock();
        state.next_txn_id = state.next_txn_id.max(next);
    }

    /// Starts a transaction and remembers its first LSN for rollback.
    pub fn begin_transaction(&self) -> WalResult<TxnId> {
        let txn_id = {
            let mut state = self.state.lock();
            let txn_id = state.next_txn_id;
            state.next_txn_id += 1;
            txn_id
        };
        let lsn = self
            .log
            .append(txn_id, NO_PAGE, LogOperation::Begin, "", "")?;
        self.state.lock().active.insert(txn_id, lsn);
        Ok(txn_id)
    }

    /// Appends an operation record for an active transaction.
    pub fn log_operation(
        &self,
        txn_id: TxnId,
        page_id: PageId,
        op: LogOperation,
        old_value: &str,
        new_value: &str,
    ) -> WalResult<Lsn> {
        if !self.is_active(txn_id) {
            return Err(WalError::InactiveTransaction(txn_id));
        }
        self.log.append(txn_id, page_id, op, old_value, new_value)
    }

    /// Commits: the COMMIT record is fsynced before this returns.
    pub fn commit(&self, txn_id: TxnId) -> WalResult<()> {
        if self.state.lock().active.remove(&txn_id).is_none() {
            return Err(WalError::InactiveTransaction(txn_id));
        }
        self.log
            .append(txn_id, NO_PAGE, LogOperation::Commit, "", "")?;
        self.log.sync()
    }

    /// Aborts: appends the ABORT record and returns the transaction's first
    /// LSN so the caller can walk the log backwards undoing its operations.
    pub fn abort(&self, txn_id: TxnId) -> WalResult<Lsn> {
        let first_lsn = self
            .state
            .lock()
            .active
            .remove(&txn_id)
            .ok_or(WalError::InactiveTransaction(txn_id))?;
        self.log
            .append(txn_id, NO_PAGE, LogOperation::Abort, "", "")?;
        self.log.sync()?;
        Ok(first_lsn)
    }

    pub fn is_active(&self, txn_id: TxnId) -> bool {
        self.state.lock().active.contains_key(&txn_id)
    }

    pub fn first_lsn(&self, txn_id: TxnId) -> Option<Lsn> {
        self.state.lock().active.get(&txn_id).copied()
    }

    pub fn active_transactions(&self) -> Vec<TxnId> {
        self.state.lock().active.keys().copied().collect()
    }
}

/// Forward scanner over the log file.
pub struct LogReader {
    reader: BufReader<File>,
    at_end: bool,
}

impl LogReader {
    pub fn open(path: impl AsRef<Path>) -> WalResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .create(true)
            .append(true)
            .open(path)?;
        Ok(Self {
            reader: BufReader::new(file),
            at_end: false,
        })
    }

    pub fn at_end(&self) -> bool {
        self.at_end
    }

    /// Returns the next record. A truncated trailing line yields a `Parse`
    /// error with `at_end` set, which replay discards.
    pub fn next_record(&mut self) -> WalResult<Option<LogRecord>> {
        let mut line = String::new();
        let read = self.reader.read_line(&mut line)?;
        if read == 0 {
            self.at_end = true;
            return Ok(None);
        }
        if !line.ends_with('\n') {
            self.at_end = true;
            return Err(WalError::Parse {
                line,
                reason: "truncated trailing record".to_string(),
            });
        }
        let trimmed = line.trim_end_matches('\n');
        LogRecord::parse(trimmed).map(Some)
    }
}
