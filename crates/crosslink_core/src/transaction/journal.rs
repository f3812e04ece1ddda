//! # Transaction Journal
//!
//! Bounded in-memory log of guarded mutations.
//!
//! Every guarded mutation opens a record as `Pending` and closes it as
//! `Committed` or `RolledBack` before the resource lock is released. A
//! journal can be private to one resource or shared by several.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use parking_lot::Mutex;

/// Process-wide counter so ids stay unique across shared journals.
static NEXT_TRANSACTION: AtomicU64 = AtomicU64::new(1);

/// Identifier of one guarded mutation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransactionId(u64);

impl TransactionId {
    fn next() -> Self {
        Self(NEXT_TRANSACTION.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw value.
    #[inline]
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx-{}", self.0)
    }
}

/// Lifecycle of a transaction record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TxStatus {
    /// Mutation in progress.
    Pending,
    /// Mutation applied.
    Committed,
    /// Mutation failed; resource restored.
    RolledBack,
}

impl fmt::Display for TxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => f.write_str("pending"),
            Self::Committed => f.write_str("committed"),
            Self::RolledBack => f.write_str("rolled back"),
        }
    }
}

/// One journal entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransactionRecord {
    /// Transaction id.
    pub id: TransactionId,
    /// Operation name.
    pub operation: String,
    /// Capability that asked for the mutation.
    pub source: String,
    /// Resource that was mutated.
    pub target: String,
    /// Current status.
    pub status: TxStatus,
    /// When the record was opened.
    pub started_at: SystemTime,
    /// When the record was closed.
    pub finished_at: Option<SystemTime>,
    /// Rollback reason.
    pub reason: Option<String>,
}

/// Bounded transaction log. Oldest records are dropped first.
#[derive(Debug)]
pub struct TransactionJournal {
    records: Mutex<VecDeque<TransactionRecord>>,
    capacity: usize,
}

impl TransactionJournal {
    /// Creates a journal keeping at most `capacity` records.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            records: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    /// Opens a `Pending` record.
    pub fn begin(&self, operation: &str, source: &str, target: &str) -> TransactionId {
        let id = TransactionId::next();
        let mut records = self.records.lock();
        records.push_back(TransactionRecord {
            id,
            operation: operation.to_owned(),
            source: source.to_owned(),
            target: target.to_owned(),
            status: TxStatus::Pending,
            started_at: SystemTime::now(),
            finished_at: None,
            reason: None,
        });
        while records.len() > self.capacity {
            records.pop_front();
        }
        id
    }

    /// Closes record `id` with a final status.
    ///
    /// Returns `false` if the record is unknown (or already evicted).
    pub fn finish(&self, id: TransactionId, status: TxStatus, reason: Option<String>) -> bool {
        let mut records = self.records.lock();
        match records.iter_mut().rev().find(|r| r.id == id) {
            Some(record) => {
                record.status = status;
                record.finished_at = Some(SystemTime::now());
                record.reason = reason;
                true
            }
            None => false,
        }
    }

    /// Copy of record `id`.
    #[must_use]
    pub fn get(&self, id: TransactionId) -> Option<TransactionRecord> {
        self.records.lock().iter().find(|r| r.id == id).cloned()
    }

    /// All retained records, oldest first.
    #[must_use]
    pub fn records(&self) -> Vec<TransactionRecord> {
        self.records.lock().iter().cloned().collect()
    }

    /// Retained records with `status`.
    #[must_use]
    pub fn count(&self, status: TxStatus) -> usize {
        self.records.lock().iter().filter(|r| r.status == status).count()
    }

    /// Retained records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// Whether nothing is retained.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

impl Default for TransactionJournal {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_begin_and_finish() {
        let journal = TransactionJournal::new(8);
        let id = journal.begin("add_item", "quest", "inventory");

        assert_eq!(journal.count(TxStatus::Pending), 1);
        assert!(journal.finish(id, TxStatus::Committed, None));

        let record = journal.get(id).unwrap();
        assert_eq!(record.status, TxStatus::Committed);
        assert!(record.finished_at.is_some());
    }

    #[test]
    fn test_capacity_drops_oldest() {
        let journal = TransactionJournal::new(2);
        let first = journal.begin("a", "s", "t");
        journal.begin("b", "s", "t");
        journal.begin("c", "s", "t");

        assert_eq!(journal.len(), 2);
        assert!(journal.get(first).is_none());
        assert!(!journal.finish(first, TxStatus::Committed, None));
    }

    #[test]
    fn test_ids_unique_across_journals() {
        let a = TransactionJournal::default();
        let b = TransactionJournal::default();
        assert_ne!(a.begin("x", "s", "t"), b.begin("x", "s", "t"));
    }
}
