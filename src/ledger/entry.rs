use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use crate::Amount;
use crate::model::{Correlation, EntryId, UserId};
use crate::store::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Deposit,
    EscrowLock,
    Release,
    Refund,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
    Pending,
    Success,
    Failed,
}

/// One immutable line of the ledger audit log.
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerEntry {
    pub id: EntryId,
    pub user: UserId,
    pub amount: Amount,
    pub kind: EntryKind,
    pub status: EntryStatus,
    pub correlation: Correlation,
    pub timestamp: SystemTime,
}

/// Append-only entry log. Entries are written once and handed out as copies.
#[derive(Debug, Default)]
pub(crate) struct EntryLog {
    next_id: AtomicU64,
    entries: RwLock<Vec<LedgerEntry>>,
}

impl EntryLog {
    pub(crate) fn append(
        &self,
        user: UserId,
        amount: Amount,
        kind: EntryKind,
        status: EntryStatus,
        correlation: Correlation,
    ) -> Result<EntryId, StoreError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let entry = LedgerEntry {
            id,
            user,
            amount,
            kind,
            status,
            correlation,
            timestamp: SystemTime::now(),
        };
        self.entries
            .write()
            .map_err(|_| StoreError::Unavailable("entry log lock poisoned".to_string()))?
            .push(entry);
        Ok(id)
    }

    pub(crate) fn filter(
        &self,
        mut keep: impl FnMut(&LedgerEntry) -> bool,
    ) -> Result<Vec<LedgerEntry>, StoreError> {
        let entries = self
            .entries
            .read()
            .map_err(|_| StoreError::Unavailable("entry log lock poisoned".to_string()))?;
        Ok(entries.iter().filter(|e| keep(e)).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_sequential_from_one() {
        let log = EntryLog::default();
        let a = log
            .append(1, Amount::units(1), EntryKind::Deposit, EntryStatus::Success, Correlation::External("a".into()))
            .unwrap();
        let b = log
            .append(2, Amount::units(1), EntryKind::Deposit, EntryStatus::Success, Correlation::External("b".into()))
            .unwrap();
        assert_eq!((a, b), (1, 2));
    }

    #[test]
    fn filter_returns_matching_copies() {
        let log = EntryLog::default();
        log.append(1, Amount::units(1), EntryKind::Deposit, EntryStatus::Success, Correlation::Group(9))
            .unwrap();
        log.append(2, Amount::units(2), EntryKind::EscrowLock, EntryStatus::Failed, Correlation::Group(9))
            .unwrap();

        let user2 = log.filter(|e| e.user == 2).unwrap();
        assert_eq!(user2.len(), 1);
        assert_eq!(user2[0].kind, EntryKind::EscrowLock);
        assert_eq!(user2[0].status, EntryStatus::Failed);
        assert_eq!(log.filter(|_| true).unwrap().len(), 2);
    }
}
