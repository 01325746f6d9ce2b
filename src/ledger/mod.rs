//! Escrow ledger.
//!
//! Owns every wallet and the append-only entry log. Each balance mutation is
//! a read-modify-write of a single wallet record, retried on conflict.
//! A release touches two wallets one after the other; both halves are
//! individually idempotent so a replayed release never moves funds twice.

use std::sync::Arc;

use tracing::{error, info};

use crate::Amount;
use crate::engine::{EngineError, ErrorKind, LedgerError};
use crate::model::{Correlation, GroupId, UserId};
use crate::retry::RetryPolicy;
use crate::store::{MemoryTable, Table, Versioned};

mod entry;
pub use entry::{EntryKind, EntryStatus, LedgerEntry};
use entry::EntryLog;

mod wallet;
pub use wallet::{LockOutcome, Wallet};

/// Result of [`Ledger::release`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Released,
    /// Both halves had already been applied by an earlier call.
    AlreadyReleased,
}

/// Wallets live in an injected [`Table`]. The entry log does not: it is
/// process-local and starts empty with every `Ledger`, so a persistent
/// wallet store outlives its audit trail.
pub struct Ledger {
    wallets: Arc<dyn Table<UserId, Wallet>>,
    log: EntryLog,
    retry: RetryPolicy,
}

/// Public API
impl Ledger {
    pub fn new(wallets: Arc<dyn Table<UserId, Wallet>>, retry: RetryPolicy) -> Self {
        Self {
            wallets,
            log: EntryLog::default(),
            retry,
        }
    }

    pub fn in_memory(retry: RetryPolicy) -> Self {
        Self::new(Arc::new(MemoryTable::<UserId, Wallet>::new()), retry)
    }

    /// Return the user's wallet, creating an empty one on first reference.
    pub async fn get_wallet(&self, user: UserId) -> Result<Wallet, EngineError> {
        self.retry
            .run("get_wallet", || self.load_or_create(user).map(|w| w.value))
            .await
    }

    /// Credit a top-up confirmed by an external payment flow.
    pub async fn deposit(
        &self,
        user: UserId,
        amount: Amount,
        external_ref: &str,
    ) -> Result<Wallet, EngineError> {
        let correlation = Correlation::External(external_ref.to_string());
        let result = self.apply_deposit(user, amount, external_ref).await;
        if result.is_ok() {
            self.log.append(
                user,
                amount,
                EntryKind::Deposit,
                EntryStatus::Success,
                correlation.clone(),
            )?;
        }
        Self::log_result("deposit", user, &correlation, amount, &result);
        result
    }

    /// Move `amount` from the user's balance into escrow for `group`.
    ///
    /// Locking twice for the same group is a no-op.
    pub async fn lock(
        &self,
        user: UserId,
        amount: Amount,
        group: GroupId,
    ) -> Result<LockOutcome, EngineError> {
        let correlation = Correlation::Group(group);
        let result = self.apply_lock(user, amount, group).await;
        match &result {
            Ok(LockOutcome::Locked) => {
                self.log.append(
                    user,
                    amount,
                    EntryKind::EscrowLock,
                    EntryStatus::Success,
                    correlation.clone(),
                )?;
            }
            Err(EngineError::Ledger(LedgerError::InsufficientFunds { .. })) => {
                self.log.append(
                    user,
                    amount,
                    EntryKind::EscrowLock,
                    EntryStatus::Failed,
                    correlation.clone(),
                )?;
            }
            _ => {}
        }
        Self::log_result("lock", user, &correlation, amount, &result);
        result
    }

    /// Pay `from`'s escrow for `group` out to `to`'s balance.
    ///
    /// Safe to call again after a partial failure: the debit and the credit
    /// each carry their own completion marker.
    pub async fn release(
        &self,
        from: UserId,
        to: UserId,
        amount: Amount,
        group: GroupId,
    ) -> Result<ReleaseOutcome, EngineError> {
        let correlation = Correlation::Group(group);
        let result = self.apply_release(from, to, amount, group).await;
        if let Err(e) = &result {
            if e.kind() == ErrorKind::Invariant {
                error!(from, to, group, amount = %amount, reason = %e, "release refused");
            }
        }
        Self::log_result("release", from, &correlation, amount, &result);
        result
    }

    /// Every entry this process recorded for `user`, oldest first.
    pub fn entries_for(&self, user: UserId) -> Result<Vec<LedgerEntry>, EngineError> {
        Ok(self.log.filter(|e| e.user == user)?)
    }

    /// The whole entry log, oldest first.
    pub fn entries(&self) -> Result<Vec<LedgerEntry>, EngineError> {
        Ok(self.log.filter(|_| true)?)
    }

    /// Snapshot of every wallet created so far.
    pub fn wallets(&self) -> Result<Vec<Wallet>, EngineError> {
        Ok(self.wallets.scan()?.into_iter().map(|w| w.value).collect())
    }
}

/// Private API
impl Ledger {
    fn log_result<T: std::fmt::Debug>(
        op: &str,
        user: UserId,
        correlation: &Correlation,
        amount: Amount,
        result: &Result<T, EngineError>,
    ) {
        match result {
            Ok(outcome) => {
                info!(
                    user = %user,
                    correlation = %correlation,
                    amount = %amount,
                    outcome = ?outcome,
                    "{op} applied"
                );
            }
            Err(e) => {
                info!(
                    user = %user,
                    correlation = %correlation,
                    amount = %amount,
                    reason = %e,
                    "{op} rejected"
                );
            }
        }
    }

    fn ensure_positive(amount: Amount) -> Result<(), EngineError> {
        if !amount.is_positive() {
            return Err(LedgerError::InvalidAmount(amount).into());
        }
        Ok(())
    }

    fn load_or_create(&self, user: UserId) -> Result<Versioned<Wallet>, EngineError> {
        match self.wallets.get(&user)? {
            Some(wallet) => Ok(wallet),
            None => Ok(self.wallets.insert(user, Wallet::new(user))?),
        }
    }

    /// One read-modify-write cycle against a single wallet.
    fn update<T>(
        &self,
        user: UserId,
        change: impl FnOnce(&mut Wallet) -> Result<T, LedgerError>,
    ) -> Result<T, EngineError> {
        let current = self.load_or_create(user)?;
        let mut wallet = current.value;
        let outcome = change(&mut wallet)?;
        wallet.check_invariants()?;
        self.wallets
            .compare_and_swap(&user, current.version, wallet)?;
        Ok(outcome)
    }

    async fn apply_deposit(
        &self,
        user: UserId,
        amount: Amount,
        external_ref: &str,
    ) -> Result<Wallet, EngineError> {
        Self::ensure_positive(amount)?;
        self.retry
            .run("deposit", || {
                self.update(user, |w| {
                    w.deposit(amount, external_ref)?;
                    Ok(w.clone())
                })
            })
            .await
    }

    async fn apply_lock(
        &self,
        user: UserId,
        amount: Amount,
        group: GroupId,
    ) -> Result<LockOutcome, EngineError> {
        Self::ensure_positive(amount)?;
        self.retry
            .run("lock", || self.update(user, |w| w.hold(group, amount)))
            .await
    }

    async fn apply_release(
        &self,
        from: UserId,
        to: UserId,
        amount: Amount,
        group: GroupId,
    ) -> Result<ReleaseOutcome, EngineError> {
        Self::ensure_positive(amount)?;
        let correlation = Correlation::Group(group);

        let debited = self
            .retry
            .run("release", || self.update(from, |w| w.pay_out(group, amount)))
            .await?;
        if debited {
            self.log.append(
                from,
                amount,
                EntryKind::Release,
                EntryStatus::Success,
                correlation.clone(),
            )?;
        }

        let credited = self
            .retry
            .run("release", || {
                self.update(to, |w| w.receive_payout(group, from, amount))
            })
            .await?;
        if credited {
            self.log.append(
                to,
                amount,
                EntryKind::Deposit,
                EntryStatus::Success,
                correlation,
            )?;
        }

        if debited || credited {
            Ok(ReleaseOutcome::Released)
        } else {
            Ok(ReleaseOutcome::AlreadyReleased)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn ledger() -> Ledger {
        Ledger::in_memory(RetryPolicy::new(5, Duration::ZERO, Duration::ZERO))
    }

    #[tokio::test]
    async fn entry_log_is_local_to_each_ledger() {
        let wallets: Arc<dyn Table<UserId, Wallet>> = Arc::new(MemoryTable::<UserId, Wallet>::new());
        let retry = RetryPolicy::new(5, Duration::ZERO, Duration::ZERO);
        let first = Ledger::new(wallets.clone(), retry.clone());
        first.deposit(1, Amount::units(100), "pay_1").await.unwrap();

        let second = Ledger::new(wallets, retry);
        assert_eq!(second.get_wallet(1).await.unwrap().balance(), Amount::units(100));
        assert!(second.entries().unwrap().is_empty());
        assert_eq!(first.entries().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn get_wallet_creates_empty_wallet() {
        let ledger = ledger();
        let wallet = ledger.get_wallet(1).await.unwrap();
        assert_eq!(wallet.balance(), Amount::ZERO);
        assert_eq!(wallet.locked(), Amount::ZERO);
        assert_eq!(ledger.wallets().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn deposit_credits_balance_and_logs() {
        let ledger = ledger();
        let wallet = ledger.deposit(1, Amount::units(100), "pay_1").await.unwrap();
        assert_eq!(wallet.balance(), Amount::units(100));

        let entries = ledger.entries_for(1).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].kind, EntryKind::Deposit);
        assert_eq!(entries[0].status, EntryStatus::Success);
        assert_eq!(entries[0].correlation, Correlation::External("pay_1".into()));
    }

    #[tokio::test]
    async fn deposit_rejects_non_positive_amount() {
        let ledger = ledger();
        let result = ledger.deposit(1, Amount::ZERO, "pay_1").await;
        assert!(matches!(
            result,
            Err(EngineError::Ledger(LedgerError::InvalidAmount(_)))
        ));
        assert!(ledger.entries().unwrap().is_empty());
    }

    #[tokio::test]
    async fn duplicate_deposit_reference_fails() {
        let ledger = ledger();
        ledger.deposit(1, Amount::units(100), "pay_1").await.unwrap();
        let result = ledger.deposit(1, Amount::units(100), "pay_1").await;
        assert!(matches!(
            result,
            Err(EngineError::Ledger(LedgerError::DuplicateDeposit(_)))
        ));
        assert_eq!(ledger.get_wallet(1).await.unwrap().balance(), Amount::units(100));
    }

    #[tokio::test]
    async fn lock_moves_funds_into_escrow() {
        let ledger = ledger();
        ledger.deposit(1, Amount::units(100), "pay_1").await.unwrap();
        let outcome = ledger.lock(1, Amount::units(60), 7).await.unwrap();
        assert_eq!(outcome, LockOutcome::Locked);

        let wallet = ledger.get_wallet(1).await.unwrap();
        assert_eq!(wallet.balance(), Amount::units(40));
        assert_eq!(wallet.locked(), Amount::units(60));
        assert_eq!(wallet.held_for(7), Some(Amount::units(60)));
    }

    #[tokio::test]
    async fn repeated_lock_does_not_double_deduct() {
        let ledger = ledger();
        ledger.deposit(1, Amount::units(100), "pay_1").await.unwrap();
        ledger.lock(1, Amount::units(60), 7).await.unwrap();
        let outcome = ledger.lock(1, Amount::units(60), 7).await.unwrap();
        assert_eq!(outcome, LockOutcome::AlreadyHeld);
        assert_eq!(ledger.get_wallet(1).await.unwrap().balance(), Amount::units(40));
        assert_eq!(ledger.entries_for(1).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn lock_without_funds_fails_and_logs_failure() {
        let ledger = ledger();
        ledger.deposit(1, Amount::units(10), "pay_1").await.unwrap();
        let result = ledger.lock(1, Amount::units(60), 7).await;
        assert!(matches!(
            result,
            Err(EngineError::Ledger(LedgerError::InsufficientFunds { user: 1, .. }))
        ));

        let wallet = ledger.get_wallet(1).await.unwrap();
        assert_eq!(wallet.balance(), Amount::units(10));
        assert_eq!(wallet.locked(), Amount::ZERO);

        let last = ledger.entries_for(1).unwrap().pop().unwrap();
        assert_eq!(last.kind, EntryKind::EscrowLock);
        assert_eq!(last.status, EntryStatus::Failed);
    }

    #[tokio::test]
    async fn deposit_lock_release_round_trip() {
        let ledger = ledger();
        ledger.deposit(1, Amount::units(500), "pay_1").await.unwrap();
        ledger.lock(1, Amount::units(500), 7).await.unwrap();
        let outcome = ledger.release(1, 2, Amount::units(500), 7).await.unwrap();
        assert_eq!(outcome, ReleaseOutcome::Released);

        let payer = ledger.get_wallet(1).await.unwrap();
        assert_eq!(payer.balance(), Amount::ZERO);
        assert_eq!(payer.locked(), Amount::ZERO);
        let receiver = ledger.get_wallet(2).await.unwrap();
        assert_eq!(receiver.balance(), Amount::units(500));

        let kinds: Vec<_> = ledger.entries_for(1).unwrap().iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![EntryKind::Deposit, EntryKind::EscrowLock, EntryKind::Release]
        );
        let credit = ledger.entries_for(2).unwrap();
        assert_eq!(credit.len(), 1);
        assert_eq!(credit[0].kind, EntryKind::Deposit);
        assert_eq!(credit[0].correlation, Correlation::Group(7));
    }

    #[tokio::test]
    async fn repeated_release_is_noop() {
        let ledger = ledger();
        ledger.deposit(1, Amount::units(500), "pay_1").await.unwrap();
        ledger.lock(1, Amount::units(500), 7).await.unwrap();
        ledger.release(1, 2, Amount::units(500), 7).await.unwrap();

        let outcome = ledger.release(1, 2, Amount::units(500), 7).await.unwrap();
        assert_eq!(outcome, ReleaseOutcome::AlreadyReleased);
        assert_eq!(ledger.get_wallet(2).await.unwrap().balance(), Amount::units(500));
        assert_eq!(ledger.entries().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn release_without_escrow_is_refused() {
        let ledger = ledger();
        ledger.deposit(1, Amount::units(500), "pay_1").await.unwrap();
        let result = ledger.release(1, 2, Amount::units(500), 7).await;
        let err = result.unwrap_err();
        assert_eq!(err.kind(), crate::engine::ErrorKind::Invariant);

        assert_eq!(ledger.get_wallet(1).await.unwrap().balance(), Amount::units(500));
        assert_eq!(ledger.get_wallet(2).await.unwrap().balance(), Amount::ZERO);
    }

    #[tokio::test]
    async fn release_exceeding_hold_is_invariant_violation() {
        let ledger = ledger();
        ledger.deposit(1, Amount::units(500), "pay_1").await.unwrap();
        ledger.lock(1, Amount::units(100), 7).await.unwrap();
        let result = ledger.release(1, 2, Amount::units(200), 7).await;
        assert!(matches!(
            result,
            Err(EngineError::Ledger(LedgerError::InvariantViolation(_)))
        ));
        assert_eq!(ledger.get_wallet(1).await.unwrap().locked(), Amount::units(100));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_deposits_are_not_lost() {
        let ledger = Arc::new(Ledger::in_memory(RetryPolicy::new(
            100,
            Duration::from_millis(1),
            Duration::from_millis(10),
        )));
        let mut handles = Vec::new();
        for i in 0..32 {
            let ledger = ledger.clone();
            handles.push(tokio::spawn(async move {
                ledger.deposit(1, Amount::units(1), &format!("pay_{i}")).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(ledger.get_wallet(1).await.unwrap().balance(), Amount::units(32));
    }
}
