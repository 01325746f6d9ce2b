use std::collections::{BTreeMap, BTreeSet};

use crate::Amount;
use crate::engine::LedgerError;
use crate::model::{GroupId, UserId};

/// A user's spendable balance and the funds locked in group escrow.
///
/// Besides the two amounts, the wallet carries the markers that make escrow
/// movements replay-safe: each hold is keyed by group, each payout marks the
/// group as released, and each incoming payout is remembered by
/// `(group, payer)`. Markers are committed in the same swap as the amounts
/// they guard.
#[derive(Debug, Clone, PartialEq)]
pub struct Wallet {
    user: UserId,
    balance: Amount,
    locked: Amount,
    holds: BTreeMap<GroupId, Amount>,
    released: BTreeSet<GroupId>,
    credited: BTreeSet<(GroupId, UserId)>,
    deposit_refs: BTreeSet<String>,
}

/// Result of [`Ledger::lock`](super::Ledger::lock).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOutcome {
    Locked,
    /// The group already holds (or held) this user's escrow; nothing moved.
    AlreadyHeld,
}

impl Wallet {
    pub fn new(user: UserId) -> Self {
        Self {
            user,
            balance: Amount::ZERO,
            locked: Amount::ZERO,
            holds: BTreeMap::new(),
            released: BTreeSet::new(),
            credited: BTreeSet::new(),
            deposit_refs: BTreeSet::new(),
        }
    }

    pub fn user(&self) -> UserId {
        self.user
    }

    pub fn balance(&self) -> Amount {
        self.balance
    }

    pub fn locked(&self) -> Amount {
        self.locked
    }

    pub fn total(&self) -> Amount {
        self.balance + self.locked
    }

    /// Escrow currently held for `group`.
    pub fn held_for(&self, group: GroupId) -> Option<Amount> {
        self.holds.get(&group).copied()
    }

    pub(crate) fn deposit(&mut self, amount: Amount, reference: &str) -> Result<(), LedgerError> {
        if self.deposit_refs.contains(reference) {
            return Err(LedgerError::DuplicateDeposit(reference.to_string()));
        }
        self.balance = self.balance.checked_add(amount).ok_or_else(|| {
            LedgerError::InvariantViolation(format!("balance overflow for user {}", self.user))
        })?;
        self.deposit_refs.insert(reference.to_string());
        Ok(())
    }

    /// Move `amount` from balance into escrow for `group`.
    pub(crate) fn hold(&mut self, group: GroupId, amount: Amount) -> Result<LockOutcome, LedgerError> {
        if self.holds.contains_key(&group) || self.released.contains(&group) {
            return Ok(LockOutcome::AlreadyHeld);
        }
        let balance =
            self.balance
                .checked_sub(amount)
                .ok_or(LedgerError::InsufficientFunds {
                    user: self.user,
                    balance: self.balance,
                    requested: amount,
                })?;
        self.balance = balance;
        self.locked += amount;
        self.holds.insert(group, amount);
        Ok(LockOutcome::Locked)
    }

    /// Remove the escrow held for `group`. Returns `false` if it was already paid out.
    pub(crate) fn pay_out(&mut self, group: GroupId, amount: Amount) -> Result<bool, LedgerError> {
        if self.released.contains(&group) {
            return Ok(false);
        }
        let held = self.held_for(group).ok_or(LedgerError::MissingHold {
            user: self.user,
            group,
        })?;
        if held != amount {
            return Err(LedgerError::InvariantViolation(format!(
                "release of {amount} for user {} in group {group} does not match held {held}",
                self.user
            )));
        }
        self.locked = self.locked.checked_sub(amount).ok_or_else(|| {
            LedgerError::InvariantViolation(format!(
                "release of {amount} exceeds locked {} for user {}",
                self.locked, self.user
            ))
        })?;
        self.holds.remove(&group);
        self.released.insert(group);
        Ok(true)
    }

    /// Credit a payout from `payer`'s escrow. Returns `false` if already credited.
    pub(crate) fn receive_payout(
        &mut self,
        group: GroupId,
        payer: UserId,
        amount: Amount,
    ) -> Result<bool, LedgerError> {
        if !self.credited.insert((group, payer)) {
            return Ok(false);
        }
        self.balance = self.balance.checked_add(amount).ok_or_else(|| {
            LedgerError::InvariantViolation(format!("balance overflow for user {}", self.user))
        })?;
        Ok(true)
    }

    pub(crate) fn check_invariants(&self) -> Result<(), LedgerError> {
        if self.balance.is_negative() || self.locked.is_negative() {
            return Err(LedgerError::InvariantViolation(format!(
                "negative wallet for user {}: balance {}, locked {}",
                self.user, self.balance, self.locked
            )));
        }
        let held: Amount = self.holds.values().copied().sum();
        if held != self.locked {
            return Err(LedgerError::InvariantViolation(format!(
                "locked {} for user {} does not match holds {held}",
                self.locked, self.user
            )));
        }
        Ok(())
    }
}
