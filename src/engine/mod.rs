//! Group-buy lifecycle engine.
//!
//! Drives a group from formation to completion:
//! `Forming -> Locked -> Funded -> Ordered -> Delivered -> Completed`.
//! Every transition is a read-validate-commit cycle on the group record,
//! retried on version conflicts. Escrow movements go through the [`Ledger`].
//! External collaborators are consulted before a cycle starts.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

use crate::Amount;
use crate::collab::{LifecycleEvent, OfferCatalog};
use crate::config::EngineConfig;
use crate::handoff::{HandoffCode, HandoffVerifier};
use crate::ledger::{Ledger, Wallet};
use crate::model::{GroupId, Identity, Location, OfferId, OfferStatus, UserId};
use crate::retry::RetryPolicy;
use crate::store::{MemoryTable, Table};

mod state;
pub use state::{DeliveryStatus, Group, GroupStatus, Member, OfferRef, PaymentStatus};
use state::HandoffOutcome;

mod error;
pub use error::{
    DependencyError, EngineError, ErrorKind, GroupError, GroupOperation, LedgerError,
};

/// Result of [`Engine::confirm_arrival`]: the delivered group and the raw
/// handoff code of every member except the receiver.
#[derive(Debug, Clone)]
pub struct Arrival {
    pub group: Group,
    pub codes: Vec<(UserId, HandoffCode)>,
}

/// The group-buy lifecycle engine.
///
/// Holds injected handles to the group table, the ledger and the offer
/// catalog. Cheap to share behind an `Arc`; every operation takes `&self`.
pub struct Engine {
    config: EngineConfig,
    groups: Arc<dyn Table<GroupId, Group>>,
    ledger: Ledger,
    catalog: Arc<dyn OfferCatalog>,
    handoff: HandoffVerifier,
    retry: RetryPolicy,
    events: Option<UnboundedSender<LifecycleEvent>>,
    next_group: AtomicU64,
}

/// Public API
impl Engine {
    /// Engine over in-memory tables.
    pub fn new(config: EngineConfig, catalog: Arc<dyn OfferCatalog>) -> Self {
        let ledger = Ledger::in_memory(RetryPolicy::from(&config.retry));
        let groups = Arc::new(MemoryTable::<GroupId, Group>::new());
        Self::with_store(config, groups, ledger, catalog)
    }

    /// Engine over caller-provided storage.
    pub fn with_store(
        config: EngineConfig,
        groups: Arc<dyn Table<GroupId, Group>>,
        ledger: Ledger,
        catalog: Arc<dyn OfferCatalog>,
    ) -> Self {
        Self {
            handoff: HandoffVerifier::from(&config.handoff),
            retry: RetryPolicy::from(&config.retry),
            config,
            groups,
            ledger,
            catalog,
            events: None,
            next_group: AtomicU64::new(0),
        }
    }

    /// Publish committed transitions on `sender`.
    pub fn with_events(mut self, sender: UnboundedSender<LifecycleEvent>) -> Self {
        self.events = Some(sender);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Open a group for `offer` with `creator` as its first member.
    pub async fn create_group(
        &self,
        offer: OfferId,
        target_size: u32,
        creator: &Identity,
        location: Location,
    ) -> Result<Group, EngineError> {
        let result = self
            .apply_create(offer, target_size, creator, location)
            .await;
        let group = result.as_ref().map(|g| g.id()).unwrap_or_default();
        Self::log_result("create_group", group, creator.user_id, &result);
        result
    }

    /// Add `user` to a forming group. The join that fills the group also
    /// selects the receiver and locks it.
    pub async fn join_group(
        &self,
        group: GroupId,
        user: &Identity,
        location: Location,
    ) -> Result<Group, EngineError> {
        let min_trust = self.config.min_trust_score;
        let result = self
            .retry
            .run("join_group", || {
                self.update_group(group, |g| g.admit(user, location, min_trust))
            })
            .await;
        if let Ok((g, Some(receiver))) = &result {
            self.emit(LifecycleEvent::GroupLocked {
                group: g.id(),
                receiver: *receiver,
            });
        }
        let result = result.map(|(g, _)| g);
        Self::log_result("join_group", group, user.user_id, &result);
        result
    }

    /// Lock `user`'s share in escrow and mark them paid. The last payment
    /// moves the group to `Funded`.
    pub async fn pay_share(&self, group: GroupId, user: UserId) -> Result<Group, EngineError> {
        let result = self.apply_pay(group, user).await;
        Self::log_result("pay_share", group, user, &result);
        result
    }

    /// Receiver reports the bulk order as placed.
    pub async fn confirm_order(&self, group: GroupId, receiver: UserId) -> Result<Group, EngineError> {
        let result = self
            .retry
            .run("confirm_order", || {
                self.update_group(group, |g| g.confirm_order(receiver))
            })
            .await
            .map(|(g, _)| g);
        if result.is_ok() {
            self.emit(LifecycleEvent::OrderPlaced { group });
        }
        Self::log_result("confirm_order", group, receiver, &result);
        result
    }

    /// Receiver reports the goods as arrived. Mints one handoff code per
    /// other member; the raw codes are returned for out-of-band delivery.
    pub async fn confirm_arrival(
        &self,
        group: GroupId,
        receiver: UserId,
    ) -> Result<Arrival, EngineError> {
        let result = self
            .retry
            .run("confirm_arrival", || {
                self.update_group(group, |g| g.confirm_arrival(receiver, &self.handoff))
            })
            .await
            .map(|(group, codes)| Arrival { group, codes });
        if result.is_ok() {
            self.emit(LifecycleEvent::GoodsArrived { group });
        }
        let logged = result.as_ref().map(|a| a.codes.len());
        Self::log_result("confirm_arrival", group, receiver, &logged);
        result
    }

    /// Receiver redeems `member`'s handoff code. Redeeming the last code
    /// completes the group and pays every share out to the receiver.
    ///
    /// Wrong codes are counted per member; once the configured budget is
    /// spent the code is revoked until the member asks for a new one.
    pub async fn verify_handoff(
        &self,
        group: GroupId,
        receiver: UserId,
        member: UserId,
        code: &str,
    ) -> Result<Group, EngineError> {
        let result = self
            .retry
            .run("verify_handoff", || {
                self.update_group(group, |g| {
                    g.confirm_handoff(receiver, member, code, &self.handoff)
                })
            })
            .await
            .and_then(|(g, outcome)| match outcome {
                HandoffOutcome::Confirmed { completed } => Ok((g, completed)),
                HandoffOutcome::Rejected { revoked: false } => {
                    Err(GroupError::InvalidOtp { group, user: member }.into())
                }
                HandoffOutcome::Rejected { revoked: true } => {
                    warn!(group = %group, member = %member, receiver = %receiver, "handoff code revoked");
                    Err(GroupError::HandoffRevoked { group, user: member }.into())
                }
            });
        Self::log_result("verify_handoff", group, member, &result);
        let (g, completed) = result?;

        self.emit(LifecycleEvent::HandoffConfirmed {
            group,
            member,
            receiver,
        });
        if !completed {
            return Ok(g);
        }
        self.emit(LifecycleEvent::GroupCompleted { group });
        self.settle(group).await
    }

    /// Member asks for a fresh handoff code, e.g. after theirs was revoked.
    /// The new raw code is returned for out-of-band delivery to the member.
    pub async fn reissue_handoff(
        &self,
        group: GroupId,
        member: UserId,
    ) -> Result<HandoffCode, EngineError> {
        let result = self
            .retry
            .run("reissue_handoff", || {
                self.update_group(group, |g| g.reissue_code(member, &self.handoff))
            })
            .await
            .map(|(_, code)| code);
        Self::log_result("reissue_handoff", group, member, &result);
        result
    }

    /// Pay out the escrow of a completed group to its receiver.
    ///
    /// Idempotent: members already paid out are skipped, so this can be
    /// re-run after an interrupted completion.
    pub async fn settle(&self, group: GroupId) -> Result<Group, EngineError> {
        let result = self.apply_settle(group).await;
        Self::log_result("settle", group, 0, &result);
        result
    }

    pub fn get_group(&self, group: GroupId) -> Result<Group, EngineError> {
        self.groups
            .get(&group)?
            .map(|g| g.value)
            .ok_or_else(|| GroupError::GroupNotFound(group).into())
    }

    /// Forming groups, oldest first.
    pub fn list_open_groups(&self, limit: usize) -> Result<Vec<Group>, EngineError> {
        let mut open: Vec<Group> = self
            .groups
            .scan()?
            .into_iter()
            .map(|g| g.value)
            .filter(|g| g.status() == GroupStatus::Forming)
            .collect();
        open.sort_by_key(|g| g.id());
        open.truncate(limit);
        Ok(open)
    }

    /// Every group `user` belongs to, oldest first.
    pub fn list_groups_for_user(&self, user: UserId) -> Result<Vec<Group>, EngineError> {
        let mut groups: Vec<Group> = self
            .groups
            .scan()?
            .into_iter()
            .map(|g| g.value)
            .filter(|g| g.is_member(user))
            .collect();
        groups.sort_by_key(|g| g.id());
        Ok(groups)
    }

    pub async fn get_wallet(&self, user: UserId) -> Result<Wallet, EngineError> {
        self.ledger.get_wallet(user).await
    }

    pub async fn deposit(
        &self,
        user: UserId,
        amount: Amount,
        external_ref: &str,
    ) -> Result<Wallet, EngineError> {
        self.ledger.deposit(user, amount, external_ref).await
    }
}

/// Private API
impl Engine {
    /// Small helper to log operation results
    fn log_result<T, E: std::fmt::Display>(
        op: &str,
        group: GroupId,
        user: UserId,
        result: &Result<T, E>,
    ) {
        match result {
            Ok(_) => info!(group = %group, user = %user, "{op} applied"),
            Err(e) => info!(group = %group, user = %user, reason = %e, "{op} rejected"),
        }
    }

    fn emit(&self, event: LifecycleEvent) {
        debug!(event = ?event, "lifecycle event");
        if let Some(sender) = &self.events {
            // a dropped receiver only means nobody is listening
            let _ = sender.send(event);
        }
    }

    /// One read-validate-commit cycle against a group record.
    fn update_group<T>(
        &self,
        id: GroupId,
        change: impl FnOnce(&mut Group) -> Result<T, GroupError>,
    ) -> Result<(Group, T), EngineError> {
        let current = self
            .groups
            .get(&id)?
            .ok_or(GroupError::GroupNotFound(id))?;
        let mut group = current.value;
        let outcome = change(&mut group)?;
        if let Err(violation) = group.check_invariants() {
            warn!(group = %id, violation, "refusing to commit group");
            return Err(EngineError::InvariantViolation(violation));
        }
        let committed = self.groups.compare_and_swap(&id, current.version, group)?;
        Ok((committed.value, outcome))
    }

    async fn apply_create(
        &self,
        offer: OfferId,
        target_size: u32,
        creator: &Identity,
        location: Location,
    ) -> Result<Group, EngineError> {
        let max = self.config.max_target_size;
        if !(2..=max).contains(&target_size) {
            return Err(GroupError::InvalidTarget {
                target: target_size,
                max,
            }
            .into());
        }

        let offer = self
            .catalog
            .offer(offer)?
            .ok_or(GroupError::OfferNotFound(offer))?;
        if offer.status != OfferStatus::Approved || !offer.price.is_positive() {
            return Err(GroupError::OfferNotAvailable(offer.id).into());
        }
        let share = offer
            .price
            .split(target_size)
            .ok_or(GroupError::InvalidTarget {
                target: target_size,
                max,
            })?;
        let offer_ref = OfferRef {
            id: offer.id,
            price: offer.price,
            currency: offer.currency,
        };

        self.retry
            .run("create_group", || {
                let id = self.next_group.fetch_add(1, Ordering::Relaxed) + 1;
                let group = Group::new(id, offer_ref.clone(), target_size, share, creator, location);
                group
                    .check_invariants()
                    .map_err(EngineError::InvariantViolation)?;
                Ok(self.groups.insert(id, group)?.value)
            })
            .await
    }

    async fn apply_pay(&self, group: GroupId, user: UserId) -> Result<Group, EngineError> {
        let snapshot = self.get_group(group)?;
        snapshot.check_payable(user)?;

        // A failed lock leaves the member untouched. A lock whose group
        // commit is lost is held per group, so paying again does not
        // deduct twice.
        self.ledger.lock(user, snapshot.share(), group).await?;

        let (g, funded) = self
            .retry
            .run("pay_share", || self.update_group(group, |g| g.mark_paid(user)))
            .await?;
        if funded {
            self.emit(LifecycleEvent::GroupFunded { group });
        }
        Ok(g)
    }

    async fn apply_settle(&self, group: GroupId) -> Result<Group, EngineError> {
        let snapshot = self.get_group(group)?;
        if snapshot.status() != GroupStatus::Completed {
            return Err(GroupError::InvalidStage {
                op: GroupOperation::Settle,
                group,
                status: snapshot.status(),
            }
            .into());
        }
        let receiver = snapshot.receiver().ok_or_else(|| {
            EngineError::InvariantViolation(format!("completed group {group} has no receiver"))
        })?;

        // The receiver's own share returns to their balance alongside the
        // other members' shares.
        let mut released = Vec::new();
        let mut failure = None;
        for member in snapshot.unsettled() {
            match self
                .ledger
                .release(member, receiver, snapshot.share(), group)
                .await
            {
                Ok(_) => released.push(member),
                Err(e) => {
                    warn!(group = %group, member = %member, reason = %e, "escrow release failed");
                    failure = Some(e);
                    break;
                }
            }
        }

        let (g, _) = self
            .retry
            .run("settle", || {
                self.update_group(group, |g| g.mark_released(&released))
            })
            .await?;
        match failure {
            Some(e) => Err(e),
            None => Ok(g),
        }
    }
}
