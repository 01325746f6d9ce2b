use std::collections::HashSet;
use std::time::SystemTime;

use crate::Amount;
use crate::engine::{GroupError, GroupOperation};
use crate::handoff::{CodeHash, HandoffCode, HandoffVerifier};
use crate::host::select_host;
use crate::model::{GroupId, Identity, Location, OfferId, UserId};

/// Stage of a group buy. Stages only move forward, one at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum GroupStatus {
    Forming,
    Locked,
    Funded,
    Ordered,
    Delivered,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentStatus {
    Joined,
    Paid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    Pending,
    Confirmed,
}

/// The offer a group is buying, as priced when the group was created.
#[derive(Debug, Clone, PartialEq)]
pub struct OfferRef {
    pub id: OfferId,
    pub price: Amount,
    pub currency: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Member {
    user_id: UserId,
    display_name: String,
    trust_score: f64,
    location: Location,
    payment: PaymentStatus,
    delivery: DeliveryStatus,
    handoff_hash: Option<CodeHash>,
    failed_attempts: u32,
    handoff_revoked: bool,
    escrow_released: bool,
}

impl Member {
    fn new(identity: &Identity, location: Location) -> Self {
        Self {
            user_id: identity.user_id,
            display_name: identity.display_name.clone(),
            trust_score: identity.trust_score,
            location,
            payment: PaymentStatus::Joined,
            delivery: DeliveryStatus::Pending,
            handoff_hash: None,
            failed_attempts: 0,
            handoff_revoked: false,
            escrow_released: false,
        }
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    /// Trust score captured when the member joined.
    pub fn trust_score(&self) -> f64 {
        self.trust_score
    }

    pub fn location(&self) -> Location {
        self.location
    }

    pub fn payment(&self) -> PaymentStatus {
        self.payment
    }

    pub fn delivery(&self) -> DeliveryStatus {
        self.delivery
    }

    pub fn has_handoff_code(&self) -> bool {
        self.handoff_hash.is_some()
    }

    /// Wrong codes tried against the member's current code.
    pub fn failed_attempts(&self) -> u32 {
        self.failed_attempts
    }

    /// The code was discarded after too many wrong attempts.
    pub fn handoff_revoked(&self) -> bool {
        self.handoff_revoked
    }

    pub fn escrow_released(&self) -> bool {
        self.escrow_released
    }
}

/// Result of a handoff attempt that must be committed either way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HandoffOutcome {
    Confirmed { completed: bool },
    /// Wrong code. `revoked` is set once the attempt budget is spent.
    Rejected { revoked: bool },
}

/// A group buy and its members.
#[derive(Debug, Clone, PartialEq)]
pub struct Group {
    id: GroupId,
    offer: OfferRef,
    target_size: u32,
    share: Amount,
    status: GroupStatus,
    receiver: Option<UserId>,
    members: Vec<Member>,
    created_at: SystemTime,
}

impl Group {
    pub(crate) fn new(
        id: GroupId,
        offer: OfferRef,
        target_size: u32,
        share: Amount,
        creator: &Identity,
        location: Location,
    ) -> Self {
        Self {
            id,
            offer,
            target_size,
            share,
            status: GroupStatus::Forming,
            receiver: None,
            members: vec![Member::new(creator, location)],
            created_at: SystemTime::now(),
        }
    }

    pub fn id(&self) -> GroupId {
        self.id
    }

    pub fn offer(&self) -> &OfferRef {
        &self.offer
    }

    pub fn target_size(&self) -> u32 {
        self.target_size
    }

    pub fn current_size(&self) -> u32 {
        self.members.len() as u32
    }

    /// Amount each member pays into escrow.
    pub fn share(&self) -> Amount {
        self.share
    }

    pub fn status(&self) -> GroupStatus {
        self.status
    }

    pub fn receiver(&self) -> Option<UserId> {
        self.receiver
    }

    /// Members in join order; the creator is first.
    pub fn members(&self) -> &[Member] {
        &self.members
    }

    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    pub fn member(&self, user: UserId) -> Option<&Member> {
        self.members.iter().find(|m| m.user_id == user)
    }

    pub fn is_member(&self, user: UserId) -> bool {
        self.member(user).is_some()
    }

    fn member_mut(&mut self, user: UserId) -> Option<&mut Member> {
        self.members.iter_mut().find(|m| m.user_id == user)
    }

    fn handoff_members(&self) -> impl Iterator<Item = &Member> {
        self.members
            .iter()
            .filter(move |m| Some(m.user_id) != self.receiver)
    }

    fn require_stage(&self, op: GroupOperation, expected: GroupStatus) -> Result<(), GroupError> {
        if self.status != expected {
            return Err(GroupError::InvalidStage {
                op,
                group: self.id,
                status: self.status,
            });
        }
        Ok(())
    }

    fn require_receiver(&self, op: GroupOperation, user: UserId) -> Result<(), GroupError> {
        match self.receiver {
            None => Err(GroupError::InvalidStage {
                op,
                group: self.id,
                status: self.status,
            }),
            Some(receiver) if receiver != user => Err(GroupError::NotReceiver {
                group: self.id,
                user,
            }),
            Some(_) => Ok(()),
        }
    }

    /// Add a member. When the group fills, picks the receiver and locks.
    ///
    /// Returns the receiver if this join locked the group.
    pub(crate) fn admit(
        &mut self,
        identity: &Identity,
        location: Location,
        min_trust: f64,
    ) -> Result<Option<UserId>, GroupError> {
        let user = identity.user_id;
        if self.is_member(user) {
            return Err(GroupError::AlreadyMember {
                group: self.id,
                user,
            });
        }
        if self.current_size() >= self.target_size {
            return Err(GroupError::GroupFull(self.id));
        }
        if self.status != GroupStatus::Forming {
            return Err(GroupError::GroupNotJoinable(self.id, self.status));
        }
        if !identity.trust_score.is_finite() || identity.trust_score < min_trust {
            return Err(GroupError::TrustTooLow {
                user,
                score: identity.trust_score,
                required: min_trust,
            });
        }

        self.members.push(Member::new(identity, location));
        if self.current_size() < self.target_size {
            return Ok(None);
        }

        let candidates: Vec<(UserId, Location)> =
            self.members.iter().map(|m| (m.user_id, m.location)).collect();
        self.receiver = select_host(&candidates);
        self.status = GroupStatus::Locked;
        Ok(self.receiver)
    }

    /// Check that `user` may pay into the group right now.
    pub(crate) fn check_payable(&self, user: UserId) -> Result<(), GroupError> {
        let member = self.member(user).ok_or(GroupError::NotMember {
            group: self.id,
            user,
        })?;
        if member.payment == PaymentStatus::Paid {
            return Err(GroupError::AlreadyPaid {
                group: self.id,
                user,
            });
        }
        self.require_stage(GroupOperation::Pay, GroupStatus::Locked)
    }

    /// Mark `user` as paid. Returns `true` if this payment funded the group.
    pub(crate) fn mark_paid(&mut self, user: UserId) -> Result<bool, GroupError> {
        self.check_payable(user)?;
        if let Some(member) = self.member_mut(user) {
            member.payment = PaymentStatus::Paid;
        }
        let funded = self.members.iter().all(|m| m.payment == PaymentStatus::Paid);
        if funded {
            self.status = GroupStatus::Funded;
        }
        Ok(funded)
    }

    pub(crate) fn confirm_order(&mut self, user: UserId) -> Result<(), GroupError> {
        self.require_receiver(GroupOperation::ConfirmOrder, user)?;
        self.require_stage(GroupOperation::ConfirmOrder, GroupStatus::Funded)?;
        self.status = GroupStatus::Ordered;
        Ok(())
    }

    /// Mint a handoff code for every member except the receiver and move to
    /// `Delivered`. Only hashes are kept; the raw codes are returned.
    pub(crate) fn confirm_arrival(
        &mut self,
        user: UserId,
        verifier: &HandoffVerifier,
    ) -> Result<Vec<(UserId, HandoffCode)>, GroupError> {
        self.require_receiver(GroupOperation::ConfirmArrival, user)?;
        self.require_stage(GroupOperation::ConfirmArrival, GroupStatus::Ordered)?;

        let (id, receiver) = (self.id, self.receiver);
        let mut codes = Vec::new();
        for member in self.members.iter_mut().filter(|m| Some(m.user_id) != receiver) {
            let (code, hash) = verifier.mint(id, member.user_id);
            member.handoff_hash = Some(hash);
            codes.push((member.user_id, code));
        }
        self.status = GroupStatus::Delivered;
        Ok(codes)
    }

    /// Redeem `member`'s handoff code.
    ///
    /// A wrong code is counted against the member and reported as
    /// `Rejected`; the count has to be committed, so it is not an error here.
    pub(crate) fn confirm_handoff(
        &mut self,
        receiver: UserId,
        member: UserId,
        code: &str,
        verifier: &HandoffVerifier,
    ) -> Result<HandoffOutcome, GroupError> {
        let op = GroupOperation::VerifyHandoff;
        self.require_receiver(op, receiver)?;
        let (id, status) = (self.id, self.status);

        if member == receiver {
            // the receiver never gets a code
            return Err(GroupError::InvalidOtp { group: id, user: member });
        }
        let target = self
            .member_mut(member)
            .ok_or(GroupError::NotMember { group: id, user: member })?;
        if target.delivery == DeliveryStatus::Confirmed {
            return Err(GroupError::AlreadyConfirmed { group: id, user: member });
        }
        if status != GroupStatus::Delivered {
            return Err(GroupError::InvalidStage { op, group: id, status });
        }
        if target.handoff_revoked {
            return Err(GroupError::HandoffRevoked { group: id, user: member });
        }
        let verified = target
            .handoff_hash
            .as_ref()
            .is_some_and(|hash| verifier.verify(id, member, code, hash));
        if !verified {
            target.failed_attempts += 1;
            let revoked = target.failed_attempts >= verifier.max_attempts();
            if revoked {
                target.handoff_hash = None;
                target.handoff_revoked = true;
            }
            return Ok(HandoffOutcome::Rejected { revoked });
        }
        target.delivery = DeliveryStatus::Confirmed;

        let completed = self
            .handoff_members()
            .all(|m| m.delivery == DeliveryStatus::Confirmed);
        if completed {
            self.status = GroupStatus::Completed;
            for m in &mut self.members {
                m.handoff_hash = None;
            }
        }
        Ok(HandoffOutcome::Confirmed { completed })
    }

    /// Replace `member`'s code with a fresh one and reset its attempt count.
    ///
    /// Requested by the member, never the receiver.
    pub(crate) fn reissue_code(
        &mut self,
        member: UserId,
        verifier: &HandoffVerifier,
    ) -> Result<HandoffCode, GroupError> {
        let op = GroupOperation::ReissueCode;
        let (id, status, receiver) = (self.id, self.status, self.receiver);
        if Some(member) == receiver {
            return Err(GroupError::InvalidOtp { group: id, user: member });
        }
        let target = self
            .member_mut(member)
            .ok_or(GroupError::NotMember { group: id, user: member })?;
        if target.delivery == DeliveryStatus::Confirmed {
            return Err(GroupError::AlreadyConfirmed { group: id, user: member });
        }
        if status != GroupStatus::Delivered {
            return Err(GroupError::InvalidStage { op, group: id, status });
        }
        let (code, hash) = verifier.mint(id, member);
        target.handoff_hash = Some(hash);
        target.failed_attempts = 0;
        target.handoff_revoked = false;
        Ok(code)
    }

    /// Members whose escrow has not been paid out yet.
    pub(crate) fn unsettled(&self) -> Vec<UserId> {
        self.members
            .iter()
            .filter(|m| !m.escrow_released)
            .map(|m| m.user_id)
            .collect()
    }

    pub(crate) fn mark_released(&mut self, users: &[UserId]) -> Result<(), GroupError> {
        self.require_stage(GroupOperation::Settle, GroupStatus::Completed)?;
        for member in self.members.iter_mut().filter(|m| users.contains(&m.user_id)) {
            member.escrow_released = true;
        }
        Ok(())
    }

    /// Structural invariants every committed group must satisfy.
    pub fn check_invariants(&self) -> Result<(), String> {
        let size = self.current_size();
        if self.target_size < 2 {
            return Err(format!("group {}: target size {} below 2", self.id, self.target_size));
        }
        if size == 0 || size > self.target_size {
            return Err(format!(
                "group {}: {size} members for target {}",
                self.id, self.target_size
            ));
        }
        let mut seen = HashSet::new();
        if !self.members.iter().all(|m| seen.insert(m.user_id)) {
            return Err(format!("group {}: duplicate member", self.id));
        }

        let forming = self.status == GroupStatus::Forming;
        if forming == self.receiver.is_some() {
            return Err(format!(
                "group {}: receiver {:?} inconsistent with {:?}",
                self.id, self.receiver, self.status
            ));
        }
        if let Some(receiver) = self.receiver {
            if !self.is_member(receiver) {
                return Err(format!("group {}: receiver {receiver} is not a member", self.id));
            }
        }
        if forming && size >= self.target_size {
            return Err(format!("group {}: full but still forming", self.id));
        }
        if !forming && size != self.target_size {
            return Err(format!("group {}: locked below target", self.id));
        }

        for m in &self.members {
            if m.payment == PaymentStatus::Paid && self.status < GroupStatus::Locked {
                return Err(format!("group {}: member {} paid before lock", self.id, m.user_id));
            }
            if self.status >= GroupStatus::Funded && m.payment != PaymentStatus::Paid {
                return Err(format!("group {}: member {} unpaid after funding", self.id, m.user_id));
            }
            if m.delivery == DeliveryStatus::Confirmed
                && (self.status < GroupStatus::Delivered || Some(m.user_id) == self.receiver)
            {
                return Err(format!(
                    "group {}: member {} confirmed out of stage",
                    self.id, m.user_id
                ));
            }
            if m.escrow_released && self.status != GroupStatus::Completed {
                return Err(format!(
                    "group {}: escrow of {} released before completion",
                    self.id, m.user_id
                ));
            }
        }

        if self.status == GroupStatus::Delivered {
            let missing = self
                .handoff_members()
                .any(|m| {
                    m.delivery == DeliveryStatus::Pending
                        && m.handoff_hash.is_none() == !m.handoff_revoked
                });
            if missing {
                return Err(format!("group {}: pending member code out of sync", self.id));
            }
        }
        if self.status == GroupStatus::Completed
            && !self
                .handoff_members()
                .all(|m| m.delivery == DeliveryStatus::Confirmed)
        {
            return Err(format!("group {}: completed with pending handoffs", self.id));
        }
        Ok(())
    }
}
