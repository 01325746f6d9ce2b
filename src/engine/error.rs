//! Error types for the ledger and the group lifecycle.

use thiserror::Error;

use crate::Amount;
use crate::engine::GroupStatus;
use crate::model::{GroupId, OfferId, UserId};
use crate::store::StoreError;

/// Top-level error returned by every [`Engine`](crate::Engine) and
/// [`Ledger`](crate::Ledger) operation.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{0}")]
    Group(#[from] GroupError),

    #[error("{0}")]
    Ledger(#[from] LedgerError),

    #[error("{op}: gave up after {attempts} conflicting attempts")]
    ConcurrencyExhausted { op: &'static str, attempts: u32 },

    #[error("dependency unavailable: {0}")]
    DependencyUnavailable(#[from] DependencyError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("invariant violation: {0}")]
    InvariantViolation(String),
}

/// Coarse classification of an [`EngineError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad input shape or range.
    Validation,
    /// A lifecycle or funding rule refused the request.
    BusinessRule,
    /// Optimistic commits kept conflicting.
    Concurrency,
    /// Data-integrity bug; nothing was committed.
    Invariant,
    /// An external collaborator or the store could not be reached.
    Dependency,
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Group(GroupError::InvalidTarget { .. })
            | EngineError::Ledger(LedgerError::InvalidAmount(_)) => ErrorKind::Validation,
            EngineError::Group(_) => ErrorKind::BusinessRule,
            EngineError::Ledger(LedgerError::InvariantViolation(_))
            | EngineError::Ledger(LedgerError::MissingHold { .. })
            | EngineError::InvariantViolation(_) => ErrorKind::Invariant,
            EngineError::Ledger(_) => ErrorKind::BusinessRule,
            EngineError::ConcurrencyExhausted { .. } => ErrorKind::Concurrency,
            EngineError::DependencyUnavailable(_) | EngineError::Store(_) => ErrorKind::Dependency,
        }
    }

    /// Whether a read-modify-write loop should start over from the read.
    pub(crate) fn is_transient(&self) -> bool {
        matches!(self, EngineError::Store(e) if e.is_transient())
    }
}

/// The lifecycle operation that was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupOperation {
    Pay,
    ConfirmOrder,
    ConfirmArrival,
    VerifyHandoff,
    ReissueCode,
    Settle,
}

/// Validation and business-rule errors of the group lifecycle.
#[derive(Debug, Error, PartialEq)]
pub enum GroupError {
    #[error("target size {target} outside 2..={max}")]
    InvalidTarget { target: u32, max: u32 },

    #[error("offer {0} not found")]
    OfferNotFound(OfferId),

    #[error("offer {0} is not open for group buys")]
    OfferNotAvailable(OfferId),

    #[error("group {0} not found")]
    GroupNotFound(GroupId),

    #[error("group {0} is full")]
    GroupFull(GroupId),

    #[error("user {user} is already a member of group {group}")]
    AlreadyMember { group: GroupId, user: UserId },

    #[error("trust score {score} of user {user} below required {required}")]
    TrustTooLow {
        user: UserId,
        score: f64,
        required: f64,
    },

    #[error("group {0} is {1:?} and no longer accepts members")]
    GroupNotJoinable(GroupId, GroupStatus),

    #[error("{op:?} not allowed while group {group} is {status:?}")]
    InvalidStage {
        op: GroupOperation,
        group: GroupId,
        status: GroupStatus,
    },

    #[error("user {user} is not the receiver of group {group}")]
    NotReceiver { group: GroupId, user: UserId },

    #[error("user {user} is not a member of group {group}")]
    NotMember { group: GroupId, user: UserId },

    #[error("user {user} already paid into group {group}")]
    AlreadyPaid { group: GroupId, user: UserId },

    #[error("handoff to user {user} in group {group} already confirmed")]
    AlreadyConfirmed { group: GroupId, user: UserId },

    #[error("invalid handoff code for user {user} in group {group}")]
    InvalidOtp { group: GroupId, user: UserId },

    #[error("handoff code for user {user} in group {group} revoked after repeated wrong attempts")]
    HandoffRevoked { group: GroupId, user: UserId },
}

/// Errors raised by escrow ledger operations.
#[derive(Debug, Error, PartialEq)]
pub enum LedgerError {
    #[error("amount {0} must be positive")]
    InvalidAmount(Amount),

    #[error("insufficient funds for user {user}: balance {balance}, requested {requested}")]
    InsufficientFunds {
        user: UserId,
        balance: Amount,
        requested: Amount,
    },

    #[error("deposit reference {0} already applied")]
    DuplicateDeposit(String),

    #[error("user {user} holds no escrow for group {group}")]
    MissingHold { user: UserId, group: GroupId },

    #[error("ledger invariant violated: {0}")]
    InvariantViolation(String),
}

/// An external collaborator could not answer.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{service} unavailable: {reason}")]
pub struct DependencyError {
    pub service: &'static str,
    pub reason: String,
}

impl DependencyError {
    pub fn new(service: &'static str, reason: impl Into<String>) -> Self {
        Self {
            service,
            reason: reason.into(),
        }
    }
}
