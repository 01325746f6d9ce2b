//! Core domain types shared by the ledger and the group lifecycle.

use std::fmt;

use crate::Amount;

/// User identifier, as issued by the identity provider.
pub type UserId = u32;

/// Group identifier.
pub type GroupId = u64;

/// Offer identifier in the external catalog.
pub type OfferId = u32;

/// Ledger entry identifier.
pub type EntryId = u64;

/// A latitude/longitude pair in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Coordinates {
    pub lat: f64,
    pub lon: f64,
}

impl Coordinates {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }
}

/// Where a member is, if known.
///
/// A failed or inconclusive geocode is `Unknown`; it is never replaced by a
/// real coordinate such as `(0, 0)`.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Location {
    Known(Coordinates),
    #[default]
    Unknown,
}

impl Location {
    pub fn at(lat: f64, lon: f64) -> Self {
        Location::Known(Coordinates::new(lat, lon))
    }

    pub fn coordinates(&self) -> Option<Coordinates> {
        match self {
            Location::Known(c) => Some(*c),
            Location::Unknown => None,
        }
    }
}

/// An authenticated caller, as returned by the identity provider.
#[derive(Debug, Clone, PartialEq)]
pub struct Identity {
    pub user_id: UserId,
    pub display_name: String,
    pub trust_score: f64,
}

impl Identity {
    pub fn new(user_id: UserId, display_name: impl Into<String>, trust_score: f64) -> Self {
        Self {
            user_id,
            display_name: display_name.into(),
            trust_score,
        }
    }
}

/// Moderation status of a catalog offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferStatus {
    Pending,
    Approved,
    Rejected,
}

/// Offer data as returned by the catalog.
#[derive(Debug, Clone, PartialEq)]
pub struct Offer {
    pub id: OfferId,
    pub price: Amount,
    pub currency: String,
    pub status: OfferStatus,
}

/// What a ledger operation refers to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Correlation {
    /// Escrow movement on behalf of a group.
    Group(GroupId),
    /// Top-up reference issued by an external payment flow.
    External(String),
}

impl fmt::Display for Correlation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Correlation::Group(id) => write!(f, "group:{id}"),
            Correlation::External(r) => write!(f, "ext:{r}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn location_default_is_unknown() {
        assert_eq!(Location::default(), Location::Unknown);
        assert_eq!(Location::default().coordinates(), None);
    }

    #[test]
    fn origin_is_a_known_location() {
        let origin = Location::at(0.0, 0.0);
        assert_eq!(origin.coordinates(), Some(Coordinates::new(0.0, 0.0)));
    }

    #[test]
    fn correlation_display() {
        assert_eq!(Correlation::Group(7).to_string(), "group:7");
        assert_eq!(Correlation::External("pay_1".into()).to_string(), "ext:pay_1");
    }
}
