//! Contracts for the services around the engine.
//!
//! Identity/trust, geocoding and the offer catalog live in other systems.
//! They are consulted before any atomic section starts, never inside one.

use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::warn;

use crate::engine::DependencyError;
use crate::model::{GroupId, Identity, Location, Offer, OfferId, UserId};

/// Lifecycle transitions announced after they are committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    GroupLocked { group: GroupId, receiver: UserId },
    GroupFunded { group: GroupId },
    OrderPlaced { group: GroupId },
    GoodsArrived { group: GroupId },
    HandoffConfirmed {
        group: GroupId,
        member: UserId,
        receiver: UserId,
    },
    GroupCompleted { group: GroupId },
}

/// Trust gate: resolves an authenticated user to an identity and trust score.
pub trait IdentityProvider: Send + Sync {
    fn identify(&self, user: UserId) -> Result<Option<Identity>, DependencyError>;

    /// Called with committed lifecycle events. Trust-score bookkeeping is the
    /// provider's business; the engine never writes trust itself.
    fn on_event(&self, _event: &LifecycleEvent) {}
}

pub trait Geocoder: Send + Sync {
    /// `Location::Unknown` when the address cannot be resolved.
    fn geocode(&self, address: &str) -> Result<Location, DependencyError>;
}

pub trait OfferCatalog: Send + Sync {
    fn offer(&self, id: OfferId) -> Result<Option<Offer>, DependencyError>;
}

/// Geocode `address`, treating an unreachable geocoder as an unknown location.
///
/// Unknown members are left out of host selection; they are never placed at
/// a made-up coordinate.
pub fn locate_or_unknown(geocoder: &dyn Geocoder, address: &str) -> Location {
    match geocoder.geocode(address) {
        Ok(location) => location,
        Err(e) => {
            warn!(address, reason = %e, "geocoding failed, location unknown");
            Location::Unknown
        }
    }
}

const MAX_TRUST: f64 = 100.0;
const HANDOFF_TRUST_REWARD: f64 = 1.0;

/// In-process identity provider.
///
/// Confirmed handoffs raise both parties' trust by a point, up to 100.
#[derive(Debug, Default)]
pub struct MemoryDirectory {
    users: RwLock<HashMap<UserId, Identity>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, identity: Identity) -> Result<(), DependencyError> {
        self.users
            .write()
            .map_err(|_| DependencyError::new("directory", "lock poisoned"))?
            .insert(identity.user_id, identity);
        Ok(())
    }

    fn reward(&self, users: &[UserId]) {
        let Ok(mut directory) = self.users.write() else {
            warn!("directory lock poisoned, trust not updated");
            return;
        };
        for user in users {
            if let Some(identity) = directory.get_mut(user) {
                identity.trust_score = (identity.trust_score + HANDOFF_TRUST_REWARD).min(MAX_TRUST);
            }
        }
    }
}

impl IdentityProvider for MemoryDirectory {
    fn identify(&self, user: UserId) -> Result<Option<Identity>, DependencyError> {
        let users = self
            .users
            .read()
            .map_err(|_| DependencyError::new("directory", "lock poisoned"))?;
        Ok(users.get(&user).cloned())
    }

    fn on_event(&self, event: &LifecycleEvent) {
        if let LifecycleEvent::HandoffConfirmed {
            member, receiver, ..
        } = event
        {
            self.reward(&[*member, *receiver]);
        }
    }
}

/// In-process geocoder over an address book. Addresses match
/// case-insensitively; anything not in the book is `Location::Unknown`.
#[derive(Debug, Default)]
pub struct MemoryGeocoder {
    places: RwLock<HashMap<String, Location>>,
    offline: AtomicBool,
}

impl MemoryGeocoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, address: &str, location: Location) -> Result<(), DependencyError> {
        self.places
            .write()
            .map_err(|_| DependencyError::new("geocoder", "lock poisoned"))?
            .insert(normalize(address), location);
        Ok(())
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::Relaxed);
    }
}

fn normalize(address: &str) -> String {
    address.trim().to_lowercase()
}

impl Geocoder for MemoryGeocoder {
    fn geocode(&self, address: &str) -> Result<Location, DependencyError> {
        if self.offline.load(Ordering::Relaxed) {
            return Err(DependencyError::new("geocoder", "offline"));
        }
        let places = self
            .places
            .read()
            .map_err(|_| DependencyError::new("geocoder", "lock poisoned"))?;
        Ok(places.get(&normalize(address)).copied().unwrap_or_default())
    }
}

/// In-process offer catalog that can be taken offline.
#[derive(Debug, Default)]
pub struct MemoryCatalog {
    offers: RwLock<HashMap<OfferId, Offer>>,
    offline: AtomicBool,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, offer: Offer) -> Result<(), DependencyError> {
        self.offers
            .write()
            .map_err(|_| DependencyError::new("catalog", "lock poisoned"))?
            .insert(offer.id, offer);
        Ok(())
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::Relaxed);
    }
}

impl OfferCatalog for MemoryCatalog {
    fn offer(&self, id: OfferId) -> Result<Option<Offer>, DependencyError> {
        if self.offline.load(Ordering::Relaxed) {
            return Err(DependencyError::new("catalog", "offline"));
        }
        let offers = self
            .offers
            .read()
            .map_err(|_| DependencyError::new("catalog", "lock poisoned"))?;
        Ok(offers.get(&id).cloned())
    }
}
