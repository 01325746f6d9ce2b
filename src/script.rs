//! Scenario driver.
//!
//! Replays a sequence of lifecycle commands against an [`Engine`] backed by
//! in-memory collaborators. Users and offers are registered by the script
//! itself; handoff codes minted on arrival are kept here and stand in for
//! out-of-band delivery to members.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio_stream::{Stream, StreamExt};
use tracing::warn;

use crate::Amount;
use crate::collab::{
    IdentityProvider, LifecycleEvent, MemoryCatalog, MemoryDirectory, MemoryGeocoder,
    locate_or_unknown,
};
use crate::config::EngineConfig;
use crate::engine::{Engine, EngineError};
use crate::handoff::HandoffCode;
use crate::ledger::Wallet;
use crate::model::{GroupId, Identity, Location, Offer, OfferId, OfferStatus, UserId};

/// One scripted step.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// An unknown `location` is geocoded from `address` when one is given.
    RegisterUser {
        user: UserId,
        name: String,
        trust: f64,
        location: Location,
        address: Option<String>,
    },
    /// Add an entry to the geocoder's address book.
    Place {
        address: String,
        location: Location,
    },
    PublishOffer {
        offer: OfferId,
        price: Amount,
        currency: String,
        status: OfferStatus,
    },
    Deposit {
        user: UserId,
        amount: Amount,
        reference: String,
    },
    Create {
        user: UserId,
        offer: OfferId,
        target: u32,
    },
    Join {
        user: UserId,
        group: GroupId,
    },
    Pay {
        user: UserId,
        group: GroupId,
    },
    Order {
        user: UserId,
        group: GroupId,
    },
    Arrive {
        user: UserId,
        group: GroupId,
    },
    /// Member asks for a fresh handoff code; the driver keeps it.
    Reissue {
        user: UserId,
        group: GroupId,
    },
    /// `code: None` redeems the code the driver kept from `Arrive`.
    Handoff {
        receiver: UserId,
        group: GroupId,
        member: UserId,
        code: Option<String>,
    },
}

#[derive(Debug, Error)]
pub enum ScriptError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("user {0} is not registered")]
    UnknownUser(UserId),

    #[error("no handoff code kept for member {member} in group {group}")]
    MissingCode { group: GroupId, member: UserId },
}

pub struct Runner {
    engine: Engine,
    directory: Arc<MemoryDirectory>,
    catalog: Arc<MemoryCatalog>,
    geocoder: MemoryGeocoder,
    locations: HashMap<UserId, Location>,
    codes: HashMap<(GroupId, UserId), HandoffCode>,
    events: UnboundedReceiver<LifecycleEvent>,
}

impl Runner {
    pub fn new(config: EngineConfig) -> Self {
        let directory = Arc::new(MemoryDirectory::new());
        let catalog = Arc::new(MemoryCatalog::new());
        let (sender, events) = mpsc::unbounded_channel();
        let engine = Engine::new(config, catalog.clone()).with_events(sender);
        Self {
            engine,
            directory,
            catalog,
            geocoder: MemoryGeocoder::new(),
            locations: HashMap::new(),
            codes: HashMap::new(),
            events,
        }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn directory(&self) -> &MemoryDirectory {
        &self.directory
    }

    /// Apply every command from `stream`. A failed command is logged and
    /// the script carries on.
    pub async fn run(&mut self, mut stream: impl Stream<Item = Command> + Unpin) {
        while let Some(command) = stream.next().await {
            if let Err(e) = self.apply(command).await {
                warn!(reason = %e, "command failed");
            }
        }
    }

    pub async fn apply(&mut self, command: Command) -> Result<(), ScriptError> {
        let result = self.dispatch(command).await;
        self.forward_events();
        result
    }

    /// Wallets of every user seen so far, ordered by user.
    pub fn wallets(&self) -> Result<Vec<Wallet>, EngineError> {
        let mut wallets = self.engine.ledger().wallets()?;
        wallets.sort_by_key(|w| w.user());
        Ok(wallets)
    }

    async fn dispatch(&mut self, command: Command) -> Result<(), ScriptError> {
        match command {
            Command::RegisterUser {
                user,
                name,
                trust,
                location,
                address,
            } => {
                let location = match (location, address) {
                    (Location::Unknown, Some(address)) => {
                        locate_or_unknown(&self.geocoder, &address)
                    }
                    (location, _) => location,
                };
                self.directory
                    .register(Identity::new(user, name, trust))
                    .map_err(EngineError::from)?;
                self.locations.insert(user, location);
            }
            Command::Place { address, location } => {
                self.geocoder
                    .add(&address, location)
                    .map_err(EngineError::from)?;
            }
            Command::PublishOffer {
                offer,
                price,
                currency,
                status,
            } => {
                self.catalog
                    .publish(Offer {
                        id: offer,
                        price,
                        currency,
                        status,
                    })
                    .map_err(EngineError::from)?;
            }
            Command::Deposit {
                user,
                amount,
                reference,
            } => {
                self.engine.deposit(user, amount, &reference).await?;
            }
            Command::Create {
                user,
                offer,
                target,
            } => {
                let identity = self.identify(user)?;
                self.engine
                    .create_group(offer, target, &identity, self.location_of(user))
                    .await?;
            }
            Command::Join { user, group } => {
                let identity = self.identify(user)?;
                self.engine
                    .join_group(group, &identity, self.location_of(user))
                    .await?;
            }
            Command::Pay { user, group } => {
                self.engine.pay_share(group, user).await?;
            }
            Command::Order { user, group } => {
                self.engine.confirm_order(group, user).await?;
            }
            Command::Arrive { user, group } => {
                let arrival = self.engine.confirm_arrival(group, user).await?;
                for (member, code) in arrival.codes {
                    self.codes.insert((group, member), code);
                }
            }
            Command::Reissue { user, group } => {
                let code = self.engine.reissue_handoff(group, user).await?;
                self.codes.insert((group, user), code);
            }
            Command::Handoff {
                receiver,
                group,
                member,
                code,
            } => {
                let code = match code {
                    Some(code) => code,
                    None => self
                        .codes
                        .get(&(group, member))
                        .map(|c| c.as_str().to_string())
                        .ok_or(ScriptError::MissingCode { group, member })?,
                };
                self.engine
                    .verify_handoff(group, receiver, member, &code)
                    .await?;
                self.codes.remove(&(group, member));
            }
        }
        Ok(())
    }

    /// Trust is read fresh from the directory for every create/join.
    fn identify(&self, user: UserId) -> Result<Identity, ScriptError> {
        self.directory
            .identify(user)
            .map_err(EngineError::from)?
            .ok_or(ScriptError::UnknownUser(user))
    }

    fn location_of(&self, user: UserId) -> Location {
        self.locations.get(&user).copied().unwrap_or_default()
    }

    fn forward_events(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            self.directory.on_event(&event);
        }
    }
}
