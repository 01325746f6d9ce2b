pub mod amount;
pub mod collab;
pub mod config;
pub mod csv;
pub mod engine;
pub mod handoff;
pub mod host;
pub mod ledger;
pub mod model;
pub mod retry;
pub mod script;
pub mod store;

pub use amount::Amount;
pub use engine::{Engine, EngineError};
pub use ledger::Ledger;
pub use model::{GroupId, Identity, Location, OfferId, UserId};
