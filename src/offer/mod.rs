//! Trade offers and the ledgers that track them

mod ledger;
#[allow(clippy::module_inception)]
mod offer;

pub use ledger::{AgentOfferLedger, OfferLedger, OfferSlot, PoolOfferLedger};
pub use offer::{OfferState, TradeOffer};
