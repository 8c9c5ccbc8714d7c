//! Offer ledgers
//!
//! Agents own their sent offers through an [`AgentOfferLedger`]; the pool keeps
//! a [`PoolOfferLedger`] of weak references across all agents. Both are the same
//! [`OfferLedger`] parameterised by how a slot holds its offer.

use dashmap::DashMap;
use std::sync::{Arc, Weak};

use super::TradeOffer;
use crate::error::{PoolError, Result};
use crate::types::{AgentId, OfferId};

/// How a ledger entry refers to its offer
pub trait OfferSlot: Clone + Send + Sync + 'static {
    fn hold(offer: &Arc<TradeOffer>) -> Self;

    /// The offer, unless it has been dropped
    fn offer(&self) -> Option<Arc<TradeOffer>>;
}

impl OfferSlot for Arc<TradeOffer> {
    fn hold(offer: &Arc<TradeOffer>) -> Self {
        Arc::clone(offer)
    }

    fn offer(&self) -> Option<Arc<TradeOffer>> {
        Some(Arc::clone(self))
    }
}

impl OfferSlot for Weak<TradeOffer> {
    fn hold(offer: &Arc<TradeOffer>) -> Self {
        Arc::downgrade(offer)
    }

    fn offer(&self) -> Option<Arc<TradeOffer>> {
        self.upgrade()
    }
}

/// Sent offers keyed by id
pub struct OfferLedger<S: OfferSlot> {
    offers: DashMap<OfferId, S>,
}

/// Owning ledger of one agent
pub type AgentOfferLedger = OfferLedger<Arc<TradeOffer>>;

/// Non-owning ledger across every agent of a pool
pub type PoolOfferLedger = OfferLedger<Weak<TradeOffer>>;

impl<S: OfferSlot> Default for OfferLedger<S> {
    fn default() -> Self {
        Self {
            offers: DashMap::new(),
        }
    }
}

impl<S: OfferSlot> OfferLedger<S> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a sent offer; unsent offers have no id and are rejected
    pub fn add(&self, offer: &Arc<TradeOffer>) -> Result<OfferId> {
        let id = offer.id().ok_or(PoolError::OfferNotSent)?;
        self.offers.insert(id, S::hold(offer));
        Ok(id)
    }

    pub fn get(&self, id: OfferId) -> Option<Arc<TradeOffer>> {
        self.offers.get(&id).and_then(|slot| slot.offer())
    }

    pub fn contains(&self, id: OfferId) -> bool {
        self.get(id).is_some()
    }

    /// Remove a resolved offer
    ///
    /// Fails with [`PoolError::OfferStillActive`] while the offer awaits
    /// resolution. Unknown ids and dropped offers yield `Ok(None)`.
    pub fn pop(&self, id: OfferId) -> Result<Option<Arc<TradeOffer>>> {
        let mut still_active = false;
        let removed = self.offers.remove_if(&id, |_, slot| match slot.offer() {
            Some(offer) if offer.is_active() => {
                still_active = true;
                false
            }
            _ => true,
        });

        if still_active {
            return Err(PoolError::OfferStillActive(id));
        }
        Ok(removed.and_then(|(_, slot)| slot.offer()))
    }

    /// Like [`pop`](Self::pop), reporting whether an entry was removed
    pub fn remove(&self, id: OfferId) -> Result<bool> {
        Ok(self.pop(id)?.is_some())
    }

    /// Drop every offer owned by `agent`, whatever its state
    pub fn purge_owner(&self, agent: AgentId) -> usize {
        let before = self.offers.len();
        self.offers.retain(|_, slot| match slot.offer() {
            Some(offer) => offer.owner_id() != agent,
            None => false,
        });
        before.saturating_sub(self.offers.len())
    }

    /// Drop resolved offers and entries whose offer is gone
    pub fn clear_resolved(&self) -> usize {
        let before = self.offers.len();
        self.offers.retain(|_, slot| match slot.offer() {
            Some(offer) => !offer.is_resolved(),
            None => false,
        });
        before.saturating_sub(self.offers.len())
    }

    /// Live offers, in no particular order
    pub fn offers(&self) -> Vec<Arc<TradeOffer>> {
        self.offers
            .iter()
            .filter_map(|entry| entry.value().offer())
            .collect()
    }

    pub fn ids(&self) -> Vec<OfferId> {
        self.offers
            .iter()
            .filter(|entry| entry.value().offer().is_some())
            .map(|entry| *entry.key())
            .collect()
    }

    /// Number of live offers
    pub fn len(&self) -> usize {
        self.offers
            .iter()
            .filter(|entry| entry.value().offer().is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget entries whose offer has been dropped
    pub fn prune(&self) -> usize {
        let before = self.offers.len();
        self.offers.retain(|_, slot| slot.offer().is_some());
        before.saturating_sub(self.offers.len())
    }
}

impl<S: OfferSlot> std::fmt::Debug for OfferLedger<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OfferLedger")
            .field("offers", &self.offers.len())
            .finish()
    }
}
