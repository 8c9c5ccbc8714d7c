use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::agent::{Agent, AgentInner};
use crate::error::{PoolError, Result};
use crate::transport::{OfferDraft, SentOffer, TradeSnapshot};
use crate::types::{AgentId, Asset, OfferId, Partner};

/// Lifecycle state of a trade offer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OfferState {
    /// Created locally, not transmitted yet
    Unsent,
    Active,
    /// Sent, waiting for a secondary confirmation
    ConfirmationNeeded,
    Confirmed,
    Accepted,
    Declined,
    Cancelled,
    Expired,
    Countered,
}

impl OfferState {
    pub fn as_str(&self) -> &'static str {
        match self {
            OfferState::Unsent => "unsent",
            OfferState::Active => "active",
            OfferState::ConfirmationNeeded => "confirmation_needed",
            OfferState::Confirmed => "confirmed",
            OfferState::Accepted => "accepted",
            OfferState::Declined => "declined",
            OfferState::Cancelled => "cancelled",
            OfferState::Expired => "expired",
            OfferState::Countered => "countered",
        }
    }

    /// Sent and still awaiting resolution
    pub fn is_active(&self) -> bool {
        matches!(self, OfferState::Active | OfferState::ConfirmationNeeded)
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(
            self,
            OfferState::Unsent | OfferState::Active | OfferState::ConfirmationNeeded
        )
    }
}

impl std::fmt::Display for OfferState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Armed auto-cancel timer
struct CancelTimer {
    generation: u64,
    handle: JoinHandle<()>,
}

/// A trade offer created by an agent
///
/// Offers live behind an `Arc`. The id is assigned once the offer has been
/// transmitted and never changes afterwards. Send, cancel and confirm are
/// serialised per offer, so whichever resolution wins a race leaves the loser
/// with [`PoolError::AlreadyResolved`].
pub struct TradeOffer {
    owner: Weak<AgentInner>,
    owner_id: AgentId,
    owner_name: String,
    partner: Partner,
    token: Option<String>,
    message: String,
    items_to_send: Vec<Asset>,
    items_to_receive: Vec<Asset>,
    created_at: DateTime<Utc>,

    id: OnceLock<OfferId>,
    state: Mutex<OfferState>,
    cancel_delay: Mutex<Option<Duration>>,
    timer: Mutex<Option<CancelTimer>>,
    timer_generation: AtomicU64,
    op: tokio::sync::Mutex<()>,
}

impl TradeOffer {
    pub(crate) fn new(
        owner: &Agent,
        owner_id: AgentId,
        partner: Partner,
        token: Option<String>,
        message: String,
        items_to_send: Vec<Asset>,
        items_to_receive: Vec<Asset>,
    ) -> Arc<Self> {
        Arc::new(Self {
            owner: owner.downgrade(),
            owner_id,
            owner_name: owner.username().to_string(),
            partner,
            token,
            message,
            items_to_send,
            items_to_receive,
            created_at: Utc::now(),
            id: OnceLock::new(),
            state: Mutex::new(OfferState::Unsent),
            cancel_delay: Mutex::new(None),
            timer: Mutex::new(None),
            timer_generation: AtomicU64::new(0),
            op: tokio::sync::Mutex::new(()),
        })
    }

    /// Assigned by the service once sent
    pub fn id(&self) -> Option<OfferId> {
        self.id.get().copied()
    }

    pub fn state(&self) -> OfferState {
        self.state.lock().map(|s| *s).unwrap_or(OfferState::Unsent)
    }

    pub fn is_sent(&self) -> bool {
        self.id.get().is_some()
    }

    pub fn is_active(&self) -> bool {
        self.state().is_active()
    }

    pub fn is_resolved(&self) -> bool {
        self.state().is_terminal()
    }

    pub fn owner_id(&self) -> AgentId {
        self.owner_id
    }

    /// The owning agent, if it is still alive
    pub fn owner(&self) -> Option<Agent> {
        self.owner.upgrade().map(Agent::from_inner)
    }

    pub(crate) fn is_owned_by(&self, agent: &Agent) -> bool {
        agent.is_same_inner(&self.owner)
    }

    pub fn partner(&self) -> &Partner {
        &self.partner
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn items_to_send(&self) -> &[Asset] {
        &self.items_to_send
    }

    pub fn items_to_receive(&self) -> &[Asset] {
        &self.items_to_receive
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Per-offer auto-cancel delay, overriding agent and pool defaults
    pub fn cancel_delay(&self) -> Option<Duration> {
        self.cancel_delay.lock().ok().and_then(|d| *d)
    }

    pub fn set_cancel_delay(&self, delay: Duration) {
        match self.cancel_delay.lock() {
            Ok(mut slot) => *slot = Some(delay),
            Err(_) => warn!("Cancel delay of offer {:?} is poisoned", self.id()),
        }
    }

    pub fn has_armed_timer(&self) -> bool {
        self.timer.lock().map(|t| t.is_some()).unwrap_or(false)
    }

    pub(crate) fn draft(&self) -> OfferDraft {
        OfferDraft {
            partner: self.partner.id,
            token: self.token.clone(),
            message: self.message.clone(),
            items_to_send: self.items_to_send.clone(),
            items_to_receive: self.items_to_receive.clone(),
        }
    }

    /// Transmit the offer through its owning agent
    pub async fn send(self: &Arc<Self>) -> Result<OfferId> {
        let owner = self
            .owner()
            .ok_or_else(|| PoolError::NotReady(self.owner_name.clone()))?;
        owner.send_offer(self).await
    }

    /// Cancel the offer; fails with `AlreadyResolved` on a terminal offer
    pub async fn cancel(&self) -> Result<()> {
        let _op = self.op.lock().await;
        let id = self.ensure_unresolved()?;
        self.disarm_timer();

        let owner = self
            .owner()
            .ok_or_else(|| PoolError::NotReady(self.owner_name.clone()))?;
        owner
            .transport()
            .cancel_offer(id)
            .await
            .map_err(|e| self.adopt_remote_resolution(e))?;
        self.set_state(OfferState::Cancelled);

        info!("Offer {} of {} cancelled", id, self.owner_name);
        Ok(())
    }

    /// Confirm an offer that needs a secondary confirmation
    pub async fn confirm(&self) -> Result<()> {
        let _op = self.op.lock().await;
        let id = self.ensure_unresolved()?;
        self.disarm_timer();

        let owner = self
            .owner()
            .ok_or_else(|| PoolError::NotReady(self.owner_name.clone()))?;
        owner
            .transport()
            .confirm_offer(id)
            .await
            .map_err(|e| self.adopt_remote_resolution(e))?;
        self.set_state(OfferState::Confirmed);

        info!("Offer {} of {} confirmed", id, self.owner_name);
        Ok(())
    }

    /// The service closed the offer first; take its state over
    fn adopt_remote_resolution(&self, error: PoolError) -> PoolError {
        if let PoolError::AlreadyResolved { offer, state } = &error {
            debug!("Offer {} was resolved remotely ({})", offer, state);
            self.set_state(*state);
        }
        error
    }

    fn ensure_unresolved(&self) -> Result<OfferId> {
        let id = self.id().ok_or(PoolError::OfferNotSent)?;
        let state = self.state();
        if state.is_terminal() {
            return Err(PoolError::AlreadyResolved { offer: id, state });
        }
        Ok(id)
    }

    pub(crate) async fn lock_op(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.op.lock().await
    }

    pub(crate) fn mark_sent(&self, sent: SentOffer) {
        if self.id.set(sent.id).is_err() {
            warn!("Offer {} was assigned an id twice", sent.id);
        }
        self.set_state(sent.state);
    }

    /// Adopt the state reported by the service
    pub(crate) fn update_from(&self, snapshot: &TradeSnapshot) {
        let previous = self.state();
        if previous != snapshot.state {
            debug!(
                "Offer {} state {} -> {}",
                snapshot.id, previous, snapshot.state
            );
            self.set_state(snapshot.state);
        }
    }

    fn set_state(&self, state: OfferState) {
        match self.state.lock() {
            Ok(mut current) => *current = state,
            Err(_) => warn!("State of offer {:?} is poisoned", self.id()),
        }
    }

    /// Schedule an automatic cancel after `delay`
    ///
    /// Re-arming replaces (and aborts) a previously armed timer.
    pub(crate) fn arm_timer(self: &Arc<Self>, delay: Duration) {
        let generation = self.timer_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let offer = Arc::downgrade(self);

        // the slot stays locked until the handle is stored, so the task always
        // finds its own entry when it fires
        let Ok(mut slot) = self.timer.lock() else {
            warn!("Cancel timer of offer {:?} is poisoned", self.id());
            return;
        };
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(offer) = offer.upgrade() else {
                return;
            };
            if !offer.take_timer(generation) || !offer.is_active() {
                return;
            }

            let id = offer.id().map(|id| id.to_string()).unwrap_or_default();
            info!(
                "Offer {} of {} not resolved after {:?}, cancelling",
                id, offer.owner_name, delay
            );
            match offer.cancel().await {
                Ok(()) => {}
                Err(e @ PoolError::AlreadyResolved { .. }) => {
                    debug!("Auto-cancel lost the race: {}", e);
                }
                Err(e) => {
                    warn!("Auto-cancel of offer {} failed: {}", id, e);
                    if let Some(owner) = offer.owner() {
                        owner.record_error(None, e);
                    }
                }
            }
        });

        if let Some(previous) = slot.replace(CancelTimer { generation, handle }) {
            previous.handle.abort();
        }
    }

    /// Abort a pending auto-cancel; no-op when nothing is armed
    pub(crate) fn disarm_timer(&self) {
        self.timer_generation.fetch_add(1, Ordering::SeqCst);
        let armed = self.timer.lock().ok().and_then(|mut slot| slot.take());
        if let Some(timer) = armed {
            timer.handle.abort();
            debug!("Disarmed cancel timer of offer {:?}", self.id());
        }
    }

    /// Called by a firing timer: detach its own handle if it is still current
    fn take_timer(&self, generation: u64) -> bool {
        if self.timer_generation.load(Ordering::SeqCst) != generation {
            return false;
        }
        match self.timer.lock() {
            Ok(mut slot) => match slot.as_ref() {
                Some(timer) if timer.generation == generation => {
                    slot.take();
                    true
                }
                _ => false,
            },
            Err(_) => false,
        }
    }
}

impl std::fmt::Debug for TradeOffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TradeOffer")
            .field("id", &self.id())
            .field("state", &self.state())
            .field("owner", &self.owner_id)
            .field("partner", &self.partner.id)
            .field("send", &self.items_to_send.len())
            .field("receive", &self.items_to_receive.len())
            .finish()
    }
}

impl std::fmt::Display for TradeOffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.id() {
            Some(id) => write!(f, "offer {} ({})", id, self.state()),
            None => write!(f, "unsent offer to {}", self.partner.id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_classification() {
        assert!(!OfferState::Unsent.is_active());
        assert!(!OfferState::Unsent.is_terminal());
        assert!(OfferState::Active.is_active());
        assert!(OfferState::ConfirmationNeeded.is_active());
        for state in [
            OfferState::Confirmed,
            OfferState::Accepted,
            OfferState::Declined,
            OfferState::Cancelled,
            OfferState::Expired,
            OfferState::Countered,
        ] {
            assert!(state.is_terminal(), "{} should be terminal", state);
            assert!(!state.is_active());
        }
    }

    #[test]
    fn test_state_display() {
        assert_eq!(OfferState::ConfirmationNeeded.to_string(), "confirmation_needed");
        assert_eq!(OfferState::Countered.to_string(), "countered");
    }
}
