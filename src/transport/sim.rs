//! In-memory trading service for dry runs and tests

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};

use super::{AgentTransport, EventSender, OfferDraft, SentOffer, TradeSnapshot};
use crate::dispatch::AgentEvent;
use crate::error::{PoolError, Result, SessionError};
use crate::offer::OfferState;
use crate::types::{Asset, AssetId, Credentials, Game, GameId, OfferId, Partner, TradeUrl, UserId};

/// A fake trading service for one user
///
/// Sessions log in, emit `Login` and `Ready`, and stay open until closed.
/// Offers get sequential ids, inventories are generated from per-game sizes
/// that tests can change between fetches.
pub struct SimulatedTransport {
    user: UserId,
    login_failure: Option<SessionError>,
    connect_failure: Option<SessionError>,
    connect_delay: Duration,
    require_confirmation: bool,
    closed: watch::Sender<bool>,
    events: Mutex<Option<EventSender>>,
    next_offer_id: AtomicU64,
    offers: DashMap<OfferId, TradeSnapshot>,
    inventory_sizes: DashMap<GameId, usize>,
    inventory_fetches: DashMap<GameId, usize>,
    accepted: Mutex<Vec<OfferId>>,
    logins: AtomicUsize,
    token: RwLock<String>,
}

impl SimulatedTransport {
    pub fn new(user: UserId) -> Self {
        let (closed, _) = watch::channel(true);
        Self {
            user,
            login_failure: None,
            connect_failure: None,
            connect_delay: Duration::ZERO,
            require_confirmation: false,
            closed,
            events: Mutex::new(None),
            next_offer_id: AtomicU64::new(1),
            offers: DashMap::new(),
            inventory_sizes: DashMap::new(),
            inventory_fetches: DashMap::new(),
            accepted: Mutex::new(Vec::new()),
            logins: AtomicUsize::new(0),
            token: RwLock::new(random_token()),
        }
    }

    /// Fail every login with `error`
    pub fn with_login_failure(mut self, error: SessionError) -> Self {
        self.login_failure = Some(error);
        self
    }

    /// Fail every connect (after a successful login) with `error`
    pub fn with_connect_failure(mut self, error: SessionError) -> Self {
        self.connect_failure = Some(error);
        self
    }

    /// Delay between login and the `Ready` event
    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = delay;
        self
    }

    /// Report sent offers as needing a secondary confirmation
    pub fn with_confirmation_required(mut self) -> Self {
        self.require_confirmation = true;
        self
    }

    pub fn with_inventory(self, game: GameId, size: usize) -> Self {
        self.set_inventory_size(game, size);
        self
    }

    pub fn set_inventory_size(&self, game: GameId, size: usize) {
        self.inventory_sizes.insert(game, size);
    }

    pub fn user(&self) -> UserId {
        self.user
    }

    /// How many times the inventory of `game` has been fetched
    pub fn inventory_fetches(&self, game: GameId) -> usize {
        self.inventory_fetches.get(&game).map(|n| *n).unwrap_or(0)
    }

    pub fn logins(&self) -> usize {
        self.logins.load(Ordering::SeqCst)
    }

    pub fn accepted(&self) -> Vec<OfferId> {
        self.accepted
            .lock()
            .map(|a| a.clone())
            .unwrap_or_default()
    }

    pub fn offer(&self, id: OfferId) -> Option<TradeSnapshot> {
        self.offers.get(&id).map(|o| o.clone())
    }

    /// Push a raw event into the open session; false when no session is open
    pub fn push_event(&self, event: AgentEvent) -> bool {
        let sender = self.events.lock().ok().and_then(|s| s.clone());
        match sender {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }

    /// Deliver an incoming offer from `partner` and return its snapshot
    pub fn receive_offer(
        &self,
        partner: UserId,
        items_to_send: Vec<Asset>,
        items_to_receive: Vec<Asset>,
    ) -> TradeSnapshot {
        let now = Utc::now();
        let snapshot = TradeSnapshot {
            id: self.next_id(),
            partner,
            state: OfferState::Active,
            is_our_offer: false,
            message: String::new(),
            token: None,
            items_to_send,
            items_to_receive,
            created_at: now,
            updated_at: now,
            expires_at: None,
        };
        self.offers.insert(snapshot.id, snapshot.clone());
        self.push_event(AgentEvent::TradeReceived(snapshot.clone()));
        snapshot
    }

    /// Resolve an offer on the service side, emitting the matching event
    pub fn resolve_offer(&self, id: OfferId, state: OfferState) -> Result<TradeSnapshot> {
        let snapshot = {
            let mut offer = self
                .offers
                .get_mut(&id)
                .ok_or_else(|| PoolError::Transport(format!("unknown offer {}", id)))?;
            offer.state = state;
            offer.updated_at = Utc::now();
            offer.clone()
        };

        let event = match state {
            OfferState::Accepted => AgentEvent::TradeAccepted(snapshot.clone()),
            OfferState::Declined => AgentEvent::TradeDeclined(snapshot.clone()),
            OfferState::Cancelled => AgentEvent::TradeCancelled(snapshot.clone()),
            OfferState::Expired => AgentEvent::TradeExpired(snapshot.clone()),
            OfferState::Countered => AgentEvent::TradeCountered(snapshot.clone()),
            other => {
                return Err(PoolError::Transport(format!(
                    "{} is not a resolution state",
                    other
                )))
            }
        };
        self.push_event(event);
        Ok(snapshot)
    }

    /// End the open session as if the service dropped it
    pub fn drop_session(&self) {
        self.closed.send_replace(true);
    }

    fn next_id(&self) -> OfferId {
        OfferId(self.next_offer_id.fetch_add(1, Ordering::SeqCst))
    }

    fn emit(&self, event: AgentEvent) {
        self.push_event(event);
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(PoolError::NotReady(format!("session of user {}", self.user)));
        }
        Ok(())
    }

    fn generate_assets(&self, game: &Game, size: usize) -> Vec<Asset> {
        (1..=size as u64)
            .map(|n| Asset {
                asset_id: AssetId(game.id.0 as u64 * 1_000_000 + n),
                game: game.id,
                context_id: game.context_id,
                class_id: n,
                instance_id: 0,
                amount: 1,
                name: format!("{} item #{}", game, n),
                tradable: true,
            })
            .collect()
    }
}

fn random_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect()
}

#[async_trait]
impl AgentTransport for SimulatedTransport {
    async fn login(&self, credentials: &Credentials) -> std::result::Result<(), SessionError> {
        self.logins.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = &self.login_failure {
            debug!("Simulated login of {} failing: {}", credentials.username, err);
            return Err(err.clone());
        }
        debug!("Simulated login of {} as {}", credentials.username, self.user);
        Ok(())
    }

    async fn connect(&self, events: EventSender) -> std::result::Result<(), SessionError> {
        if let Some(err) = &self.connect_failure {
            return Err(err.clone());
        }

        let mut closed = self.closed.subscribe();
        self.closed.send_replace(false);
        if let Ok(mut slot) = self.events.lock() {
            *slot = Some(events.clone());
        }

        let _ = events.send(AgentEvent::Login);
        if !self.connect_delay.is_zero() {
            tokio::time::sleep(self.connect_delay).await;
        }
        let _ = events.send(AgentEvent::Ready { user: self.user });
        info!("Simulated session of {} ready", self.user);

        // a dropped sender means the transport itself went away
        let _ = closed.wait_for(|closed| *closed).await;

        let _ = events.send(AgentEvent::Logout);
        let _ = events.send(AgentEvent::Closed);
        if let Ok(mut slot) = self.events.lock() {
            *slot = None;
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.send_replace(true);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    async fn fetch_user(&self, user: UserId) -> Result<Partner> {
        Ok(Partner {
            id: user,
            name: format!("user-{}", user.account_id()),
        })
    }

    async fn send_offer(&self, draft: &OfferDraft) -> Result<SentOffer> {
        self.ensure_open()?;

        let state = if self.require_confirmation {
            OfferState::ConfirmationNeeded
        } else {
            OfferState::Active
        };
        let now = Utc::now();
        let snapshot = TradeSnapshot {
            id: self.next_id(),
            partner: draft.partner,
            state,
            is_our_offer: true,
            message: draft.message.clone(),
            token: draft.token.clone(),
            items_to_send: draft.items_to_send.clone(),
            items_to_receive: draft.items_to_receive.clone(),
            created_at: now,
            updated_at: now,
            expires_at: Some(now + chrono::Duration::days(14)),
        };
        self.offers.insert(snapshot.id, snapshot.clone());
        self.emit(AgentEvent::TradeSent(snapshot.clone()));

        Ok(SentOffer {
            id: snapshot.id,
            state,
        })
    }

    async fn cancel_offer(&self, offer: OfferId) -> Result<()> {
        self.ensure_open()?;

        let snapshot = {
            let mut entry = self
                .offers
                .get_mut(&offer)
                .ok_or_else(|| PoolError::Transport(format!("unknown offer {}", offer)))?;
            if !entry.state.is_active() {
                return Err(PoolError::AlreadyResolved {
                    offer,
                    state: entry.state,
                });
            }
            entry.state = OfferState::Cancelled;
            entry.updated_at = Utc::now();
            entry.clone()
        };
        self.emit(AgentEvent::TradeCancelled(snapshot));
        Ok(())
    }

    async fn confirm_offer(&self, offer: OfferId) -> Result<()> {
        self.ensure_open()?;

        let mut entry = self
            .offers
            .get_mut(&offer)
            .ok_or_else(|| PoolError::Transport(format!("unknown offer {}", offer)))?;
        if !entry.state.is_active() {
            return Err(PoolError::AlreadyResolved {
                offer,
                state: entry.state,
            });
        }
        entry.state = OfferState::Confirmed;
        entry.updated_at = Utc::now();
        Ok(())
    }

    async fn accept_offer(&self, offer: OfferId) -> Result<()> {
        self.ensure_open()?;

        if let Some(mut entry) = self.offers.get_mut(&offer) {
            entry.state = OfferState::Accepted;
            entry.updated_at = Utc::now();
        }
        if let Ok(mut accepted) = self.accepted.lock() {
            accepted.push(offer);
        }
        Ok(())
    }

    async fn fetch_inventory(&self, user: UserId, game: &Game) -> Result<Vec<Asset>> {
        self.ensure_open()?;

        *self.inventory_fetches.entry(game.id).or_insert(0) += 1;
        let size = self.inventory_sizes.get(&game.id).map(|s| *s).unwrap_or(0);
        debug!("Simulated inventory of {} for {}: {} items", user, game, size);
        Ok(self.generate_assets(game, size))
    }

    async fn trade_url(&self, generate_new: bool) -> Result<String> {
        self.ensure_open()?;

        let token = match self.token.write() {
            Ok(mut token) => {
                if generate_new {
                    *token = random_token();
                }
                token.clone()
            }
            Err(_) => return Err(PoolError::Transport("token lock poisoned".into())),
        };
        Ok(TradeUrl::new(self.user, token).to_string())
    }

    async fn register_api_key(&self, domain: &str) -> Result<String> {
        self.ensure_open()?;
        Ok(format!("{}-{}", domain, random_token()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn user() -> UserId {
        UserId::from_account_id(42)
    }

    #[tokio::test]
    async fn test_session_emits_ready_and_closes() {
        let transport = std::sync::Arc::new(SimulatedTransport::new(user()));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let session = {
            let transport = transport.clone();
            tokio::spawn(async move { transport.connect(tx).await })
        };

        assert!(matches!(rx.recv().await, Some(AgentEvent::Login)));
        assert!(matches!(rx.recv().await, Some(AgentEvent::Ready { user: u }) if u == user()));
        assert!(!transport.is_closed());

        transport.close().await.unwrap();
        assert!(session.await.unwrap().is_ok());
        assert!(matches!(rx.recv().await, Some(AgentEvent::Logout)));
        assert!(matches!(rx.recv().await, Some(AgentEvent::Closed)));
    }

    #[tokio::test]
    async fn test_login_failure() {
        let transport = SimulatedTransport::new(user())
            .with_login_failure(SessionError::InvalidCredentials("nope".into()));
        let err = transport
            .login(&Credentials::new("bot", "pw"))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::InvalidCredentials(_)));
        assert_eq!(transport.logins(), 1);
    }

    #[tokio::test]
    async fn test_requests_need_open_session() {
        let transport = SimulatedTransport::new(user()).with_inventory(GameId(440), 3);
        let game = Game::new(440, "TF2");
        assert!(matches!(
            transport.fetch_inventory(user(), &game).await,
            Err(PoolError::NotReady(_))
        ));
    }

    #[tokio::test]
    async fn test_double_cancel_fails() {
        let transport = std::sync::Arc::new(SimulatedTransport::new(user()));
        let (tx, _rx) = mpsc::unbounded_channel();
        let t = transport.clone();
        tokio::spawn(async move { t.connect(tx).await });
        while transport.is_closed() {
            tokio::task::yield_now().await;
        }

        let sent = transport
            .send_offer(&OfferDraft {
                partner: UserId::from_account_id(7),
                token: Some("abc".into()),
                message: String::new(),
                items_to_send: Vec::new(),
                items_to_receive: Vec::new(),
            })
            .await
            .unwrap();
        assert_eq!(sent.state, OfferState::Active);

        transport.cancel_offer(sent.id).await.unwrap();
        assert!(matches!(
            transport.cancel_offer(sent.id).await,
            Err(PoolError::AlreadyResolved { state: OfferState::Cancelled, .. })
        ));
        assert_eq!(
            transport.offer(sent.id).map(|o| o.state),
            Some(OfferState::Cancelled)
        );
    }
}
