//! Boundary to the remote trading service
//!
//! An [`AgentTransport`] is one session's view of the service: login, the
//! long-running connection that emits [`AgentEvent`]s, and the request/response
//! calls agents make for users, offers, inventories and trade urls.

mod sim;

pub use sim::SimulatedTransport;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::dispatch::AgentEvent;
use crate::error::{Result, SessionError};
use crate::offer::OfferState;
use crate::types::{Asset, Credentials, Game, OfferId, Partner, UserId};

/// Channel a connected session pushes its events into
pub type EventSender = mpsc::UnboundedSender<AgentEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<AgentEvent>;

/// A trade offer as the service reports it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TradeSnapshot {
    pub id: OfferId,
    pub partner: UserId,
    pub state: OfferState,
    /// Whether the offer was sent by the session's own user
    pub is_our_offer: bool,
    pub message: String,
    pub token: Option<String>,
    pub items_to_send: Vec<Asset>,
    pub items_to_receive: Vec<Asset>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl TradeSnapshot {
    /// Distinct games touched by either side of the trade
    pub fn games(&self) -> Vec<Game> {
        let mut games: Vec<Game> = Vec::new();
        for asset in self.items_to_receive.iter().chain(self.items_to_send.iter()) {
            if !games
                .iter()
                .any(|g| g.id == asset.game && g.context_id == asset.context_id)
            {
                games.push(Game {
                    id: asset.game,
                    context_id: asset.context_id,
                    name: String::new(),
                });
            }
        }
        games
    }
}

/// Everything the service needs to transmit a new offer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OfferDraft {
    pub partner: UserId,
    pub token: Option<String>,
    pub message: String,
    pub items_to_send: Vec<Asset>,
    pub items_to_receive: Vec<Asset>,
}

/// Result of a successful transmission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SentOffer {
    pub id: OfferId,
    pub state: OfferState,
}

/// One session with the trading service
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AgentTransport: Send + Sync {
    async fn login(&self, credentials: &Credentials) -> std::result::Result<(), SessionError>;

    /// Run the session until it closes, pushing every event into `events`
    ///
    /// Returns `Ok(())` when the session is closed cleanly (locally or by the
    /// service) and an error when it could not be established.
    async fn connect(&self, events: EventSender) -> std::result::Result<(), SessionError>;

    async fn close(&self) -> Result<()>;

    fn is_closed(&self) -> bool;

    async fn fetch_user(&self, user: UserId) -> Result<Partner>;

    async fn send_offer(&self, draft: &OfferDraft) -> Result<SentOffer>;

    /// Fails with `AlreadyResolved` when the service already closed the offer
    async fn cancel_offer(&self, offer: OfferId) -> Result<()>;

    /// Same contract as [`AgentTransport::cancel_offer`]
    async fn confirm_offer(&self, offer: OfferId) -> Result<()>;

    async fn accept_offer(&self, offer: OfferId) -> Result<()>;

    async fn fetch_inventory(&self, user: UserId, game: &Game) -> Result<Vec<Asset>>;

    /// The session user's trade url, optionally invalidating the current token
    async fn trade_url(&self, generate_new: bool) -> Result<String>;

    /// Register a web api key for `domain`
    async fn register_api_key(&self, domain: &str) -> Result<String>;
}
