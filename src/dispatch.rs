//! Event fan-out
//!
//! Agents and pools each own a [`HandlerTable`] mapping an [`EventKind`] to the
//! handlers registered for it. Dispatching an event spawns every matching
//! handler as its own task. A handler that fails (or panics) never affects its
//! siblings: the failure is re-dispatched as an [`AgentEvent::Error`] on the
//! same table, where the owner's error handler records it.

use async_trait::async_trait;
use dashmap::DashMap;
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::error::{PoolError, Result};
use crate::inventory::InventorySnapshot;
use crate::offer::TradeOffer;
use crate::transport::TradeSnapshot;
use crate::types::UserId;

/// Every event an agent or pool can handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Ready,
    Closed,
    Login,
    Logout,
    TradeReceived,
    TradeSent,
    TradeAccepted,
    TradeDeclined,
    TradeCancelled,
    TradeExpired,
    TradeCountered,
    InventoryUpdated,
    OfferSent,
    OfferClosed,
    Error,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Ready => "ready",
            EventKind::Closed => "closed",
            EventKind::Login => "login",
            EventKind::Logout => "logout",
            EventKind::TradeReceived => "trade_receive",
            EventKind::TradeSent => "trade_send",
            EventKind::TradeAccepted => "trade_accept",
            EventKind::TradeDeclined => "trade_decline",
            EventKind::TradeCancelled => "trade_cancel",
            EventKind::TradeExpired => "trade_expire",
            EventKind::TradeCountered => "trade_counter",
            EventKind::InventoryUpdated => "inventory_update",
            EventKind::OfferSent => "offer_send",
            EventKind::OfferClosed => "offer_close",
            EventKind::Error => "error",
        }
    }

    /// Name of the handler slot, `on_<event>`
    pub fn handler_name(&self) -> String {
        format!("on_{}", self.as_str())
    }

    /// Events raised by the agent itself and delivered to its pool only
    pub fn is_pool_only(&self) -> bool {
        matches!(
            self,
            EventKind::InventoryUpdated | EventKind::OfferSent | EventKind::OfferClosed
        )
    }

    /// Events that move a sent offer into a terminal state
    pub fn is_resolution(&self) -> bool {
        matches!(
            self,
            EventKind::TradeAccepted
                | EventKind::TradeDeclined
                | EventKind::TradeCancelled
                | EventKind::TradeExpired
                | EventKind::TradeCountered
        )
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An event with its payload
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// Session is ready; carries the identity the session is logged in as
    Ready { user: UserId },
    Closed,
    Login,
    Logout,
    TradeReceived(TradeSnapshot),
    TradeSent(TradeSnapshot),
    TradeAccepted(TradeSnapshot),
    TradeDeclined(TradeSnapshot),
    TradeCancelled(TradeSnapshot),
    TradeExpired(TradeSnapshot),
    TradeCountered(TradeSnapshot),
    InventoryUpdated(Arc<InventorySnapshot>),
    OfferSent(Arc<TradeOffer>),
    OfferClosed(Arc<TradeOffer>),
    /// A handler for `event` failed
    Error {
        event: EventKind,
        error: Arc<PoolError>,
    },
}

impl AgentEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            AgentEvent::Ready { .. } => EventKind::Ready,
            AgentEvent::Closed => EventKind::Closed,
            AgentEvent::Login => EventKind::Login,
            AgentEvent::Logout => EventKind::Logout,
            AgentEvent::TradeReceived(_) => EventKind::TradeReceived,
            AgentEvent::TradeSent(_) => EventKind::TradeSent,
            AgentEvent::TradeAccepted(_) => EventKind::TradeAccepted,
            AgentEvent::TradeDeclined(_) => EventKind::TradeDeclined,
            AgentEvent::TradeCancelled(_) => EventKind::TradeCancelled,
            AgentEvent::TradeExpired(_) => EventKind::TradeExpired,
            AgentEvent::TradeCountered(_) => EventKind::TradeCountered,
            AgentEvent::InventoryUpdated(_) => EventKind::InventoryUpdated,
            AgentEvent::OfferSent(_) => EventKind::OfferSent,
            AgentEvent::OfferClosed(_) => EventKind::OfferClosed,
            AgentEvent::Error { .. } => EventKind::Error,
        }
    }

    /// The transport-level trade carried by trade events
    pub fn trade(&self) -> Option<&TradeSnapshot> {
        match self {
            AgentEvent::TradeReceived(t)
            | AgentEvent::TradeSent(t)
            | AgentEvent::TradeAccepted(t)
            | AgentEvent::TradeDeclined(t)
            | AgentEvent::TradeCancelled(t)
            | AgentEvent::TradeExpired(t)
            | AgentEvent::TradeCountered(t) => Some(t),
            _ => None,
        }
    }
}

/// A handler for one event kind, receiving the dispatch context `C`
///
/// Closures `Fn(C, AgentEvent) -> impl Future<Output = Result<()>>` implement
/// this trait.
#[async_trait]
pub trait EventHandler<C>: Send + Sync {
    async fn handle(&self, ctx: C, event: AgentEvent) -> Result<()>;
}

#[async_trait]
impl<C, F, Fut> EventHandler<C> for F
where
    C: Send + 'static,
    F: Fn(C, AgentEvent) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn handle(&self, ctx: C, event: AgentEvent) -> Result<()> {
        (self)(ctx, event).await
    }
}

/// Handlers keyed by event kind
pub struct HandlerTable<C> {
    owner: String,
    handlers: DashMap<EventKind, Vec<Arc<dyn EventHandler<C>>>>,
}

impl<C> HandlerTable<C>
where
    C: Clone + Send + Sync + 'static,
{
    /// `owner` only labels log lines
    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            handlers: DashMap::new(),
        }
    }

    /// Register a handler for `kind`; handlers run in registration order of scheduling
    pub fn on<H>(&self, kind: EventKind, handler: H)
    where
        H: EventHandler<C> + 'static,
    {
        self.handlers
            .entry(kind)
            .or_default()
            .push(Arc::new(handler));
    }

    pub fn has_handler(&self, kind: EventKind) -> bool {
        self.handlers
            .get(&kind)
            .map(|h| !h.is_empty())
            .unwrap_or(false)
    }

    pub fn handler_count(&self, kind: EventKind) -> usize {
        self.handlers.get(&kind).map(|h| h.len()).unwrap_or(0)
    }

    fn handlers_for(&self, kind: EventKind) -> Vec<Arc<dyn EventHandler<C>>> {
        self.handlers
            .get(&kind)
            .map(|h| h.clone())
            .unwrap_or_default()
    }

    /// Schedule every handler registered for the event's kind
    ///
    /// Returns immediately with one join handle per scheduled handler. A kind
    /// without handlers is a no-op.
    pub fn dispatch(self: &Arc<Self>, ctx: C, event: AgentEvent) -> Vec<JoinHandle<()>> {
        let kind = event.kind();
        let handlers = self.handlers_for(kind);
        if handlers.is_empty() {
            return Vec::new();
        }

        debug!(
            "{} dispatching {} to {} handler(s)",
            self.owner,
            kind.handler_name(),
            handlers.len()
        );

        handlers
            .into_iter()
            .map(|handler| {
                let table = Arc::clone(self);
                let ctx = ctx.clone();
                let event = event.clone();
                tokio::spawn(async move {
                    let outcome = AssertUnwindSafe(handler.handle(ctx.clone(), event))
                        .catch_unwind()
                        .await;

                    let error = match outcome {
                        Ok(Ok(())) => return,
                        Ok(Err(e)) => e,
                        Err(panic) => PoolError::HandlerPanicked {
                            event: kind.to_string(),
                            message: panic_message(panic.as_ref()),
                        },
                    };

                    table.report_failure(ctx, kind, error).await;
                })
            })
            .collect()
    }

    async fn report_failure(self: &Arc<Self>, ctx: C, kind: EventKind, error: PoolError) {
        if kind == EventKind::Error || !self.has_handler(EventKind::Error) {
            error!(
                "{} ignoring failure in {}: {}",
                self.owner,
                kind.handler_name(),
                error
            );
            return;
        }

        let event = AgentEvent::Error {
            event: kind,
            error: Arc::new(error),
        };
        for handle in self.dispatch(ctx, event) {
            let _ = handle.await;
        }
    }
}

impl<C> std::fmt::Debug for HandlerTable<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerTable")
            .field("owner", &self.owner)
            .field("kinds", &self.handlers.len())
            .finish()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
