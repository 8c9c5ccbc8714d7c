use dashmap::DashMap;
use futures::future::join_all;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn};

use super::handlers;
use crate::agent::{Agent, ErrorRecord};
use crate::dispatch::{AgentEvent, EventHandler, EventKind, HandlerTable};
use crate::error::{PoolError, Result};
use crate::inventory::{Item, PoolItems};
use crate::offer::{PoolOfferLedger, TradeOffer};
use crate::settings::PoolSettings;
use crate::types::{AgentId, Asset, OfferId, Partner, TradeUrl};

/// Context handed to pool handlers: the pool and the agent the event came from
#[derive(Clone)]
pub struct PoolEventContext {
    pub pool: Pool,
    pub agent: Agent,
}

impl PoolEventContext {
    /// Whether the originating agent is still bound to this pool
    pub fn is_current(&self) -> bool {
        self.pool.is_bound(&self.agent)
    }
}

pub struct PoolInner {
    settings: PoolSettings,
    agents: DashMap<AgentId, Agent>,
    offers: PoolOfferLedger,
    items: PoolItems,
    errors: Mutex<Vec<ErrorRecord>>,
    handlers: Arc<HandlerTable<PoolEventContext>>,
}

/// Outcome of [`Pool::startup`]
#[derive(Debug, Clone, Default)]
pub struct StartupReport {
    pub ready: Vec<AgentId>,
    pub failed: Vec<(AgentId, String)>,
}

impl StartupReport {
    pub fn all_ready(&self) -> bool {
        self.failed.is_empty()
    }
}

/// A registry of agents with shared defaults, offers and items
///
/// The pool owns its agents; an agent refers back to at most one pool.
/// `Pool` is a cheap handle, clones share the same registry.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl Default for Pool {
    fn default() -> Self {
        Self::new(PoolSettings::default())
    }
}

impl Pool {
    pub fn new(settings: PoolSettings) -> Self {
        let handlers = Arc::new(HandlerTable::new("pool"));
        handlers::install(&handlers);

        Self {
            inner: Arc::new(PoolInner {
                settings,
                agents: DashMap::new(),
                offers: PoolOfferLedger::new(),
                items: PoolItems::new(),
                errors: Mutex::new(Vec::new()),
                handlers,
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<PoolInner>) -> Self {
        Self { inner }
    }

    pub fn ptr_eq(&self, other: &Pool) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.inner.settings
    }

    // --- registry ---

    /// Bind an agent; fails if it already belongs to a pool
    pub fn add(&self, agent: &Agent) -> Result<()> {
        self.add_with(agent, true)
    }

    /// Bind an agent; with `strict == false` an agent bound elsewhere is moved
    pub fn add_with(&self, agent: &Agent, strict: bool) -> Result<()> {
        let id = agent.require_id()?;

        if let Some(current) = agent.pool() {
            if strict {
                return Err(PoolError::AlreadyBound(id));
            }
            if !current.ptr_eq(self) {
                warn!("Agent {} is bound to another pool, moving it", agent);
                if let Err(e) = current.remove(agent) {
                    warn!("Could not detach agent {} from its pool: {}", agent, e);
                }
            }
        }

        match self.inner.agents.entry(id) {
            dashmap::mapref::entry::Entry::Occupied(entry) => {
                if !entry.get().ptr_eq(agent) {
                    return Err(PoolError::AlreadyBound(id));
                }
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(agent.clone());
            }
        }
        agent.bind(Arc::downgrade(&self.inner));

        info!("Agent {} added to pool ({} agents)", agent, self.len());
        Ok(())
    }

    /// Unbind an agent
    pub fn remove(&self, agent: &Agent) -> Result<()> {
        let id = agent.require_id()?;
        match self.inner.agents.get(&id) {
            Some(bound) if bound.ptr_eq(agent) => {}
            Some(_) => return Err(PoolError::NotBound(agent.username().to_string())),
            None => return Err(PoolError::AgentNotFound(id)),
        }
        self.pop(id).map(|_| ())
    }

    /// Unbind and return the agent with this id
    pub fn pop(&self, id: AgentId) -> Result<Agent> {
        let (_, agent) = self
            .inner
            .agents
            .remove(&id)
            .ok_or(PoolError::AgentNotFound(id))?;

        if agent.pool().map(|p| p.ptr_eq(self)).unwrap_or(false) {
            agent.unbind();
        }
        let items = self.inner.items.purge_agent(id);
        let offers = self.inner.offers.purge_owner(id);

        info!(
            "Agent {} removed from pool (dropped {} items, {} offers)",
            agent, items, offers
        );
        Ok(agent)
    }

    pub fn get(&self, id: AgentId) -> Option<Agent> {
        self.inner.agents.get(&id).map(|agent| agent.clone())
    }

    pub fn contains(&self, id: AgentId) -> bool {
        self.inner.agents.contains_key(&id)
    }

    /// Whether this exact agent is bound here
    pub fn is_bound(&self, agent: &Agent) -> bool {
        agent
            .id()
            .and_then(|id| self.inner.agents.get(&id).map(|bound| bound.ptr_eq(agent)))
            .unwrap_or(false)
    }

    /// Snapshot of the bound agents
    pub fn agents(&self) -> Vec<Agent> {
        self.inner
            .agents
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn ids(&self) -> Vec<AgentId> {
        self.inner.agents.iter().map(|entry| *entry.key()).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.agents.is_empty()
    }

    // --- lifecycle ---

    /// Start every agent concurrently with the configured timeout
    pub async fn startup(&self) -> StartupReport {
        self.startup_with_timeout(self.inner.settings.start_timeout)
            .await
    }

    /// Start every agent concurrently; failures never affect other agents
    pub async fn startup_with_timeout(&self, timeout: Duration) -> StartupReport {
        let agents = self.agents();
        info!("Starting {} agents", agents.len());

        let outcomes = join_all(agents.into_iter().map(|agent| async move {
            let result = agent.start_with_timeout(timeout).await;
            (agent, result)
        }))
        .await;

        let mut report = StartupReport::default();
        for (agent, result) in outcomes {
            let Some(id) = agent.id() else {
                continue;
            };
            match result {
                Ok(()) => report.ready.push(id),
                Err(e) => {
                    report.failed.push((id, e.to_string()));
                    self.record_error(None, Arc::new(e));
                }
            }
        }

        info!(
            "Pool startup finished: {} ready, {} failed",
            report.ready.len(),
            report.failed.len()
        );
        report
    }

    /// Stop every agent concurrently
    pub async fn shutdown(&self) {
        let agents = self.agents();
        info!("Stopping {} agents", agents.len());
        join_all(agents.iter().map(|agent| agent.stop())).await;
        info!("Pool shutdown complete");
    }

    // --- events ---

    /// Register a handler for events coming from any bound agent
    pub fn on<H>(&self, kind: EventKind, handler: H)
    where
        H: EventHandler<PoolEventContext> + 'static,
    {
        self.inner.handlers.on(kind, handler);
    }

    pub(crate) fn dispatch_from(&self, agent: &Agent, event: AgentEvent) {
        let ctx = PoolEventContext {
            pool: self.clone(),
            agent: agent.clone(),
        };
        self.inner.handlers.dispatch(ctx, event);
    }

    pub fn errors(&self) -> Vec<ErrorRecord> {
        self.inner
            .errors
            .lock()
            .map(|errors| errors.clone())
            .unwrap_or_default()
    }

    pub(crate) fn record_error(&self, event: Option<EventKind>, error: Arc<PoolError>) {
        match self.inner.errors.lock() {
            Ok(mut errors) => errors.push(ErrorRecord::new(event, error)),
            Err(_) => warn!("Pool error log is poisoned, dropping: {}", error),
        }
    }

    // --- aggregates ---

    /// Sent offers of every bound agent
    pub fn offers(&self) -> &PoolOfferLedger {
        &self.inner.offers
    }

    pub fn get_offer(&self, id: OfferId) -> Option<Arc<TradeOffer>> {
        self.inner.offers.get(id)
    }

    /// Items of every bound agent, from their latest inventory updates
    pub fn items(&self) -> &PoolItems {
        &self.inner.items
    }

    // --- offer creation ---

    fn owner_of(&self, items: &[Arc<Item>]) -> Result<Agent> {
        let first = items.first().ok_or(PoolError::NoItemsToSend)?;
        let owner = first.owner();
        if let Some(other) = items.iter().find(|item| item.owner() != owner) {
            return Err(PoolError::MixedOwners(format!("{}, {}", owner, other.owner())));
        }
        self.get(owner)
            .ok_or_else(|| PoolError::NotBound(owner.to_string()))
    }

    fn owners_of(&self, items: &[Arc<Item>]) -> Result<Vec<(Agent, Vec<Asset>)>> {
        let mut groups: Vec<(AgentId, Vec<Asset>)> = Vec::new();
        for item in items {
            match groups.iter_mut().find(|(owner, _)| *owner == item.owner()) {
                Some((_, assets)) => assets.push(item.asset().clone()),
                None => groups.push((item.owner(), vec![item.asset().clone()])),
            }
        }
        if groups.is_empty() {
            return Err(PoolError::NoItemsToSend);
        }

        groups
            .into_iter()
            .map(|(owner, assets)| {
                self.get(owner)
                    .map(|agent| (agent, assets))
                    .ok_or_else(|| PoolError::NotBound(owner.to_string()))
            })
            .collect()
    }

    /// Create one offer; every item to send must belong to the same agent
    pub fn create_offer(
        &self,
        partner: Partner,
        token: Option<String>,
        message: impl Into<String>,
        items_to_send: &[Arc<Item>],
        items_to_receive: Vec<Asset>,
    ) -> Result<Arc<TradeOffer>> {
        let owner = self.owner_of(items_to_send)?;
        let send = items_to_send.iter().map(|i| i.asset().clone()).collect();
        owner.create_offer(partner, token, message, send, items_to_receive)
    }

    /// Create one offer per agent owning some of the items to send
    ///
    /// Items to receive go into the first offer only, as does the message
    /// unless `message_in_all` is set.
    pub fn create_offers(
        &self,
        partner: Partner,
        token: Option<String>,
        message: impl Into<String>,
        items_to_send: &[Arc<Item>],
        items_to_receive: Vec<Asset>,
        message_in_all: bool,
    ) -> Result<Vec<Arc<TradeOffer>>> {
        let message = message.into();
        let groups = self.owners_of(items_to_send)?;

        let mut receive = Some(items_to_receive);
        let mut offers = Vec::with_capacity(groups.len());
        for (index, (agent, send)) in groups.into_iter().enumerate() {
            let text = if index == 0 || message_in_all {
                message.clone()
            } else {
                String::new()
            };
            let offer = agent.create_offer(
                partner.clone(),
                token.clone(),
                text,
                send,
                receive.take().unwrap_or_default(),
            )?;
            offers.push(offer);
        }
        Ok(offers)
    }

    /// Like [`create_offer`](Self::create_offer), addressed by trade url
    pub async fn create_offer_from_url(
        &self,
        trade_url: &str,
        message: impl Into<String>,
        items_to_send: &[Arc<Item>],
        items_to_receive: Vec<Asset>,
    ) -> Result<Arc<TradeOffer>> {
        let owner = self.owner_of(items_to_send)?;
        let url = TradeUrl::parse(trade_url)?;
        let partner = owner.fetch_user(url.partner).await?;
        self.create_offer(
            partner,
            Some(url.token),
            message,
            items_to_send,
            items_to_receive,
        )
    }

    /// Like [`create_offers`](Self::create_offers), addressed by trade url
    pub async fn create_offers_from_url(
        &self,
        trade_url: &str,
        message: impl Into<String>,
        items_to_send: &[Arc<Item>],
        items_to_receive: Vec<Asset>,
        message_in_all: bool,
    ) -> Result<Vec<Arc<TradeOffer>>> {
        let url = TradeUrl::parse(trade_url)?;
        let groups = self.owners_of(items_to_send)?;
        let (first, _) = groups.first().ok_or(PoolError::NoItemsToSend)?;
        let partner = first.fetch_user(url.partner).await?;
        self.create_offers(
            partner,
            Some(url.token),
            message,
            items_to_send,
            items_to_receive,
            message_in_all,
        )
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("agents", &self.len())
            .field("offers", &self.inner.offers)
            .field("items", &self.inner.items)
            .finish()
    }
}
