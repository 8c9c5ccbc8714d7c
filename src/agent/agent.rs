use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::handlers;
use super::state::{AgentState, ErrorRecord};
use crate::constraint::{ConstraintGuard, ConstraintIndex, ConstraintSet};
use crate::dispatch::{AgentEvent, EventHandler, EventKind, HandlerTable};
use crate::error::{PoolError, Result};
use crate::inventory::{GamesInventory, InventorySnapshot};
use crate::offer::{AgentOfferLedger, TradeOffer};
use crate::pool::{Pool, PoolInner};
use crate::settings::{AgentSettings, RestartPolicy};
use crate::transport::{AgentTransport, EventReceiver, EventSender};
use crate::types::{AgentId, Asset, Credentials, Game, OfferId, Partner, TradeUrl, UserId};

/// Constraint dimension shared by all agents
pub const AGENT_DIMENSION: &str = "agent";

/// Default readiness timeout of [`Agent::start`]
pub const DEFAULT_START_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Default)]
struct SessionTasks {
    session: Option<JoinHandle<()>>,
    pump: Option<JoinHandle<()>>,
    restarter: Option<JoinHandle<()>>,
}

pub struct AgentInner {
    username: String,
    credentials: Credentials,
    transport: Arc<dyn AgentTransport>,
    settings: AgentSettings,
    id: OnceLock<AgentId>,
    state: watch::Sender<AgentState>,
    errors: Mutex<Vec<ErrorRecord>>,
    pool: RwLock<Weak<PoolInner>>,
    inventory: GamesInventory,
    offers: AgentOfferLedger,
    trade_token: RwLock<Option<String>>,
    handlers: Arc<HandlerTable<Agent>>,
    tasks: Mutex<SessionTasks>,
    /// Set by `stop`; ends the restart loop
    closed: AtomicBool,
    restart_generation: AtomicU64,
    session_generation: AtomicU64,
    _constraint: ConstraintGuard,
}

/// One session with the trading service
///
/// `Agent` is a cheap handle; clones share the same session, caches and
/// handlers. Usernames are unique among live agents of a [`ConstraintIndex`].
#[derive(Clone)]
pub struct Agent {
    inner: Arc<AgentInner>,
}

/// Builder for [`Agent`]
pub struct AgentBuilder {
    credentials: Credentials,
    transport: Arc<dyn AgentTransport>,
    id: Option<AgentId>,
    settings: AgentSettings,
}

impl AgentBuilder {
    /// Known identity; otherwise it is learned on the first ready event
    pub fn id(mut self, id: impl Into<AgentId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn settings(mut self, settings: AgentSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Create the agent, claiming its username in `constraints`
    pub fn build(self, constraints: &ConstraintIndex) -> Result<Agent> {
        let username = self.credentials.username.clone();
        let guard = constraints.register(
            AGENT_DIMENSION,
            &ConstraintSet::new().field("username", &username),
        )?;

        let id = OnceLock::new();
        if let Some(agent_id) = self.id {
            let _ = id.set(agent_id);
        }
        let (state, _) = watch::channel(AgentState::Stopped);

        let handlers = Arc::new(HandlerTable::new(format!("agent {}", username)));
        handlers::install(&handlers);

        debug!("Created agent {}", username);
        Ok(Agent {
            inner: Arc::new(AgentInner {
                username,
                credentials: self.credentials,
                transport: self.transport,
                settings: self.settings,
                id,
                state,
                errors: Mutex::new(Vec::new()),
                pool: RwLock::new(Weak::new()),
                inventory: GamesInventory::new(),
                offers: AgentOfferLedger::new(),
                trade_token: RwLock::new(None),
                handlers,
                tasks: Mutex::new(SessionTasks::default()),
                closed: AtomicBool::new(false),
                restart_generation: AtomicU64::new(0),
                session_generation: AtomicU64::new(0),
                _constraint: guard,
            }),
        })
    }
}

impl Agent {
    pub fn builder(credentials: Credentials, transport: Arc<dyn AgentTransport>) -> AgentBuilder {
        AgentBuilder {
            credentials,
            transport,
            id: None,
            settings: AgentSettings::default(),
        }
    }

    pub fn new(
        credentials: Credentials,
        transport: Arc<dyn AgentTransport>,
        constraints: &ConstraintIndex,
    ) -> Result<Self> {
        Self::builder(credentials, transport).build(constraints)
    }

    pub(crate) fn from_inner(inner: Arc<AgentInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn downgrade(&self) -> Weak<AgentInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn is_same_inner(&self, other: &Weak<AgentInner>) -> bool {
        std::ptr::eq(Arc::as_ptr(&self.inner), other.as_ptr())
    }

    /// Whether both handles refer to the same agent
    pub fn ptr_eq(&self, other: &Agent) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    // --- identity & state ---

    pub fn id(&self) -> Option<AgentId> {
        self.inner.id.get().copied()
    }

    pub(crate) fn require_id(&self) -> Result<AgentId> {
        self.id()
            .ok_or_else(|| PoolError::MissingIdentity(self.inner.username.clone()))
    }

    /// Assign the identity once; later calls are ignored
    pub(crate) fn set_id(&self, id: AgentId) -> bool {
        self.inner.id.set(id).is_ok()
    }

    pub fn username(&self) -> &str {
        &self.inner.username
    }

    pub fn settings(&self) -> &AgentSettings {
        &self.inner.settings
    }

    pub fn state(&self) -> AgentState {
        *self.inner.state.borrow()
    }

    pub fn is_ready(&self) -> bool {
        self.state().is_active()
    }

    /// Watch lifecycle transitions
    pub fn subscribe_state(&self) -> watch::Receiver<AgentState> {
        self.inner.state.subscribe()
    }

    pub(crate) fn set_state(&self, state: AgentState) {
        let previous = self.inner.state.send_replace(state);
        if previous != state {
            debug!("Agent {} state {} -> {}", self.username(), previous, state);
        }
    }

    /// Set the state reported by session `generation`, unless it was replaced
    fn set_session_state(&self, generation: u64, state: AgentState) -> bool {
        let mut previous = None;
        self.inner.state.send_if_modified(|current| {
            if !self.is_session_current(generation) || *current == state {
                return false;
            }
            previous = Some(std::mem::replace(current, state));
            true
        });
        if let Some(previous) = previous {
            debug!("Agent {} state {} -> {}", self.username(), previous, state);
        }
        previous.is_some()
    }

    /// Handle `Ready` from session `generation`; false when it is stale
    fn mark_ready(&self, generation: u64, user: UserId) -> bool {
        if !self.is_session_current(generation) {
            return false;
        }
        if self.set_id(user.into()) {
            debug!("Agent {} learned its id {}", self.username(), user);
        } else if self.id() != Some(user.into()) {
            warn!(
                "Agent {} is logged in as {}, keeping its configured id",
                self, user
            );
        }

        let mut current = true;
        self.inner.state.send_if_modified(|state| {
            current = self.is_session_current(generation);
            if !current || *state != AgentState::Waiting {
                return false;
            }
            *state = AgentState::Active;
            true
        });
        current
    }

    fn is_session_current(&self, generation: u64) -> bool {
        self.inner.session_generation.load(Ordering::SeqCst) == generation
    }

    pub fn errors(&self) -> Vec<ErrorRecord> {
        self.inner
            .errors
            .lock()
            .map(|errors| errors.clone())
            .unwrap_or_default()
    }

    pub(crate) fn record_error(&self, event: Option<EventKind>, error: PoolError) -> Arc<PoolError> {
        let error = Arc::new(error);
        self.record_shared_error(event, Arc::clone(&error));
        error
    }

    pub(crate) fn record_shared_error(&self, event: Option<EventKind>, error: Arc<PoolError>) {
        match self.inner.errors.lock() {
            Ok(mut errors) => errors.push(ErrorRecord::new(event, error)),
            Err(_) => warn!(
                "Error log of agent {} is poisoned, dropping: {}",
                self.username(),
                error
            ),
        }
    }

    pub fn transport(&self) -> Arc<dyn AgentTransport> {
        Arc::clone(&self.inner.transport)
    }

    pub fn inventory(&self) -> &GamesInventory {
        &self.inner.inventory
    }

    /// Sent offers awaiting resolution
    pub fn offers(&self) -> &AgentOfferLedger {
        &self.inner.offers
    }

    // --- pool binding ---

    /// The pool this agent is bound to
    pub fn pool(&self) -> Option<Pool> {
        self.inner
            .pool
            .read()
            .ok()
            .and_then(|pool| pool.upgrade())
            .map(Pool::from_inner)
    }

    pub fn is_bound(&self) -> bool {
        self.pool().is_some()
    }

    pub(crate) fn bind(&self, pool: Weak<PoolInner>) {
        match self.inner.pool.write() {
            Ok(mut slot) => *slot = pool,
            Err(_) => warn!("Pool binding of agent {} is poisoned", self.username()),
        }
    }

    pub(crate) fn unbind(&self) {
        self.bind(Weak::new());
    }

    // --- effective settings: agent override, then pool default ---

    pub fn restart_policy(&self) -> Option<RestartPolicy> {
        self.inner
            .settings
            .restart_policy
            .clone()
            .or_else(|| self.pool().and_then(|p| p.settings().restart_policy.clone()))
    }

    pub fn offer_cancel_delay(&self) -> Option<Duration> {
        self.inner
            .settings
            .offer_cancel_delay
            .or_else(|| self.pool().and_then(|p| p.settings().offer_cancel_delay))
    }

    pub fn is_whitelisted(&self, partner: UserId) -> bool {
        match &self.inner.settings.whitelist {
            Some(whitelist) => whitelist.contains(&partner),
            None => self
                .pool()
                .map(|p| p.settings().whitelist.contains(&partner))
                .unwrap_or(false),
        }
    }

    pub fn registration_domain(&self) -> String {
        self.inner
            .settings
            .registration_domain
            .clone()
            .or_else(|| self.pool().map(|p| p.settings().registration_domain.clone()))
            .unwrap_or_else(|| "localhost".to_string())
    }

    pub fn prefetch_games(&self) -> Vec<Game> {
        self.inner
            .settings
            .prefetch_games
            .clone()
            .or_else(|| self.pool().map(|p| p.settings().prefetch_games.clone()))
            .unwrap_or_default()
    }

    fn start_timeout(&self) -> Duration {
        self.pool()
            .map(|p| p.settings().start_timeout)
            .unwrap_or(DEFAULT_START_TIMEOUT)
    }

    // --- event handling ---

    /// Register a handler for events of `kind` delivered to this agent
    pub fn on<H>(&self, kind: EventKind, handler: H)
    where
        H: EventHandler<Agent> + 'static,
    {
        self.inner.handlers.on(kind, handler);
    }

    /// Schedule local handlers, then hand the event to the bound pool
    pub(crate) fn dispatch(&self, event: AgentEvent) {
        if !event.kind().is_pool_only() {
            self.inner.handlers.dispatch(self.clone(), event.clone());
        }
        self.forward_to_pool(event);
    }

    pub(crate) fn forward_to_pool(&self, event: AgentEvent) {
        if let Some(pool) = self.pool() {
            pool.dispatch_from(self, event);
        }
    }

    // --- lifecycle ---

    /// Start the session and wait up to a minute for it to become ready
    pub async fn start(&self) -> Result<()> {
        self.start_with_timeout(DEFAULT_START_TIMEOUT).await
    }

    /// Start the session and wait up to `timeout` for it to become ready
    ///
    /// A timeout leaves the session running in the background. Starting an
    /// agent whose session is already running only waits for readiness.
    pub async fn start_with_timeout(&self, timeout: Duration) -> Result<()> {
        self.inner.closed.store(false, Ordering::SeqCst);

        if self.has_live_session() {
            return self.wait_until_ready(timeout).await;
        }

        info!("Starting agent {}", self.username());
        self.launch_session(false)?;

        let result = self.wait_until_ready(timeout).await;
        match &result {
            Ok(()) => {
                info!("Agent {} started", self.username());
                self.ensure_restarter();
            }
            Err(e) => warn!("Agent {} failed to start: {}", self.username(), e),
        }
        result
    }

    /// Wait until the state leaves `Waiting`
    ///
    /// Succeeds when the agent is active; any other settled state fails with
    /// [`PoolError::SessionFailed`].
    pub async fn wait_until_ready(&self, timeout: Duration) -> Result<()> {
        let mut state = self.inner.state.subscribe();
        let settled = tokio::time::timeout(
            timeout,
            state.wait_for(|s| *s != AgentState::Waiting),
        )
        .await
        .map(|r| r.map(|s| *s));

        match settled {
            Err(_) => Err(PoolError::ReadyTimeout {
                agent: self.username().to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }),
            Ok(Err(_)) => Err(PoolError::NotReady(self.username().to_string())),
            Ok(Ok(AgentState::Active)) => Ok(()),
            Ok(Ok(state)) => Err(PoolError::SessionFailed {
                agent: self.username().to_string(),
                state,
            }),
        }
    }

    /// Stop serving: end the restart loop and close the session
    ///
    /// Idempotent. Close failures are recorded; the agent always ends up
    /// `Stopped`.
    pub async fn stop(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.restart_generation.fetch_add(1, Ordering::SeqCst);
        let restarter = self
            .inner
            .tasks
            .lock()
            .ok()
            .and_then(|mut tasks| tasks.restarter.take());
        if let Some(restarter) = restarter {
            restarter.abort();
        }

        self.stop_session().await;
    }

    /// Close and start the session again; the restart loop is left alone
    pub async fn restart(&self) -> Result<()> {
        self.restart_session(false).await
    }

    /// A scheduled restart gives up once `stop` has been called
    async fn restart_session(&self, scheduled: bool) -> Result<()> {
        info!("Restarting agent {}", self.username());
        self.stop_session().await;
        self.launch_session(scheduled)?;
        self.wait_until_ready(self.start_timeout()).await
    }

    /// Whether `stop` has been called since the last start
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    fn has_live_session(&self) -> bool {
        self.inner
            .tasks
            .lock()
            .map(|tasks| {
                tasks
                    .session
                    .as_ref()
                    .map(|h| !h.is_finished())
                    .unwrap_or(false)
            })
            .unwrap_or(false)
    }

    /// Spawn a new session and its event pump
    ///
    /// With `unless_closed` the launch is refused after `stop`. The check runs
    /// under the task lock, so a concurrent `stop` either sees the new session
    /// or keeps it from starting.
    fn launch_session(&self, unless_closed: bool) -> Result<()> {
        let mut tasks = self
            .inner
            .tasks
            .lock()
            .map_err(|_| PoolError::NotReady(self.username().to_string()))?;
        if unless_closed && self.is_closed() {
            return Err(PoolError::NotReady(self.username().to_string()));
        }

        let generation = self.inner.session_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (events, receiver) = mpsc::unbounded_channel();
        self.set_state(AgentState::Waiting);

        let pump = tokio::spawn(pump_events(self.downgrade(), receiver, generation));
        let session = tokio::spawn(run_session(
            self.downgrade(),
            self.transport(),
            self.inner.credentials.clone(),
            events,
            generation,
        ));

        for previous in [tasks.session.replace(session), tasks.pump.replace(pump)]
            .into_iter()
            .flatten()
        {
            previous.abort();
        }
        Ok(())
    }

    async fn stop_session(&self) {
        self.inner.session_generation.fetch_add(1, Ordering::SeqCst);
        let (session, pump) = match self.inner.tasks.lock() {
            Ok(mut tasks) => (tasks.session.take(), tasks.pump.take()),
            Err(_) => {
                warn!("Session tasks of agent {} are poisoned", self.username());
                (None, None)
            }
        };

        // events still queued belong to the torn-down session
        if let Some(pump) = pump {
            pump.abort();
        }
        let had_session = session.is_some();
        if let Some(session) = session {
            session.abort();
        }

        let transport = self.transport();
        if had_session || !transport.is_closed() {
            if let Err(e) = transport.close().await {
                warn!("Agent {} failed to close its session: {}", self.username(), e);
                self.record_error(None, e);
            }
        }

        self.set_state(AgentState::Stopped);
        info!("Agent {} stopped", self.username());
    }

    fn ensure_restarter(&self) {
        let Some(policy) = self.restart_policy() else {
            return;
        };
        let Ok(mut tasks) = self.inner.tasks.lock() else {
            return;
        };
        if tasks
            .restarter
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
        {
            return;
        }

        let generation = self.inner.restart_generation.load(Ordering::SeqCst);
        debug!("Agent {} restarts with {:?}", self.username(), policy);
        tasks.restarter = Some(tokio::spawn(restart_loop(
            self.downgrade(),
            policy,
            generation,
        )));
    }

    // --- remote calls ---

    fn ensure_ready(&self) -> Result<()> {
        if !self.is_ready() {
            return Err(PoolError::NotReady(self.username().to_string()));
        }
        Ok(())
    }

    pub async fn fetch_user(&self, user: UserId) -> Result<Partner> {
        self.transport().fetch_user(user).await
    }

    /// Trade url of this agent, known once the session has been ready
    pub fn trade_url(&self) -> Option<TradeUrl> {
        let token = self.inner.trade_token.read().ok().and_then(|t| t.clone())?;
        Some(TradeUrl::new(self.id()?.into(), token))
    }

    pub(crate) fn set_trade_token(&self, token: String) {
        match self.inner.trade_token.write() {
            Ok(mut slot) => *slot = Some(token),
            Err(_) => warn!("Trade token of agent {} is poisoned", self.username()),
        }
    }

    pub(crate) fn has_trade_token(&self) -> bool {
        self.inner
            .trade_token
            .read()
            .map(|t| t.is_some())
            .unwrap_or(false)
    }

    /// Invalidate the current trade url and return the new one
    pub async fn generate_trade_url(&self) -> Result<TradeUrl> {
        self.ensure_ready()?;
        let raw = self.transport().trade_url(true).await?;
        let url = TradeUrl::parse(&raw)?;
        self.set_trade_token(url.token.clone());
        info!("Agent {} generated a new trade url", self.username());
        Ok(url)
    }

    /// Register a web api key for the effective registration domain
    pub async fn register_api_key(&self) -> Result<String> {
        self.ensure_ready()?;
        let domain = self.registration_domain();
        let key = self.transport().register_api_key(&domain).await?;
        info!("Agent {} registered an api key for {}", self.username(), domain);
        Ok(key)
    }

    pub async fn accept_offer(&self, offer: OfferId) -> Result<()> {
        self.ensure_ready()?;
        self.transport().accept_offer(offer).await?;
        info!("Agent {} accepted offer {}", self.username(), offer);
        Ok(())
    }

    // --- offers ---

    /// Create an unsent offer to `partner`
    pub fn create_offer(
        &self,
        partner: Partner,
        token: Option<String>,
        message: impl Into<String>,
        items_to_send: Vec<Asset>,
        items_to_receive: Vec<Asset>,
    ) -> Result<Arc<TradeOffer>> {
        self.ensure_ready()?;
        let owner = self.require_id()?;
        Ok(TradeOffer::new(
            self,
            owner,
            partner,
            token,
            message.into(),
            items_to_send,
            items_to_receive,
        ))
    }

    /// Create an unsent offer addressed by a trade url
    pub async fn create_offer_from_trade_url(
        &self,
        trade_url: &str,
        message: impl Into<String>,
        items_to_send: Vec<Asset>,
        items_to_receive: Vec<Asset>,
    ) -> Result<Arc<TradeOffer>> {
        self.ensure_ready()?;
        let url = TradeUrl::parse(trade_url)?;
        let partner = self.fetch_user(url.partner).await?;
        self.create_offer(
            partner,
            Some(url.token),
            message,
            items_to_send,
            items_to_receive,
        )
    }

    /// Transmit an offer created by this agent
    pub async fn send_offer(&self, offer: &Arc<TradeOffer>) -> Result<OfferId> {
        self.ensure_ready()?;
        if !offer.is_owned_by(self) {
            return Err(PoolError::ForeignOffer {
                owner: offer.owner_id().to_string(),
                agent: self.username().to_string(),
            });
        }

        let _op = offer.lock_op().await;
        if let Some(id) = offer.id() {
            return Err(PoolError::AlreadySent(id));
        }

        let sent = self.transport().send_offer(&offer.draft()).await?;
        offer.mark_sent(sent);
        self.inner.offers.add(offer)?;
        info!(
            "Agent {} sent offer {} to {}",
            self.username(),
            sent.id,
            offer.partner().id
        );

        let delay = offer.cancel_delay().or_else(|| self.offer_cancel_delay());
        if let Some(delay) = delay {
            offer.arm_timer(delay);
        }

        self.forward_to_pool(AgentEvent::OfferSent(Arc::clone(offer)));
        Ok(sent.id)
    }

    // --- inventory ---

    /// Fetch and cache the inventory of one game
    pub async fn fetch_inventory(&self, game: &Game) -> Result<Arc<InventorySnapshot>> {
        let owner = self.require_id()?;
        let assets = self.transport().fetch_inventory(owner.into(), game).await?;

        let snapshot = Arc::new(InventorySnapshot::new(owner, game.clone(), assets));
        self.inner.inventory.replace(Arc::clone(&snapshot));
        self.forward_to_pool(AgentEvent::InventoryUpdated(Arc::clone(&snapshot)));
        Ok(snapshot)
    }

    /// Fetch every game fetched before again
    ///
    /// Every game is attempted; the first failure is returned.
    pub async fn refresh_inventories(&self) -> Result<()> {
        let mut first_error = None;
        for game in self.inner.inventory.games() {
            if let Err(e) = self.fetch_inventory(&game).await {
                warn!(
                    "Agent {} failed to refresh inventory of {}: {}",
                    self.username(),
                    game,
                    e
                );
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("id", &self.id())
            .field("username", &self.inner.username)
            .field("state", &self.state())
            .finish()
    }
}

impl std::fmt::Display for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.id() {
            Some(id) => write!(f, "{} ({})", self.inner.username, id),
            None => write!(f, "{}", self.inner.username),
        }
    }
}

impl Drop for AgentInner {
    fn drop(&mut self) {
        let tasks = match self.tasks.get_mut() {
            Ok(tasks) => std::mem::take(tasks),
            Err(poisoned) => std::mem::take(poisoned.into_inner()),
        };

        let open = tasks
            .session
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false);
        for handle in [tasks.session, tasks.pump, tasks.restarter]
            .into_iter()
            .flatten()
        {
            handle.abort();
        }

        if open {
            error!(
                "Agent {} dropped with an open session, call stop() before dropping it",
                self.username
            );
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                let transport = Arc::clone(&self.transport);
                let username = self.username.clone();
                runtime.spawn(async move {
                    if let Err(e) = transport.close().await {
                        warn!("Closing leaked session of {} failed: {}", username, e);
                    }
                });
            }
        }
    }
}

/// Drive one session: login, then stay connected until it ends
async fn run_session(
    agent: Weak<AgentInner>,
    transport: Arc<dyn AgentTransport>,
    credentials: Credentials,
    events: EventSender,
    generation: u64,
) {
    let outcome = match transport.login(&credentials).await {
        Ok(()) => transport.connect(events).await,
        Err(e) => Err(e),
    };

    let Some(inner) = agent.upgrade() else {
        return;
    };
    let agent = Agent::from_inner(inner);
    if !agent.is_session_current(generation) {
        return;
    }

    match outcome {
        Ok(()) => {
            info!("Session of agent {} closed", agent.username());
            agent.set_session_state(generation, AgentState::Stopped);
        }
        Err(e) => {
            let error = PoolError::from(e);
            let state = if error.is_auth_failure() {
                AgentState::InvalidCredentials
            } else {
                AgentState::UnknownError
            };
            error!("Session of agent {} failed: {}", agent.username(), error);
            agent.record_error(None, error);
            agent.set_session_state(generation, state);
        }
    }
}

/// Feed events of session `generation` into dispatch
///
/// Ends when the session drops its sender or is replaced.
async fn pump_events(agent: Weak<AgentInner>, mut events: EventReceiver, generation: u64) {
    while let Some(event) = events.recv().await {
        let Some(inner) = agent.upgrade() else {
            break;
        };
        let agent = Agent::from_inner(inner);
        let current = match &event {
            AgentEvent::Ready { user } => agent.mark_ready(generation, *user),
            _ => agent.is_session_current(generation),
        };
        if !current {
            debug!("Dropping {} from a replaced session of {}", event.kind(), agent.username());
            break;
        }
        agent.dispatch(event);
    }
}

async fn restart_loop(agent: Weak<AgentInner>, policy: RestartPolicy, generation: u64) {
    loop {
        let delay = policy.next_delay();
        tokio::time::sleep(delay).await;

        let Some(inner) = agent.upgrade() else {
            break;
        };
        let agent = Agent::from_inner(inner);
        if agent.is_closed() || agent.inner.restart_generation.load(Ordering::SeqCst) != generation
        {
            break;
        }

        if let Err(e) = agent.restart_session(true).await {
            if agent.is_closed() {
                break;
            }
            warn!("Scheduled restart of agent {} failed: {}", agent.username(), e);
            agent.record_error(None, e);
        }
    }
}
