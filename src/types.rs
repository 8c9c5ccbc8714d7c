//! Identity and asset types shared by agents, offers and inventories

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use url::Url;

use crate::error::{PoolError, Result};

/// Offset between a 32-bit account id and the full 64-bit individual identity
pub const INDIVIDUAL_ID_BASE: u64 = 76_561_197_960_265_728;

/// Base of trade urls handed out by agents
pub const TRADE_URL_BASE: &str = "https://steamcommunity.com/tradeoffer/new/";

/// Full 64-bit identity of a user on the trading service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub u64);

impl UserId {
    /// Convert a 32-bit account id (as found in trade urls) to the full identity
    pub fn from_account_id(account_id: u32) -> Self {
        Self(INDIVIDUAL_ID_BASE + account_id as u64)
    }

    /// The 32-bit account id part of this identity
    pub fn account_id(&self) -> u32 {
        (self.0.wrapping_sub(INDIVIDUAL_ID_BASE) & 0xFFFF_FFFF) as u32
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of an agent (the user id of the session it drives)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(pub u64);

impl From<UserId> for AgentId {
    fn from(user: UserId) -> Self {
        Self(user.0)
    }
}

impl From<AgentId> for UserId {
    fn from(agent: AgentId) -> Self {
        Self(agent.0)
    }
}

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OfferId(pub u64);

impl std::fmt::Display for OfferId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// App id of a game whose items can be traded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GameId(pub u32);

impl std::fmt::Display for GameId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AssetId(pub u64);

impl std::fmt::Display for AssetId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A game inventory context
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Game {
    pub id: GameId,
    #[serde(default = "default_context_id")]
    pub context_id: u64,
    #[serde(default)]
    pub name: String,
}

fn default_context_id() -> u64 {
    2
}

impl Game {
    pub fn new(id: u32, name: impl Into<String>) -> Self {
        Self {
            id: GameId(id),
            context_id: default_context_id(),
            name: name.into(),
        }
    }

    pub fn with_context(mut self, context_id: u64) -> Self {
        self.context_id = context_id;
        self
    }
}

impl std::fmt::Display for Game {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.name.is_empty() {
            write!(f, "{}", self.id)
        } else {
            write!(f, "{} ({})", self.name, self.id)
        }
    }
}

/// Asset ids are only unique within a game, so items are keyed by both
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AssetKey {
    pub game: GameId,
    pub asset_id: AssetId,
}

impl AssetKey {
    pub fn new(game: GameId, asset_id: AssetId) -> Self {
        Self { game, asset_id }
    }
}

impl std::fmt::Display for AssetKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.game, self.asset_id)
    }
}

/// One asset as reported by the trading service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Asset {
    pub asset_id: AssetId,
    pub game: GameId,
    pub context_id: u64,
    pub class_id: u64,
    pub instance_id: u64,
    pub amount: u32,
    pub name: String,
    pub tradable: bool,
}

impl Asset {
    pub fn key(&self) -> AssetKey {
        AssetKey::new(self.game, self.asset_id)
    }
}

/// A user the agents can trade with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partner {
    pub id: UserId,
    pub name: String,
}

/// Login material for one agent; passed through to the transport untouched
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    pub shared_secret: Option<String>,
    pub identity_secret: Option<String>,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            shared_secret: None,
            identity_secret: None,
        }
    }

    pub fn with_secrets(
        mut self,
        shared_secret: impl Into<String>,
        identity_secret: impl Into<String>,
    ) -> Self {
        self.shared_secret = Some(shared_secret.into());
        self.identity_secret = Some(identity_secret.into());
        self
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("shared_secret", &self.shared_secret.as_ref().map(|_| "<redacted>"))
            .field("identity_secret", &self.identity_secret.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// A parsed trade url: who to send to and the access token to use
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TradeUrl {
    pub partner: UserId,
    pub token: String,
}

impl TradeUrl {
    pub fn new(partner: UserId, token: impl Into<String>) -> Self {
        Self {
            partner,
            token: token.into(),
        }
    }

    /// Parse a trade url; `partner` (32-bit account id) and `token` are required
    pub fn parse(raw: &str) -> Result<Self> {
        let url = Url::parse(raw.trim())
            .map_err(|e| PoolError::InvalidTradeUrl(format!("{}: {}", raw, e)))?;

        let mut partner = None;
        let mut token = None;
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "partner" => partner = Some(value.into_owned()),
                "token" => token = Some(value.into_owned()),
                _ => {}
            }
        }

        let partner = partner
            .ok_or_else(|| PoolError::InvalidTradeUrl(format!("{}: missing partner", raw)))?;
        let account_id = partner.parse::<u32>().map_err(|e| {
            PoolError::InvalidTradeUrl(format!("{}: bad partner '{}': {}", raw, partner, e))
        })?;
        let token = token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| PoolError::InvalidTradeUrl(format!("{}: missing token", raw)))?;

        Ok(Self {
            partner: UserId::from_account_id(account_id),
            token,
        })
    }
}

impl FromStr for TradeUrl {
    type Err = PoolError;

    fn from_str(raw: &str) -> Result<Self> {
        Self::parse(raw)
    }
}

impl std::fmt::Display for TradeUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}?partner={}&token={}",
            TRADE_URL_BASE,
            self.partner.account_id(),
            self.token
        )
    }
}
