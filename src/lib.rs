pub mod agent;
pub mod config;
pub mod constraint;
pub mod dispatch;
pub mod error;
pub mod inventory;
pub mod logging;
pub mod offer;
pub mod pool;
pub mod settings;
pub mod transport;
pub mod types;

pub use agent::{Agent, AgentBuilder, AgentState, ErrorRecord};
pub use config::AppConfig;
pub use constraint::{ConstraintGuard, ConstraintIndex, ConstraintSet};
pub use dispatch::{AgentEvent, EventHandler, EventKind, HandlerTable};
pub use error::{PoolError, Result, SessionError};
pub use inventory::{GamesInventory, InventorySnapshot, Item, PoolItems};
pub use offer::{AgentOfferLedger, OfferLedger, OfferState, PoolOfferLedger, TradeOffer};
pub use pool::{Pool, PoolEventContext, StartupReport};
pub use settings::{AgentSettings, PoolSettings, RestartPolicy};
pub use transport::{AgentTransport, OfferDraft, SentOffer, SimulatedTransport, TradeSnapshot};
pub use types::{
    AgentId, Asset, AssetId, AssetKey, Credentials, Game, GameId, OfferId, Partner, TradeUrl,
    UserId,
};
