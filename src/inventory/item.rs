use crate::types::{AgentId, Asset, AssetId, AssetKey, GameId};

/// An asset held by one of the pool's agents
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    asset: Asset,
    owner: AgentId,
}

impl Item {
    pub fn new(asset: Asset, owner: AgentId) -> Self {
        Self { asset, owner }
    }

    pub fn key(&self) -> AssetKey {
        self.asset.key()
    }

    pub fn owner(&self) -> AgentId {
        self.owner
    }

    pub fn asset(&self) -> &Asset {
        &self.asset
    }

    pub fn asset_id(&self) -> AssetId {
        self.asset.asset_id
    }

    pub fn game(&self) -> GameId {
        self.asset.game
    }

    pub fn name(&self) -> &str {
        &self.asset.name
    }

    pub fn is_tradable(&self) -> bool {
        self.asset.tradable
    }
}

impl std::fmt::Display for Item {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} [{}] of {}", self.asset.name, self.key(), self.owner)
    }
}
