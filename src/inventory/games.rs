use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::{Arc, Mutex, Weak};
use tracing::debug;

use super::Item;
use crate::types::{AgentId, Asset, AssetKey, Game, GameId};

/// Inventory of one agent for one game, as last fetched
///
/// The snapshot is the only strong owner of its items; every index refers
/// to them weakly, so replacing a snapshot expires the previous items.
#[derive(Debug)]
pub struct InventorySnapshot {
    owner: AgentId,
    game: Game,
    items: Vec<Arc<Item>>,
    fetched_at: DateTime<Utc>,
}

impl InventorySnapshot {
    /// Tag every asset with its owner
    pub fn new(owner: AgentId, game: Game, assets: Vec<Asset>) -> Self {
        let items = assets
            .into_iter()
            .map(|asset| Arc::new(Item::new(asset, owner)))
            .collect();
        Self {
            owner,
            game,
            items,
            fetched_at: Utc::now(),
        }
    }

    pub fn owner(&self) -> AgentId {
        self.owner
    }

    pub fn game(&self) -> &Game {
        &self.game
    }

    pub fn items(&self) -> &[Arc<Item>] {
        &self.items
    }

    pub fn fetched_at(&self) -> DateTime<Utc> {
        self.fetched_at
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

}

/// Per-agent inventory cache
///
/// Holds the latest snapshot of every fetched game plus a flat index over all
/// of them keyed by `(game, asset id)`.
#[derive(Default)]
pub struct GamesInventory {
    games: DashMap<GameId, Arc<InventorySnapshot>>,
    index: DashMap<AssetKey, Weak<Item>>,
    replace_lock: Mutex<()>,
}

impl GamesInventory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a freshly fetched snapshot, replacing that game's entries
    pub fn replace(&self, snapshot: Arc<InventorySnapshot>) {
        let game = snapshot.game().id;
        let _guard = self.replace_lock.lock();

        self.index.retain(|key, _| key.game != game);
        for item in snapshot.items() {
            self.index.insert(item.key(), Arc::downgrade(item));
        }
        self.games.insert(game, Arc::clone(&snapshot));

        debug!(
            "Inventory of {} for {} now holds {} items",
            snapshot.owner(),
            snapshot.game(),
            snapshot.len()
        );
    }

    pub fn get(&self, key: &AssetKey) -> Option<Arc<Item>> {
        self.index.get(key).and_then(|item| item.upgrade())
    }

    /// Look up an item, falling back to `default` when absent
    pub fn get_or(&self, key: &AssetKey, default: Arc<Item>) -> Arc<Item> {
        self.get(key).unwrap_or(default)
    }

    pub fn contains(&self, key: &AssetKey) -> bool {
        self.get(key).is_some()
    }

    /// Latest snapshot of one game
    pub fn game(&self, game: GameId) -> Option<Arc<InventorySnapshot>> {
        self.games.get(&game).map(|s| Arc::clone(&s))
    }

    /// Every game fetched so far
    pub fn games(&self) -> Vec<Game> {
        self.games
            .iter()
            .map(|entry| entry.value().game().clone())
            .collect()
    }

    /// All cached items across games
    pub fn items(&self) -> Vec<Arc<Item>> {
        self.index
            .iter()
            .filter_map(|entry| entry.value().upgrade())
            .collect()
    }

    /// Number of indexed items
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn clear(&self) {
        let _guard = self.replace_lock.lock();
        self.index.clear();
        self.games.clear();
    }
}

impl std::fmt::Debug for GamesInventory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GamesInventory")
            .field("games", &self.games.len())
            .field("items", &self.index.len())
            .finish()
    }
}
