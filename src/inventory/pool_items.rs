use dashmap::DashMap;
use std::sync::{Arc, Mutex, Weak};
use tracing::debug;

use super::{InventorySnapshot, Item};
use crate::types::{AgentId, AssetKey};

/// Items of every agent in a pool
///
/// Filled from inventory updates only. Keys include the owning agent, so the
/// same asset key reported by two agents never overwrites one another.
#[derive(Default)]
pub struct PoolItems {
    items: DashMap<(AgentId, AssetKey), Weak<Item>>,
    replace_lock: Mutex<()>,
}

impl PoolItems {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the entries of the snapshot's agent and game
    pub fn replace(&self, snapshot: &InventorySnapshot) {
        let owner = snapshot.owner();
        let game = snapshot.game().id;
        let _guard = self.replace_lock.lock();

        self.items
            .retain(|(agent, key), _| !(*agent == owner && key.game == game));
        for item in snapshot.items() {
            self.items.insert((owner, item.key()), Arc::downgrade(item));
        }

        debug!(
            "Pool index holds {} items after update from {} for {}",
            self.items.len(),
            owner,
            snapshot.game()
        );
    }

    /// Forget every item of `agent`
    pub fn purge_agent(&self, agent: AgentId) -> usize {
        let _guard = self.replace_lock.lock();
        let before = self.items.len();
        self.items.retain(|(owner, _), _| *owner != agent);
        before.saturating_sub(self.items.len())
    }

    pub fn get(&self, agent: AgentId, key: &AssetKey) -> Option<Arc<Item>> {
        self.items
            .get(&(agent, *key))
            .and_then(|item| item.upgrade())
    }

    /// Every agent's item with this key
    pub fn find(&self, key: &AssetKey) -> Vec<Arc<Item>> {
        self.items
            .iter()
            .filter(|entry| entry.key().1 == *key)
            .filter_map(|entry| entry.value().upgrade())
            .collect()
    }

    pub fn items(&self) -> Vec<Arc<Item>> {
        self.items
            .iter()
            .filter_map(|entry| entry.value().upgrade())
            .collect()
    }

    pub fn items_of(&self, agent: AgentId) -> Vec<Arc<Item>> {
        self.items
            .iter()
            .filter(|entry| entry.key().0 == agent)
            .filter_map(|entry| entry.value().upgrade())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl std::fmt::Debug for PoolItems {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolItems")
            .field("items", &self.items.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Asset, AssetId, Game};

    fn snapshot(owner: u64, game: &Game, count: u64) -> InventorySnapshot {
        let assets = (1..=count)
            .map(|n| Asset {
                asset_id: AssetId(n),
                game: game.id,
                context_id: game.context_id,
                class_id: n,
                instance_id: 0,
                amount: 1,
                name: format!("item {}", n),
                tradable: true,
            })
            .collect();
        InventorySnapshot::new(AgentId(owner), game.clone(), assets)
    }

    #[test]
    fn test_same_asset_from_two_agents() {
        let tf2 = Game::new(440, "TF2");
        let pool = PoolItems::new();
        let a = snapshot(1, &tf2, 3);
        let b = snapshot(2, &tf2, 3);
        pool.replace(&a);
        pool.replace(&b);

        assert_eq!(pool.len(), 6);
        let key = AssetKey::new(tf2.id, AssetId(1));
        assert_eq!(pool.find(&key).len(), 2);
        assert_eq!(pool.get(AgentId(2), &key).map(|i| i.owner()), Some(AgentId(2)));
    }

    #[test]
    fn test_replace_and_purge() {
        let tf2 = Game::new(440, "TF2");
        let pool = PoolItems::new();
        let first = snapshot(1, &tf2, 4);
        pool.replace(&first);
        let other = snapshot(2, &tf2, 1);
        pool.replace(&other);

        let second = snapshot(1, &tf2, 2);
        pool.replace(&second);
        assert_eq!(pool.items_of(AgentId(1)).len(), 2);
        assert_eq!(pool.len(), 3);

        assert_eq!(pool.purge_agent(AgentId(1)), 2);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_dropped_snapshot_expires_items() {
        let tf2 = Game::new(440, "TF2");
        let pool = PoolItems::new();
        {
            let snap = snapshot(1, &tf2, 2);
            pool.replace(&snap);
            assert_eq!(pool.items().len(), 2);
        }
        assert!(pool.items().is_empty());
    }
}
