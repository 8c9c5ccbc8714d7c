//! Item caches: per-agent game inventories and the pool-wide item index

mod games;
mod item;
mod pool_items;

pub use games::{GamesInventory, InventorySnapshot};
pub use item::Item;
pub use pool_items::PoolItems;
