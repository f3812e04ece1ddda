//! # Inventory
//!
//! Pre-allocated stacking slots per player, plus the item catalog.
//!
//! Mutations here are not atomic on their own: `add` may fill some stacks
//! before discovering the inventory is full. Callers go through the
//! transaction layer, which restores the [`Rollback`] checkpoint on failure.

use std::collections::HashMap;
use std::path::Path;

use crosslink_core::Rollback;
use serde::Deserialize;

use crate::error::{GameError, GameResult};
use crate::events::{ItemId, PlayerId};

/// Maximum inventory slots per player.
pub const MAX_INVENTORY_SLOTS: usize = 64;

#[allow(clippy::cast_possible_truncation)]
const SLOT_CAPACITY: u32 = MAX_INVENTORY_SLOTS as u32;

// ============================================================================
// Catalog
// ============================================================================

/// An item definition.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct Item {
    /// Unique identifier (never 0).
    pub id: ItemId,
    /// Display name.
    pub name: String,
    /// Maximum stack size.
    pub max_stack: u32,
    /// Price of one unit in gold.
    pub base_price: u64,
    /// Whether the item can be traded between players.
    #[serde(default = "default_tradeable")]
    pub tradeable: bool,
}

fn default_tradeable() -> bool {
    true
}

#[derive(Deserialize)]
struct CatalogFile {
    items: Vec<Item>,
}

/// All known items, loaded once at startup.
#[derive(Clone, Debug, Default)]
pub struct ItemCatalog {
    items: HashMap<ItemId, Item>,
}

impl ItemCatalog {
    /// Parses a catalog:
    ///
    /// ```toml
    /// [[items]]
    /// id = 1
    /// name = "Iron Ore"
    /// max_stack = 64
    /// base_price = 5
    /// ```
    ///
    /// # Errors
    ///
    /// `InvalidCatalog` on malformed TOML, id 0, zero stack size or duplicates.
    pub fn from_toml_str(source: &str) -> GameResult<Self> {
        let file: CatalogFile =
            toml::from_str(source).map_err(|e| GameError::InvalidCatalog(e.to_string()))?;

        let mut items = HashMap::with_capacity(file.items.len());
        for item in file.items {
            if item.id == 0 {
                return Err(GameError::InvalidCatalog(format!("{}: id 0 is reserved", item.name)));
            }
            if item.max_stack == 0 {
                return Err(GameError::InvalidCatalog(format!("{}: max_stack is 0", item.name)));
            }
            if let Some(previous) = items.insert(item.id, item) {
                return Err(GameError::InvalidCatalog(format!("duplicate item id {}", previous.id)));
            }
        }
        Ok(Self { items })
    }

    /// Loads a catalog file.
    ///
    /// # Errors
    ///
    /// `InvalidCatalog` if the file cannot be read or parsed.
    pub fn load(path: impl AsRef<Path>) -> GameResult<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)
            .map_err(|e| GameError::InvalidCatalog(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&source)
    }

    /// Looks up an item.
    ///
    /// # Errors
    ///
    /// `ItemNotFound` if the id is unknown.
    pub fn get(&self, item_id: ItemId) -> GameResult<&Item> {
        self.items.get(&item_id).ok_or(GameError::ItemNotFound(item_id))
    }

    /// Number of items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the catalog is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

// ============================================================================
// Slots
// ============================================================================

/// A stack of items in an inventory slot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ItemStack {
    /// The item type ID, or 0 for empty slot.
    pub item_id: ItemId,
    /// Number of items in this stack.
    pub count: u32,
}

impl ItemStack {
    /// Creates an empty item stack.
    #[inline]
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            item_id: 0,
            count: 0,
        }
    }

    /// Creates a new item stack.
    #[inline]
    #[must_use]
    pub const fn new(item_id: ItemId, count: u32) -> Self {
        Self { item_id, count }
    }

    /// Returns true if this slot is empty.
    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.count == 0 || self.item_id == 0
    }
}

/// One player's slots.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Inventory {
    slots: [ItemStack; MAX_INVENTORY_SLOTS],
    used_slots: u32,
}

impl Inventory {
    /// Creates an empty inventory.
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: [ItemStack::empty(); MAX_INVENTORY_SLOTS],
            used_slots: 0,
        }
    }

    /// Slots in use.
    #[inline]
    #[must_use]
    pub const fn used_slots(&self) -> u32 {
        self.used_slots
    }

    /// Total items of one type across all stacks.
    #[must_use]
    pub fn count_item(&self, item_id: ItemId) -> u32 {
        self.slots
            .iter()
            .filter(|s| s.item_id == item_id)
            .map(|s| s.count)
            .sum()
    }

    /// Adds items, topping up existing stacks before opening new ones.
    ///
    /// # Errors
    ///
    /// `InventoryFull` if not everything fits. Stacks filled before the
    /// failure stay filled.
    pub fn add(&mut self, item_id: ItemId, count: u32, max_stack: u32) -> GameResult<()> {
        let mut remaining = count;

        for slot in &mut self.slots {
            if remaining == 0 {
                break;
            }
            if slot.item_id == item_id && slot.count < max_stack {
                let can_add = (max_stack - slot.count).min(remaining);
                slot.count += can_add;
                remaining -= can_add;
            }
        }

        while remaining > 0 {
            let Some(slot_idx) = self.slots.iter().position(ItemStack::is_empty) else {
                return Err(GameError::InventoryFull {
                    capacity: SLOT_CAPACITY,
                    amount: remaining,
                });
            };
            let add_count = remaining.min(max_stack);
            self.slots[slot_idx] = ItemStack::new(item_id, add_count);
            self.used_slots += 1;
            remaining -= add_count;
        }

        Ok(())
    }

    /// Removes items.
    ///
    /// # Errors
    ///
    /// `InsufficientItems` if the player holds fewer than `count`; nothing
    /// is removed in that case.
    pub fn remove(&mut self, item_id: ItemId, count: u32) -> GameResult<()> {
        let available = self.count_item(item_id);
        if available < count {
            return Err(GameError::InsufficientItems {
                item_id,
                required: count,
                available,
            });
        }

        let mut remaining = count;
        for slot in &mut self.slots {
            if remaining == 0 {
                break;
            }
            if slot.item_id == item_id {
                let remove_count = slot.count.min(remaining);
                slot.count -= remove_count;
                remaining -= remove_count;
                if slot.count == 0 {
                    *slot = ItemStack::empty();
                    self.used_slots = self.used_slots.saturating_sub(1);
                }
            }
        }

        Ok(())
    }
}

impl Default for Inventory {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// All players
// ============================================================================

/// Every player's inventory; the unit the transaction layer guards.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Inventories {
    players: HashMap<PlayerId, Inventory>,
}

impl Inventories {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A player's inventory, if they own anything yet.
    #[must_use]
    pub fn get(&self, player: PlayerId) -> Option<&Inventory> {
        self.players.get(&player)
    }

    /// Items of one type held by `player`.
    #[must_use]
    pub fn count(&self, player: PlayerId, item_id: ItemId) -> u32 {
        self.players.get(&player).map_or(0, |inv| inv.count_item(item_id))
    }

    /// Gives `count` of `item` to `player`. Returns the new total.
    ///
    /// # Errors
    ///
    /// `InventoryFull`, with partial fills left in place.
    pub fn give(&mut self, player: PlayerId, item: &Item, count: u32) -> GameResult<u32> {
        let inventory = self.players.entry(player).or_default();
        inventory.add(item.id, count, item.max_stack)?;
        Ok(inventory.count_item(item.id))
    }

    /// Takes `count` of `item_id` from `player`. Returns the new total.
    ///
    /// # Errors
    ///
    /// `InsufficientItems`.
    pub fn take(&mut self, player: PlayerId, item_id: ItemId, count: u32) -> GameResult<u32> {
        let Some(inventory) = self.players.get_mut(&player) else {
            return Err(GameError::InsufficientItems {
                item_id,
                required: count,
                available: 0,
            });
        };
        inventory.remove(item_id, count)?;
        Ok(inventory.count_item(item_id))
    }
}

impl Rollback for Inventories {
    type Snapshot = HashMap<PlayerId, Inventory>;

    fn snapshot(&self) -> Self::Snapshot {
        self.players.clone()
    }

    fn restore(&mut self, snapshot: Self::Snapshot) {
        self.players = snapshot;
    }
}
