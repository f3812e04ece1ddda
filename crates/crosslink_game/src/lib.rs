//! # CROSSLINK Game Subsystems
//!
//! Inventory, economy, quest and world subsystems that never reference each
//! other. They meet only through `crosslink_core`:
//!
//! - capabilities resolved from the registry ([`capabilities`])
//! - events and requests on the bus ([`events`])
//! - guarded resources for every mutation
//!
//! ## Design Principles
//!
//! 1. **Integer gold** - balances and prices are `u64`
//! 2. **Transactional trades** - payment and item move settle together or not at all
//! 3. **Replay safe** - keyed trades, loot and quest rewards apply once
//! 4. **External configuration** - items and quests load from TOML
//!
//! ## Example
//!
//! ```rust,ignore
//! use crosslink_game::{GameContext, GameWorld, ItemCatalog};
//!
//! let ctx = GameContext::builder().build()?;
//! let world = GameWorld::install(&ctx, ItemCatalog::load("data/items.toml")?, quests);
//!
//! let economy = ctx.registry().resolve::<dyn EconomyCapability>()?;
//! economy.trade(seller, buyer, IRON_ORE, 4, "market-17")?;
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]
#![allow(clippy::module_name_repetitions)]

use std::sync::Arc;

use crosslink_core::IntegrationContext;

pub mod capabilities;
pub mod error;
pub mod events;
pub mod inventory;
pub mod ledger;
pub mod quest;
pub mod services;
pub mod world;

pub use capabilities::{
    EconomyCapability, InventoryCapability, QuestCapability, TradeReceipt, WorldCapability,
};
pub use error::{GameError, GameResult};
pub use events::{EventKind, GameEvent, GameRequest, GameResponse, ItemId, PlayerId, QuestId};
pub use inventory::{Inventories, Inventory, Item, ItemCatalog, ItemStack};
pub use ledger::Ledger;
pub use quest::{load_quests, quests_from_toml_str, Quest, QuestTracker};
pub use services::{EconomyService, InventoryService, TradeBook};
pub use world::{AdvanceHours, WorldClock, WorldTime};

/// Integration context specialised to game events and responses.
pub type GameContext = IntegrationContext<GameEvent, GameResponse>;

/// Every subsystem, installed into one context.
///
/// The registry also holds every subsystem, so they keep answering events
/// until unregistered even if this handle is dropped.
pub struct GameWorld {
    /// Item ownership.
    pub inventory: Arc<InventoryService>,
    /// Gold and trades.
    pub economy: Arc<EconomyService>,
    /// Quest progress.
    pub quests: Arc<QuestTracker>,
    /// Shared clock.
    pub clock: Arc<WorldClock>,
}

impl GameWorld {
    /// Installs and registers every subsystem.
    #[must_use]
    pub fn install(ctx: &GameContext, catalog: ItemCatalog, quests: Vec<Quest>) -> Self {
        let catalog = Arc::new(catalog);
        Self {
            inventory: InventoryService::install(ctx, Arc::clone(&catalog)),
            economy: EconomyService::install(ctx, catalog),
            quests: QuestTracker::install(ctx, quests),
            clock: WorldClock::install(ctx),
        }
    }
}
