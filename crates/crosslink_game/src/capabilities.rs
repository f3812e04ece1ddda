//! # Capabilities
//!
//! The abstract roles subsystems look each other up by. A subsystem only
//! ever sees these traits, resolved from the registry at call time; it never
//! holds the concrete type of another subsystem.

use std::any::type_name;
use std::sync::{Arc, Weak};

use crosslink_core::{CapabilityRegistry, IntegrationError};

use crate::error::GameResult;
use crate::events::{ItemId, PlayerId, QuestId};
use crate::world::WorldTime;

/// Resolves `C` through a registry the caller does not keep alive.
///
/// Providers hold the registry weakly; they are themselves owned by it.
pub(crate) fn resolve<C>(registry: &Weak<CapabilityRegistry>) -> GameResult<Arc<C>>
where
    C: ?Sized + Send + Sync + 'static,
{
    let registry = registry
        .upgrade()
        .ok_or(IntegrationError::CapabilityNotRegistered {
            capability: type_name::<C>(),
        })?;
    Ok(registry.resolve::<C>()?)
}

/// Item ownership.
pub trait InventoryCapability: Send + Sync {
    /// Items of one type held by `player`.
    fn count(&self, player: PlayerId, item_id: ItemId) -> u32;

    /// Gives items. Returns the new total.
    ///
    /// # Errors
    ///
    /// Unknown item, full inventory or a rolled back transaction.
    fn give(
        &self,
        player: PlayerId,
        item_id: ItemId,
        count: u32,
        key: Option<&str>,
    ) -> GameResult<u32>;

    /// Takes items. Returns the new total.
    ///
    /// # Errors
    ///
    /// Not enough items or a rolled back transaction.
    fn take(
        &self,
        player: PlayerId,
        item_id: ItemId,
        count: u32,
        key: Option<&str>,
    ) -> GameResult<u32>;

    /// Moves items between players as one transaction.
    ///
    /// # Errors
    ///
    /// Not enough items at `from`, no room at `to`; nothing moves.
    fn transfer(
        &self,
        from: PlayerId,
        to: PlayerId,
        item_id: ItemId,
        count: u32,
        key: Option<&str>,
    ) -> GameResult<()>;
}

/// Completed trade.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TradeReceipt {
    /// Seller.
    pub seller: PlayerId,
    /// Buyer.
    pub buyer: PlayerId,
    /// Item traded.
    pub item_id: ItemId,
    /// Quantity.
    pub count: u32,
    /// Gold paid.
    pub price: u64,
}

/// Gold and trading.
pub trait EconomyCapability: Send + Sync {
    /// Gold held by `player`.
    fn balance(&self, player: PlayerId) -> u64;

    /// Price of `count` units of an item.
    ///
    /// # Errors
    ///
    /// Unknown item or overflow.
    fn quote(&self, item_id: ItemId, count: u32) -> GameResult<u64>;

    /// Creates gold for `player` (rewards, starting funds).
    ///
    /// # Errors
    ///
    /// Overflow or a rolled back transaction.
    fn grant(&self, player: PlayerId, amount: u64, key: Option<&str>) -> GameResult<u64>;

    /// Sells items from `seller` to `buyer` at the catalog price.
    ///
    /// Repeating a trade with the same `key` returns the first receipt and
    /// moves nothing.
    ///
    /// # Errors
    ///
    /// Untradeable item, insufficient funds or items; nothing changes.
    fn trade(
        &self,
        seller: PlayerId,
        buyer: PlayerId,
        item_id: ItemId,
        count: u32,
        key: &str,
    ) -> GameResult<TradeReceipt>;
}

/// Quest progress.
pub trait QuestCapability: Send + Sync {
    /// Progress of `player` on `quest_id`, if the quest exists.
    fn progress(&self, player: PlayerId, quest_id: QuestId) -> Option<u32>;

    /// Whether `player` has completed `quest_id`.
    fn is_completed(&self, player: PlayerId, quest_id: QuestId) -> bool;
}

/// The world clock.
pub trait WorldCapability: Send + Sync {
    /// Current world time.
    fn now(&self) -> WorldTime;
}
