//! # Game Error Types
//!
//! Domain errors of the game subsystems. Framework errors pass through
//! unchanged as [`GameError::Integration`].

use crosslink_core::IntegrationError;
use thiserror::Error;

use crate::events::{ItemId, PlayerId};

/// Errors that can occur in the game subsystems.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GameError {
    /// Not enough items to remove.
    #[error("insufficient items: need {required} of item {item_id}, have {available}")]
    InsufficientItems {
        /// The item that was missing.
        item_id: ItemId,
        /// The amount required.
        required: u32,
        /// The amount available.
        available: u32,
    },

    /// Inventory is full, cannot add more items.
    #[error("inventory full: capacity {capacity}, could not place {amount}")]
    InventoryFull {
        /// Slot capacity.
        capacity: u32,
        /// Items left over.
        amount: u32,
    },

    /// Not enough gold.
    #[error("insufficient funds: player {player} needs {required}, has {available}")]
    InsufficientFunds {
        /// Paying player.
        player: PlayerId,
        /// Amount required.
        required: u64,
        /// Amount available.
        available: u64,
    },

    /// Item not in the catalog.
    #[error("item not found: {0}")]
    ItemNotFound(ItemId),

    /// Item may not change hands.
    #[error("item {0} is not tradeable")]
    NotTradeable(ItemId),

    /// Arithmetic overflow in a balance or count.
    #[error("arithmetic overflow")]
    ArithmeticOverflow,

    /// Invalid catalog file.
    #[error("invalid catalog: {0}")]
    InvalidCatalog(String),

    /// Framework failure (lookup, rollback, request).
    #[error(transparent)]
    Integration(#[from] IntegrationError),
}

/// Result type for game operations.
pub type GameResult<T> = Result<T, GameError>;
